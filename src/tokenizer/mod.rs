//! Byte-level BPE tokenizer loaded from a `vocab.json` / `merges.txt` pair.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;

pub const EOS_PIECE: &str = "<|endoftext|>";
pub const DEFAULT_EOS_ID: u32 = 50256;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed tokenizer artifacts {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    eos_id: u32,
}

impl Tokenizer {
    pub fn load(
        vocab_path: &Path,
        merges_path: &Path,
        eos_override: Option<u32>,
    ) -> Result<Self, TokenizerError> {
        for path in [vocab_path, merges_path] {
            std::fs::metadata(path).map_err(|source| TokenizerError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let malformed = |e: tokenizers::Error| TokenizerError::Malformed {
            path: vocab_path.to_path_buf(),
            reason: e.to_string(),
        };

        let (vocab, merges) = BPE::read_file(
            &vocab_path.to_string_lossy(),
            &merges_path.to_string_lossy(),
        )
        .map_err(malformed)?;

        let eos_id = resolve_eos_id(|piece| vocab.get(piece).copied(), eos_override);
        // Unmapped pieces encode as the end-of-sequence id when it has a piece.
        let unk_piece = vocab
            .iter()
            .find(|(_, id)| **id == eos_id)
            .map(|(piece, _)| piece.clone());
        let merge_count = merges.len();

        let mut builder = BPE::builder().vocab_and_merges(vocab, merges);
        if let Some(piece) = unk_piece {
            builder = builder.unk_token(piece);
        }
        let model = builder.build().map_err(malformed)?;

        let mut inner = tokenizers::Tokenizer::new(model);
        inner.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
        inner.with_decoder(Some(ByteLevelDecoder::default()));

        let tokenizer = Self { inner, eos_id };
        tracing::info!(
            vocab = tokenizer.vocab_size(),
            merges = merge_count,
            eos = tokenizer.eos_id,
            "tokenizer loaded"
        );
        Ok(tokenizer)
    }

    /// Never fails: non-empty text always yields at least one id.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        if text.is_empty() {
            return Vec::new();
        }
        let ids = match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "encode failed, falling back to eos");
                Vec::new()
            }
        };
        if ids.is_empty() {
            vec![self.eos_id]
        } else {
            ids
        }
    }

    /// Ids without a vocabulary entry are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        self.inner.decode(ids, false).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "decode failed");
            String::new()
        })
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }
}

fn resolve_eos_id(lookup: impl Fn(&str) -> Option<u32>, eos_override: Option<u32>) -> u32 {
    eos_override
        .or_else(|| lookup(EOS_PIECE))
        .unwrap_or(DEFAULT_EOS_ID)
}
