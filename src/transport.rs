use std::io::{self, BufRead, Write};

use crate::commands::execute_line;
use crate::state::ServerState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeStats {
    pub lines_read: u64,
    pub responses_written: u64,
}

/// Read commands line by line until end of input, answering each non-blank
/// line before reading the next. Invalid UTF-8 is replaced, not rejected.
pub fn serve<R: BufRead, W: Write>(
    state: &mut ServerState,
    mut input: R,
    mut output: W,
) -> io::Result<ServeStats> {
    let mut stats = ServeStats::default();
    let mut buffer = Vec::with_capacity(4096);

    loop {
        buffer.clear();
        match input.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        stats.lines_read += 1;

        let line = String::from_utf8_lossy(trim_line_ending(&buffer));
        if let Some(response) = execute_line(state, &line) {
            output.write_all(response.as_bytes())?;
            output.write_all(b"\n")?;
            output.flush()?;
            stats.responses_written += 1;
        }
    }

    tracing::info!(
        lines = stats.lines_read,
        responses = stats.responses_written,
        "input closed"
    );
    Ok(stats)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{serve, trim_line_ending, ServeStats};
    use crate::config::ServerConfig;
    use crate::state::ServerState;

    fn stub_state() -> ServerState {
        ServerState::with_engine(
            ServerConfig {
                stub: true,
                ..ServerConfig::default()
            },
            None,
        )
    }

    #[test]
    fn one_line_out_per_command_line_in() {
        let input = b"{\"cmd\":\"health\"}\n\n   \n{\"cmd\":\"bogus\"}\r\n{\"cmd\":\"metrics\"}";
        let mut output = Vec::new();
        let mut state = stub_state();

        let stats = serve(&mut state, Cursor::new(&input[..]), &mut output).expect("serve");
        assert_eq!(
            stats,
            ServeStats {
                lines_read: 5,
                responses_written: 3
            }
        );

        let text = String::from_utf8(output).expect("utf8 output");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"status\":\"healthy\""));
        assert_eq!(lines[1], r#"{"error":"unknown command: 'bogus'"}"#);
        assert!(lines[2].starts_with("{\"requests_total\":0"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn invalid_utf8_is_still_answered() {
        let input = b"{\"cmd\":\"embed\",\"text\":\"caf\xE9\"}\n";
        let mut output = Vec::new();
        let mut state = stub_state();

        serve(&mut state, Cursor::new(&input[..]), &mut output).expect("serve");
        let text = String::from_utf8(output).expect("utf8 output");
        assert!(text.contains("\"dimensions\":384"));
    }

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(trim_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc"), b"abc");
    }
}
