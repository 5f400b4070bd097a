//! Reading and writing the two line-oriented frame shapes.

use super::frame::RequestFrame;
use crate::Result;
use anyhow::bail;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Read one pipelined request frame off `reader`.
///
/// Returns `Ok(None)` on a clean EOF between frames. A line ending in
/// `": "` is tolerated and dropped rather than folded into the header
/// list — mirroring the quirk the proxy's own line sender produces.
pub async fn read_request_frame<R>(reader: &mut R) -> Result<Option<RequestFrame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines: Vec<String> = Vec::new();
    loop {
        let mut raw = String::new();
        let n = reader.read_line(&mut raw).await?;
        if n == 0 {
            return if lines.is_empty() {
                Ok(None)
            } else {
                bail!("connection closed mid-frame")
            };
        }

        let trimmed = raw.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            if lines.is_empty() {
                // Stray blank line before a command line; ignore it.
                continue;
            }
            let command = lines.remove(0);
            return Ok(Some(RequestFrame {
                command,
                headers: lines,
            }));
        }

        if !trimmed.ends_with(": ") {
            lines.push(trimmed.to_string());
        }
    }
}

/// Build the `<command> <seq>\r\n<headers>\r\n\r\n\r\n` frame sent to a
/// relay. Two trailing empty lines, not one — the second blank line is
/// the frame terminator on the relay side (spec.md §4.1/§8 S1).
pub fn relay_command_frame(command: &str, seq: u32, headers: &[String]) -> String {
    let mut out = format!("{} {}\r\n", command, seq);
    for header in headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("\r\n\r\n");
    out
}

/// A decoded line from a relay: either an unsolicited `expired` event or a
/// `<seq> <payload>` reply.
#[derive(Debug, Clone)]
pub enum RelayLine {
    Expired(serde_json::Value),
    Reply { seq: String, payload: String },
    Malformed(String),
}

pub fn parse_relay_line(line: &str) -> RelayLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some((first, rest)) = line.split_once(' ') else {
        return RelayLine::Malformed(line.to_string());
    };

    if first == "expired" {
        match serde_json::from_str(rest) {
            Ok(value) => RelayLine::Expired(value),
            Err(_) => RelayLine::Malformed(line.to_string()),
        }
    } else {
        RelayLine::Reply {
            seq: first.to_string(),
            payload: rest.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_a_simple_frame() {
        let input = b"update\r\ncall_id: abc\r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        let frame = read_request_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.command, "update");
        assert_eq!(frame.call_id(), Some("abc"));
    }

    #[tokio::test]
    async fn drops_lines_ending_in_colon_space() {
        let input = b"update\r\ncall_id: abc\r\ngarbage: \r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        let frame = read_request_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.headers, vec!["call_id: abc".to_string()]);
    }

    #[tokio::test]
    async fn reads_two_pipelined_frames() {
        let input = b"update\r\ncall_id: a\r\n\r\nremove\r\ncall_id: b\r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        let first = read_request_frame(&mut reader).await.unwrap().unwrap();
        let second = read_request_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.command, "update");
        assert_eq!(second.command, "remove");
    }

    #[tokio::test]
    async fn clean_eof_between_frames_yields_none() {
        let input = b"".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        assert!(read_request_frame(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn builds_relay_frame_with_headers() {
        let frame = relay_command_frame("update", 0, &["call_id: abc".to_string()]);
        assert_eq!(frame, "update 0\r\ncall_id: abc\r\n\r\n\r\n");
    }

    #[test]
    fn builds_relay_frame_without_headers() {
        let frame = relay_command_frame("remove", 3, &[]);
        assert_eq!(frame, "remove 3\r\n\r\n\r\n");
    }

    #[test]
    fn parses_expired_notification() {
        match parse_relay_line(r#"expired {"call_id":"q","duration":42}"#) {
            RelayLine::Expired(value) => assert_eq!(value["call_id"], "q"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_sequenced_reply() {
        match parse_relay_line("0 ok-payload") {
            RelayLine::Reply { seq, payload } => {
                assert_eq!(seq, "0");
                assert_eq!(payload, "ok-payload");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
