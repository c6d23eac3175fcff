//! Line-by-line draining of a child's output stream.
//!
//! Local processes and remote channels both feed their stdout and stderr
//! through `drain`, one drain per stream, running concurrently. A drain
//! returns only once its stream reaches EOF.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::sink::{OutputSink, Stream};

/// Reads `reader` to EOF, handing each line to `sink` as soon as it is
/// complete. Lines end at either `\r` or `\n` so that progress bars redrawn
/// with carriage returns still show up live. Returns everything read, one
/// line per `\n`-terminated row.
pub async fn drain<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    sink: &dyn OutputSink,
) -> std::io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    let mut captured = String::new();
    let mut after_cr = false;
    loop {
        buf.clear();
        let delimiter = read_until2(&mut reader, b'\r', b'\n', &mut buf).await?;
        if delimiter.is_none() && buf.is_empty() {
            break;
        }
        // "\r\n" reads as a line ended by '\r' followed by an empty one ended by '\n'.
        let crlf_tail = after_cr && delimiter == Some(b'\n') && buf.is_empty();
        after_cr = delimiter == Some(b'\r');
        if crlf_tail {
            continue;
        }
        // Invalid UTF-8 sequences are replaced with U+FFFD.
        let line = String::from_utf8_lossy(&buf);
        sink.on_line(stream, &line);
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}

/// Reads into `buf` until either delimiter or EOF. The delimiter is consumed
/// but not stored. Returns the delimiter met, or `None` on EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<u8>> {
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            match memchr::memchr2(delimiter1, delimiter2, available) {
                Some(i) => {
                    buf.extend_from_slice(&available[..i]);
                    (Some(available[i]), i + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (None, available.len())
                }
            }
        };
        reader.consume(used);
        if found.is_some() || used == 0 {
            return Ok(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Capture;

    #[tokio::test]
    async fn test_drain_splits_lines() {
        let capture = Capture::new();
        let text = drain(&b"one\ntwo\n\nthree"[..], Stream::Stdout, &capture)
            .await
            .unwrap();
        assert_eq!(
            capture.stream(Stream::Stdout),
            vec!["one", "two", "", "three"]
        );
        assert_eq!(text, "one\ntwo\n\nthree\n");
    }

    #[tokio::test]
    async fn test_drain_crlf_is_one_line_break() {
        let capture = Capture::new();
        drain(&b"a\r\nb\r\n"[..], Stream::Stderr, &capture)
            .await
            .unwrap();
        assert_eq!(capture.stream(Stream::Stderr), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_drain_carriage_return_progress() {
        let capture = Capture::new();
        drain(&b"10%\r50%\r100%\n"[..], Stream::Stdout, &capture)
            .await
            .unwrap();
        assert_eq!(capture.stream(Stream::Stdout), vec!["10%", "50%", "100%"]);
    }

    #[tokio::test]
    async fn test_drain_replaces_invalid_utf8() {
        let capture = Capture::new();
        drain(&b"ok\xffok\n"[..], Stream::Stdout, &capture)
            .await
            .unwrap();
        assert_eq!(capture.stream(Stream::Stdout), vec!["ok\u{FFFD}ok"]);
    }

    #[tokio::test]
    async fn test_drain_empty_stream() {
        let capture = Capture::new();
        let text = drain(&b""[..], Stream::Stdout, &capture).await.unwrap();
        assert!(text.is_empty());
        assert!(capture.lines().is_empty());
    }
}
