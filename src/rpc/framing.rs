//! `Content-Length` framing of JSON-RPC bodies over a pair of byte streams.

use std::borrow::Cow;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::NotedownError;

pub const CONTENT_LENGTH: &str = "Content-Length";

/// Upper bound on a single body; anything larger is treated as a corrupt header.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Frame a body: `Content-Length: <n>\r\n\r\n<body>`.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

pub struct MessageReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next body. `Ok(None)` signals end of stream.
    ///
    /// Header names are matched case-insensitively and headers other than `Content-Length` are
    /// ignored. A malformed header block (bytes that are not UTF-8, an unusable length) is a
    /// [`NotedownError::Protocol`] error. The stream is then positioned after that block, and
    /// after its body when the leading digits of the length still say how long it is, so the
    /// caller may keep reading.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, NotedownError> {
        let mut content_length: Option<usize> = None;
        let mut malformed: Option<String> = None;
        let mut line = Vec::new();
        let mut saw_header = false;

        loop {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                if saw_header {
                    tracing::warn!("[MessageReader] End of stream inside a header block");
                }
                return Ok(None);
            }

            let text = match std::str::from_utf8(&line) {
                Ok(text) => Cow::Borrowed(text),
                Err(e) => {
                    if malformed.is_none() {
                        malformed = Some(format!("header is not valid UTF-8: {e}"));
                    }
                    String::from_utf8_lossy(&line)
                }
            };
            let trimmed = text.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                if !saw_header {
                    // Tolerate stray blank lines between messages.
                    continue;
                }
                break;
            }
            saw_header = true;

            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };

            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                match value.parse::<usize>() {
                    Ok(len) => content_length = Some(len),
                    Err(e) => {
                        if malformed.is_none() {
                            malformed = Some(format!("invalid Content-Length {value:?}: {e}"));
                        }
                        let digits: String =
                            value.chars().take_while(|c| c.is_ascii_digit()).collect();
                        content_length = digits.parse().ok();
                    }
                }
            }
        }

        if let Some(message) = malformed {
            if let Some(len) = content_length.filter(|len| *len <= MAX_CONTENT_LENGTH) {
                let mut skipped = vec![0u8; len];
                self.reader.read_exact(&mut skipped).await?;
            }
            return Err(NotedownError::Protocol(message));
        }
        let Some(len) = content_length else {
            return Err(NotedownError::Protocol(format!(
                "missing {CONTENT_LENGTH} header"
            )));
        };
        if len > MAX_CONTENT_LENGTH {
            return Err(NotedownError::Protocol(format!(
                "{CONTENT_LENGTH} {len} exceeds the limit of {MAX_CONTENT_LENGTH} bytes"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one framed body and flush. Header and body go out in a single write.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), NotedownError> {
        self.writer.write_all(&encode_frame(body)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_read_frames() {
        let mut input = Vec::new();
        input.extend(encode_frame(br#"{"a":1}"#));
        input.extend(b"content-length: 2\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}");
        let mut reader = MessageReader::new(input.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(br#"{"a":1}"#.to_vec()));
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[test(tokio::test)]
    async fn test_missing_length_is_recoverable() {
        let mut input = b"X-Other: 1\r\n\r\n".to_vec();
        input.extend(encode_frame(b"[]"));
        let mut reader = MessageReader::new(input.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(NotedownError::Protocol(_))
        ));
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"[]".to_vec()));
    }

    #[test(tokio::test)]
    async fn test_non_utf8_header_skips_its_frame() {
        let mut input = b"Content-Length: 2\xff\r\n\r\n{}".to_vec();
        input.extend(encode_frame(b"[1]"));
        let mut reader = MessageReader::new(input.as_slice());
        match reader.read_frame().await {
            Err(NotedownError::Protocol(message)) => assert!(message.contains("UTF-8"), "{message}"),
            other => panic!("expected a protocol error, got {other:?}"),
        }
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"[1]".to_vec()));
    }

    #[test(tokio::test)]
    async fn test_bad_length_consumes_header_block() {
        let mut input = b"Content-Length: abc\r\nX-Other: 1\r\n\r\n".to_vec();
        input.extend(encode_frame(b"{}"));
        let mut reader = MessageReader::new(input.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(NotedownError::Protocol(_))
        ));
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"{}".to_vec()));
    }

    #[test(tokio::test)]
    async fn test_truncated_body() {
        let input = b"Content-Length: 10\r\n\r\n{}".to_vec();
        let mut reader = MessageReader::new(input.as_slice());
        assert!(reader.read_frame().await.is_err());
    }

    #[test(tokio::test)]
    async fn test_writer_frames_exact_length() {
        let mut writer = MessageWriter::new(Vec::new());
        let body = "{\"text\":\"héllo\"}".as_bytes();
        writer.write_frame(body).await.unwrap();
        let written = writer.into_inner();
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        assert!(written.starts_with(header.as_bytes()));
        assert_eq!(&written[header.len()..], body);

        let mut reader = MessageReader::new(written.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(body.to_vec()));
    }
}
