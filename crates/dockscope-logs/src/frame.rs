use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use dockscope_client::wire::HEADER_LEN;
use dockscope_types::StdType;

/// One decoded chunk of container output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub text: String,
    pub stream: StdType,
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// Fewer than 8 header bytes were available. `recovered` holds the best-effort
    /// line read in place of the frame; reading may continue.
    #[error("bad frame header")]
    BadHeader { recovered: String },

    /// Any other read failure; the stream is unusable
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BadHeader { .. })
    }
}

/// Decodes a runtime log stream into frames
///
/// In TTY mode the stream is plain newline-delimited text and every line is
/// reported as stdout. Otherwise each record is prefixed by an 8-byte header:
/// stream tag in byte 0, big-endian payload length in bytes 4..8.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    tty: bool,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, tty: bool) -> Self {
        Self {
            reader: BufReader::new(reader),
            tty,
            buf: Vec::new(),
        }
    }

    /// Read the next frame. `Ok(None)` means the stream ended cleanly.
    pub async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.tty {
            return self.read_line().await;
        }

        let mut header = [0u8; HEADER_LEN];
        let filled = self.fill_header(&mut header).await?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_LEN {
            tracing::warn!(bytes = filled, "short frame header, reading line instead");
            self.buf.clear();
            self.buf.extend_from_slice(&header[..filled]);
            self.reader.read_until(b'\n', &mut self.buf).await?;
            return Err(FrameError::BadHeader {
                recovered: String::from_utf8_lossy(&self.buf).into_owned(),
            });
        }

        let stream = StdType::from_tag(header[0]);
        if stream == StdType::Unknown {
            tracing::warn!(tag = header[0], "unknown stream type in frame header");
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        self.buf.clear();
        self.buf.resize(len, 0);
        self.reader.read_exact(&mut self.buf).await?;

        Ok(Some(Frame {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            stream,
        }))
    }

    async fn read_line(&mut self) -> Result<Option<Frame>, FrameError> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Frame {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            stream: StdType::Stdout,
        }))
    }

    /// Fill as much of the header as the stream provides, returning the byte count
    async fn fill_header(&mut self, header: &mut [u8; HEADER_LEN]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockscope_client::wire::encode_frame;

    fn framed(parts: &[(StdType, &str)]) -> Vec<u8> {
        parts
            .iter()
            .flat_map(|(stream, text)| encode_frame(*stream, text.as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_reads_multiplexed_frames() {
        let bytes = framed(&[(StdType::Stdout, "one\n"), (StdType::Stderr, "two\n")]);
        let mut reader = FrameReader::new(bytes.as_slice(), false);

        let first = reader.read().await.unwrap().unwrap();
        assert_eq!(first.text, "one\n");
        assert_eq!(first.stream, StdType::Stdout);

        let second = reader.read().await.unwrap().unwrap();
        assert_eq!(second.text, "two\n");
        assert_eq!(second.stream, StdType::Stderr);

        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tag_still_reads_payload() {
        let mut bytes = framed(&[(StdType::Stdout, "x")]);
        bytes[0] = 7;
        let mut reader = FrameReader::new(bytes.as_slice(), false);

        let frame = reader.read().await.unwrap().unwrap();
        assert_eq!(frame.stream, StdType::Unknown);
        assert_eq!(frame.text, "x");
    }

    #[tokio::test]
    async fn test_zero_length_payload() {
        let bytes = framed(&[(StdType::Stdout, "")]);
        let mut reader = FrameReader::new(bytes.as_slice(), false);

        let frame = reader.read().await.unwrap().unwrap();
        assert!(frame.text.is_empty());
    }

    #[tokio::test]
    async fn test_short_header_is_recoverable() {
        let bytes = b"\x01\x00\x00partial line\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..3], false);

        match reader.read().await {
            Err(err @ FrameError::BadHeader { .. }) => assert!(err.is_recoverable()),
            other => panic!("expected bad header, got {other:?}"),
        }
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_terminal() {
        let mut bytes = framed(&[(StdType::Stdout, "hello world")]);
        bytes.truncate(HEADER_LEN + 3);
        let mut reader = FrameReader::new(bytes.as_slice(), false);

        let err = reader.read().await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_tty_mode_reads_lines() {
        let bytes = b"first\nsecond".to_vec();
        let mut reader = FrameReader::new(bytes.as_slice(), true);

        let first = reader.read().await.unwrap().unwrap();
        assert_eq!(first.text, "first\n");
        assert_eq!(first.stream, StdType::Stdout);
        assert_eq!(reader.read().await.unwrap().unwrap().text, "second");
        assert!(reader.read().await.unwrap().is_none());
    }
}
