//! Message framing on a duplex byte stream.
//!
//! Two framings are supported:
//! - `Newline`: one JSON document per line
//! - `ContentLength`: LSP-style `Content-Length: N` headers followed by N bytes

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::api::types::ApiError;

const CONTENT_LENGTH_HEADER: &str = "content-length";

/// How frames are delimited on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Framing {
    #[default]
    Newline,
    ContentLength,
}

/// Reads whole frames from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            framing,
            max_frame_bytes,
        }
    }

    /// Read the next frame.
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - One complete frame
    /// * `Ok(None)` - The stream ended cleanly between frames
    /// * `Err(ApiError::Decode)` - Oversized frame or malformed headers
    /// * `Err(ApiError::IoError)` - Reading from the stream failed
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        match self.framing {
            Framing::Newline => self.read_line_frame().await,
            Framing::ContentLength => self.read_content_length_frame().await,
        }
    }

    async fn read_line_frame(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        loop {
            let mut line = Vec::new();
            let read = (&mut self.inner)
                .take(self.max_frame_bytes as u64 + 1)
                .read_until(b'\n', &mut line)
                .await
                .map_err(io_error)?;
            if read == 0 {
                return Ok(None);
            }
            if line.len() > self.max_frame_bytes && !line.ends_with(b"\n") {
                return Err(ApiError::Decode {
                    message: format!("frame exceeds {} bytes", self.max_frame_bytes),
                });
            }
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    async fn read_content_length_frame(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut header = String::new();
            let read = (&mut self.inner)
                .take(self.max_frame_bytes as u64 + 1)
                .read_line(&mut header)
                .await
                .map_err(io_error)?;
            if header.len() > self.max_frame_bytes && !header.ends_with('\n') {
                return Err(ApiError::Decode {
                    message: format!("frame header exceeds {} bytes", self.max_frame_bytes),
                });
            }
            if read == 0 {
                if saw_header {
                    return Err(ApiError::Decode {
                        message: "stream ended inside frame headers".to_string(),
                    });
                }
                return Ok(None);
            }

            let header = header.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;

            let (name, value) = header.split_once(':').ok_or_else(|| ApiError::Decode {
                message: format!("malformed frame header: {header}"),
            })?;
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH_HEADER) {
                let length = value.trim().parse::<usize>().map_err(|e| ApiError::Decode {
                    message: format!("invalid Content-Length {value:?}: {e}"),
                })?;
                content_length = Some(length);
            }
        }

        let length = content_length.ok_or_else(|| ApiError::Decode {
            message: "frame headers missing Content-Length".to_string(),
        })?;
        if length > self.max_frame_bytes {
            return Err(ApiError::Decode {
                message: format!(
                    "frame of {length} bytes exceeds {} bytes",
                    self.max_frame_bytes
                ),
            });
        }

        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await.map_err(io_error)?;
        Ok(Some(body))
    }
}

/// Writes whole frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ApiError> {
        match self.framing {
            Framing::Newline => {
                self.inner.write_all(payload).await.map_err(io_error)?;
                self.inner.write_all(b"\n").await.map_err(io_error)?;
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", payload.len());
                self.inner
                    .write_all(header.as_bytes())
                    .await
                    .map_err(io_error)?;
                self.inner.write_all(payload).await.map_err(io_error)?;
            }
        }
        self.inner.flush().await.map_err(io_error)
    }

    /// Shut the underlying stream down (closes the agent's stdin).
    pub async fn close(&mut self) -> Result<(), ApiError> {
        self.inner.shutdown().await.map_err(io_error)
    }
}

fn io_error(e: std::io::Error) -> ApiError {
    ApiError::IoError {
        message: format!("Transport IO failed: {e}"),
    }
}
