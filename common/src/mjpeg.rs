//! `multipart/x-mixed-replace` framing for MJPEG streams.
//!
//! The same boundary is used on both sides: the camera reader splits an
//! incoming stream into JPEG parts with [`MultipartParser`], and viewers get
//! parts produced by [`encode_part`].

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Build one self-delimited multipart part carrying a JPEG image.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(BOUNDARY.len() + header.len() + jpeg.len() + 2);
    buf.put_slice(BOUNDARY);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for an MJPEG byte stream. Feed network chunks with
/// [`push`](Self::push) and collect the completed JPEG parts.
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
    max_part_bytes: usize,
}

impl MultipartParser {
    pub fn new(max_part_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            max_part_bytes,
        }
    }

    /// Append `chunk` and return every JPEG part completed by it, oldest first.
    ///
    /// A part is only complete once the following boundary has arrived, so
    /// the newest part of a stream is emitted one part late.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, MjpegError> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    {
                        let jpeg_end = self.jpeg_start + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2
                            && self.buffer[jpeg_end - 2] == b'\r'
                            && self.buffer[jpeg_end - 1] == b'\n'
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };

                        let jpeg = self.buffer[..end].to_vec();
                        let _ = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                        if !jpeg.is_empty() {
                            debug!(bytes = jpeg.len(), "multipart part complete");
                            parts.push(jpeg);
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        if self.buffer.len() > self.max_part_bytes {
                            let size = self.buffer.len();
                            self.reset();
                            return Err(MjpegError::PartTooLarge {
                                size,
                                max: self.max_part_bytes,
                            });
                        }
                        // Avoid re-scanning bytes already checked
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    }
                }
            }
        }

        Ok(parts)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::SeekingBoundary;
        self.jpeg_start = 0;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MjpegError {
    #[error("multipart part exceeded {max} bytes (got {size})")]
    PartTooLarge { size: usize, max: usize },
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
