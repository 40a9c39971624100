//! Frame codec.
//!
//! Encoding joins a tag and its fields with `,` and appends the `;` delimiter. Decoding is a
//! lazy iterator over a byte stream: bytes accumulate in a pending buffer until a delimiter
//! completes a frame.
//!
//! The decoder enforces no maximum frame length unless one is configured with
//! [`FrameDecoder::with_max_len`]. A peer that never sends `;` grows the pending buffer
//! without bound in that mode.
use std::{
    fmt,
    io::{self, BufReader, Bytes, Read},
    iter::FusedIterator,
};

use log::{debug, trace};
use thiserror::Error;

/// Terminates every frame on the wire.
pub const FRAME_DELIMITER: u8 = b';';
/// Separates the tag and the fields of a frame.
pub const FIELD_SEPARATOR: char = ',';

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream closed")]
    Closed,

    #[error("frame exceeded maximum length of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("frame stream IO error: {0}")]
    Io(#[from] io::Error),
}

/// One complete protocol message, without its delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    payload: String,
}

impl Frame {
    /// Builds a frame from a tag and its fields.
    ///
    /// Fields must not contain `,` or `;`; the protocol has no escaping.
    pub fn new<I, F>(tag: char, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: fmt::Display,
    {
        let mut payload = String::from(tag);
        for field in fields {
            let field = field.to_string();
            debug_assert!(
                !field.contains([FIELD_SEPARATOR, FRAME_DELIMITER as char]),
                "field '{field}' contains a reserved character"
            );
            payload.push(FIELD_SEPARATOR);
            payload.push_str(&field);
        }
        Self { payload }
    }

    /// A frame carrying only a tag, e.g. `S`.
    pub fn tag_only(tag: char) -> Self {
        Self::new(tag, std::iter::empty::<u8>())
    }

    /// Wraps an already assembled payload.
    pub fn from_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn tag(&self) -> Option<char> {
        self.payload.chars().next()
    }

    /// Fields following the tag, split on `,`.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.payload.split(FIELD_SEPARATOR).skip(1)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 1);
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes.push(FRAME_DELIMITER);
        bytes
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}

/// Encodes `tag` and `fields` straight to wire bytes.
pub fn encode<I, F>(tag: char, fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = F>,
    F: fmt::Display,
{
    Frame::new(tag, fields).encode()
}

/// Lazily decodes frames from a byte stream.
///
/// Yields `Ok(frame)` for every delimiter seen, then exactly one `Err` when the stream ends,
/// fails or overflows the configured limit, and `None` afterwards. A partially received frame
/// is discarded when the stream ends.
pub struct FrameDecoder<R: Read> {
    bytes: Bytes<BufReader<R>>,
    pending: Vec<u8>,
    max_len: Option<usize>,
    done: bool,
}

impl<R: Read> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, None)
    }

    pub fn with_max_len(reader: R, max_len: Option<usize>) -> Self {
        Self {
            bytes: BufReader::new(reader).bytes(),
            pending: Vec::new(),
            max_len,
            done: false,
        }
    }

    /// Bytes of the frame currently being accumulated.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn finish(&mut self, err: FrameError) -> Option<Result<Frame, FrameError>> {
        self.done = true;
        if !self.pending.is_empty() {
            debug!(
                "discarding {} bytes of a partial frame: {err}",
                self.pending.len()
            );
            self.pending.clear();
        }
        Some(Err(err))
    }
}

impl<R: Read> Iterator for FrameDecoder<R> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.bytes.next() {
                None => return self.finish(FrameError::Closed),
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(Err(e)) => return self.finish(FrameError::Io(e)),
                Some(Ok(FRAME_DELIMITER)) => {
                    let payload = std::mem::take(&mut self.pending);
                    let frame = Frame::from_payload(String::from_utf8_lossy(&payload));
                    trace!("decoded frame '{frame}'");
                    return Some(Ok(frame));
                }
                Some(Ok(byte)) => {
                    if let Some(limit) = self.max_len {
                        if self.pending.len() >= limit {
                            return self.finish(FrameError::TooLarge { limit });
                        }
                    }
                    self.pending.push(byte);
                }
            }
        }
    }
}

impl<R: Read> FusedIterator for FrameDecoder<R> {}
