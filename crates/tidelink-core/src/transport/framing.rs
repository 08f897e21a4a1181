//! Link-level framing
//!
//! The proximity link only carries small frames, so encoded messages are cut
//! into ordered chunks and reassembled per peer on the receiving side.
//!
//! ## Frame Layout
//!
//! ```text
//! chunk:   | 0x01 | msg seq (u32 BE) | index (u16 BE) | total (u16 BE) | data ... |
//! goodbye: | 0x02 |
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::error::FrameError;

const KIND_CHUNK: u8 = 0x01;
const KIND_GOODBYE: u8 = 0x02;

/// Bytes taken by a chunk header
pub const CHUNK_HEADER_LEN: usize = 1 + 4 + 2 + 2;

/// A parsed link frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One piece of a message
    Chunk {
        /// Sender-local message sequence number
        seq: u32,
        /// Position of this chunk
        index: u16,
        /// Number of chunks in the message
        total: u16,
        /// Chunk body
        data: Bytes,
    },
    /// The peer is closing the link on purpose
    Goodbye,
}

impl Frame {
    /// Parse a received frame
    pub fn parse(mut frame: Bytes) -> Result<Self, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::TooShort(0));
        }
        match frame[0] {
            KIND_GOODBYE => Ok(Frame::Goodbye),
            KIND_CHUNK => {
                if frame.len() < CHUNK_HEADER_LEN {
                    return Err(FrameError::TooShort(frame.len()));
                }
                frame.advance(1);
                let seq = frame.get_u32();
                let index = frame.get_u16();
                let total = frame.get_u16();
                if total == 0 || index >= total {
                    return Err(FrameError::IndexOutOfRange { index, total });
                }
                Ok(Frame::Chunk {
                    seq,
                    index,
                    total,
                    data: frame,
                })
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// The frame sent before deliberately closing a link
pub fn goodbye_frame() -> Bytes {
    Bytes::from_static(&[KIND_GOODBYE])
}

/// Split `payload` into chunk frames no larger than `mtu`.
pub fn split_message(
    seq: u32,
    payload: &[u8],
    mtu: usize,
    max_chunks: u16,
) -> Result<Vec<Bytes>, FrameError> {
    if mtu <= CHUNK_HEADER_LEN {
        return Err(FrameError::MtuTooSmall(mtu));
    }
    let body = mtu - CHUNK_HEADER_LEN;
    let count = payload.len().div_ceil(body).max(1);
    if count > usize::from(max_chunks) {
        return Err(FrameError::TooManyChunks(count));
    }
    let total = count as u16;

    let mut frames = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * body;
        let end = (start + body).min(payload.len());
        let data = &payload[start.min(payload.len())..end];

        let mut frame = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
        frame.put_u8(KIND_CHUNK);
        frame.put_u32(seq);
        frame.put_u16(index as u16);
        frame.put_u16(total);
        frame.put_slice(data);
        frames.push(frame.freeze());
    }
    Ok(frames)
}

struct Partial {
    total: u16,
    chunks: Vec<Option<Bytes>>,
    received: u16,
    started: Instant,
}

/// Per-peer reassembly of chunked messages.
///
/// Several messages may be in flight at once (keyed by sequence number).
/// Incomplete messages are discarded once older than the timeout.
pub struct Reassembler {
    partial: HashMap<u32, Partial>,
    timeout: Duration,
    max_chunks: u16,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new(timeout: Duration, max_chunks: u16) -> Self {
        Self {
            partial: HashMap::new(),
            timeout,
            max_chunks,
        }
    }

    /// Add a chunk; returns the full message once every chunk has arrived.
    pub fn push(
        &mut self,
        seq: u32,
        index: u16,
        total: u16,
        data: Bytes,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        if total > self.max_chunks {
            return Err(FrameError::TooManyChunks(usize::from(total)));
        }
        if index >= total {
            return Err(FrameError::IndexOutOfRange { index, total });
        }
        if total == 1 {
            self.partial.remove(&seq);
            return Ok(Some(data.to_vec()));
        }

        let partial = self.partial.entry(seq).or_insert_with(|| Partial {
            total,
            chunks: vec![None; usize::from(total)],
            received: 0,
            started: now,
        });
        // Sequence reused with a different shape: the old attempt is dead.
        if partial.total != total {
            *partial = Partial {
                total,
                chunks: vec![None; usize::from(total)],
                received: 0,
                started: now,
            };
        }

        let slot = &mut partial.chunks[usize::from(index)];
        if slot.is_none() {
            *slot = Some(data);
            partial.received += 1;
        }
        if partial.received < partial.total {
            return Ok(None);
        }

        let done = self.partial.remove(&seq).map(|p| p.chunks);
        let message = done
            .into_iter()
            .flatten()
            .flatten()
            .fold(Vec::new(), |mut acc, chunk| {
                acc.extend_from_slice(&chunk);
                acc
            });
        Ok(Some(message))
    }

    /// Drop incomplete messages older than the timeout; returns how many.
    pub fn discard_expired(&mut self, now: Instant) -> usize {
        let before = self.partial.len();
        let timeout = self.timeout;
        self.partial
            .retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        before - self.partial.len()
    }

    /// Number of incomplete messages held
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }
}
