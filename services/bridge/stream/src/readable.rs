//! Readable side of a stream: inbound chunk buffer with a high-water mark.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Result of a pull read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Up to the requested number of bytes
    Data(Bytes),
    /// Nothing buffered yet
    WouldBlock,
    /// Peer finished and every byte has been consumed
    Eof,
}

impl ReadOutcome {
    /// Bytes carried by a `Data` outcome.
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            ReadOutcome::Data(b) => Some(b),
            _ => None,
        }
    }
}

/// Inbound buffer state.
///
/// `ended` is set at most once and nothing is buffered after it. The end
/// marker is handed out once, after the buffer has been fully consumed.
#[derive(Debug)]
pub struct ReadableSide {
    buffer: VecDeque<Bytes>,
    length: usize,
    high_water_mark: usize,
    reading: bool,
    ended: bool,
    end_emitted: bool,
}

impl ReadableSide {
    /// Empty side with the given high-water mark.
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            length: 0,
            high_water_mark: high_water_mark.max(1),
            reading: false,
            ended: false,
            end_emitted: false,
        }
    }

    /// Append a chunk. Returns `false` when the chunk was dropped because the
    /// side already ended or the chunk was empty.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if self.ended || chunk.is_empty() {
            return false;
        }
        self.length += chunk.len();
        self.buffer.push_back(chunk);
        true
    }

    /// Mark end of stream. Returns `true` the first time.
    pub fn push_eof(&mut self) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        true
    }

    /// Take up to `max` bytes.
    pub fn read(&mut self, max: usize) -> ReadOutcome {
        if self.length == 0 {
            return if self.ended {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            };
        }
        if max == 0 {
            return ReadOutcome::WouldBlock;
        }

        let Some(front) = self.buffer.front_mut() else {
            return ReadOutcome::WouldBlock;
        };
        if front.len() >= max {
            let out = if front.len() == max {
                self.buffer.pop_front().unwrap_or_default()
            } else {
                front.split_to(max)
            };
            self.length -= out.len();
            return ReadOutcome::Data(out);
        }

        let mut out = BytesMut::with_capacity(max.min(self.length));
        while out.len() < max {
            let Some(mut chunk) = self.buffer.pop_front() else {
                break;
            };
            let room = max - out.len();
            if chunk.len() > room {
                out.extend_from_slice(&chunk.split_to(room));
                self.buffer.push_front(chunk);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        self.length -= out.len();
        ReadOutcome::Data(out.freeze())
    }

    /// Hand out the end marker: `true` exactly once, when ended and drained.
    pub fn take_end(&mut self) -> bool {
        if self.ended && self.length == 0 && !self.end_emitted {
            self.end_emitted = true;
            return true;
        }
        false
    }

    /// Drop every buffered chunk.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.length = 0;
    }

    /// Drop buffered data and finish the side without handing out an end
    /// marker. Later reads report `Eof`.
    pub fn close(&mut self) {
        self.clear();
        self.reading = false;
        self.ended = true;
        self.end_emitted = true;
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Nothing buffered.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Buffer at or over the high-water mark.
    pub fn is_saturated(&self) -> bool {
        self.length >= self.high_water_mark
    }

    /// Whether inbound delivery is flowing.
    pub fn reading(&self) -> bool {
        self.reading
    }

    /// Set the flowing flag.
    pub fn set_reading(&mut self, reading: bool) {
        self.reading = reading;
    }

    /// Peer finished.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// End marker handed out.
    pub fn end_emitted(&self) -> bool {
        self.end_emitted
    }

    /// High-water mark in bytes.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
