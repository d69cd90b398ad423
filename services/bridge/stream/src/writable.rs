//! Writable side of a stream: FIFO write queue with drain signalling.

use bridge_handle::{Completion, RawHandle, SocketError};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug)]
struct PendingWrite {
    data: Bytes,
    completion: Completion,
}

/// What a flush did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Chunks handed to the handle
    pub written: usize,
    /// Buffered bytes dropped back under the mark after a refused write
    pub drain: bool,
}

/// Outbound queue state.
///
/// At most one write is outstanding on the handle at a time: once the handle
/// answers "would block", that write's completion waits for the next drain
/// and every later write stays queued behind it. Completions therefore fire
/// in submission order, each exactly once.
#[derive(Debug)]
pub struct WritableSide {
    queue: VecDeque<PendingWrite>,
    blocked: Option<(usize, Completion)>,
    pending_bytes: usize,
    high_water_mark: usize,
    need_drain: bool,
    ended: bool,
    finished: bool,
    bytes_written: u64,
}

impl WritableSide {
    /// Empty side with the given high-water mark.
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            blocked: None,
            pending_bytes: 0,
            high_water_mark: high_water_mark.max(1),
            need_drain: false,
            ended: false,
            finished: false,
            bytes_written: 0,
        }
    }

    /// Queue a chunk. Returns `false` once buffered bytes reach the mark; the
    /// caller should then wait for a drain.
    pub fn enqueue(&mut self, data: Bytes, completion: Completion) -> bool {
        self.pending_bytes += data.len();
        self.queue.push_back(PendingWrite { data, completion });
        let below = self.pending_bytes < self.high_water_mark;
        if !below {
            self.need_drain = true;
        }
        below
    }

    /// Hand queued chunks to `handle` until it refuses one or the queue is
    /// empty.
    pub fn flush(&mut self, handle: &mut dyn RawHandle) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        while self.blocked.is_none() {
            let Some(PendingWrite { data, completion }) = self.queue.pop_front() else {
                break;
            };
            let len = data.len();
            let accepted = handle.send(&data);
            self.bytes_written += len as u64;
            outcome.written += 1;
            if accepted {
                self.pending_bytes -= len;
                completion.complete(Ok(()));
            } else {
                trace!("handle would block after {} bytes", len);
                self.blocked = Some((len, completion));
            }
        }
        outcome.drain = self.take_drain();
        outcome
    }

    /// The handle drained: release the blocked write, then keep flushing.
    pub fn on_drain(&mut self, handle: &mut dyn RawHandle) -> FlushOutcome {
        if let Some((len, completion)) = self.blocked.take() {
            self.pending_bytes -= len;
            completion.complete(Ok(()));
        }
        self.flush(handle)
    }

    fn take_drain(&mut self) -> bool {
        if self.need_drain && self.pending_bytes == 0 {
            self.need_drain = false;
            return true;
        }
        false
    }

    /// Fail every outstanding completion with `err`, oldest first.
    pub fn fail_all(&mut self, err: SocketError) {
        if let Some((_, completion)) = self.blocked.take() {
            completion.complete(Err(err.clone()));
        }
        for pending in self.queue.drain(..) {
            pending.completion.complete(Err(err.clone()));
        }
        self.pending_bytes = 0;
        self.need_drain = false;
    }

    /// No queued or outstanding writes.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.blocked.is_none()
    }

    /// Queued chunk count, excluding the outstanding one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Bytes not yet acknowledged by the handle.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Bytes queued but not yet handed to the handle.
    pub fn queued_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.data.len()).sum()
    }

    /// Bytes handed to the handle so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether a write is waiting on a drain.
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Stop accepting writes.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Local end requested.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Mark the side finished (ended and drained).
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Ended and fully drained.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_handle::mem::MemTransport;
    use bridge_handle::{AddressFamily, HandleAdapter, HandleFactory, HandleId, StreamTarget};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn open() -> (MemTransport, Box<dyn RawHandle>) {
        let transport = MemTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = StreamTarget {
            host: "127.0.0.1".into(),
            port: 9,
            family: AddressFamily::V4,
        };
        let handle = transport
            .open_stream(&target, HandleAdapter::new(HandleId(1), tx))
            .unwrap();
        (transport, handle)
    }

    fn tracked(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Completion {
        let log = log.clone();
        Completion::new(move |r| {
            assert!(r.is_ok());
            log.lock().unwrap().push(tag);
        })
    }

    #[test]
    fn test_blocked_write_holds_queue() {
        let (transport, mut handle) = open();
        let ctl = transport.last().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut side = WritableSide::new(1024);

        ctl.set_blocked(true);
        side.enqueue(Bytes::from_static(b"one"), tracked(&log, 1));
        side.enqueue(Bytes::from_static(b"two"), tracked(&log, 2));
        let out = side.flush(handle.as_mut());
        assert_eq!(out.written, 1);
        assert!(side.is_blocked());
        assert_eq!(side.queued(), 1);
        assert!(log.lock().unwrap().is_empty());

        ctl.set_blocked(false);
        side.on_drain(handle.as_mut());
        assert!(side.is_idle());
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(ctl.sent_bytes(), b"onetwo");
        assert_eq!(side.bytes_written(), 6);
    }

    #[test]
    fn test_high_water_mark_and_drain() {
        let (_transport, mut handle) = open();
        let mut side = WritableSide::new(4);
        assert!(side.enqueue(Bytes::from_static(b"ab"), Completion::noop()));
        assert!(!side.enqueue(Bytes::from_static(b"cd"), Completion::noop()));
        let out = side.flush(handle.as_mut());
        assert!(out.drain);
        assert_eq!(side.pending_bytes(), 0);
    }

    #[test]
    fn test_fail_all_in_order() {
        let mut side = WritableSide::new(16);
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let log = log.clone();
            side.enqueue(
                Bytes::from_static(b"x"),
                Completion::new(move |r| {
                    assert_eq!(r, Err(SocketError::Closed));
                    log.lock().unwrap().push(tag);
                }),
            );
        }
        side.fail_all(SocketError::Closed);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(side.is_idle());
    }
}
