//! Outbound replay state machine.
//!
//! [`Outbound`] owns the bounded queue of pending entries, the resend
//! cursor, the paused flag, and the frame currently being written. It is
//! deliberately free of socket types: writes go through the [`SendSink`]
//! trait, so the replay algorithm can be exercised in tests with scripted
//! sinks and no I/O.
//!
//! Correctness across interleavings rests on two rules:
//!
//! - The cursor remembers the last transmitted entry by its stable `seq`
//!   tag, never by position. Replies purge completed entries from the front
//!   and overflow evicts them, both of which shift every later position, so
//!   resumption re-locates the entry by identity (scanning backward from a
//!   position hint). A missing entry means it was evicted and the scan
//!   restarts from the front.
//! - The bytes of the frame in flight are cloned into [`PendingWrite`] when
//!   transmission starts. Eviction of the entry mid-write therefore cannot
//!   corrupt framing: the remaining bytes still go out, and only the cursor
//!   bookkeeping notices the entry is gone.

use std::io;

use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::protocol::{Encoder, RpcError};
use crate::queue::{BoundedQueue, OverflowFn};

/// Delivered to a waiting caller: the reply's result, or a protocol /
/// synthesized error.
pub(crate) type CallResult = std::result::Result<Value, RpcError>;

/// One buffered outbound message plus its delivery metadata.
pub(crate) struct Entry {
    /// Stable identity tag, unique per client instance.
    pub seq: u64,
    /// Correlation id; present iff a reply is expected.
    pub id: Option<u64>,
    /// The protocol object to encode.
    pub message: Value,
    /// Lazily computed, cached once; resends never re-encode.
    pub encoded: Option<Bytes>,
    /// Reply channel; taken exactly once.
    pub waiter: Option<oneshot::Sender<CallResult>>,
    /// Monotonic: once true, never reset.
    pub completed: bool,
}

/// Outcome of a non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStatus {
    /// The sink accepted this many bytes (possibly fewer than offered).
    Sent(usize),
    /// The sink is full; wait for drain before retrying.
    Full,
}

/// Non-blocking byte sink. Implemented by `TcpStream` and by test fakes.
pub(crate) trait SendSink {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<SendStatus>;
}

impl SendSink for TcpStream {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<SendStatus> {
        match TcpStream::try_write(self, buf) {
            Ok(n) => Ok(SendStatus::Sent(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendStatus::Full),
            Err(e) => Err(e),
        }
    }
}

/// Resend cursor: the last fully transmitted entry plus a position hint.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    seq: u64,
    hint: usize,
}

/// The frame currently being written, cloned out of its entry.
struct PendingWrite {
    seq: u64,
    hint: usize,
    buf: Bytes,
    offset: usize,
}

pub(crate) struct Outbound {
    queue: BoundedQueue<Entry>,
    cursor: Option<Cursor>,
    pending: Option<PendingWrite>,
    paused: bool,
    next_seq: u64,
    encoder: Encoder,
}

impl Outbound {
    pub fn new(capacity: usize, encoder: Encoder, overflow: OverflowFn<Entry>) -> Self {
        Self {
            queue: BoundedQueue::new(capacity, overflow),
            cursor: None,
            pending: None,
            paused: false,
            next_seq: 0,
            encoder,
        }
    }

    /// Buffer a message. Overflow policy runs inside the queue push.
    pub fn push(&mut self, id: Option<u64>, message: Value, waiter: Option<oneshot::Sender<CallResult>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            seq,
            id,
            message,
            encoded: None,
            waiter,
            completed: false,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.queue.get_mut(index)
    }

    pub fn shift(&mut self) -> Option<Entry> {
        self.queue.shift()
    }

    /// Drop completed entries from the front, stopping at the first pending
    /// one. Keeps resident size equal to the count of truly pending entries.
    pub fn purge_front(&mut self) {
        while matches!(self.queue.first(), Some(e) if e.completed) {
            self.queue.shift();
        }
    }

    /// Forget all per-connection state. Called on every (re)connect and
    /// disconnect: in-flight assumptions from before the break are void.
    pub fn reset_connection(&mut self) {
        self.cursor = None;
        self.pending = None;
        self.paused = false;
    }

    /// The socket signalled drained capacity; replay may continue.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether the owner should wait for socket writability.
    pub fn wants_write(&self) -> bool {
        self.paused
    }

    /// Drive the replay loop until the queue is exhausted or the sink is
    /// full. `on_sent` fires once per entry when its bytes have been fully
    /// accepted (the owner marks notifications completed there).
    ///
    /// An `Err` means the connection is dead; the caller tears it down.
    pub fn replay<S: SendSink>(
        &mut self,
        sink: &mut S,
        mut on_sent: impl FnMut(&mut Entry),
    ) -> io::Result<()> {
        loop {
            if self.paused {
                return Ok(());
            }

            // Finish the frame in flight before selecting a new one.
            if let Some(pw) = self.pending.as_mut() {
                match sink.try_send(&pw.buf[pw.offset..])? {
                    SendStatus::Full => {
                        self.paused = true;
                    }
                    SendStatus::Sent(n) => {
                        pw.offset += n;
                        if pw.offset >= pw.buf.len() {
                            let pw = self.pending.take().expect("pending frame present");
                            self.cursor = Some(Cursor {
                                seq: pw.seq,
                                hint: pw.hint,
                            });
                            // The entry may have been evicted mid-write.
                            if let Some(idx) = self.locate(pw.seq, pw.hint) {
                                on_sent(self.queue.get_mut(idx).expect("located index in bounds"));
                            }
                        }
                    }
                }
                continue;
            }

            let Some(idx) = self.next_index() else {
                return Ok(());
            };
            let entry = self.queue.get_mut(idx).expect("index from next_index");
            let buf = match &entry.encoded {
                Some(b) => b.clone(),
                None => {
                    let b = (self.encoder)(&entry.message);
                    entry.encoded = Some(b.clone());
                    b
                }
            };
            let seq = entry.seq;
            self.pending = Some(PendingWrite {
                seq,
                hint: idx,
                buf,
                offset: 0,
            });
        }
    }

    /// Pick the next eligible entry: re-locate the cursor by identity, then
    /// scan forward past it, skipping completed entries. With no cursor (or
    /// an evicted one) the scan starts at the front.
    fn next_index(&mut self) -> Option<usize> {
        let len = self.queue.len();
        if len == 0 {
            return None;
        }
        let confirmed: i64 = match self.cursor {
            None => -1,
            Some(Cursor { seq, hint }) => match self.locate(seq, hint) {
                Some(i) => {
                    self.cursor = Some(Cursor { seq, hint: i });
                    i as i64
                }
                None => {
                    // Evicted while we were away; restart from the front.
                    self.cursor = None;
                    -1
                }
            },
        };
        let mut i = (confirmed + 1) as usize;
        while i < len {
            if !self.queue.get(i).expect("index in bounds").completed {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Identity scan backward from the clamped hint.
    fn locate(&self, seq: u64, hint: usize) -> Option<usize> {
        let len = self.queue.len();
        if len == 0 {
            return None;
        }
        let mut i = hint.min(len - 1) as i64;
        while i >= 0 {
            if self.queue.get(i as usize).expect("index in bounds").seq == seq {
                return Some(i as usize);
            }
            i -= 1;
        }
        None
    }
}
