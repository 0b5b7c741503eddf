//! Scripted in-memory transport: plays the servo side of the bus.

use embassy_time::{Duration, Timer};
use heapless::{Deque, Vec};

use super::codec::Frame;
use super::transport::Transport;

const SCRIPT_DEPTH: usize = 32;
const REPLY_MAX: usize = 1024;
const LOG_DEPTH: usize = 64;

/// Replies are released into the input buffer one script entry per write, in
/// the order they were queued. An empty entry models a servo that stays silent.
pub struct MockTransport {
    baud_rate: Option<u32>,
    refuse_open: bool,
    short_writes: bool,
    chunk: usize,
    script: Deque<Vec<u8, REPLY_MAX>, SCRIPT_DEPTH>,
    input: Deque<u8, REPLY_MAX>,
    written: Vec<Frame, LOG_DEPTH>,
    reads: usize,
    flushes: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            baud_rate: None,
            refuse_open: false,
            short_writes: false,
            chunk: usize::MAX,
            script: Deque::new(),
            input: Deque::new(),
            written: Vec::new(),
            reads: 0,
            flushes: 0,
        }
    }

    /// Bytes that arrive after the next unanswered write.
    pub fn queue_reply(&mut self, bytes: &[u8]) -> &mut Self {
        let mut entry = Vec::new();
        let _ = entry.extend_from_slice(&bytes[..bytes.len().min(REPLY_MAX)]);
        let _ = self.script.push_back(entry);
        self
    }

    /// A write that gets no answer at all.
    pub fn queue_silence(&mut self) -> &mut Self {
        self.queue_reply(&[])
    }

    /// Bytes already sitting in the input buffer (a stale reply, line noise).
    pub fn inject(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let _ = self.input.push_back(b);
        }
    }

    /// Deliver at most `n` bytes per read call.
    pub fn set_chunk(&mut self, n: usize) {
        self.chunk = n.max(1);
    }

    pub fn set_short_writes(&mut self, on: bool) {
        self.short_writes = on;
    }

    pub fn set_refuse_open(&mut self, on: bool) {
        self.refuse_open = on;
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    pub fn written(&self) -> &[Frame] {
        &self.written
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }
}

impl Transport for MockTransport {
    async fn open(&mut self, baud_rate: u32) -> bool {
        if self.refuse_open {
            return false;
        }
        self.baud_rate = Some(baud_rate);
        true
    }

    async fn write(&mut self, bytes: &[u8]) -> usize {
        let mut frame = Frame::new();
        let _ = frame.extend_from_slice(&bytes[..bytes.len().min(frame.capacity())]);
        let _ = self.written.push(frame);

        if let Some(reply) = self.script.pop_front() {
            self.inject(&reply);
        }
        if self.short_writes {
            bytes.len().saturating_sub(1)
        } else {
            bytes.len()
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        self.reads += 1;
        if self.input.is_empty() {
            Timer::after(timeout).await;
            return 0;
        }
        let mut n = 0;
        while n < buf.len() && n < self.chunk {
            match self.input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    async fn flush_input(&mut self) {
        self.flushes += 1;
        self.input.clear();
    }

    async fn close(&mut self) {
        self.baud_rate = None;
    }
}
