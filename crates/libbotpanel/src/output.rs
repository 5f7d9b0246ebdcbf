use std::collections::VecDeque;
use std::time::SystemTime;

/// Number of lines kept per bot for replay.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Where a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Synthesized by the supervisor (lifecycle notices, stdin echo).
    Status,
}

/// One immutable chunk of console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    pub source: LineSource,
    pub text: String,
    pub timestamp: SystemTime,
}

/// Bounded, oldest-evicting history of a single bot's console.
#[derive(Debug)]
pub struct LogRingBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
    next_seq: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    /// Stamp `text` with the next sequence number and append it, evicting
    /// from the head once the capacity is exceeded.
    pub fn append(&mut self, source: LineSource, text: String) -> LogLine {
        let line = LogLine {
            seq: self.next_seq,
            source,
            text,
            timestamp: SystemTime::now(),
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.capacity {
            let _ = self.lines.pop_front();
        }
        line
    }

    /// Copy of the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
