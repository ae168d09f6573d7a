/*!
 * Reassembles raw serial chunks into complete responses.
 *
 * Serial reads deliver arbitrary fragments. A response is complete once a
 * final result line (`OK`, `ERROR` or `+CME ERROR...`) arrives; anything
 * still pending when the line goes idle is flushed by the caller. A device
 * that streams without ever sending a final line is cut into responses of
 * at most the pending limit. Without an idle window the assembler passes
 * every chunk through unchanged.
 */
use std::time::Duration;

const FINAL_RESULTS: [&str; 2] = ["OK", "ERROR"];
const CME_ERROR_PREFIX: &str = "+CME ERROR";

/// Bytes held back before a partial response is flushed regardless
pub const DEFAULT_PENDING_LIMIT: usize = 16 * 1024;

/// Buffers chunks until a response is complete
#[derive(Debug)]
pub struct ResponseAssembler {
    idle: Option<Duration>,
    limit: usize,
    buffer: String,
}

impl ResponseAssembler {
    /// Create an assembler; `None` disables buffering
    pub fn new(idle: Option<Duration>) -> Self {
        Self {
            idle,
            limit: DEFAULT_PENDING_LIMIT,
            buffer: String::new(),
        }
    }

    /// Cap the pending buffer at `limit` bytes
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Idle window after which a partial response is flushed
    pub fn idle(&self) -> Option<Duration> {
        self.idle
    }

    /// Whether partial data is waiting for more input
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Feed a chunk and collect every response it completes
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        if self.idle.is_none() {
            return vec![chunk.to_string()];
        }

        let scan_from = self.buffer.rfind('\n').map(|i| i + 1).unwrap_or(0);
        self.buffer.push_str(chunk);

        let mut responses = Vec::new();
        let mut line_start = scan_from;
        let mut cut = 0;
        while let Some(offset) = self.buffer[line_start..].find('\n') {
            let line_end = line_start + offset + 1;
            if is_final_result(&self.buffer[line_start..line_end]) {
                responses.push(self.buffer[cut..line_end].to_string());
                cut = line_end;
            }
            line_start = line_end;
        }
        if cut > 0 {
            self.buffer.drain(..cut);
        }
        if self.buffer.len() >= self.limit {
            responses.extend(self.flush());
        }
        responses
    }

    /// Take whatever is pending as a response
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

fn is_final_result(line: &str) -> bool {
    let line = line.trim();
    FINAL_RESULTS.contains(&line) || line.starts_with(CME_ERROR_PREFIX)
}
