/// Bounded output capture for command execution
use serde::{Deserialize, Serialize};

/// How completely a stream was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputIntegrity {
    /// Every byte up to EOF was kept
    #[default]
    Complete,
    /// Bytes beyond the capture limit were discarded
    Truncated,
    /// The stream ended with a read error rather than EOF
    ReadError,
    /// Capture was not requested
    NotCaptured,
}

/// Append-only byte buffer with a hard cap
#[derive(Debug, Clone)]
pub struct BoundedOutput {
    data: Vec<u8>,
    limit: usize,
    discarded: usize,
    integrity: OutputIntegrity,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            discarded: 0,
            integrity: OutputIntegrity::Complete,
        }
    }

    pub fn not_captured() -> Self {
        Self {
            data: Vec::new(),
            limit: 0,
            discarded: 0,
            integrity: OutputIntegrity::NotCaptured,
        }
    }

    /// Keep what fits; count the rest as discarded
    pub fn push(&mut self, chunk: &[u8]) {
        if self.integrity == OutputIntegrity::NotCaptured {
            return;
        }
        let room = self.limit.saturating_sub(self.data.len());
        let kept = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..kept]);
        if kept < chunk.len() {
            self.discarded += chunk.len() - kept;
            self.integrity = OutputIntegrity::Truncated;
        }
    }

    pub fn mark_read_error(&mut self) {
        if self.integrity == OutputIntegrity::Complete {
            self.integrity = OutputIntegrity::ReadError;
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn integrity(&self) -> OutputIntegrity {
        self.integrity
    }

    /// Lossy UTF-8 view
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limit_is_complete() {
        let mut out = BoundedOutput::new(16);
        out.push(b"hello ");
        out.push(b"world");
        assert_eq!(out.integrity(), OutputIntegrity::Complete);
        assert_eq!(out.into_string(), "hello world");
    }

    #[test]
    fn test_overflow_truncates_and_counts() {
        let mut out = BoundedOutput::new(4);
        out.push(b"abcdef");
        out.push(b"gh");
        assert_eq!(out.len(), 4);
        assert_eq!(out.discarded(), 4);
        assert_eq!(out.integrity(), OutputIntegrity::Truncated);
        assert_eq!(out.into_string(), "abcd");
    }

    #[test]
    fn test_not_captured_ignores_data() {
        let mut out = BoundedOutput::not_captured();
        out.push(b"ignored");
        assert!(out.is_empty());
        assert_eq!(out.integrity(), OutputIntegrity::NotCaptured);
    }

    #[test]
    fn test_read_error_does_not_mask_truncation() {
        let mut out = BoundedOutput::new(1);
        out.push(b"xy");
        out.mark_read_error();
        assert_eq!(out.integrity(), OutputIntegrity::Truncated);
    }
}
