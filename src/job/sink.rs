//! Append-only text sinks that engines write job output and errors into.

use std::sync::{Arc, Mutex, MutexGuard};

/// Shared, append-only text buffer.
///
/// Cloning yields another handle to the same buffer, so an engine can append
/// from its own task while the job that owns the sink sits in the completion
/// table.
#[derive(Debug, Clone, Default)]
pub struct TextSink {
    inner: Arc<Mutex<String>>,
}

impl TextSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> MutexGuard<'_, String> {
        // A panic while appending cannot leave the String itself invalid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append text to the sink.
    pub fn append(&self, text: &str) {
        self.buffer().push_str(text);
    }

    /// Append text followed by a newline.
    pub fn append_line(&self, text: &str) {
        let mut buf = self.buffer();
        buf.push_str(text);
        buf.push('\n');
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> String {
        self.buffer().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }
}
