//! Injectable output sinks for captured program output.

use std::sync::{Mutex, PoisonError};

/// Destination for lines printed by user code.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// In-memory sink: one entry per print call, joined with newlines.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured lines joined with `\n`, in emission order.
    pub fn contents(&self) -> String {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl OutputSink for BufferSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_in_order() {
        let sink = BufferSink::new();
        sink.write_line("Lewis");
        sink.write_line("Max\nVerstappen");
        assert_eq!(sink.contents(), "Lewis\nMax\nVerstappen");
        assert_eq!(sink.line_count(), 2);
    }

    #[test]
    fn empty_sink_is_empty_string() {
        assert_eq!(BufferSink::new().contents(), "");
    }
}
