//! Query events as emitted by database bindings.

use std::time::Duration;

/// One frame of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Source identity of the code running in this frame (module name or
    /// path). `None` for native code.
    pub source: Option<String>,
    /// 1-based line within `source`.
    pub line: Option<usize>,
}

impl CallFrame {
    pub fn new(source: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            source: Some(source.into()),
            line,
        }
    }

    /// A frame inside library or binding internals.
    pub fn native(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }
}

/// Call stack captured at the moment a query was issued, innermost frame
/// first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    pub fn new(frames: Vec<CallFrame>) -> Self {
        Self { frames }
    }

    /// An empty stack: the query was not issued by any script code.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// First frame, scanning top-down, whose source identity is `source`.
    pub fn first_in(&self, source: &str) -> Option<&CallFrame> {
        self.frames
            .iter()
            .find(|f| f.source.as_deref() == Some(source))
    }
}

/// A raw query observation from a binding's instrumentation hook.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// Statement text with parameters inlined.
    pub sql: String,
    /// Statement text with placeholders.
    pub template: String,
    /// `None` when the binding could not time the statement.
    pub duration: Option<Duration>,
    pub stack: CallStack,
    /// Name of the binding that executed the statement.
    pub binding: &'static str,
    /// Rows returned or affected.
    pub rows: u64,
    pub failed: bool,
}

impl QueryEvent {
    pub fn new(sql: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            template: template.into(),
            duration: None,
            stack: CallStack::empty(),
            binding: "unknown",
            rows: 0,
            failed: false,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_stack(mut self, stack: CallStack) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_binding(mut self, binding: &'static str) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = rows;
        self
    }

    pub fn failed(mut self) -> Self {
        self.failed = true;
        self
    }

    /// Duration in milliseconds; unknown durations count as zero.
    pub fn millis(&self) -> f64 {
        self.duration.map_or(0.0, |d| d.as_secs_f64() * 1000.0)
    }
}

/// Observer for query events. Implementations must tolerate concurrent
/// calls from several threads.
pub trait QueryListener: Send + Sync {
    fn on_query(&self, event: &QueryEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_in_scans_top_down() {
        let stack = CallStack::new(vec![
            CallFrame::native("orm"),
            CallFrame::new("transaction.rhai", Some(7)),
            CallFrame::new("transaction.rhai", Some(2)),
        ]);
        assert_eq!(stack.first_in("transaction.rhai").unwrap().line, Some(7));
        assert!(stack.first_in("other.rhai").is_none());
    }

    #[test]
    fn unknown_duration_is_zero_millis() {
        let event = QueryEvent::new("SELECT 1", "SELECT ?");
        assert_eq!(event.millis(), 0.0);
        let timed = event.with_duration(Duration::from_micros(1500));
        assert!((timed.millis() - 1.5).abs() < 1e-9);
    }
}
