//! Line-attributed query logging.
//!
//! [`QueryLogger`] is the listener attached to the query hub while user code
//! runs. For every event it looks for the first stack frame that belongs to
//! the loaded transaction source and, if there is one, records the line
//! number and the trimmed text of that line alongside the query.

use std::sync::{Mutex, PoisonError};

use crate::query::{QueryEvent, QueryListener};
use crate::result::QueryRecord;

pub struct QueryLogger {
    /// Source identity the transaction module was loaded under.
    source_id: String,
    source_text: String,
    records: Mutex<Vec<QueryRecord>>,
}

impl QueryLogger {
    pub fn new(source_id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_text: source_text.into(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Intake for one query event.
    ///
    /// Never fails: attribution problems only leave the line fields unset.
    pub fn record(&self, event: &QueryEvent) {
        let (line_number, source_context) = match self.attribute(event) {
            Some(line) => (Some(line), self.source_line(line)),
            None => (None, None),
        };

        let record = QueryRecord {
            sql: event.sql.clone(),
            template: event.template.clone(),
            time: event.millis(),
            line_number,
            source_context,
        };

        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Drain the recorded queries in issuance order.
    pub fn take(&self) -> Vec<QueryRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attribute(&self, event: &QueryEvent) -> Option<usize> {
        event
            .stack
            .first_in(&self.source_id)
            .and_then(|frame| frame.line)
            .filter(|line| *line > 0)
    }

    /// Trimmed text of the 1-based `line`, if it exists.
    fn source_line(&self, line: usize) -> Option<String> {
        self.source_text
            .lines()
            .nth(line.checked_sub(1)?)
            .map(|text| text.trim().to_string())
    }
}

impl QueryListener for QueryLogger {
    fn on_query(&self, event: &QueryEvent) {
        self.record(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::query::{CallFrame, CallStack};

    const SOURCE: &str = "fn run(db) {\n    db.query(\"SELECT 1\");\n    db.create(\"Driver\", #{ name: \"Max\" });\n}\n";

    fn event_at(line: usize) -> QueryEvent {
        QueryEvent::new("SELECT 1", "SELECT ?").with_stack(CallStack::new(vec![
            CallFrame::native("orm"),
            CallFrame::new("transaction.rhai", Some(line)),
        ]))
    }

    #[test]
    fn attributes_first_matching_frame() {
        let logger = QueryLogger::new("transaction.rhai", SOURCE);
        logger.record(&event_at(3));

        let records = logger.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line_number, Some(3));
        assert_eq!(
            records[0].source_context.as_deref(),
            Some("db.create(\"Driver\", #{ name: \"Max\" });")
        );
    }

    #[test]
    fn library_only_stack_leaves_line_unset() {
        let logger = QueryLogger::new("transaction.rhai", SOURCE);
        let event = QueryEvent::new("PRAGMA foreign_keys", "PRAGMA foreign_keys").with_stack(
            CallStack::new(vec![
                CallFrame::native("orm"),
                CallFrame::new("prelude.rhai", Some(2)),
            ]),
        );
        logger.record(&event);

        let records = logger.take();
        assert_eq!(records[0].line_number, None);
        assert_eq!(records[0].source_context, None);
    }

    #[test]
    fn line_past_end_keeps_number_without_context() {
        let logger = QueryLogger::new("transaction.rhai", SOURCE);
        logger.record(&event_at(40));

        let records = logger.take();
        assert_eq!(records[0].line_number, Some(40));
        assert_eq!(records[0].source_context, None);
    }

    #[test]
    fn identical_queries_are_not_deduplicated() {
        let logger = QueryLogger::new("transaction.rhai", SOURCE);
        logger.record(&event_at(2));
        logger.record(&event_at(2));
        assert_eq!(logger.len(), 2);
    }

    #[test]
    fn missing_duration_records_zero() {
        let logger = QueryLogger::new("transaction.rhai", SOURCE);
        logger.record(&QueryEvent::new("SELECT 1", "SELECT ?"));
        logger.record(&event_at(2).with_duration(Duration::from_millis(4)));

        let records = logger.take();
        assert_eq!(records[0].time, 0.0);
        assert_eq!(records[1].time, 4.0);
        assert!(logger.is_empty(), "take drains the log");
    }

    #[test]
    fn concurrent_intake_loses_nothing() {
        let logger = Arc::new(QueryLogger::new("transaction.rhai", SOURCE));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let logger = Arc::clone(&logger);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        logger.on_query(&event_at(2 + t % 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = logger.take();
        assert_eq!(records.len(), 400);
        assert!(records
            .iter()
            .all(|r| matches!(r.line_number, Some(2) | Some(3))));
    }
}
