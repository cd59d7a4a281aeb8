//! Instrumented connection.
//!
//! [`Connection`] is what the rest of the harness talks to. It times each
//! statement on the underlying [`Backend`] and emits exactly one
//! [`QueryEvent`] per statement on the [`QueryBus`] after it completes,
//! failed statements included.

use std::sync::Arc;
use std::time::{Duration, Instant};

use querylens_core::query::{CallStack, QueryEvent};
use querylens_core::sql::{self, Dialect, SqlValue};
use querylens_events::QueryBus;

use crate::backend::{Backend, Row};
use crate::DbResult;

#[derive(Clone)]
pub struct Connection {
    backend: Arc<dyn Backend>,
    bus: Arc<QueryBus>,
}

impl Connection {
    pub fn new(backend: Arc<dyn Backend>, bus: Arc<QueryBus>) -> Self {
        Self { backend, bus }
    }

    /// Connect to `url` and report statements on `bus`.
    pub async fn open(url: &str, bus: Arc<QueryBus>) -> DbResult<Self> {
        let backend = crate::connect(url).await?;
        Ok(Self::new(backend, bus))
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub fn bus(&self) -> &Arc<QueryBus> {
        &self.bus
    }

    /// Run a row-returning statement issued from `stack`.
    pub async fn fetch(
        &self,
        statement: &str,
        params: &[SqlValue],
        stack: CallStack,
    ) -> DbResult<Vec<Row>> {
        let started = Instant::now();
        let result = self.backend.fetch(statement, params).await;
        let rows = result.as_ref().map_or(0, |rows| rows.len() as u64);
        self.report(statement, params, stack, Some(started.elapsed()), rows, result.is_err());
        result
    }

    /// Run a statement issued from `stack` and return the affected row count.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[SqlValue],
        stack: CallStack,
    ) -> DbResult<u64> {
        let started = Instant::now();
        let result = self.backend.execute(statement, params).await;
        let rows = result.as_ref().copied().unwrap_or(0);
        self.report(statement, params, stack, Some(started.elapsed()), rows, result.is_err());
        result
    }

    /// Run statements in one transaction. Reported as one event per
    /// statement without a duration, since only the batch as a whole is timed.
    pub async fn execute_batch(&self, statements: &[String]) -> DbResult<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.backend.execute_batch(statements).await;
        tracing::debug!(
            statements = statements.len(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Batch executed"
        );
        for statement in statements {
            self.report(statement, &[], CallStack::empty(), None, 0, result.is_err());
        }
        result
    }

    /// Release the connection. Never fails.
    pub async fn close(&self) {
        self.backend.close().await;
    }

    fn report(
        &self,
        statement: &str,
        params: &[SqlValue],
        stack: CallStack,
        duration: Option<Duration>,
        rows: u64,
        failed: bool,
    ) {
        let (rendered, template) = if params.is_empty() {
            (statement.to_string(), sql::generalize(statement))
        } else {
            (
                sql::render(statement, params, self.dialect()),
                statement.to_string(),
            )
        };

        let mut event = QueryEvent::new(rendered, template)
            .with_stack(stack)
            .with_binding(self.backend.name())
            .with_rows(rows);
        if let Some(duration) = duration {
            event = event.with_duration(duration);
        }
        if failed {
            event = event.failed();
        }
        self.bus.emit(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use querylens_core::query::{CallFrame, QueryListener};

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<QueryEvent>>);

    impl QueryListener for Capture {
        fn on_query(&self, event: &QueryEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    async fn open() -> (Connection, Arc<Capture>) {
        let bus = Arc::new(QueryBus::default());
        let capture = Arc::new(Capture::default());
        bus.subscribe(capture.clone());
        let conn = Connection::open("sqlite::memory:", bus).await.unwrap();
        (conn, capture)
    }

    #[tokio::test]
    async fn reports_rendered_and_template_text() {
        let (conn, capture) = open().await;
        conn.execute("CREATE TABLE d (name TEXT)", &[], CallStack::empty())
            .await
            .unwrap();
        let stack = CallStack::new(vec![CallFrame::new("transaction.rhai", Some(4))]);
        conn.execute(
            "INSERT INTO d (name) VALUES (?)",
            &[SqlValue::Text("Lando".into())],
            stack.clone(),
        )
        .await
        .unwrap();

        let events = capture.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sql, "INSERT INTO d (name) VALUES ('Lando')");
        assert_eq!(events[1].template, "INSERT INTO d (name) VALUES (?)");
        assert_eq!(events[1].stack, stack);
        assert_eq!(events[1].binding, "sqlite");
        assert_eq!(events[1].rows, 1);
        assert!(events[1].duration.is_some());
    }

    #[tokio::test]
    async fn hand_written_literals_are_generalized() {
        let (conn, capture) = open().await;
        conn.fetch("SELECT 1 AS one WHERE 'a' = 'a'", &[], CallStack::empty())
            .await
            .unwrap();

        let events = capture.0.lock().unwrap();
        assert_eq!(events[0].sql, "SELECT 1 AS one WHERE 'a' = 'a'");
        assert_eq!(events[0].template, "SELECT ? AS one WHERE ? = ?");
        assert_eq!(events[0].rows, 1);
    }

    #[tokio::test]
    async fn failed_statements_are_reported() {
        let (conn, capture) = open().await;
        let result = conn
            .fetch("SELECT * FROM missing", &[], CallStack::empty())
            .await;
        assert!(result.is_err());

        let events = capture.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].failed);
    }

    #[tokio::test]
    async fn batch_reports_each_statement() {
        let (conn, capture) = open().await;
        conn.execute_batch(&[
            "CREATE TABLE a (id INTEGER)".to_string(),
            "CREATE TABLE b (id INTEGER)".to_string(),
        ])
        .await
        .unwrap();

        let events = capture.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.duration.is_none()));
        assert_eq!(events[1].millis(), 0.0);
    }
}
