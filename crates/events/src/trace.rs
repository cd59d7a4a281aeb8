//! Background query tracing.
//!
//! [`QueryTrace`] drains the [`QueryBus`](crate::bus::QueryBus) tap and
//! writes a `debug` line per statement to the diagnostic log. It shuts down
//! when the bus is dropped.

use querylens_core::query::QueryEvent;
use tokio::sync::broadcast;

pub struct QueryTrace;

impl QueryTrace {
    /// Run the trace loop until the channel closes. Returns the number of
    /// events traced.
    pub async fn run(mut receiver: broadcast::Receiver<QueryEvent>) -> u64 {
        let mut traced = 0;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    Self::trace(&event);
                    traced += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Query trace lagged, some statements were not traced");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!(traced, "Query bus closed, trace shutting down");
                    break;
                }
            }
        }
        traced
    }

    fn trace(event: &QueryEvent) {
        if event.failed {
            tracing::debug!(
                binding = event.binding,
                elapsed_ms = event.millis(),
                sql = %event.sql,
                "Statement failed"
            );
        } else {
            tracing::debug!(
                binding = event.binding,
                elapsed_ms = event.millis(),
                rows = event.rows,
                sql = %event.sql,
                "Statement executed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::QueryBus;

    #[tokio::test]
    async fn exits_when_bus_is_dropped() {
        let bus = Arc::new(QueryBus::default());
        let handle = tokio::spawn(QueryTrace::run(bus.tap()));

        bus.emit(QueryEvent::new("SELECT 1", "SELECT ?"));
        bus.emit(QueryEvent::new("SELECT 2", "SELECT ?").failed());
        drop(bus);

        let traced = handle.await.unwrap();
        assert_eq!(traced, 2);
    }
}
