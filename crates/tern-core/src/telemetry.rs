//! Caller-context telemetry around interesting queries.
//!
//! A correlation id is established before execution and a
//! start/complete/error record is emitted around the execute call.
//! Recording must never affect the query result: implementations are
//! infallible by contract and the dispatcher swallows nothing because
//! there is nothing to swallow.

use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPhase {
    Started,
    Completed { rows: usize, duration_ms: u64 },
    Failed { error: String, duration_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub correlation_id: String,
    pub session: String,
    pub query: String,
    pub phase: QueryPhase,
}

pub trait QueryTelemetry: Send + Sync {
    fn record(&self, event: &QueryEvent);
}

/// Emits telemetry through the log stream.
pub struct LogTelemetry;

impl QueryTelemetry for LogTelemetry {
    fn record(&self, event: &QueryEvent) {
        match &event.phase {
            QueryPhase::Started => tracing::info!(
                correlation = %event.correlation_id,
                session = %event.session,
                "query started"
            ),
            QueryPhase::Completed { rows, duration_ms } => tracing::info!(
                correlation = %event.correlation_id,
                session = %event.session,
                rows,
                duration_ms,
                "query completed"
            ),
            QueryPhase::Failed { error, duration_ms } => tracing::warn!(
                correlation = %event.correlation_id,
                session = %event.session,
                duration_ms,
                error = %error,
                "query failed"
            ),
        }
    }
}

pub struct NoopTelemetry;

impl QueryTelemetry for NoopTelemetry {
    fn record(&self, _event: &QueryEvent) {}
}

/// Test sink capturing every event.
#[derive(Default)]
pub struct CollectingTelemetry {
    pub events: Mutex<Vec<QueryEvent>>,
}

impl QueryTelemetry for CollectingTelemetry {
    fn record(&self, event: &QueryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_telemetry_captures_phases() {
        let sink = CollectingTelemetry::default();
        let id = new_correlation_id();
        sink.record(&QueryEvent {
            correlation_id: id.clone(),
            session: "s".to_string(),
            query: "SELECT 1".to_string(),
            phase: QueryPhase::Started,
        });
        sink.record(&QueryEvent {
            correlation_id: id.clone(),
            session: "s".to_string(),
            query: "SELECT 1".to_string(),
            phase: QueryPhase::Completed {
                rows: 1,
                duration_ms: 3,
            },
        });
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id, events[1].correlation_id);
        assert_eq!(events[0].phase, QueryPhase::Started);
    }
}
