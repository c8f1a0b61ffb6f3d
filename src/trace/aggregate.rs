use chrono::Utc;
use std::sync::Arc;

use crate::export::TraceSink;
use crate::state::{TraceResult, TraceSession};

/// Turns terminated sessions into immutable results and logs them
#[derive(Clone)]
pub struct Aggregator {
    sink: Arc<dyn TraceSink>,
}

impl Aggregator {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }

    /// Freeze the hop list, stamp the end time and emit one log record
    ///
    /// Takes the session by value: nothing can touch it afterwards.
    pub fn finalize(&self, session: TraceSession, error: Option<&str>) -> TraceResult {
        debug_assert!(session.state.is_terminal());

        let result = TraceResult::freeze(session, Utc::now());
        self.sink.record_trace(&result, error);

        tracing::info!(
            session = %result.session_id,
            target = %result.target,
            hops = result.hops.len(),
            completed = result.completed,
            reached = result.reached,
            error,
            "trace finished"
        );
        result
    }
}
