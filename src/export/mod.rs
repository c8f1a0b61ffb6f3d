pub mod jsonl;

pub use jsonl::*;

use crate::state::TraceResult;

/// Receives one record per finalized trace session
pub trait TraceSink: Send + Sync {
    fn record_trace(&self, result: &TraceResult, error: Option<&str>);
}
