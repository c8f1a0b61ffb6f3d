// Public API - data types, engine and front-end
pub mod config;
pub mod error;
pub mod export;
pub mod server;
pub mod state;
pub mod trace;

// Plumbing shared by the binary and integration tests
pub mod cli;
pub mod probe;

pub use error::TraceError;
pub use trace::{TraceConnection, TraceEngine};
