//! Catch-all HTTP capture: a listener that records every inbound request
//! into a bounded, queryable in-memory history with live statistics.

pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod handlers;
pub mod models;
pub mod server;
pub mod stats;
pub mod store;

pub use config::Settings;
pub use error::{CaptureError, CaptureResult};
pub use events::{ChangeStream, StoreEvent};
pub use filter::{PathMatch, RequestFilter};
pub use models::{CapturedRequest, RequestIdGenerator, Statistics};
pub use server::CaptureServer;
pub use store::{RequestSink, RequestStore};
