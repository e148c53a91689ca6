use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name to ordered values; repeated keys keep every value in arrival order
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// Captured inbound HTTP request, immutable once admitted to the store
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query_params: MultiMap,
    /// Keys are lowercase header names
    pub headers: MultiMap,
    pub headers_truncated: bool,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
    pub truncated: bool,
    pub client_address: String,
    pub content_length: usize,
    pub user_agent: String,
}

fn serialize_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl CapturedRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    /// All values of a header in arrival order
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn query_values(&self, name: &str) -> &[String] {
        self.query_params
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Issues process-unique, monotonically increasing request ids.
///
/// Owned by whoever builds the capture server and shared explicitly, so
/// several servers can draw from one sequence.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests admitted within one fixed-width time bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeBucket {
    pub start: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: usize,
}

/// Point-in-time aggregate over the resident requests
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_count: usize,
    pub count_by_method: BTreeMap<String, usize>,
    pub count_per_time_bucket: Vec<TimeBucket>,
    pub average_body_size: f64,
    pub top_paths: Vec<PathCount>,
    pub last_updated: DateTime<Utc>,
}

/// Fixed acknowledgment returned to every captured client
#[derive(Debug, Serialize)]
pub struct CaptureAck {
    pub status: &'static str,
}

impl CaptureAck {
    pub const CAPTURED: CaptureAck = CaptureAck { status: "captured" };
}
