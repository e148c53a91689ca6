//! Predicates used by dashboard and export reads.
//!
//! Every part of a [`RequestFilter`] is checked when it is built, so
//! applying one to the store cannot fail.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::{CaptureError, CaptureResult};
use crate::models::CapturedRequest;

/// How the request path is matched
#[derive(Debug, Clone)]
pub enum PathMatch {
    /// Case-insensitive substring; stored lowercased
    Contains(String),
    Pattern(Regex),
}

impl PathMatch {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Contains(needle) => path.to_lowercase().contains(needle.as_str()),
            PathMatch::Pattern(re) => re.is_match(path),
        }
    }
}

/// Conjunction of optional method, path and time-range predicates.
/// The default filter matches every request.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    methods: Vec<String>,
    path: Option<PathMatch>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

impl RequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method to the accepted set (case-insensitive)
    pub fn method(mut self, method: &str) -> Self {
        let method = method.trim().to_ascii_uppercase();
        if !method.is_empty() && !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    pub fn methods<'a>(self, methods: impl IntoIterator<Item = &'a str>) -> Self {
        methods.into_iter().fold(self, |filter, m| filter.method(m))
    }

    pub fn path_contains(mut self, needle: &str) -> Self {
        self.path = Some(PathMatch::Contains(needle.to_lowercase()));
        self
    }

    pub fn path_pattern(mut self, pattern: &str) -> CaptureResult<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| CaptureError::InvalidFilter(format!("path pattern {pattern:?}: {e}")))?;
        self.path = Some(PathMatch::Pattern(re));
        Ok(self)
    }

    /// Inclusive time range; either bound may be open
    pub fn between(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> CaptureResult<Self> {
        if let (Some(start), Some(end)) = (since, until) {
            if start > end {
                return Err(CaptureError::InvalidFilter(format!(
                    "time range starts at {start} after it ends at {end}"
                )));
            }
        }
        self.since = since;
        self.until = until;
        Ok(self)
    }

    /// Requests captured within the trailing window, e.g. the last hour
    pub fn within(mut self, window: Duration) -> Self {
        self.since = Some(Utc::now() - window);
        self.until = None;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.path.is_none() && self.since.is_none() && self.until.is_none()
    }

    pub fn matches(&self, request: &CapturedRequest) -> bool {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&request.method))
        {
            return false;
        }

        if let Some(path) = &self.path {
            if !path.matches(&request.path) {
                return false;
            }
        }

        if self.since.is_some_and(|since| request.timestamp < since) {
            return false;
        }

        if self.until.is_some_and(|until| request.timestamp > until) {
            return false;
        }

        true
    }
}
