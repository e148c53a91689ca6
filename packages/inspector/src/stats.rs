use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use crate::config::StoreSettings;
use crate::models::{CapturedRequest, PathCount, Statistics, TimeBucket};

/// Running aggregate over the resident requests.
///
/// `record` and `forget` are exact inverses; counters that drop to zero are
/// removed so the maps only ever describe residents.
#[derive(Debug)]
pub struct StatsAccumulator {
    total: usize,
    body_bytes: u64,
    by_method: HashMap<String, usize>,
    by_bucket: BTreeMap<i64, usize>,
    by_path: HashMap<String, usize>,
    bucket_width: i64,
    top_n: usize,
    last_updated: DateTime<Utc>,
}

impl StatsAccumulator {
    pub fn new(settings: &StoreSettings) -> Self {
        Self {
            total: 0,
            body_bytes: 0,
            by_method: HashMap::new(),
            by_bucket: BTreeMap::new(),
            by_path: HashMap::new(),
            bucket_width: settings.bucket_width_secs.max(1),
            top_n: settings.top_paths,
            last_updated: Utc::now(),
        }
    }

    fn bucket_of(&self, timestamp: &DateTime<Utc>) -> i64 {
        timestamp.timestamp().div_euclid(self.bucket_width) * self.bucket_width
    }

    pub fn record(&mut self, request: &CapturedRequest) {
        self.total += 1;
        self.body_bytes += request.content_length as u64;
        *self.by_method.entry(request.method.clone()).or_insert(0) += 1;
        *self.by_bucket.entry(self.bucket_of(&request.timestamp)).or_insert(0) += 1;
        *self.by_path.entry(request.path.clone()).or_insert(0) += 1;
        self.last_updated = Utc::now();
    }

    pub fn forget(&mut self, request: &CapturedRequest) {
        self.total = self.total.saturating_sub(1);
        self.body_bytes = self.body_bytes.saturating_sub(request.content_length as u64);
        decrement(&mut self.by_method, &request.method);
        let bucket = self.bucket_of(&request.timestamp);
        if let Some(count) = self.by_bucket.get_mut(&bucket) {
            *count -= 1;
            if *count == 0 {
                self.by_bucket.remove(&bucket);
            }
        }
        decrement(&mut self.by_path, &request.path);
        self.last_updated = Utc::now();
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.body_bytes = 0;
        self.by_method.clear();
        self.by_bucket.clear();
        self.by_path.clear();
        self.last_updated = Utc::now();
    }

    pub fn snapshot(&self) -> Statistics {
        let average_body_size = if self.total == 0 {
            0.0
        } else {
            self.body_bytes as f64 / self.total as f64
        };

        Statistics {
            total_count: self.total,
            count_by_method: self
                .by_method
                .iter()
                .map(|(method, count)| (method.clone(), *count))
                .collect(),
            count_per_time_bucket: self
                .by_bucket
                .iter()
                .filter_map(|(start, count)| {
                    Utc.timestamp_opt(*start, 0).single().map(|start| TimeBucket {
                        start,
                        count: *count,
                    })
                })
                .collect(),
            average_body_size,
            top_paths: self.top_paths(),
            last_updated: self.last_updated,
        }
    }

    /// Highest counts first, ties ordered by path
    fn top_paths(&self) -> Vec<PathCount> {
        if self.top_n == 0 {
            return Vec::new();
        }

        // Min-heap of the best `top_n` seen so far
        let mut heap = BinaryHeap::with_capacity(self.top_n.min(self.by_path.len()) + 1);
        for (path, count) in &self.by_path {
            heap.push(Reverse((*count, Reverse(path.as_str()))));
            if heap.len() > self.top_n {
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|Reverse((count, Reverse(path)))| PathCount {
                path: path.to_string(),
                count,
            })
            .collect()
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            map.remove(key);
        }
    }
}
