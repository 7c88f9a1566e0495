// Per-user usage accounting
//
// Counters live in fixed wall-clock windows: the minute counters belong to
// `unix / 60`, the day counter to `unix / 86400`. A stale window is zeroed
// lazily on the next write or snapshot.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use super::TokenUsage;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub user_id: u64,
    pub model: String,
    pub requests_this_minute: u64,
    pub tokens_this_minute: u64,
    pub input_tokens_this_minute: u64,
    pub output_tokens_this_minute: u64,
    pub tokens_this_day: u64,
    #[serde(skip)]
    pub(crate) minute_window: i64,
    #[serde(skip)]
    pub(crate) day_window: i64,
}

impl UsageRecord {
    fn empty(user_id: u64, model: &str, now: i64) -> Self {
        Self {
            user_id,
            model: model.to_string(),
            minute_window: now.div_euclid(SECONDS_PER_MINUTE),
            day_window: now.div_euclid(SECONDS_PER_DAY),
            ..Default::default()
        }
    }

    fn roll_windows(&mut self, now: i64) {
        let minute = now.div_euclid(SECONDS_PER_MINUTE);
        if minute != self.minute_window {
            self.minute_window = minute;
            self.requests_this_minute = 0;
            self.tokens_this_minute = 0;
            self.input_tokens_this_minute = 0;
            self.output_tokens_this_minute = 0;
        }

        let day = now.div_euclid(SECONDS_PER_DAY);
        if day != self.day_window {
            self.day_window = day;
            self.tokens_this_day = 0;
        }
    }
}

/// In-memory usage counters keyed by (caller, model)
#[derive(Debug, Default)]
pub struct UsageTracker {
    records: RwLock<HashMap<(u64, String), UsageRecord>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: u64, model: &str, usage: TokenUsage) {
        self.record_at(user_id, model, usage, chrono::Utc::now().timestamp());
    }

    pub fn record_at(&self, user_id: u64, model: &str, usage: TokenUsage, now: i64) {
        let mut records = self.records.write();
        let record = records
            .entry((user_id, model.to_string()))
            .or_insert_with(|| UsageRecord::empty(user_id, model, now));

        record.roll_windows(now);
        record.requests_this_minute += 1;
        record.input_tokens_this_minute += usage.input;
        record.output_tokens_this_minute += usage.output;
        record.tokens_this_minute += usage.total();
        record.tokens_this_day += usage.total();

        tracing::debug!(
            "Recorded usage for user {} on {}: requests={} tokens_today={}",
            user_id,
            model,
            record.requests_this_minute,
            record.tokens_this_day
        );
    }

    /// Copy of the current counters; zero-valued when nothing was recorded.
    pub fn snapshot(&self, user_id: u64, model: &str) -> UsageRecord {
        self.snapshot_at(user_id, model, chrono::Utc::now().timestamp())
    }

    pub fn snapshot_at(&self, user_id: u64, model: &str, now: i64) -> UsageRecord {
        let records = self.records.read();
        match records.get(&(user_id, model.to_string())) {
            Some(record) => {
                let mut copy = record.clone();
                copy.roll_windows(now);
                copy
            }
            None => UsageRecord::empty(user_id, model, now),
        }
    }
}
