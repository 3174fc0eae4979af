//! Day-bucketed attribution of kernel resource usage.
//!
//! Usage records arrive as intervals with a resource-seconds total. Each one
//! is split at UTC midnight and accumulated into user, project and domain
//! buckets. Splitting conserves the total exactly: every fragment but the
//! last is scaled proportionally and truncated, and the last one takes the
//! remainder.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sokovan_id::{KernelId, ProjectId, SessionId, UserId};
use sokovan_resource::ResourceSlot;
use tracing::warn;

/// Decimal places kept on proportionally scaled fragments.
const FRAGMENT_SCALE: u32 = 9;

/// Usage of one kernel over one measurement period.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelUsageRecord {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub user_uuid: UserId,
    pub project_id: ProjectId,
    pub domain_name: String,
    pub resource_group: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Resource-seconds consumed during the period.
    pub resource_usage: ResourceSlot,
}

/// The part of a record that falls on one calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayFragment {
    pub date: NaiveDate,
    pub resource_usage: ResourceSlot,
    pub duration_seconds: Decimal,
}

fn millis_to_seconds(ms: i64) -> Decimal {
    Decimal::new(ms, 3)
}

fn next_midnight(ts: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = ts.date_naive() + Duration::days(1);
    tomorrow.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Splits `record` at every UTC midnight inside its period.
///
/// An interval ending exactly at midnight belongs to the earlier day; one
/// starting exactly at midnight belongs to the later day.
pub fn split_by_day(record: &KernelUsageRecord) -> Vec<DayFragment> {
    let start = record.period_start;
    let end = record.period_end;
    if end < start {
        warn!(
            kernel_id = %record.kernel_id,
            period_start = %start,
            period_end = %end,
            "Usage record ends before it starts; skipping"
        );
        return Vec::new();
    }
    if start == end {
        return Vec::new();
    }

    let total_ms = (end - start).num_milliseconds();
    if start.date_naive() == end.date_naive() {
        return vec![DayFragment {
            date: start.date_naive(),
            resource_usage: record.resource_usage.clone(),
            duration_seconds: millis_to_seconds(total_ms),
        }];
    }

    let total = Decimal::from(total_ms);
    let mut fragments = Vec::new();
    let mut allocated = ResourceSlot::new();
    let mut cursor = start;
    loop {
        let segment_end = next_midnight(cursor).min(end);
        let segment_ms = (segment_end - cursor).num_milliseconds();
        if segment_end == end {
            fragments.push(DayFragment {
                date: cursor.date_naive(),
                resource_usage: &record.resource_usage - &allocated,
                duration_seconds: millis_to_seconds(segment_ms),
            });
            break;
        }
        let usage = record
            .resource_usage
            .scale(Decimal::from(segment_ms), total)
            .truncate_dp(FRAGMENT_SCALE);
        allocated += &usage;
        fragments.push(DayFragment {
            date: cursor.date_naive(),
            resource_usage: usage,
            duration_seconds: millis_to_seconds(segment_ms),
        });
        cursor = segment_end;
    }
    fragments
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserUsageBucketKey {
    pub user_uuid: UserId,
    pub project_id: ProjectId,
    pub domain_name: String,
    pub resource_group: String,
    pub period_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectUsageBucketKey {
    pub project_id: ProjectId,
    pub domain_name: String,
    pub resource_group: String,
    pub period_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainUsageBucketKey {
    pub domain_name: String,
    pub resource_group: String,
    pub period_date: NaiveDate,
}

/// Accumulated usage for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketDelta {
    pub slots: ResourceSlot,
    pub duration_seconds: Decimal,
}

impl BucketDelta {
    fn add(&mut self, fragment: &DayFragment) {
        self.slots += &fragment.resource_usage;
        self.duration_seconds += fragment.duration_seconds;
    }
}

/// Deltas to be written to the daily usage tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketAggregation {
    pub user_usage_deltas: BTreeMap<UserUsageBucketKey, BucketDelta>,
    pub project_usage_deltas: BTreeMap<ProjectUsageBucketKey, BucketDelta>,
    pub domain_usage_deltas: BTreeMap<DomainUsageBucketKey, BucketDelta>,
}

impl BucketAggregation {
    pub fn is_empty(&self) -> bool {
        self.user_usage_deltas.is_empty()
    }
}

/// Splits every record by day and sums the fragments per scope.
pub fn aggregate_kernel_usage_to_buckets(records: &[KernelUsageRecord]) -> BucketAggregation {
    let mut result = BucketAggregation::default();
    for record in records {
        for fragment in split_by_day(record) {
            result
                .user_usage_deltas
                .entry(UserUsageBucketKey {
                    user_uuid: record.user_uuid,
                    project_id: record.project_id,
                    domain_name: record.domain_name.clone(),
                    resource_group: record.resource_group.clone(),
                    period_date: fragment.date,
                })
                .or_default()
                .add(&fragment);
            result
                .project_usage_deltas
                .entry(ProjectUsageBucketKey {
                    project_id: record.project_id,
                    domain_name: record.domain_name.clone(),
                    resource_group: record.resource_group.clone(),
                    period_date: fragment.date,
                })
                .or_default()
                .add(&fragment);
            result
                .domain_usage_deltas
                .entry(DomainUsageBucketKey {
                    domain_name: record.domain_name.clone(),
                    resource_group: record.resource_group.clone(),
                    period_date: fragment.date,
                })
                .or_default()
                .add(&fragment);
        }
    }
    result
}
