//! Fair-share usage attribution.

pub mod aggregator;

pub use aggregator::{
    aggregate_kernel_usage_to_buckets, split_by_day, BucketAggregation, BucketDelta, DayFragment,
    DomainUsageBucketKey, KernelUsageRecord, ProjectUsageBucketKey, UserUsageBucketKey,
};
