//! Admission validators.
//!
//! Every validator is a pure check over a [`SystemSnapshot`]. The pipeline
//! runs them in order and stops at the first rejection.

use sokovan_id::SessionId;
use sokovan_resource::{ResourceSlot, SlotExcess};
use thiserror::Error;
use tracing::debug;

use super::snapshot::{DefaultForUnspecified, PendingSessionInfo, SessionWorkload, SystemSnapshot};

/// Which limit a resource check was measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    PendingSessions,
    Keypair,
    User,
    Group,
    Domain,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LimitScope::PendingSessions => "pending session",
            LimitScope::Keypair => "keypair",
            LimitScope::User => "user",
            LimitScope::Group => "project",
            LimitScope::Domain => "domain",
        })
    }
}

/// Rejection reasons returned to the admission caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingValidationError {
    #[error("{scope} resource limit exceeded ({})", format_excess(.excess))]
    ResourceLimitExceeded {
        scope: LimitScope,
        excess: Vec<SlotExcess>,
    },

    #[error("{} concurrency limit reached ({current}/{limit})", session_kind(.sftp))]
    ConcurrencyLimitExceeded { current: u32, limit: u32, sftp: bool },

    #[error("pending session count limit exceeded ({current} pending, limit {limit})")]
    PendingSessionCountLimitExceeded { current: u32, limit: u32 },

    #[error("waiting for {} dependency session(s) to finish successfully", .unsatisfied.len())]
    DependenciesNotSatisfied { unsatisfied: Vec<SessionId> },
}

fn session_kind(sftp: &bool) -> &'static str {
    if *sftp {
        "SFTP session"
    } else {
        "session"
    }
}

fn format_excess(excess: &[SlotExcess]) -> String {
    excess
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type ValidationResult = Result<(), SchedulingValidationError>;

/// One admission rule.
pub trait SchedulingValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult;
}

fn check(scope: LimitScope, excess: Vec<SlotExcess>) -> ValidationResult {
    if excess.is_empty() {
        Ok(())
    } else {
        Err(SchedulingValidationError::ResourceLimitExceeded { scope, excess })
    }
}

/// Every dependency session must have terminated successfully.
pub struct DependenciesValidator;

impl SchedulingValidator for DependenciesValidator {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(deps) = snapshot
            .session_dependencies
            .by_session
            .get(&workload.session_id)
        else {
            return Ok(());
        };
        let unsatisfied: Vec<SessionId> = deps
            .iter()
            .filter(|d| !d.is_satisfied())
            .map(|d| d.depends_on)
            .collect();
        if unsatisfied.is_empty() {
            Ok(())
        } else {
            Err(SchedulingValidationError::DependenciesNotSatisfied { unsatisfied })
        }
    }
}

/// Caps live sessions per keypair; private sessions use the SFTP cap.
pub struct ConcurrencyValidator;

impl SchedulingValidator for ConcurrencyValidator {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(policy) = snapshot
            .resource_policy
            .keypair_policies
            .get(&workload.access_key)
        else {
            return Ok(());
        };
        let (limit, counters) = if workload.is_private {
            (
                policy.max_concurrent_sftp_sessions,
                &snapshot.concurrency.sftp_sessions_by_keypair,
            )
        } else {
            (
                policy.max_concurrent_sessions,
                &snapshot.concurrency.sessions_by_keypair,
            )
        };
        let Some(limit) = limit else {
            return Ok(());
        };
        let current = counters.get(&workload.access_key).copied().unwrap_or(0);
        if current >= limit {
            return Err(SchedulingValidationError::ConcurrencyLimitExceeded {
                current,
                limit,
                sftp: workload.is_private,
            });
        }
        Ok(())
    }
}

fn pending_for<'a>(
    snapshot: &'a SystemSnapshot,
    workload: &'a SessionWorkload,
) -> impl Iterator<Item = &'a PendingSessionInfo> + 'a {
    snapshot
        .pending_sessions
        .by_keypair
        .get(&workload.access_key)
        .into_iter()
        .flatten()
        .filter(move |p| p.session_id != workload.session_id)
}

/// Caps how many sessions a keypair may have waiting.
pub struct PendingSessionCountLimitValidator;

impl SchedulingValidator for PendingSessionCountLimitValidator {
    fn name(&self) -> &'static str {
        "pending_session_count"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(limit) = snapshot
            .resource_policy
            .keypair_policies
            .get(&workload.access_key)
            .and_then(|p| p.max_pending_session_count)
        else {
            return Ok(());
        };
        let current = u32::try_from(pending_for(snapshot, workload).count()).unwrap_or(u32::MAX);
        if current.saturating_add(1) > limit {
            return Err(SchedulingValidationError::PendingSessionCountLimitExceeded {
                current,
                limit,
            });
        }
        Ok(())
    }
}

/// Caps the summed request of a keypair's pending sessions.
pub struct PendingSessionResourceLimitValidator;

impl SchedulingValidator for PendingSessionResourceLimitValidator {
    fn name(&self) -> &'static str {
        "pending_session_resource"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(limit) = snapshot
            .resource_policy
            .keypair_policies
            .get(&workload.access_key)
            .and_then(|p| p.max_pending_session_resource_slots.as_ref())
        else {
            return Ok(());
        };
        let pending_total: ResourceSlot = pending_for(snapshot, workload)
            .map(|p| &p.requested_slots)
            .sum();
        let total = &pending_total + &workload.requested_slots;
        check(LimitScope::PendingSessions, total.exceeding(limit))
    }
}

/// Caps keypair occupancy plus the new request.
pub struct KeypairResourceLimitValidator;

impl SchedulingValidator for KeypairResourceLimitValidator {
    fn name(&self) -> &'static str {
        "keypair_resource"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(policy) = snapshot
            .resource_policy
            .keypair_policies
            .get(&workload.access_key)
        else {
            return Ok(());
        };
        let Some(limit) = policy.total_resource_slots.as_ref() else {
            return Ok(());
        };
        let occupied = snapshot
            .resource_occupancy
            .by_keypair
            .get(&workload.access_key)
            .cloned()
            .unwrap_or_default();
        let total = occupied + workload.requested_slots.clone();
        let excess = match policy.default_for_unspecified {
            DefaultForUnspecified::Limited => total.exceeding(limit),
            DefaultForUnspecified::Unlimited => total.exceeding_bounded(limit),
        };
        check(LimitScope::Keypair, excess)
    }
}

pub struct UserResourceLimitValidator;

impl SchedulingValidator for UserResourceLimitValidator {
    fn name(&self) -> &'static str {
        "user_resource"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(limit) = snapshot.resource_policy.user_limits.get(&workload.user_uuid) else {
            return Ok(());
        };
        let occupied = snapshot
            .resource_occupancy
            .by_user
            .get(&workload.user_uuid)
            .cloned()
            .unwrap_or_default();
        let total = occupied + workload.requested_slots.clone();
        check(LimitScope::User, total.exceeding_bounded(limit))
    }
}

pub struct GroupResourceLimitValidator;

impl SchedulingValidator for GroupResourceLimitValidator {
    fn name(&self) -> &'static str {
        "group_resource"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(limit) = snapshot.resource_policy.group_limits.get(&workload.group_id) else {
            return Ok(());
        };
        let occupied = snapshot
            .resource_occupancy
            .by_group
            .get(&workload.group_id)
            .cloned()
            .unwrap_or_default();
        let total = occupied + workload.requested_slots.clone();
        check(LimitScope::Group, total.exceeding_bounded(limit))
    }
}

pub struct DomainResourceLimitValidator;

impl SchedulingValidator for DomainResourceLimitValidator {
    fn name(&self) -> &'static str {
        "domain_resource"
    }

    fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        let Some(limit) = snapshot
            .resource_policy
            .domain_limits
            .get(&workload.domain_name)
        else {
            return Ok(());
        };
        let occupied = snapshot
            .resource_occupancy
            .by_domain
            .get(&workload.domain_name)
            .cloned()
            .unwrap_or_default();
        let total = occupied + workload.requested_slots.clone();
        check(LimitScope::Domain, total.exceeding_bounded(limit))
    }
}

/// Ordered validator list evaluated until the first failure.
pub struct ValidatorPipeline {
    validators: Vec<Box<dyn SchedulingValidator>>,
}

impl ValidatorPipeline {
    pub fn new(validators: Vec<Box<dyn SchedulingValidator>>) -> Self {
        Self { validators }
    }

    /// Dependencies, concurrency, pending count, pending resources, then
    /// keypair, user, group and domain ceilings.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(DependenciesValidator),
            Box::new(ConcurrencyValidator),
            Box::new(PendingSessionCountLimitValidator),
            Box::new(PendingSessionResourceLimitValidator),
            Box::new(KeypairResourceLimitValidator),
            Box::new(UserResourceLimitValidator),
            Box::new(GroupResourceLimitValidator),
            Box::new(DomainResourceLimitValidator),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    pub fn validate(&self, snapshot: &SystemSnapshot, workload: &SessionWorkload) -> ValidationResult {
        for validator in &self.validators {
            if let Err(e) = validator.validate(snapshot, workload) {
                debug!(
                    validator = validator.name(),
                    session_id = %workload.session_id,
                    error = %e,
                    "Admission rejected"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Default for ValidatorPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::snapshot::{KeypairResourcePolicy, SessionDependencyInfo, SessionResult};
    use chrono::Utc;
    use rstest::rstest;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use sokovan_events::SessionStatus;
    use sokovan_id::{AccessKey, ProjectId, UserId};

    fn slots(cpu: Decimal, mem: Decimal) -> ResourceSlot {
        ResourceSlot::try_from_pairs([("cpu", cpu), ("mem", mem)]).unwrap()
    }

    fn workload(requested: ResourceSlot) -> SessionWorkload {
        SessionWorkload {
            session_id: SessionId::new(),
            access_key: AccessKey::parse("AKTEST").unwrap(),
            requested_slots: requested,
            user_uuid: UserId::new(),
            group_id: ProjectId::new(),
            domain_name: "default".to_string(),
            scaling_group: "default".to_string(),
            is_private: false,
        }
    }

    fn with_policy(policy: KeypairResourcePolicy) -> SystemSnapshot {
        let mut snapshot = SystemSnapshot::default();
        snapshot
            .resource_policy
            .keypair_policies
            .insert(AccessKey::parse("AKTEST").unwrap(), policy);
        snapshot
    }

    fn add_pending(snapshot: &mut SystemSnapshot, requested: ResourceSlot, count: usize) {
        let entry = snapshot
            .pending_sessions
            .by_keypair
            .entry(AccessKey::parse("AKTEST").unwrap())
            .or_default();
        for _ in 0..count {
            entry.push(PendingSessionInfo {
                session_id: SessionId::new(),
                requested_slots: requested.clone(),
                creation_time: Utc::now(),
            });
        }
    }

    #[rstest]
    #[case(dec!(1), true)]
    #[case(dec!(2), false)]
    fn test_pending_resource_limit_boundary(#[case] each: Decimal, #[case] passes: bool) {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_pending_session_resource_slots: Some(slots(dec!(10), dec!(10))),
            ..Default::default()
        });
        add_pending(&mut snapshot, slots(dec!(3), dec!(3)), 3);

        let result = PendingSessionResourceLimitValidator
            .validate(&snapshot, &workload(slots(each, each)));

        assert_eq!(result.is_ok(), passes);
    }

    #[test]
    fn test_pending_resource_rejection_names_slot_and_amount() {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_pending_session_resource_slots: Some(slots(dec!(10), dec!(10))),
            ..Default::default()
        });
        add_pending(&mut snapshot, slots(dec!(3), dec!(3)), 3);

        let err = PendingSessionResourceLimitValidator
            .validate(&snapshot, &workload(slots(dec!(2), dec!(1))))
            .unwrap_err();

        let SchedulingValidationError::ResourceLimitExceeded { scope, excess } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(*scope, LimitScope::PendingSessions);
        assert_eq!(excess.len(), 1);
        assert_eq!(excess[0].slot.as_str(), "cpu");
        assert_eq!(excess[0].excess(), dec!(1));
        assert_eq!(
            err.to_string(),
            "pending session resource limit exceeded (cpu: 11 > 10 (over by 1))"
        );
    }

    #[test]
    fn test_pending_resource_unset_limit_never_rejects() {
        let mut snapshot = with_policy(KeypairResourcePolicy::default());
        add_pending(&mut snapshot, slots(dec!(1000), dec!(1000)), 5);
        let huge = workload(slots(dec!(1000000), dec!(1000000)));

        assert!(PendingSessionResourceLimitValidator
            .validate(&snapshot, &huge)
            .is_ok());
        assert!(PendingSessionResourceLimitValidator
            .validate(&SystemSnapshot::default(), &huge)
            .is_ok());
    }

    #[test]
    fn test_pending_resource_slot_missing_from_limit_is_bounded_to_zero() {
        let snapshot = with_policy(KeypairResourcePolicy {
            max_pending_session_resource_slots: Some(
                ResourceSlot::try_from_pairs([("cpu", dec!(10))]).unwrap(),
            ),
            ..Default::default()
        });
        let request = ResourceSlot::try_from_pairs([("cpu", dec!(1)), ("cuda.shares", dec!(1))])
            .unwrap();

        assert!(PendingSessionResourceLimitValidator
            .validate(&snapshot, &workload(request))
            .is_err());
    }

    #[test]
    fn test_pending_list_excludes_the_workload_itself() {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_pending_session_count: Some(1),
            ..Default::default()
        });
        let w = workload(slots(dec!(1), dec!(1)));
        snapshot
            .pending_sessions
            .by_keypair
            .entry(w.access_key.clone())
            .or_default()
            .push(PendingSessionInfo {
                session_id: w.session_id,
                requested_slots: w.requested_slots.clone(),
                creation_time: Utc::now(),
            });

        assert!(PendingSessionCountLimitValidator
            .validate(&snapshot, &w)
            .is_ok());
    }

    #[rstest]
    #[case(2, 3, true)]
    #[case(3, 3, false)]
    fn test_pending_count_limit(#[case] pending: usize, #[case] limit: u32, #[case] passes: bool) {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_pending_session_count: Some(limit),
            ..Default::default()
        });
        add_pending(&mut snapshot, slots(dec!(1), dec!(1)), pending);

        let result =
            PendingSessionCountLimitValidator.validate(&snapshot, &workload(slots(dec!(1), dec!(1))));

        assert_eq!(result.is_ok(), passes);
    }

    #[rstest]
    #[case(false, 4, true)]
    #[case(false, 5, false)]
    #[case(true, 0, true)]
    #[case(true, 1, false)]
    fn test_concurrency_limit(#[case] private: bool, #[case] current: u32, #[case] passes: bool) {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_concurrent_sessions: Some(5),
            max_concurrent_sftp_sessions: Some(1),
            ..Default::default()
        });
        let key = AccessKey::parse("AKTEST").unwrap();
        let counters = if private {
            &mut snapshot.concurrency.sftp_sessions_by_keypair
        } else {
            &mut snapshot.concurrency.sessions_by_keypair
        };
        counters.insert(key, current);
        let mut w = workload(slots(dec!(1), dec!(1)));
        w.is_private = private;

        assert_eq!(ConcurrencyValidator.validate(&snapshot, &w).is_ok(), passes);
    }

    #[rstest]
    #[case(DefaultForUnspecified::Limited, false)]
    #[case(DefaultForUnspecified::Unlimited, true)]
    fn test_keypair_limit_default_for_unspecified(
        #[case] default: DefaultForUnspecified,
        #[case] passes: bool,
    ) {
        let snapshot = with_policy(KeypairResourcePolicy {
            total_resource_slots: Some(ResourceSlot::try_from_pairs([("cpu", dec!(8))]).unwrap()),
            default_for_unspecified: default,
            ..Default::default()
        });
        let request =
            ResourceSlot::try_from_pairs([("cpu", dec!(2)), ("cuda.device", dec!(1))]).unwrap();

        let result = KeypairResourceLimitValidator.validate(&snapshot, &workload(request));

        assert_eq!(result.is_ok(), passes);
    }

    #[test]
    fn test_keypair_limit_counts_current_occupancy() {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            total_resource_slots: Some(slots(dec!(8), dec!(8))),
            ..Default::default()
        });
        snapshot.resource_occupancy.by_keypair.insert(
            AccessKey::parse("AKTEST").unwrap(),
            slots(dec!(7), dec!(1)),
        );

        assert!(KeypairResourceLimitValidator
            .validate(&snapshot, &workload(slots(dec!(1), dec!(1))))
            .is_ok());
        assert!(KeypairResourceLimitValidator
            .validate(&snapshot, &workload(slots(dec!(2), dec!(1))))
            .is_err());
    }

    #[test]
    fn test_group_and_domain_limits_only_bound_named_slots() {
        let w = workload(slots(dec!(4), dec!(64)));
        let mut snapshot = SystemSnapshot::default();
        snapshot.resource_policy.group_limits.insert(
            w.group_id,
            ResourceSlot::try_from_pairs([("cpu", dec!(4))]).unwrap(),
        );
        snapshot.resource_policy.domain_limits.insert(
            "default".to_string(),
            ResourceSlot::try_from_pairs([("cpu", dec!(3))]).unwrap(),
        );

        assert!(GroupResourceLimitValidator.validate(&snapshot, &w).is_ok());
        let err = DomainResourceLimitValidator.validate(&snapshot, &w).unwrap_err();
        assert!(err.to_string().starts_with("domain resource limit exceeded"));
    }

    #[test]
    fn test_user_limit_rejects_over_occupancy() {
        let w = workload(slots(dec!(1), dec!(1)));
        let mut snapshot = SystemSnapshot::default();
        snapshot
            .resource_policy
            .user_limits
            .insert(w.user_uuid, slots(dec!(4), dec!(4)));
        snapshot
            .resource_occupancy
            .by_user
            .insert(w.user_uuid, slots(dec!(4), dec!(0)));

        assert!(UserResourceLimitValidator.validate(&snapshot, &w).is_err());
    }

    #[test]
    fn test_dependencies_validator() {
        let w = workload(slots(dec!(1), dec!(1)));
        let waiting = SessionId::new();
        let mut snapshot = SystemSnapshot::default();
        snapshot.session_dependencies.by_session.insert(
            w.session_id,
            vec![
                SessionDependencyInfo {
                    depends_on: SessionId::new(),
                    status: SessionStatus::Terminated,
                    result: SessionResult::Success,
                },
                SessionDependencyInfo {
                    depends_on: waiting,
                    status: SessionStatus::Running,
                    result: SessionResult::Undefined,
                },
            ],
        );

        let err = DependenciesValidator.validate(&snapshot, &w).unwrap_err();

        assert_eq!(
            err,
            SchedulingValidationError::DependenciesNotSatisfied {
                unsatisfied: vec![waiting]
            }
        );
    }

    #[test]
    fn test_pipeline_stops_at_first_failure() {
        let mut snapshot = with_policy(KeypairResourcePolicy {
            max_concurrent_sessions: Some(0),
            max_pending_session_count: Some(0),
            ..Default::default()
        });
        add_pending(&mut snapshot, slots(dec!(1), dec!(1)), 1);

        let err = ValidatorPipeline::standard()
            .validate(&snapshot, &workload(slots(dec!(1), dec!(1))))
            .unwrap_err();

        assert!(matches!(
            err,
            SchedulingValidationError::ConcurrencyLimitExceeded { .. }
        ));
    }

    #[test]
    fn test_standard_pipeline_order() {
        assert_eq!(
            ValidatorPipeline::standard().names(),
            vec![
                "dependencies",
                "concurrency",
                "pending_session_count",
                "pending_session_resource",
                "keypair_resource",
                "user_resource",
                "group_resource",
                "domain_resource",
            ]
        );
    }
}
