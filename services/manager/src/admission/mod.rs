//! Admission checks run by the session-admission workflow before any
//! allocation is written.

pub mod snapshot;
pub mod validators;

pub use snapshot::{
    ConcurrencySnapshot, DefaultForUnspecified, KeypairResourcePolicy, PendingSessionInfo,
    PendingSessionSnapshot, ResourceOccupancySnapshot, ResourcePolicySnapshot,
    SessionDependencyInfo, SessionDependencySnapshot, SessionResult, SessionWorkload, SlotType,
    SystemSnapshot,
};
pub use validators::{
    LimitScope, SchedulingValidationError, SchedulingValidator, ValidationResult,
    ValidatorPipeline,
};
