//! Session lifecycle scheduler.
//!
//! Ticks are driven by [`SchedulerWorker`]. Promotion handlers run through
//! the [`LifecycleCoordinator`]; termination has its own
//! [`TerminationCoordinator`] because it talks to agents.

pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod kernel_events;
pub mod lock;
pub mod repository;
pub mod termination;
pub mod types;
pub mod wake;
pub mod worker;

pub use coordinator::{HandlerRunSummary, LifecycleCoordinator};
pub use error::{HookError, SchedulerError, SchedulerResult};
pub use handlers::{
    DetectTerminationHandler, PromoteToPreparedHandler, PromoteToRunningHandler,
    PromoteToTerminatedHandler, PromotionHandler, PromotionHandlerRegistry, SchedulerContext,
};
pub use hooks::{best_effort, HookRegistry, SessionHook};
pub use kernel_events::KernelStateEngine;
pub use lock::{DistributedLock, LockLease, MemoryLockService};
pub use repository::SchedulerRepository;
pub use termination::{TerminationCoordinator, TerminationTickSummary};
pub use wake::{MemoryWakeChannel, WakeChannel};
pub use worker::SchedulerWorker;
