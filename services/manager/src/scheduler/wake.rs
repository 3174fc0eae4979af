//! "Schedule needed" wake signals.
//!
//! An immediate publish notifies subscribers right away. A deferred publish
//! only sets a durable mark that the next short tick consumes.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::ScheduleType;
use crate::db::DbResult;

/// Capacity of in-process notification channels.
pub const WAKE_BUFFER: usize = 256;

#[async_trait]
pub trait WakeChannel: Send + Sync {
    /// Requests processing of `schedule_type`.
    async fn publish(&self, schedule_type: ScheduleType, immediate: bool) -> DbResult<()>;

    /// Consumes the mark for `schedule_type`, returning whether it was set.
    async fn load_and_delete_mark(&self, schedule_type: ScheduleType) -> DbResult<bool>;

    /// Receives immediate notifications from every publisher.
    async fn subscribe(&self) -> DbResult<broadcast::Receiver<ScheduleType>>;
}

/// In-process wake channel.
pub struct MemoryWakeChannel {
    marks: Mutex<HashSet<ScheduleType>>,
    published: Mutex<Vec<(ScheduleType, bool)>>,
    notify: broadcast::Sender<ScheduleType>,
}

impl MemoryWakeChannel {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(WAKE_BUFFER);
        Self {
            marks: Mutex::new(HashSet::new()),
            published: Mutex::new(Vec::new()),
            notify,
        }
    }

    /// Every publish so far, in order.
    pub fn published(&self) -> Vec<(ScheduleType, bool)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_mark(&self, schedule_type: ScheduleType) -> bool {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&schedule_type)
    }
}

impl Default for MemoryWakeChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WakeChannel for MemoryWakeChannel {
    async fn publish(&self, schedule_type: ScheduleType, immediate: bool) -> DbResult<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((schedule_type, immediate));
        if immediate {
            // No subscribers is fine.
            let _ = self.notify.send(schedule_type);
        } else {
            self.marks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(schedule_type);
        }
        Ok(())
    }

    async fn load_and_delete_mark(&self, schedule_type: ScheduleType) -> DbResult<bool> {
        Ok(self
            .marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&schedule_type))
    }

    async fn subscribe(&self) -> DbResult<broadcast::Receiver<ScheduleType>> {
        Ok(self.notify.subscribe())
    }
}
