//! Error types for resource slot construction.

use thiserror::Error;

/// Errors raised while building a resource slot from external input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceSlotError {
    /// Slot names must be non-empty.
    #[error("slot name cannot be empty")]
    EmptySlotName,

    /// Quantities must never be negative.
    #[error("negative quantity for slot {slot}: {value}")]
    NegativeQuantity { slot: String, value: String },

    /// The value could not be read as a decimal quantity.
    #[error("invalid quantity for slot {slot}: {value}")]
    InvalidQuantity { slot: String, value: String },
}
