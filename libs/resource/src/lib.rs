//! # sokovan-resource
//!
//! `ResourceSlot` is an immutable vector of named quantities (`cpu`, `mem`,
//! `cuda.shares`, ...) backed by exact decimals. Absent slots read as zero and
//! every binary operation works over the union of slot names of both operands.

mod error;
mod slot;

pub use error::ResourceSlotError;
pub use rust_decimal::Decimal;
pub use slot::{ResourceSlot, SlotExcess, SlotName};
