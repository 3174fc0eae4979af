//! The `ResourceSlot` value type.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::ResourceSlotError;

/// Name of one resource dimension, e.g. `cpu`, `mem`, `cuda.shares`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotName(String);

impl SlotName {
    /// Validates and wraps a slot name.
    pub fn new(name: impl Into<String>) -> Result<Self, ResourceSlotError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ResourceSlotError::EmptySlotName);
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Memory-like slots accept binary size suffixes in user input.
    pub fn is_bytes(&self) -> bool {
        self.0.contains("mem")
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for SlotName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One slot where a quantity went over its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotExcess {
    pub slot: SlotName,
    pub requested: Decimal,
    pub limit: Decimal,
}

impl SlotExcess {
    /// How far the request is over the limit.
    pub fn excess(&self) -> Decimal {
        self.requested - self.limit
    }
}

impl fmt::Display for SlotExcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} > {} (over by {})",
            self.slot,
            self.requested.normalize(),
            self.limit.normalize(),
            self.excess().normalize()
        )
    }
}

/// Multi-dimensional resource quantity.
///
/// Equality and ordering checks treat an absent slot as zero, so
/// `{cpu: 1}` equals `{cpu: 1, mem: 0}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSlot(BTreeMap<SlotName, Decimal>);

impl ResourceSlot {
    /// An empty slot vector (zero in every dimension).
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builds a slot vector from `(name, quantity)` pairs, rejecting
    /// negative quantities.
    pub fn try_from_pairs<I, K>(pairs: I) -> Result<Self, ResourceSlotError>
    where
        I: IntoIterator<Item = (K, Decimal)>,
        K: Into<String>,
    {
        let mut slots = BTreeMap::new();
        for (name, value) in pairs {
            let name = SlotName::new(name)?;
            if value.is_sign_negative() && !value.is_zero() {
                return Err(ResourceSlotError::NegativeQuantity {
                    slot: name.0,
                    value: value.to_string(),
                });
            }
            slots.insert(name, value);
        }
        Ok(Self(slots))
    }

    /// Parses user-supplied quantities such as `{"cpu": "2", "mem": "4g"}`.
    ///
    /// Memory slots accept `k`, `m`, `g`, `t` and `p` binary suffixes.
    pub fn from_user_input<'a, I>(input: I) -> Result<Self, ResourceSlotError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut pairs = Vec::new();
        for (name, raw) in input {
            let slot = SlotName::new(name)?;
            let value = parse_quantity(&slot, raw)?;
            pairs.push((slot.0, value));
        }
        Self::try_from_pairs(pairs)
    }

    /// Returns a copy with `name` set to `value`.
    pub fn with(mut self, name: SlotName, value: Decimal) -> Self {
        self.0.insert(name, value);
        self
    }

    /// Quantity for a slot, zero when absent.
    pub fn get(&self, name: &str) -> Decimal {
        self.0.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotName, &Decimal)> {
        self.0.iter()
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &SlotName> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every dimension is zero.
    pub fn is_zero(&self) -> bool {
        self.0.values().all(Decimal::is_zero)
    }

    /// Scales every dimension by `part / total`, with `part` at most `total`.
    ///
    /// A zero `total` yields zeros in every present dimension. Values too
    /// large to multiply by `part` are scaled by the ratio instead.
    pub fn scale(&self, part: Decimal, total: Decimal) -> Self {
        if total.is_zero() {
            return Self(self.0.keys().map(|k| (k.clone(), Decimal::ZERO)).collect());
        }
        Self(
            self.0
                .iter()
                .map(|(k, v)| {
                    let scaled = v
                        .checked_mul(part)
                        .and_then(|product| product.checked_div(total))
                        .unwrap_or_else(|| *v * (part / total));
                    (k.clone(), scaled)
                })
                .collect(),
        )
    }

    /// Every slot in the union of both vectors where `self` is above `limit`.
    ///
    /// Slots missing from `limit` are limited to zero.
    pub fn exceeding(&self, limit: &ResourceSlot) -> Vec<SlotExcess> {
        self.union_names(limit)
            .into_iter()
            .filter_map(|name| excess_for(name, self.get(name.as_str()), limit.get(name.as_str())))
            .collect()
    }

    /// Like [`ResourceSlot::exceeding`], but only slots named by `limit` are
    /// bounded; other slots are unlimited.
    pub fn exceeding_bounded(&self, limit: &ResourceSlot) -> Vec<SlotExcess> {
        limit
            .0
            .iter()
            .filter_map(|(name, max)| excess_for(name, self.get(name.as_str()), *max))
            .collect()
    }

    /// Elementwise `self <= other` over the union of slot names.
    pub fn fits_within(&self, other: &ResourceSlot) -> bool {
        self.exceeding(other).is_empty()
    }

    /// Cuts every dimension to `dp` decimal places, rounding toward zero.
    pub fn truncate_dp(&self, dp: u32) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        v.round_dp_with_strategy(dp, RoundingStrategy::ToZero),
                    )
                })
                .collect(),
        )
    }

    /// Drops zero-valued dimensions.
    pub fn without_zeros(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, v)| !v.is_zero())
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        )
    }

    fn union_names<'a>(&'a self, other: &'a ResourceSlot) -> Vec<&'a SlotName> {
        let mut names: Vec<&SlotName> = self.0.keys().chain(other.0.keys()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn combine(&self, other: &ResourceSlot, op: impl Fn(Decimal, Decimal) -> Decimal) -> Self {
        Self(
            self.union_names(other)
                .into_iter()
                .map(|name| {
                    let value = op(self.get(name.as_str()), other.get(name.as_str()));
                    (name.clone(), value)
                })
                .collect(),
        )
    }
}

fn excess_for(name: &SlotName, requested: Decimal, limit: Decimal) -> Option<SlotExcess> {
    (requested > limit).then(|| SlotExcess {
        slot: name.clone(),
        requested,
        limit,
    })
}

fn parse_quantity(slot: &SlotName, raw: &str) -> Result<Decimal, ResourceSlotError> {
    let invalid = || ResourceSlotError::InvalidQuantity {
        slot: slot.0.clone(),
        value: raw.to_string(),
    };
    let trimmed = raw.trim();
    if !slot.is_bytes() {
        return trimmed.parse::<Decimal>().map_err(|_| invalid());
    }

    let lower = trimmed.to_ascii_lowercase();
    let digits = lower.trim_end_matches(['b', 'i']);
    let (number, shift) = match digits.chars().last() {
        Some('k') => (&digits[..digits.len() - 1], 10),
        Some('m') => (&digits[..digits.len() - 1], 20),
        Some('g') => (&digits[..digits.len() - 1], 30),
        Some('t') => (&digits[..digits.len() - 1], 40),
        Some('p') => (&digits[..digits.len() - 1], 50),
        _ => (digits, 0),
    };
    let value = number.trim().parse::<Decimal>().map_err(|_| invalid())?;
    let multiplier = Decimal::from(1u64 << shift);
    value
        .checked_mul(multiplier)
        .map(|bytes| bytes.trunc())
        .ok_or_else(invalid)
}

impl PartialEq for ResourceSlot {
    fn eq(&self, other: &Self) -> bool {
        self.union_names(other)
            .into_iter()
            .all(|name| self.get(name.as_str()) == other.get(name.as_str()))
    }
}

impl Eq for ResourceSlot {}

impl Add for &ResourceSlot {
    type Output = ResourceSlot;

    fn add(self, rhs: &ResourceSlot) -> ResourceSlot {
        self.combine(rhs, |a, b| a + b)
    }
}

impl Add for ResourceSlot {
    type Output = ResourceSlot;

    fn add(self, rhs: ResourceSlot) -> ResourceSlot {
        &self + &rhs
    }
}

impl Sub for &ResourceSlot {
    type Output = ResourceSlot;

    fn sub(self, rhs: &ResourceSlot) -> ResourceSlot {
        self.combine(rhs, |a, b| a - b)
    }
}

impl Sub for ResourceSlot {
    type Output = ResourceSlot;

    fn sub(self, rhs: ResourceSlot) -> ResourceSlot {
        &self - &rhs
    }
}

impl AddAssign<&ResourceSlot> for ResourceSlot {
    fn add_assign(&mut self, rhs: &ResourceSlot) {
        for (name, value) in &rhs.0 {
            *self.0.entry(name.clone()).or_insert(Decimal::ZERO) += *value;
        }
    }
}

impl<'a> Sum<&'a ResourceSlot> for ResourceSlot {
    fn sum<I: Iterator<Item = &'a ResourceSlot>>(iter: I) -> Self {
        iter.fold(ResourceSlot::new(), |mut acc, slot| {
            acc += slot;
            acc
        })
    }
}

impl Sum for ResourceSlot {
    fn sum<I: Iterator<Item = ResourceSlot>>(iter: I) -> Self {
        iter.fold(ResourceSlot::new(), |mut acc, slot| {
            acc += &slot;
            acc
        })
    }
}

impl fmt::Display for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value.normalize())?;
        }
        f.write_str("}")
    }
}
