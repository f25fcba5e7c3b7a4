use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::FlapStatus;

pub const MAX_SERVOS: usize = 16;
pub const RC_MIN_LIMIT: u8 = 0;
pub const RC_MAX_LIMIT: u8 = 180;
pub const RC_MIN_LIMIT_DEFAULT: u8 = 30;
pub const RC_MAX_LIMIT_DEFAULT: u8 = 150;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlapError {
    #[error("flap count {count} outside 1..={max}")]
    CountOutOfRange { count: usize, max: usize },
    #[error("flap index {0} does not exist")]
    NoSuchFlap(usize),
    #[error("limits {min}..{max} invalid (need 0 <= min < max <= 180)")]
    InvalidLimits { min: u8, max: u8 },
}

/// Persisted bounds of one flap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlapLimits {
    #[serde(rename = "minLimit")]
    pub min_limit: u8,
    #[serde(rename = "maxLimit")]
    pub max_limit: u8,
}

impl Default for FlapLimits {
    fn default() -> Self {
        Self {
            min_limit: RC_MIN_LIMIT_DEFAULT,
            max_limit: RC_MAX_LIMIT_DEFAULT,
        }
    }
}

impl FlapLimits {
    pub fn new(min_limit: u8, max_limit: u8) -> Result<Self, FlapError> {
        if min_limit >= max_limit || max_limit > RC_MAX_LIMIT {
            return Err(FlapError::InvalidLimits {
                min: min_limit,
                max: max_limit,
            });
        }
        Ok(Self {
            min_limit,
            max_limit,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.min_limit < self.max_limit && self.max_limit <= RC_MAX_LIMIT
    }
}

/// One cover leaf. Position is always inside its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flap {
    limits: FlapLimits,
    position: u8,
}

impl Flap {
    pub fn closed(limits: FlapLimits) -> Self {
        Self {
            limits,
            position: limits.min_limit,
        }
    }

    pub fn limits(&self) -> FlapLimits {
        self.limits
    }

    pub fn min_limit(&self) -> u8 {
        self.limits.min_limit
    }

    pub fn max_limit(&self) -> u8 {
        self.limits.max_limit
    }

    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn set_position(&mut self, degrees: u8) {
        self.position = degrees.clamp(self.limits.min_limit, self.limits.max_limit);
    }

    pub fn set_limits(&mut self, limits: FlapLimits) {
        self.limits = limits;
        self.set_position(self.position);
    }

    /// Next position one step of `increment` toward `goal`, never overshooting.
    pub fn step_toward(&self, goal: u8, increment: u8) -> u8 {
        let goal = goal.clamp(self.limits.min_limit, self.limits.max_limit);
        let increment = increment.max(1);
        if self.position < goal {
            self.position.saturating_add(increment).min(goal)
        } else {
            self.position.saturating_sub(increment).max(goal)
        }
    }

    pub fn status(&self) -> FlapStatus {
        FlapStatus {
            position: self.position,
            minimum: self.limits.min_limit,
            maximum: self.limits.max_limit,
        }
    }
}

/// Ordered flaps; the index is the servo channel. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlapSet {
    flaps: Vec<Flap>,
}

impl Default for FlapSet {
    fn default() -> Self {
        Self {
            flaps: vec![Flap::closed(FlapLimits::default())],
        }
    }
}

impl FlapSet {
    /// Builds closed flaps from persisted limits, repairing anything invalid.
    pub fn from_limits(limits: &[FlapLimits]) -> Self {
        let mut flaps: Vec<Flap> = limits
            .iter()
            .take(MAX_SERVOS)
            .map(|limits| {
                let limits = if limits.is_valid() {
                    *limits
                } else {
                    FlapLimits::default()
                };
                Flap::closed(limits)
            })
            .collect();
        if flaps.is_empty() {
            flaps.push(Flap::closed(FlapLimits::default()));
        }
        Self { flaps }
    }

    pub fn len(&self) -> usize {
        self.flaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flaps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Flap> {
        self.flaps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Flap> {
        self.flaps.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flap> {
        self.flaps.iter()
    }

    pub fn limits(&self) -> Vec<FlapLimits> {
        self.flaps.iter().map(Flap::limits).collect()
    }

    pub fn statuses(&self) -> Vec<FlapStatus> {
        self.flaps.iter().map(Flap::status).collect()
    }

    /// Resizes to `count` flaps, at most `channels` of them. Shared indices
    /// keep their values; new indices copy the last existing flap.
    pub fn resize(&mut self, count: usize, channels: usize) -> Result<(), FlapError> {
        let max = channels.clamp(1, MAX_SERVOS);
        if !(1..=max).contains(&count) {
            return Err(FlapError::CountOutOfRange { count, max });
        }
        let last = self
            .flaps
            .last()
            .copied()
            .unwrap_or_else(|| Flap::closed(FlapLimits::default()));
        self.flaps.resize(count, last);
        Ok(())
    }

    pub fn set_limits(&mut self, index: usize, limits: FlapLimits) -> Result<(), FlapError> {
        if !limits.is_valid() {
            return Err(FlapError::InvalidLimits {
                min: limits.min_limit,
                max: limits.max_limit,
            });
        }
        let flap = self
            .flaps
            .get_mut(index)
            .ok_or(FlapError::NoSuchFlap(index))?;
        flap.set_limits(limits);
        Ok(())
    }

    pub fn all_at(&self, goal: impl Fn(&Flap) -> u8) -> bool {
        self.flaps.iter().all(|flap| flap.position() == goal(flap))
    }
}
