//! Device selection among several eligible candidates

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::models::Device;

/// How to choose among eligible devices.
///
/// `Random` spreads concurrent callers over the pool so they race for the
/// same handset less often.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Keep the order the cloud returned
    #[default]
    FirstMatch,
    /// Uniformly random
    Random,
}

impl SelectionStrategy {
    /// Order candidates for sequential session attempts
    pub fn order(&self, mut devices: Vec<Device>) -> Vec<Device> {
        if *self == SelectionStrategy::Random {
            devices.shuffle(&mut rand::thread_rng());
        }
        devices
    }

    /// Pick a single candidate
    pub fn pick<'a>(&self, devices: &'a [Device]) -> Option<&'a Device> {
        match self {
            SelectionStrategy::FirstMatch => devices.first(),
            SelectionStrategy::Random => devices.choose(&mut rand::thread_rng()),
        }
    }
}
