//! Area occupancy vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The single authoritative occupancy state of an area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaState {
    /// No evidence of occupancy
    #[default]
    Clear,
    /// At least one presence indicator is active
    Occupied,
    /// Evidence is gone but the extended grace window is still running
    Extended,
    /// Occupied and the bright entity is on
    Bright,
    /// Occupied and the sleep entity is on
    Sleep,
    /// Occupied and the accented entity is on
    Accented,
    /// Automatic control is disabled
    Manual,
}

impl AreaState {
    pub const ALL: [AreaState; 7] = [
        AreaState::Clear,
        AreaState::Occupied,
        AreaState::Extended,
        AreaState::Bright,
        AreaState::Sleep,
        AreaState::Accented,
        AreaState::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AreaState::Clear => "clear",
            AreaState::Occupied => "occupied",
            AreaState::Extended => "extended",
            AreaState::Bright => "bright",
            AreaState::Sleep => "sleep",
            AreaState::Accented => "accented",
            AreaState::Manual => "manual",
        }
    }

    /// Whether this state counts as occupied when aggregated by a meta area.
    ///
    /// `clear` and `manual` are the only non-occupied states.
    pub fn is_occupied_class(&self) -> bool {
        !matches!(self, AreaState::Clear | AreaState::Manual)
    }
}

impl fmt::Display for AreaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown area state '{0}'")]
pub struct ParseAreaStateError(pub String);

impl FromStr for AreaState {
    type Err = ParseAreaStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AreaState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseAreaStateError(s.to_string()))
    }
}

/// Kind of area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaKind {
    #[default]
    Interior,
    Exterior,
    /// Aggregates child areas instead of owning sensors
    Meta,
}

impl AreaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AreaKind::Interior => "interior",
            AreaKind::Exterior => "exterior",
            AreaKind::Meta => "meta",
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
