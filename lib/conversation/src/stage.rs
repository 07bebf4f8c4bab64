//! Booking stage state machine.
//!
//! Stages only move forward:
//!
//! ```text
//! GREETING -> BOOKING -> ANSWERING -> CLOSING -> FINALIZED
//! ```
//!
//! A transition to any strictly later stage is legal, so the booking flow
//! may skip `ANSWERING` entirely. Staying in place or moving backwards is
//! rejected. `FINALIZED` is absorbing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A conversation's position in the booking workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// First contact.
    Greeting,
    /// Collecting booking details.
    Booking,
    /// Answering side questions.
    Answering,
    /// Confirming and wrapping up.
    Closing,
    /// Terminal. No further transitions.
    Finalized,
}

impl Stage {
    /// Returns the persisted name of this stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "GREETING",
            Self::Booking => "BOOKING",
            Self::Answering => "ANSWERING",
            Self::Closing => "CLOSING",
            Self::Finalized => "FINALIZED",
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Greeting => 0,
            Self::Booking => 1,
            Self::Answering => 2,
            Self::Closing => 3,
            Self::Finalized => 4,
        }
    }

    /// Returns true if no transition may leave this stage.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Stage) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for a stage name outside the enumerated set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStageError {
    /// The rejected value.
    pub value: String,
}

impl fmt::Display for ParseStageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stage '{}'", self.value)
    }
}

impl std::error::Error for ParseStageError {}

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GREETING" => Ok(Self::Greeting),
            "BOOKING" => Ok(Self::Booking),
            "ANSWERING" => Ok(Self::Answering),
            "CLOSING" => Ok(Self::Closing),
            "FINALIZED" => Ok(Self::Finalized),
            other => Err(ParseStageError {
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Stage; 5] = [
        Stage::Greeting,
        Stage::Booking,
        Stage::Answering,
        Stage::Closing,
        Stage::Finalized,
    ];

    #[test]
    fn adjacent_forward_transitions_are_legal() {
        for pair in ALL.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_forward_is_legal() {
        assert!(Stage::Greeting.can_transition_to(Stage::Closing));
        assert!(Stage::Booking.can_transition_to(Stage::Finalized));
    }

    #[test]
    fn self_and_backward_transitions_are_rejected() {
        for (i, from) in ALL.iter().enumerate() {
            for to in &ALL[..=i] {
                assert!(!from.can_transition_to(*to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn finalized_is_absorbing() {
        assert!(Stage::Finalized.is_terminal());
        assert!(ALL.iter().all(|to| !Stage::Finalized.can_transition_to(*to)));
    }

    #[test]
    fn persisted_names_parse_back() {
        for stage in ALL {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        // Legacy free-form names are not accepted.
        assert!("BOOKING_APPOINTMENT".parse::<Stage>().is_err());
    }

    #[test]
    fn serde_matches_persisted_names() {
        let json = serde_json::to_string(&Stage::Answering).expect("serialize");
        assert_eq!(json, "\"ANSWERING\"");
    }
}
