//! Run stages and run states.
//!
//! Stage and state are tracked independently. [`is_consistent`] rejects
//! the combinations that cannot occur.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a run in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Started,
    ApiCallerStarted,
    ApiCallerComplete,
    ScraperStarted,
    ScraperComplete,
    ParserStarted,
    ParserComplete,
}

impl Stage {
    /// All stages in execution order.
    pub const SEQUENCE: [Stage; 7] = [
        Stage::Started,
        Stage::ApiCallerStarted,
        Stage::ApiCallerComplete,
        Stage::ScraperStarted,
        Stage::ScraperComplete,
        Stage::ParserStarted,
        Stage::ParserComplete,
    ];

    /// Returns the stage that follows this one in a straight run.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Started => Some(Self::ApiCallerStarted),
            Self::ApiCallerStarted => Some(Self::ApiCallerComplete),
            Self::ApiCallerComplete => Some(Self::ScraperStarted),
            Self::ScraperStarted => Some(Self::ScraperComplete),
            Self::ScraperComplete => Some(Self::ParserStarted),
            Self::ParserStarted => Some(Self::ParserComplete),
            Self::ParserComplete => None,
        }
    }

    /// Returns whether a run may move from this stage to `to`.
    ///
    /// Stages only move forward, except that a finished parser round may
    /// loop back to the scraper for another round.
    pub fn can_advance_to(self, to: Stage) -> bool {
        self.next() == Some(to) || (self == Self::ParserComplete && to == Self::ScraperStarted)
    }

    /// Returns whether work is in progress at this stage.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::ApiCallerStarted | Self::ScraperStarted | Self::ParserStarted
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "STARTED",
            Self::ApiCallerStarted => "API_CALLER_STARTED",
            Self::ApiCallerComplete => "API_CALLER_COMPLETE",
            Self::ScraperStarted => "SCRAPER_STARTED",
            Self::ScraperComplete => "SCRAPER_COMPLETE",
            Self::ParserStarted => "PARSER_STARTED",
            Self::ParserComplete => "PARSER_COMPLETE",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Paused,
    Cancelled,
    Skipping,
    Completed,
    Failed,
}

impl RunState {
    /// Terminal states.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which the run task is alive.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Skipping)
    }

    /// States in which no new attempt may start.
    pub fn should_stop(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }

    /// Returns whether the state machine allows moving to `to`.
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Pending, Running | Cancelled | Failed)
                | (Running, Paused | Skipping | Cancelled | Completed | Failed)
                | (Paused, Running | Cancelled)
                | (Skipping, Running | Completed | Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Skipping => "SKIPPING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Returns whether a stage and a state can be observed together.
pub fn is_consistent(stage: Stage, state: RunState) -> bool {
    match state {
        RunState::Pending => stage == Stage::Started,
        RunState::Completed => stage == Stage::ParserComplete,
        RunState::Skipping => stage != Stage::Started,
        RunState::Running | RunState::Paused | RunState::Cancelled | RunState::Failed => true,
    }
}
