//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker to take the lease.
    Queued,
    /// Leased to exactly one worker.
    Started,
    /// A worker reported a final response.
    Finished,
    /// No worker could take the task before it expired.
    Error,
    /// Cancelled by an administrative caller.
    Aborted,
}

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] = [Self::Finished, Self::Error, Self::Aborted];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Started) | (Queued, Aborted) | (Queued, Error) |
            // From Started (retry on another worker goes back to Queued)
            (Started, Finished) | (Started, Aborted) | (Started, Queued)
        )
    }

    /// Terminal statuses are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Whether a caller blocks on the task or fires and forgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Sync,
    Async,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown task mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_retry_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Started));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Finished));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Finished));
        assert!(!TaskStatus::Started.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn terminal_statuses_are_frozen() {
        for terminal in TaskStatus::TERMINAL {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Queued,
                TaskStatus::Started,
                TaskStatus::Finished,
                TaskStatus::Error,
                TaskStatus::Aborted,
            ] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [TaskStatus::Queued, TaskStatus::Aborted] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
