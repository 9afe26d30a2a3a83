use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;

/// The only task whose reward can currently be claimed.
pub const JOIN_TASK: &str = "join";

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

/// Closed set of actions a client may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    GetBalanceAndTaskStatus,
    AddPoints,
    RecordGameEnd,
    ClaimTaskReward,
    WatchAd,
    ExecuteSwap,
    Spin,
    Ref,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::GetBalanceAndTaskStatus,
        Action::AddPoints,
        Action::RecordGameEnd,
        Action::ClaimTaskReward,
        Action::WatchAd,
        Action::ExecuteSwap,
        Action::Spin,
        Action::Ref,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::GetBalanceAndTaskStatus => "getBalanceAndTaskStatus",
            Action::AddPoints => "addPoints",
            Action::RecordGameEnd => "recordGameEnd",
            Action::ClaimTaskReward => "claimTaskReward",
            Action::WatchAd => "watchAd",
            Action::ExecuteSwap => "executeSwap",
            Action::Spin => "spin",
            Action::Ref => "ref",
        }
    }

    /// Position in [`Action::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Action::GetBalanceAndTaskStatus => 0,
            Action::AddPoints => 1,
            Action::RecordGameEnd => 2,
            Action::ClaimTaskReward => 3,
            Action::WatchAd => 4,
            Action::ExecuteSwap => 5,
            Action::Spin => 6,
            Action::Ref => 7,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| UnknownAction(value.to_string()))
    }
}

/// Row written to the audit log for every validated request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action: String,
    pub user_id: String,
    pub payload: Value,
}
