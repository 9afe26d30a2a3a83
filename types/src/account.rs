use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Projection requested for every account read. `games_played` only exists
/// on newer schemas and naming a missing column fails the whole read, so
/// accounts are read whole.
pub const ACCOUNT_COLUMNS: &str = "*";

/// Largest magnitude below which every whole `f64` is an exact integer.
const MAX_EXACT_WHOLE: f64 = 9_007_199_254_740_992.0;

/// JSON for a decimal balance. Whole values are written as integers, so an
/// empty wallet reads `0` rather than `0.0`.
pub fn balance_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_WHOLE {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn serialize_balance<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    balance_value(*value).serialize(serializer)
}

/// Progress of the "join" task. Only ever advances `Check -> Claimed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Join,
    Check,
    Claimed,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Join => "join",
            JoinStatus::Check => "check",
            JoinStatus::Claimed => "claimed",
        }
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account row as stored in the `users` table.
///
/// Accounts are provisioned elsewhere; this service only reads and
/// conditionally updates them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub points: i64,
    pub usdt: f64,
    pub ticket: i64,
    pub join_status: JoinStatus,
    pub ads_left: i64,
    /// Added in a later schema revision; absent or null on older rows.
    #[serde(default)]
    pub games_played: Option<i64>,
}

/// Client-facing view of an account.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub points: i64,
    #[serde(serialize_with = "serialize_balance")]
    pub usdt: f64,
    pub ticket: i64,
    pub join_task_status: JoinStatus,
    pub ads_left: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub games_played: Option<i64>,
}

impl From<&UserAccount> for AccountSnapshot {
    fn from(account: &UserAccount) -> Self {
        Self {
            points: account.points,
            usdt: account.usdt,
            ticket: account.ticket,
            join_task_status: account.join_status,
            ads_left: account.ads_left,
            games_played: account.games_played,
        }
    }
}
