use serde_json::{json, Map, Value};
use tapvault_types::{balance_value, AccountSnapshot, Action, JOIN_TASK};

use crate::error::ActionError;
use crate::ledger::{Ledger, SwapRequest};

/// Fields of the request body other than `userId` and `action`.
pub type ActionData = Map<String, Value>;

/// Read a non-negative whole number. `5.0` is accepted, `5.5` and `"5"` are not.
fn amount(data: &ActionData, field: &'static str) -> Result<i64, ActionError> {
    let value = data.get(field).ok_or(ActionError::InvalidField {
        field,
        reason: "is required",
    })?;
    let invalid = ActionError::InvalidField {
        field,
        reason: "must be a non-negative integer",
    };
    if let Some(whole) = value.as_i64() {
        return if whole >= 0 { Ok(whole) } else { Err(invalid) };
    }
    match value.as_f64() {
        Some(number) if number >= 0.0 && number.fract() == 0.0 && number < i64::MAX as f64 => {
            Ok(number as i64)
        }
        _ => Err(invalid),
    }
}

/// Read a positive decimal, as a number or numeric string. Zero, empty and
/// missing values are refused alike.
fn positive_decimal(data: &ActionData, field: &'static str) -> Result<f64, ActionError> {
    let number = match data.get(field) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(number) if number.is_finite() && number > 0.0 => Ok(number),
        _ => Err(ActionError::InvalidField {
            field,
            reason: "must be a positive number",
        }),
    }
}

fn require_task(data: &ActionData) -> Result<(), ActionError> {
    match data.get("task").and_then(Value::as_str) {
        Some(JOIN_TASK) => Ok(()),
        _ => Err(ActionError::InvalidField {
            field: "task",
            reason: "is not a claimable task",
        }),
    }
}

fn object(value: Value) -> ActionData {
    match value {
        Value::Object(map) => map,
        _ => ActionData::new(),
    }
}

/// Settings the handlers need beyond the ledger.
#[derive(Clone, Copy, Debug)]
pub struct ActionSettings {
    pub swap_points_per_usdt: f64,
}

/// Validate `data` for `action`, perform it and return the success payload.
///
/// Every field check runs before the first call to the data service.
pub async fn run(
    ledger: &Ledger,
    settings: ActionSettings,
    action: Action,
    user_id: &str,
    data: &ActionData,
) -> Result<ActionData, ActionError> {
    match action {
        Action::GetBalanceAndTaskStatus => {
            let account = ledger.account(user_id).await?;
            serde_json::to_value(AccountSnapshot::from(&account))
                .map(object)
                .map_err(|err| ActionError::Database(err.to_string()))
        }
        Action::AddPoints => {
            let points = amount(data, "points")?;
            let account = ledger.add_points(user_id, points).await?;
            Ok(object(json!({
                "message": "Points added",
                "points": account.points,
            })))
        }
        Action::RecordGameEnd => {
            let points = amount(data, "points")?;
            let account = ledger.record_game_end(user_id, points).await?;
            Ok(object(json!({
                "message": "Game recorded",
                "points": account.points,
                "gamesPlayed": account.games_played,
            })))
        }
        Action::ClaimTaskReward => {
            require_task(data)?;
            let reward = amount(data, "reward")?;
            let account = ledger.claim_task(user_id, reward).await?;
            Ok(object(json!({
                "message": "Task reward claimed",
                "points": account.points,
            })))
        }
        Action::WatchAd => {
            let reward = amount(data, "reward")?;
            let account = ledger.watch_ad(user_id, reward).await?;
            Ok(object(json!({
                "message": "Ad reward credited",
                "points": account.points,
                "adsLeft": account.ads_left,
            })))
        }
        Action::ExecuteSwap => {
            let request = SwapRequest {
                new_points: amount(data, "newPoints")?,
                new_usdt: positive_decimal(data, "newUsdt")?,
                points: match data.get("points") {
                    Some(_) => Some(amount(data, "points")?),
                    None => None,
                },
            };
            let account = ledger
                .swap(user_id, request, settings.swap_points_per_usdt)
                .await?;
            Ok(object(json!({
                "message": "Swap executed",
                "newPoints": account.points,
                "newUsdt": balance_value(account.usdt),
            })))
        }
        // TODO: ticket deduction and payout once the spin table is designed.
        Action::Spin => Ok(object(json!({ "message": "Spin received" }))),
        Action::Ref => Ok(object(json!({ "message": "Referral received" }))),
    }
}
