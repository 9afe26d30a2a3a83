//! Conditional account updates.
//!
//! Each mutation reads the current row, derives the new values from it and
//! writes them with a `PATCH` whose filter pins every column it touches to
//! the value that was read. A `PATCH` that matches nothing means another
//! request got there first; the mutation is re-derived from a fresh read, up
//! to a fixed number of attempts.

use serde_json::{Map, Value};
use std::fmt::Display;
use tapvault_gateway::{Filter, Gateway};
use tapvault_types::{balance_value, JoinStatus, UserAccount, ACCOUNT_COLUMNS};

use crate::error::ActionError;

/// Slack allowed when checking a swap credit against the exchange rate.
const SWAP_RATE_TOLERANCE: f64 = 1e-9;

/// A write plus the predicates that must still hold for it to apply.
#[derive(Debug, Default)]
pub struct Change {
    patch: Map<String, Value>,
    guard: Filter,
}

impl Change {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.patch.insert(column.to_string(), value.into());
        self
    }

    /// Only apply while `column` still holds `value`.
    fn pin(mut self, column: &str, value: impl Display) -> Self {
        self.guard = self.guard.eq(column, value);
        self
    }

    fn pin_optional(mut self, column: &str, value: Option<i64>) -> Self {
        self.guard = match value {
            Some(value) => self.guard.eq(column, value),
            None => self.guard.is_null(column),
        };
        self
    }

    fn above(mut self, column: &str, floor: i64) -> Self {
        self.guard = self.guard.gt(column, floor);
        self
    }
}

fn credit(balance: i64, amount: i64, field: &'static str) -> Result<i64, ActionError> {
    balance.checked_add(amount).ok_or(ActionError::InvalidField {
        field,
        reason: "would overflow the balance",
    })
}

/// Client's requested swap, as received.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapRequest {
    pub new_points: i64,
    pub new_usdt: f64,
    /// Explicit amount of points to spend, when the client sends one.
    pub points: Option<i64>,
}

/// Swap expressed as deltas, fixed from the first read so retries cannot
/// change what the client agreed to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapTerms {
    pub debit: i64,
    pub credit: f64,
    /// usdt balance of the first read and the balance the client asked for.
    read_usdt: f64,
    target_usdt: f64,
}

impl SwapTerms {
    pub fn new(
        account: &UserAccount,
        request: &SwapRequest,
        points_per_usdt: f64,
    ) -> Result<Self, ActionError> {
        if request.new_points > account.points {
            return Err(ActionError::Rejected("Insufficient points for swap"));
        }
        let debit = account.points - request.new_points;
        if debit <= 0 {
            return Err(ActionError::Rejected("Swap must spend points"));
        }
        if request.points.is_some_and(|points| points != debit) {
            return Err(ActionError::InvalidField {
                field: "points",
                reason: "does not match the requested balance change",
            });
        }
        let credit = request.new_usdt - account.usdt;
        if !(credit > 0.0) {
            return Err(ActionError::Rejected("Swap must credit usdt"));
        }
        if credit > debit as f64 / points_per_usdt + SWAP_RATE_TOLERANCE {
            return Err(ActionError::Rejected("Swap exceeds the exchange rate"));
        }
        Ok(Self {
            debit,
            credit,
            read_usdt: account.usdt,
            target_usdt: request.new_usdt,
        })
    }

    fn apply(&self, account: &UserAccount) -> Result<Change, ActionError> {
        if self.debit > account.points {
            return Err(ActionError::Rejected("Insufficient points for swap"));
        }
        // Re-adding the delta to the read balance is lossy; only fall back to
        // it once another write has moved the balance.
        let usdt = if account.usdt == self.read_usdt {
            self.target_usdt
        } else {
            account.usdt + self.credit
        };
        Ok(Change::new()
            .set("points", account.points - self.debit)
            .set("usdt", balance_value(usdt))
            .pin("points", account.points)
            .pin("usdt", account.usdt))
    }
}

#[derive(Clone)]
pub struct Ledger {
    gateway: Gateway,
    table: String,
    max_attempts: u32,
}

impl Ledger {
    pub fn new(gateway: Gateway, table: String, max_attempts: u32) -> Self {
        Self {
            gateway,
            table,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn account(&self, user_id: &str) -> Result<UserAccount, ActionError> {
        let filter = Filter::new().select(ACCOUNT_COLUMNS).eq("id", user_id);
        self.gateway
            .select_one(&self.table, &filter)
            .await?
            .ok_or(ActionError::NotFound)
    }

    /// Re-run `plan` against fresh reads until its guarded write lands.
    async fn apply<F>(&self, user_id: &str, mut plan: F) -> Result<UserAccount, ActionError>
    where
        F: FnMut(&UserAccount) -> Result<Change, ActionError>,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.account(user_id).await?;
            let change = plan(&current)?;
            let filter = Filter::new().eq("id", user_id).and(change.guard);
            let rows = self
                .gateway
                .update_where(&self.table, &change.patch, &filter)
                .await?;
            if let Some(row) = rows.into_iter().next() {
                return serde_json::from_value(row).map_err(|err| {
                    ActionError::Database(format!("unexpected account row: {err}"))
                });
            }
            tracing::debug!(user_id, attempt, "account changed underneath update; retrying");
        }
        tracing::warn!(user_id, attempts = self.max_attempts, "giving up on contended update");
        Err(ActionError::Conflict)
    }

    pub async fn add_points(&self, user_id: &str, amount: i64) -> Result<UserAccount, ActionError> {
        self.apply(user_id, |account| {
            Ok(Change::new()
                .set("points", credit(account.points, amount, "points")?)
                .pin("points", account.points))
        })
        .await
    }

    /// Credit points and count one more finished game.
    pub async fn record_game_end(
        &self,
        user_id: &str,
        amount: i64,
    ) -> Result<UserAccount, ActionError> {
        self.apply(user_id, |account| {
            let played = credit(account.games_played.unwrap_or(0), 1, "gamesPlayed")?;
            Ok(Change::new()
                .set("points", credit(account.points, amount, "points")?)
                .set("games_played", played)
                .pin("points", account.points)
                .pin_optional("games_played", account.games_played))
        })
        .await
    }

    pub async fn watch_ad(&self, user_id: &str, reward: i64) -> Result<UserAccount, ActionError> {
        self.apply(user_id, |account| {
            if account.ads_left <= 0 {
                return Err(ActionError::Rejected("No ads left"));
            }
            Ok(Change::new()
                .set("ads_left", account.ads_left - 1)
                .set("points", credit(account.points, reward, "reward")?)
                .above("ads_left", 0)
                .pin("ads_left", account.ads_left)
                .pin("points", account.points))
        })
        .await
    }

    pub async fn claim_task(&self, user_id: &str, reward: i64) -> Result<UserAccount, ActionError> {
        self.apply(user_id, |account| {
            if account.join_status != JoinStatus::Check {
                return Err(ActionError::Rejected("Task reward is not claimable"));
            }
            Ok(Change::new()
                .set("join_status", JoinStatus::Claimed.as_str())
                .set("points", credit(account.points, reward, "reward")?)
                .pin("join_status", JoinStatus::Check)
                .pin("points", account.points))
        })
        .await
    }

    pub async fn swap(
        &self,
        user_id: &str,
        request: SwapRequest,
        points_per_usdt: f64,
    ) -> Result<UserAccount, ActionError> {
        let mut terms: Option<SwapTerms> = None;
        self.apply(user_id, |account| {
            let agreed = match terms {
                Some(agreed) => agreed,
                None => *terms.insert(SwapTerms::new(account, &request, points_per_usdt)?),
            };
            agreed.apply(account)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(points: i64, usdt: f64) -> UserAccount {
        UserAccount {
            points,
            usdt,
            ticket: 0,
            join_status: JoinStatus::Join,
            ads_left: 0,
            games_played: None,
        }
    }

    fn swap(new_points: i64, new_usdt: f64, points: Option<i64>) -> SwapRequest {
        SwapRequest {
            new_points,
            new_usdt,
            points,
        }
    }

    #[test]
    fn swap_terms_are_relative_to_the_read() {
        let terms = SwapTerms::new(&account(5_000, 1.0), &swap(3_000, 3.0, None), 1_000.0).unwrap();
        assert_eq!(terms.debit, 2_000);
        assert_eq!(terms.credit, 2.0);

        // A later read with a different balance keeps the same deltas.
        let change = terms.apply(&account(6_000, 1.0)).unwrap();
        assert_eq!(change.patch["points"], Value::from(4_000));
        assert_eq!(change.patch["usdt"], Value::from(3));
        assert_eq!(change.guard.to_string(), "points=eq.6000&usdt=eq.1");

        let change = terms.apply(&account(5_000, 1.5)).unwrap();
        assert_eq!(change.patch["usdt"], Value::from(3.5));
    }

    #[test]
    fn swap_writes_the_requested_usdt_exactly() {
        let terms = SwapTerms::new(&account(1_000, 0.2), &swap(300, 0.9, None), 1_000.0).unwrap();
        let change = terms.apply(&account(1_000, 0.2)).unwrap();
        assert_eq!(change.patch["usdt"], Value::from(0.9));
        assert_eq!(change.guard.to_string(), "points=eq.1000&usdt=eq.0.2");
    }

    #[test]
    fn swap_requires_sufficient_points() {
        let err = SwapTerms::new(&account(100, 0.0), &swap(200, 1.0, None), 1_000.0).unwrap_err();
        assert_eq!(err.to_string(), "Insufficient points for swap");

        let terms = SwapTerms::new(&account(1_000, 0.0), &swap(0, 1.0, None), 1_000.0).unwrap();
        let err = terms.apply(&account(500, 0.0)).unwrap_err();
        assert_eq!(err.to_string(), "Insufficient points for swap");
    }

    #[test]
    fn swap_cannot_mint_usdt() {
        let err = SwapTerms::new(&account(1_000, 0.0), &swap(0, 2.0, None), 1_000.0).unwrap_err();
        assert_eq!(err.to_string(), "Swap exceeds the exchange rate");

        let err = SwapTerms::new(&account(1_000, 5.0), &swap(0, 4.0, None), 1_000.0).unwrap_err();
        assert_eq!(err.to_string(), "Swap must credit usdt");

        let err = SwapTerms::new(&account(1_000, 0.0), &swap(1_000, 0.5, None), 1_000.0).unwrap_err();
        assert_eq!(err.to_string(), "Swap must spend points");
    }

    #[test]
    fn explicit_swap_amount_must_agree() {
        assert!(SwapTerms::new(&account(1_000, 0.0), &swap(500, 0.5, Some(500)), 1_000.0).is_ok());
        let err =
            SwapTerms::new(&account(1_000, 0.0), &swap(500, 0.5, Some(400)), 1_000.0).unwrap_err();
        assert!(matches!(err, ActionError::InvalidField { field: "points", .. }));
    }

    #[test]
    fn change_guards_accumulate() {
        let change = Change::new()
            .set("ads_left", 4)
            .above("ads_left", 0)
            .pin("ads_left", 5)
            .pin_optional("games_played", None);
        assert_eq!(
            change.guard.to_string(),
            "ads_left=gt.0&ads_left=eq.5&games_played=is.null"
        );
        assert_eq!(change.patch["ads_left"], Value::from(4));
    }

    #[test]
    fn credit_checks_overflow() {
        assert_eq!(credit(1, 2, "points").unwrap(), 3);
        assert!(credit(i64::MAX, 1, "points").is_err());
    }
}
