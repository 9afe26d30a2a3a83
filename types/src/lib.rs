pub mod account;
pub use account::{balance_value, AccountSnapshot, JoinStatus, UserAccount, ACCOUNT_COLUMNS};
pub mod action;
pub use action::{Action, ActionLogEntry, UnknownAction, JOIN_TASK};

/// Table holding account balances and task state.
pub const USERS_TABLE: &str = "users";

/// Write-only audit trail of every action request.
pub const ACTIONS_LOG_TABLE: &str = "actions_log";
