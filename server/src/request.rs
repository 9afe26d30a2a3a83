use serde_json::Value;

use crate::actions::ActionData;
use crate::error::ActionError;

/// A validated inbound request body.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    pub user_id: String,
    pub action: String,
    /// Everything except `userId` and `action`.
    pub data: ActionData,
    /// The body exactly as received, for the audit log.
    pub body: Value,
}

impl ActionRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, ActionError> {
        let body: Value =
            serde_json::from_slice(bytes).map_err(|err| ActionError::InvalidBody(err.to_string()))?;
        let Value::Object(mut data) = body.clone() else {
            return Err(ActionError::InvalidBody("expected a JSON object".to_string()));
        };
        let user_id = match data.remove("userId") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(ActionError::MissingParameters),
        };
        let action = match data.remove("action") {
            Some(Value::String(action)) if !action.trim().is_empty() => action,
            _ => return Err(ActionError::MissingParameters),
        };
        Ok(Self {
            user_id,
            action,
            data,
            body,
        })
    }
}
