use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Result of one `sx` command, rendered as text or as a JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

/// The `{status, message, details}` envelope printed under `--json`.
#[must_use]
pub fn to_json_response(command: &str, outcome: &ExecutionOutcome) -> Value {
    let status = match outcome.status {
        CommandStatus::Ok => "ok",
        CommandStatus::UserError => "user-error",
        CommandStatus::Failure => "error",
    };
    let details = match &outcome.details {
        Value::Object(_) => outcome.details.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    let message = if outcome.message.is_empty() {
        format!("sx {command}")
    } else {
        format!("sx {command}: {}", outcome.message)
    };
    json!({
        "status": status,
        "message": message,
        "details": details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_envelope_wraps_scalar_details() {
        let outcome = ExecutionOutcome::user_error("nope", json!(3));
        let payload = to_json_response("gc", &outcome);
        assert_eq!(payload["status"], "user-error");
        assert_eq!(payload["message"], "sx gc: nope");
        assert_eq!(payload["details"]["value"], 3);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn json_envelope_defaults_empty_details() {
        let outcome = ExecutionOutcome::success("", Value::Null);
        let payload = to_json_response("auto-gc", &outcome);
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "sx auto-gc");
        assert!(payload["details"].as_object().is_some_and(serde_json::Map::is_empty));
    }
}
