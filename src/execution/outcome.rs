//! What an entry point hands back when it finishes.

use serde_json::Value;

/// Result of running a package entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Process-style exit code; `0` is success.
    ExitCode { code: i64 },
    /// Structured result. Success follows its `success` field, default true.
    Payload { result: serde_json::Map<String, Value> },
    /// Bare success flag.
    Flag { success: bool },
}

impl RunOutcome {
    /// Interpret an arbitrary returned value.
    ///
    /// Integers are exit codes, objects are payloads, anything else is
    /// reduced to its truthiness.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::ExitCode {
                code: n.as_i64().unwrap_or(i64::MAX),
            },
            Value::Object(result) => Self::Payload { result },
            other => Self::Flag {
                success: truthy(&other),
            },
        }
    }

    pub fn success(&self) -> bool {
        match self {
            Self::ExitCode { code } => *code == 0,
            Self::Payload { result } => result
                .get("success")
                .map(truthy)
                .unwrap_or(true),
            Self::Flag { success } => *success,
        }
    }

    /// Error message for an unsuccessful outcome.
    pub fn failure_message(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let message = match self {
            Self::Payload { result } => match result.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "package reported failure".to_string(),
                Some(other) => other.to_string(),
            },
            Self::ExitCode { code } => format!("exit code {code}"),
            Self::Flag { .. } => "package reported failure".to_string(),
        };
        Some(message)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integers_are_exit_codes() {
        assert_eq!(RunOutcome::from_value(json!(0)), RunOutcome::ExitCode { code: 0 });
        assert!(RunOutcome::from_value(json!(0)).success());

        let failed = RunOutcome::from_value(json!(2));
        assert!(!failed.success());
        assert_eq!(failed.failure_message().as_deref(), Some("exit code 2"));
    }

    #[test]
    fn objects_are_payloads() {
        let ok = RunOutcome::from_value(json!({"success": true, "value": 42}));
        assert!(ok.success());
        assert!(ok.failure_message().is_none());

        let implicit = RunOutcome::from_value(json!({"value": 1}));
        assert!(implicit.success());

        let failed = RunOutcome::from_value(json!({"success": false, "error": "captcha"}));
        assert!(!failed.success());
        assert_eq!(failed.failure_message().as_deref(), Some("captcha"));
    }

    #[test]
    fn other_values_are_truthiness() {
        assert!(RunOutcome::from_value(json!(true)).success());
        assert!(RunOutcome::from_value(json!("done")).success());
        assert!(RunOutcome::from_value(json!(1.5)).success());
        assert!(!RunOutcome::from_value(json!(null)).success());
        assert!(!RunOutcome::from_value(json!("")).success());
        assert!(!RunOutcome::from_value(json!([])).success());
        assert_eq!(
            RunOutcome::from_value(json!(false)).failure_message().as_deref(),
            Some("package reported failure")
        );
    }
}
