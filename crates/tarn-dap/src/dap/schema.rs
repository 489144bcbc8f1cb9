use serde_json::Value;

/// Request validation seam.
///
/// The adapter validates every inbound message once, right after JSON
/// parsing; a failed validation is treated exactly like a malformed payload
/// (the message is dropped and the poll reports "no request available").
/// Hosts that ship the full DAP JSON schema can plug a real validator in
/// here; the default checks the envelope shape the dispatcher relies on.
pub trait RequestValidator: Send {
    fn validate(&self, message: &Value) -> Result<(), String>;
}

/// Envelope validator: `seq` is a positive integer, `type` and `command`
/// are strings, `arguments` (when present) is an object.
pub struct EnvelopeValidator;

impl RequestValidator for EnvelopeValidator {
    fn validate(&self, message: &Value) -> Result<(), String> {
        let obj = message
            .as_object()
            .ok_or_else(|| "message is not an object".to_string())?;

        match obj.get("seq").and_then(Value::as_i64) {
            Some(seq) if seq > 0 => {}
            _ => return Err("`seq` must be a positive integer".to_string()),
        }

        if obj.get("type").and_then(Value::as_str).is_none() {
            return Err("`type` must be a string".to_string());
        }

        if obj.get("type").and_then(Value::as_str) == Some("request") {
            if obj.get("command").and_then(Value::as_str).is_none() {
                return Err("`command` must be a string".to_string());
            }
            if let Some(arguments) = obj.get("arguments") {
                if !arguments.is_object() && !arguments.is_null() {
                    return Err("`arguments` must be an object".to_string());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_a_well_formed_request() {
        let validator = EnvelopeValidator;
        assert!(validator
            .validate(&json!({
                "seq": 1,
                "type": "request",
                "command": "initialize",
                "arguments": {}
            }))
            .is_ok());
    }

    #[test]
    fn rejects_missing_command_and_bad_seq() {
        let validator = EnvelopeValidator;
        assert!(validator
            .validate(&json!({"seq": 0, "type": "request", "command": "x"}))
            .is_err());
        assert!(validator
            .validate(&json!({"seq": 1, "type": "request"}))
            .is_err());
        assert!(validator
            .validate(&json!({"seq": 1, "type": "request", "command": "x", "arguments": 3}))
            .is_err());
        assert!(validator.validate(&json!([1, 2])).is_err());
    }
}
