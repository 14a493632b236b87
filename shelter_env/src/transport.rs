//! Transport abstraction between the observer and the simulation service.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::EnvError;

/// Request/response boundary to the external simulation engine.
///
/// # Implementations
///
/// - **Production**: `HttpTransport` - reqwest against the FastAPI service
/// - **Simulation**: `ScriptedEngine` (in `shelter_sim`) - in-process engine with fault injection
///
/// # Envelope
///
/// The service wraps every payload as `{"success": bool, "data": ..., "error": ...}`.
/// Implementations return the unwrapped `data` (see [`unwrap_envelope`]), so
/// callers only ever see the payload or an `EnvError`.
#[async_trait]
pub trait SimulationTransport: Send + Sync + 'static {
    /// Issues a GET for `path` bounded by `timeout`.
    async fn get(&self, path: &str, timeout: Duration) -> Result<Value, EnvError>;

    /// Issues a POST for `path` with an optional JSON body, bounded by `timeout`.
    async fn post(&self, path: &str, body: Option<Value>, timeout: Duration) -> Result<Value, EnvError>;
}

/// Strips the `{success, data, error}` envelope.
///
/// - `success: false` becomes `EnvError::Rejected` with the service's message
/// - `success: true` yields `data`, or the remaining object when `data` is absent
///   (acknowledgement-only endpoints such as `reset`)
/// - a body without `success` is passed through untouched
pub fn unwrap_envelope(body: Value) -> Result<Value, EnvError> {
    let Value::Object(mut map) = body else {
        return Ok(body);
    };

    match map.get("success").and_then(Value::as_bool) {
        Some(false) => {
            let message = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(EnvError::rejected(message))
        }
        Some(true) => match map.remove("data") {
            Some(data) => Ok(data),
            None => {
                map.remove("success");
                Ok(Value::Object(map))
            }
        },
        None => Ok(Value::Object(map)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_success_data() {
        let body = json!({"success": true, "data": {"day": 3}});
        assert_eq!(unwrap_envelope(body).unwrap(), json!({"day": 3}));
    }

    #[test]
    fn test_unwrap_rejected() {
        let body = json!({"success": false, "error": "busy"});
        match unwrap_envelope(body) {
            Err(EnvError::Rejected(msg)) => assert_eq!(msg, "busy"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_ack_without_data() {
        let body = json!({"success": true, "message": "reset"});
        assert_eq!(unwrap_envelope(body).unwrap(), json!({"message": "reset"}));
    }

    #[test]
    fn test_unwrap_passthrough() {
        let body = json!([1, 2, 3]);
        assert_eq!(unwrap_envelope(body.clone()).unwrap(), body);
    }
}
