//! In-process invoker for dry runs of workflow definitions.

use async_trait::async_trait;
use serde_json::{Value, json};
use stratus_abstraction::{AgentError, AgentInvoker, InvocationContext};
use tracing::debug;

/// Answers every agent by echoing its payload.
///
/// A payload object with a string `fail` field is answered with an
/// invalid-input error carrying that message, so failure paths of a
/// definition can be exercised too. A payload object with a `vote` field is
/// echoed as is and therefore counts as that vote in consensus groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackInvoker;

#[async_trait]
impl AgentInvoker for LoopbackInvoker {
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        context: &InvocationContext,
    ) -> Result<Value, AgentError> {
        debug!(target = %target_id, step_id = %context.step_id, attempt = context.attempt, "Loopback invocation");

        if let Some(message) = payload.get("fail").and_then(Value::as_str) {
            return Err(AgentError::InvalidInput(format!("{}: {}", target_id, message)));
        }
        Ok(match payload {
            Value::Null => json!({ "agent": target_id, "step_id": context.step_id }),
            other => other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_payload() {
        let context = InvocationContext::new("run-1", "greet");
        let reply = LoopbackInvoker.invoke("greeter", &json!({"hello": 1}), &context).await.unwrap();
        assert_eq!(reply, json!({"hello": 1}));
    }

    #[tokio::test]
    async fn test_null_payload_names_the_agent() {
        let context = InvocationContext::new("run-1", "greet");
        let reply = LoopbackInvoker.invoke("greeter", &Value::Null, &context).await.unwrap();
        assert_eq!(reply["agent"], "greeter");
    }

    #[tokio::test]
    async fn test_fail_field_is_invalid_input() {
        let context = InvocationContext::new("run-1", "greet");
        let err = LoopbackInvoker
            .invoke("greeter", &json!({"fail": "boom"}), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(message) if message.contains("boom")));
    }
}
