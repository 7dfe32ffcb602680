//! Adapter for agents reached through a deliver-and-acknowledge transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stratus_abstraction::{AgentError, AgentInvoker, InvocationContext, MessageDelivery};
use tracing::debug;

/// Presents a [`MessageDelivery`] transport as an [`AgentInvoker`].
///
/// Each invocation sends an envelope carrying the payload and the invocation
/// context, then waits up to `reply_timeout` for the answer.
pub struct DeliveryInvoker {
    transport: Arc<dyn MessageDelivery>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for DeliveryInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryInvoker").field("reply_timeout", &self.reply_timeout).finish_non_exhaustive()
    }
}

impl DeliveryInvoker {
    /// Creates an invoker over `transport`.
    pub fn new(transport: Arc<dyn MessageDelivery>, reply_timeout: Duration) -> Self {
        Self { transport, reply_timeout }
    }

    fn envelope(payload: &Value, context: &InvocationContext) -> Value {
        json!({
            "payload": payload,
            "run_id": context.run_id,
            "step_id": context.step_id,
            "attempt": context.attempt,
            "variables": context.variables,
        })
    }
}

#[async_trait]
impl AgentInvoker for DeliveryInvoker {
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        context: &InvocationContext,
    ) -> Result<Value, AgentError> {
        let token = self.transport.send(target_id, &Self::envelope(payload, context)).await?;
        debug!(target = %target_id, token = %token, "Message delivered, awaiting reply");
        self.transport.await_result(&token, self.reply_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use stratus_abstraction::DeliveryToken;

    /// Replies with the envelope it was sent, unless the target is "silent".
    #[derive(Default)]
    struct Mailbox {
        sent: Mutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl MessageDelivery for Mailbox {
        async fn send(&self, target_id: &str, payload: &Value) -> Result<DeliveryToken, AgentError> {
            let token = format!("{}-{}", target_id, self.sent.lock().unwrap().len());
            if target_id != "silent" {
                self.sent.lock().unwrap().insert(token.clone(), payload.clone());
            }
            Ok(DeliveryToken(token))
        }

        async fn await_result(
            &self,
            token: &DeliveryToken,
            timeout: Duration,
        ) -> Result<Value, AgentError> {
            self.sent
                .lock()
                .unwrap()
                .remove(&token.0)
                .ok_or_else(|| AgentError::Timeout(format!("no reply within {:?}", timeout)))
        }
    }

    #[tokio::test]
    async fn test_invoke_round_trips_through_transport() {
        let invoker = DeliveryInvoker::new(Arc::new(Mailbox::default()), Duration::from_secs(1));
        let context = InvocationContext::new("run-1", "ask");

        let reply = invoker.invoke("oracle", &json!({"q": 1}), &context).await.unwrap();
        assert_eq!(reply["payload"], json!({"q": 1}));
        assert_eq!(reply["step_id"], "ask");
        assert_eq!(reply["attempt"], 1);
    }

    #[tokio::test]
    async fn test_missing_reply_is_a_timeout() {
        let invoker = DeliveryInvoker::new(Arc::new(Mailbox::default()), Duration::from_millis(5));
        let err = invoker
            .invoke("silent", &Value::Null, &InvocationContext::new("run-1", "ask"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }
}
