use async_trait::async_trait;
use spoolcore::{Handler, HandlerContext, HandlerDescriptor, HandlerError, PortType, Value};
use std::collections::HashMap;

/// Simple debug handler that logs its inputs
pub struct DebugLogHandler;

#[async_trait]
impl Handler for DebugLogHandler {
    async fn execute(
        &self,
        input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");

        tracing::info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "DEBUG: {}", message);

        // Also log all inputs for visibility
        for (key, value) in &input {
            tracing::info!("  {}: {:?}", key, value);
        }

        Ok(HashMap::from([(
            "message".to_string(),
            Value::String(message.to_string()),
        )]))
    }
}

pub fn descriptor() -> HandlerDescriptor {
    HandlerDescriptor::new("debug.log")
        .with_description("Logs input values for debugging")
        .with_category("debug")
        .with_input("message", PortType::Any)
        .with_output("message", PortType::String)
        .non_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> HandlerContext {
        HandlerContext {
            run_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            attempt: 1,
            config: HashMap::new(),
            cancellation: CancellationToken::new(),
            deadline: Utc::now() + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn echoes_the_message() {
        let input = HashMap::from([("message".to_string(), Value::String("hi".to_string()))]);
        let out = DebugLogHandler.execute(input, ctx()).await.unwrap();
        assert_eq!(out.get("message"), Some(&Value::String("hi".to_string())));
    }

    #[tokio::test]
    async fn tolerates_missing_message() {
        let out = DebugLogHandler.execute(HashMap::new(), ctx()).await.unwrap();
        assert_eq!(
            out.get("message"),
            Some(&Value::String("(no message)".to_string()))
        );
    }
}
