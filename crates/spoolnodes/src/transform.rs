use async_trait::async_trait;
use spoolcore::{Handler, HandlerContext, HandlerError, HandlerDescriptor, PortType, Value};
use std::collections::HashMap;

/// Parse JSON string to Value
pub struct JsonParseHandler;

#[async_trait]
impl Handler for JsonParseHandler {
    async fn execute(
        &self,
        input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        let text = ctx
            .require_input(&input, "json")?
            .as_str()
            .ok_or_else(|| HandlerError::InvalidInputType {
                field: "json".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| HandlerError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(HashMap::from([(
            "parsed".to_string(),
            Value::Json(parsed),
        )]))
    }
}

pub fn parse_descriptor() -> HandlerDescriptor {
    HandlerDescriptor::new("transform.json_parse")
        .with_description("Parse JSON string")
        .with_category("transform")
        .with_input("json", PortType::String)
        .with_output("parsed", PortType::Object)
        .non_retryable()
}

/// Stringify Value to JSON
pub struct JsonStringifyHandler;

#[async_trait]
impl Handler for JsonStringifyHandler {
    async fn execute(
        &self,
        input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        let value = ctx.require_input(&input, "value")?;

        let json_str = serde_json::to_string_pretty(value)
            .map_err(|e| HandlerError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(HashMap::from([(
            "json".to_string(),
            Value::String(json_str),
        )]))
    }
}

pub fn stringify_descriptor() -> HandlerDescriptor {
    HandlerDescriptor::new("transform.json_stringify")
        .with_description("Convert value to JSON string")
        .with_category("transform")
        .with_input("value", PortType::Any)
        .with_output("json", PortType::String)
        .non_retryable()
}
