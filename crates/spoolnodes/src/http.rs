use async_trait::async_trait;
use spoolcore::{Handler, HandlerContext, HandlerDescriptor, HandlerError, PortType, Value};
use std::collections::HashMap;

/// HTTP request handler
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for HttpRequestHandler {
    async fn execute(
        &self,
        input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        let url = ctx
            .require_input(&input, "url")?
            .as_str()
            .ok_or_else(|| HandlerError::InvalidInputType {
                field: "url".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;
        let method_value = ctx.get_config_or("method", Value::String("GET".to_string()));
        let method = method_value.as_str().unwrap_or("GET");

        tracing::info!(attempt = ctx.attempt, "{} {}", method, url);

        let request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let mut req = self.client.post(url);
                if let Some(body) = input.get("body") {
                    if let Some(json) = body.as_json() {
                        req = req.json(json);
                    } else if let Some(text) = body.as_str() {
                        req = req.body(text.to_string());
                    }
                }
                req
            }
            "PUT" => {
                let mut req = self.client.put(url);
                if let Some(body) = input.get("body") {
                    if let Some(json) = body.as_json() {
                        req = req.json(json);
                    }
                }
                req
            }
            "DELETE" => self.client.delete(url),
            _ => {
                return Err(HandlerError::Configuration(format!(
                    "Unsupported method: {}",
                    method
                )))
            }
        };

        // Add headers if provided
        let request = if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            let mut req = request;
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    req = req.header(key, val_str);
                }
            }
            req
        } else {
            request
        };

        let response = tokio::select! {
            result = request.send() => result
                .map_err(|e| HandlerError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(HandlerError::Cancelled),
        };

        let status = response.status().as_u16();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| HandlerError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        tracing::info!("Response status: {}", status);

        Ok(HashMap::from([
            ("status".to_string(), Value::Number(status as f64)),
            ("body".to_string(), Value::String(body_text)),
            ("headers".to_string(), Value::Object(headers_map)),
        ]))
    }
}

pub fn descriptor() -> HandlerDescriptor {
    HandlerDescriptor::new("http.request")
        .with_description("Make HTTP requests")
        .with_category("http")
        .with_input("url", PortType::String)
        .with_input("body", PortType::Any)
        .with_output("status", PortType::Number)
        .with_output("body", PortType::String)
        .with_output("headers", PortType::Object)
}
