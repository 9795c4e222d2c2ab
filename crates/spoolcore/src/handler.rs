use crate::error::HandlerError;
use crate::value::Value;
use crate::workflow::NodeId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Contract implemented by external action providers.
///
/// Requirements the engine imposes on every implementation: be
/// idempotent enough to retry (or register with `retryable: false`),
/// watch `ctx.cancellation` and return within the grace period once it
/// fires, and never block forever; the engine enforces a hard
/// per-attempt deadline either way.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(
        &self,
        input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError>;
}

/// Per-attempt context passed to every handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub run_id: Uuid,
    pub node_id: NodeId,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Static configuration from the node spec.
    pub config: HashMap<String, Value>,
    /// Cooperative cancellation signal for this run.
    pub cancellation: CancellationToken,
    /// Hard deadline for this attempt; the engine abandons the attempt
    /// past this point regardless of cooperation.
    pub deadline: DateTime<Utc>,
}

impl HandlerContext {
    pub fn require_input<'a>(
        &self,
        input: &'a HashMap<String, Value>,
        name: &str,
    ) -> Result<&'a Value, HandlerError> {
        input
            .get(name)
            .ok_or_else(|| HandlerError::MissingInput(name.to_string()))
    }

    pub fn require_config(&self, name: &str) -> Result<&Value, HandlerError> {
        self.config
            .get(name)
            .ok_or_else(|| HandlerError::Configuration(format!("missing config: {}", name)))
    }

    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

/// What the catalog knows about an action kind: its port schema and
/// its execution policy. The descriptor never executes anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub action_kind: String,
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub retry: RetryPolicy,
    /// Hard per-attempt deadline in milliseconds.
    pub timeout_ms: u64,
    /// Handlers that are not safe to re-run never get a second attempt.
    pub retryable: bool,
}

impl HandlerDescriptor {
    pub fn new(action_kind: impl Into<String>) -> Self {
        Self {
            action_kind: action_kind.into(),
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: 30_000,
            retryable: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        self.inputs.push(PortSpec::new(name, port_type));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        self.outputs.push(PortSpec::new(name, port_type));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Declared port on a node or handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub port_type: PortType,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Any,
    String,
    Number,
    Bool,
    Object,
    Array,
    File,
}

impl PortType {
    /// Whether a value of this type may feed a port of `other`'s type.
    pub fn accepts(&self, other: &PortType) -> bool {
        *self == PortType::Any || *other == PortType::Any || self == other
    }
}

/// Exponential backoff schedule for failed attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    /// Delay before the attempt following `attempt` (1-based), capped.
    pub fn delay_before_retry(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay =
            (self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32)) as u64;
        std::time::Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1_000)
    }
}
