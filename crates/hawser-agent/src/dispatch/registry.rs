//! Command registry
//!
//! Maps dotted action names (`terminal.create`, `system.metrics`, ...)
//! to handlers. The set of registered actions is fixed at startup;
//! deployments without a container engine or an update endpoint simply
//! never register those actions, and the control plane gets a clean
//! "unknown action" failure instead of a hang.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hawser_core::traits::{ContainerDriver, MetricsSampler};

/// Errors produced while executing a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown action: {0}")]
    NotFound(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

/// A single command implementation.
///
/// Handlers receive the raw `params` object and a cancellation token
/// that fires if the command deadline passes. Long-running handlers
/// that spawn work of their own should pass the token along.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, params: Value, cancel: CancellationToken) -> anyhow::Result<Value>;
}

/// Immutable action-to-handler table
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Execute an action, enforcing the caller-supplied deadline.
    ///
    /// On timeout the handler future is dropped and its cancellation
    /// token fired, so any work it handed off stops as well.
    pub async fn execute(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Value, CommandError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| CommandError::NotFound(action.to_string()))?;

        match timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, handler.execute(params, cancel.clone())).await
                {
                    Ok(result) => result.map_err(|e| CommandError::Failed(format!("{e:#}"))),
                    Err(_) => {
                        cancel.cancel();
                        Err(CommandError::Timeout(deadline))
                    }
                }
            }
            None => handler
                .execute(params, cancel)
                .await
                .map_err(|e| CommandError::Failed(format!("{e:#}"))),
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted for stable output
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }
}

pub struct CommandRegistryBuilder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistryBuilder {
    pub fn register(mut self, action: &str, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(action.to_string(), handler);
        self
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            handlers: self.handlers,
        }
    }
}

/// `system.metrics`: one-shot telemetry sample
pub struct MetricsHandler {
    pub sampler: Arc<dyn MetricsSampler>,
}

#[async_trait]
impl CommandHandler for MetricsHandler {
    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let metrics = self.sampler.sample().await?;
        Ok(serde_json::to_value(metrics)?)
    }
}

/// Container operations exposed over the command channel
#[derive(Debug, Clone, Copy)]
pub enum ContainerOp {
    List,
    Inspect,
    Start,
    Stop,
    Restart,
}

/// `container.*`: thin adapter over the injected engine driver
pub struct ContainerHandler {
    driver: Arc<dyn ContainerDriver>,
    op: ContainerOp,
}

impl ContainerHandler {
    pub fn new(driver: Arc<dyn ContainerDriver>, op: ContainerOp) -> Self {
        Self { driver, op }
    }

    fn container_id(params: &Value) -> anyhow::Result<String> {
        params
            .get("container_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("missing container_id"))
    }
}

#[async_trait]
impl CommandHandler for ContainerHandler {
    async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        match self.op {
            ContainerOp::List => self.driver.list().await,
            ContainerOp::Inspect => self.driver.inspect(&Self::container_id(&params)?).await,
            ContainerOp::Start => self.driver.start(&Self::container_id(&params)?).await,
            ContainerOp::Stop => self.driver.stop(&Self::container_id(&params)?).await,
            ContainerOp::Restart => self.driver.restart(&Self::container_id(&params)?).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
            Ok(params)
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl CommandHandler for SlowHandler {
        async fn execute(&self, _params: Value, cancel: CancellationToken) -> anyhow::Result<Value> {
            cancel.cancelled().await;
            Ok(Value::Null)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CommandHandler for FailingHandler {
        async fn execute(
            &self,
            _params: Value,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Value> {
            anyhow::bail!("engine unavailable")
        }
    }

    fn registry() -> CommandRegistry {
        CommandRegistry::builder()
            .register("echo", Arc::new(EchoHandler))
            .register("slow", Arc::new(SlowHandler))
            .register("fail", Arc::new(FailingHandler))
            .build()
    }

    #[tokio::test]
    async fn test_execute_known_action() {
        let registry = registry();
        let params = json!({"value": 42});

        let result = registry
            .execute("echo", params.clone(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, params);
    }

    #[tokio::test]
    async fn test_execute_unknown_action() {
        let registry = registry();

        let err = registry
            .execute("nope", Value::Null, None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::NotFound(_)));
        assert!(err.to_string().contains("Unknown action"));
    }

    #[tokio::test]
    async fn test_execute_times_out_and_cancels() {
        let registry = registry();
        let cancel = CancellationToken::new();

        let err = registry
            .execute(
                "slow",
                Value::Null,
                Some(Duration::from_millis(50)),
                cancel.clone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_execute_surfaces_handler_error() {
        let registry = registry();

        let err = registry
            .execute("fail", Value::Null, None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("engine unavailable"));
    }

    #[test]
    fn test_actions_sorted() {
        let registry = registry();
        assert_eq!(registry.actions(), vec!["echo", "fail", "slow"]);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("echo2"));
    }

    struct FakeDriver;

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn counts(&self) -> anyhow::Result<hawser_core::traits::ContainerCounts> {
            Ok(hawser_core::traits::ContainerCounts {
                total: 2,
                running: 1,
            })
        }
        async fn list(&self) -> anyhow::Result<Value> {
            Ok(json!([{"id": "c1"}, {"id": "c2"}]))
        }
        async fn inspect(&self, id: &str) -> anyhow::Result<Value> {
            Ok(json!({"id": id, "state": "running"}))
        }
        async fn start(&self, id: &str) -> anyhow::Result<Value> {
            Ok(json!({"id": id, "started": true}))
        }
        async fn stop(&self, id: &str) -> anyhow::Result<Value> {
            Ok(json!({"id": id, "stopped": true}))
        }
        async fn restart(&self, id: &str) -> anyhow::Result<Value> {
            Ok(json!({"id": id, "restarted": true}))
        }
    }

    #[tokio::test]
    async fn test_container_handler_routes_ops() {
        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver);

        let list = ContainerHandler::new(Arc::clone(&driver), ContainerOp::List);
        let result = list
            .execute(Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), 2);

        let inspect = ContainerHandler::new(Arc::clone(&driver), ContainerOp::Inspect);
        let result = inspect
            .execute(json!({"container_id": "c7"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["id"], "c7");
    }

    #[tokio::test]
    async fn test_container_handler_requires_id() {
        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver);
        let stop = ContainerHandler::new(driver, ContainerOp::Stop);

        let err = stop
            .execute(json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("container_id"));
    }
}
