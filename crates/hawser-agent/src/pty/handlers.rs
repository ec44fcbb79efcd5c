//! Terminal command handlers
//!
//! Wire-facing adapters for `terminal.*` actions. Output and close
//! events ride the session's dedicated stream channel; command replies
//! only confirm that the operation itself happened.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hawser_protocol::{base64_bytes, terminal_channel, Message};

use crate::dispatch::CommandHandler;
use crate::pty::{CloseCallback, OutputCallback, TerminalManager};
use crate::transport::OutboundSender;

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    session_id: String,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default)]
    shell: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InputParams {
    session_id: String,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ResizeParams {
    session_id: String,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct CloseParams {
    session_id: String,
}

/// Event payload carried on a session's `terminal:<id>` channel
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TerminalEvent {
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Closed {
        reason: String,
    },
}

fn send_event(outbound: &OutboundSender, channel: &str, event: TerminalEvent) {
    let data = match serde_json::to_value(&event) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(channel, error = %e, "Failed to serialize terminal event");
            return;
        }
    };
    if let Err(e) = outbound.send(Message::Stream {
        channel: channel.to_string(),
        data,
    }) {
        // Queue pressure while the link is down; the shell keeps running
        tracing::debug!(channel, error = %e, "Dropping terminal event");
    }
}

/// `terminal.create`
pub struct TerminalCreateHandler {
    pub terminals: Arc<TerminalManager>,
    pub outbound: OutboundSender,
}

#[async_trait]
impl CommandHandler for TerminalCreateHandler {
    async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let params: CreateParams =
            serde_json::from_value(params).context("invalid terminal.create params")?;
        let channel = terminal_channel(&params.session_id);

        let on_output: OutputCallback = {
            let outbound = self.outbound.clone();
            let channel = channel.clone();
            Arc::new(move |chunk: Vec<u8>| {
                send_event(&outbound, &channel, TerminalEvent::Output { data: chunk });
            })
        };
        let on_close: CloseCallback = {
            let outbound = self.outbound.clone();
            let channel = channel.clone();
            Arc::new(move |reason: String| {
                send_event(&outbound, &channel, TerminalEvent::Closed { reason });
            })
        };

        let info = self
            .terminals
            .create(
                &params.session_id,
                params.cols,
                params.rows,
                params.shell,
                on_output,
                on_close,
            )
            .await?;

        Ok(serde_json::to_value(info)?)
    }
}

/// `terminal.input`
pub struct TerminalInputHandler {
    pub terminals: Arc<TerminalManager>,
}

#[async_trait]
impl CommandHandler for TerminalInputHandler {
    async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let params: InputParams =
            serde_json::from_value(params).context("invalid terminal.input params")?;
        self.terminals
            .write(&params.session_id, &params.data)
            .await?;
        Ok(json!({ "written": params.data.len() }))
    }
}

/// `terminal.resize`
pub struct TerminalResizeHandler {
    pub terminals: Arc<TerminalManager>,
}

#[async_trait]
impl CommandHandler for TerminalResizeHandler {
    async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let params: ResizeParams =
            serde_json::from_value(params).context("invalid terminal.resize params")?;
        self.terminals
            .resize(&params.session_id, params.cols, params.rows)
            .await?;
        Ok(json!({ "cols": params.cols, "rows": params.rows }))
    }
}

/// `terminal.close`
pub struct TerminalCloseHandler {
    pub terminals: Arc<TerminalManager>,
}

#[async_trait]
impl CommandHandler for TerminalCloseHandler {
    async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let params: CloseParams =
            serde_json::from_value(params).context("invalid terminal.close params")?;
        let exit_code = self.terminals.close(&params.session_id).await?;
        Ok(json!({ "closed": true, "exit_code": exit_code }))
    }
}
