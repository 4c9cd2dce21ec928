//! Invokes a remote worker for one request/response cycle.
//!
//! The original dispatches to AWS Lambda (`lib/proxies/aws_short.py`)
//! or a local subprocess (`lib/proxies/local.py`) behind the same
//! `invoke` shape: hand over an opaque payload, get back either a
//! worker's payload or a `functionError`. We keep that shape and
//! implement it against a plain child process running the
//! `forward_proxy_worker` binary, since this crate has no Lambda SDK
//! dependency to build on.

use crate::errors::{ProxyError, ProxyResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;

pub struct InvokeResult {
    pub payload: Vec<u8>,
    pub function_error: Option<String>,
}

#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, request_payload: Vec<u8>) -> ProxyResult<InvokeResult>;
}

/// Bounds the number of concurrently in-flight invocations, mirroring
/// `MAX_PARALLEL_INVOCATIONS` in the original worker manager.
pub struct ProcessInvoker {
    worker_binary: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl ProcessInvoker {
    pub fn new(worker_binary: PathBuf, max_parallel_invocations: usize) -> Self {
        Self {
            worker_binary,
            semaphore: Arc::new(Semaphore::new(max_parallel_invocations.max(1))),
        }
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn invoke(&self, request_payload: Vec<u8>) -> ProxyResult<InvokeResult> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Transport("invocation semaphore closed".into()))?;

        let mut child = Command::new(&self.worker_binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProxyError::Transport(format!("spawn worker failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Transport("worker stdin unavailable".into()))?;
        stdin
            .write_all(&request_payload)
            .await
            .map_err(|e| ProxyError::Transport(format!("write to worker failed: {e}")))?;
        drop(stdin);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Transport("worker stdout unavailable".into()))?;
        let mut out = Vec::new();
        stdout
            .read_to_end(&mut out)
            .await
            .map_err(|e| ProxyError::Transport(format!("read from worker failed: {e}")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| ProxyError::Transport(format!("wait on worker failed: {e}")))?;
        if !status.success() {
            return Err(ProxyError::Transport(format!(
                "worker exited with {status}"
            )));
        }

        let function_error = serde_json::from_slice::<serde_json::Value>(&out)
            .ok()
            .and_then(|v| {
                v.get("functionError")
                    .and_then(|fe| fe.as_str())
                    .map(str::to_string)
            });

        Ok(InvokeResult {
            payload: out,
            function_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_function_error_envelope() {
        let raw = br#"{"functionError":"boom","trace":[]}"#;
        let value: serde_json::Value = serde_json::from_slice(raw).unwrap();
        assert_eq!(value["functionError"].as_str(), Some("boom"));
    }
}
