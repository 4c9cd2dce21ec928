//! `forward_proxy_worker`: reads one invocation payload off stdin and
//! writes a reply to stdout. Spawned once per invocation by
//! [`proxy_core::invoker::ProcessInvoker`], either for the short-lived
//! request/reply dispatch path (grounded in `lib/proxies/local.py`'s
//! local-subprocess worker and `lib/proxies/aws_short.py`'s per-call
//! Lambda body) or, when the payload carries `"stream": true`, for the
//! stream-mode `CONNECT`-tunnel relay (grounded in
//! `lambda/impl/stream.py`'s `stream_handler`).

use proxy_core::config::{self, WorkerRuntimeConfig};
use proxy_core::crypto;
use proxy_core::object_store::FsObjectStore;
use proxy_core::worker_side;
use std::io::{Read, Write};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = WorkerRuntimeConfig::from_env();

    let privkey = match std::env::var("RSA_PRIVATE_KEY") {
        Ok(hex_der) => Some(crypto::load_private_key_der_hex(&hex_der)?),
        Err(_) => None,
    };

    let object_store_dir = std::env::var("FORWARD_PROXY_OBJECT_STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("forward-proxy-objects"));
    let sink = FsObjectStore::new(object_store_dir);

    let inline_limit = std::env::var("FORWARD_PROXY_INLINE_BODY_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(config::default_inline_body_limit);

    let mut request_bytes = Vec::new();
    std::io::stdin().read_to_end(&mut request_bytes)?;

    let is_stream = serde_json::from_slice::<serde_json::Value>(&request_bytes)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false);

    let reply_bytes = if is_stream {
        worker_side::execute_stream(&request_bytes).await
    } else {
        let client = reqwest::Client::builder().build()?;
        worker_side::execute(
            &request_bytes,
            privkey.as_ref(),
            &client,
            &runtime,
            inline_limit,
            Some(&sink),
        )
        .await
    };

    std::io::stdout().write_all(&reply_bytes)?;
    Ok(())
}
