//! Worker-side request execution: turn a [`WireRequest`] into an actual
//! outbound HTTP call and seal the result back up as a [`WireReply`].
//!
//! Shared between `forward_proxy_worker`'s stdin/stdout loop (short-lived
//! dispatch, one process per request) and [`crate::worker_manager`]'s
//! in-process long-lived loop, exactly as `lib/proxies/aws_short.py` and
//! the long-lived Lambda body in the original share one request-handling
//! core regardless of how the invocation arrived.

use crate::config::WorkerRuntimeConfig;
use crate::envelope::{self, ReplyMeta, WireReply, WireRequest};
use crate::object_store::ObjectStore;
use rsa::RsaPrivateKey;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Hop-by-hop headers stripped before replaying a request upstream or
/// returning a reply downstream, per RFC 7230 §6.1. Named identically
/// to the equivalent list in `listener.rs`'s cleartext path.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub async fn execute(
    wire_request: &[u8],
    privkey: Option<&RsaPrivateKey>,
    client: &reqwest::Client,
    runtime: &WorkerRuntimeConfig,
    inline_limit: usize,
    sink: Option<&dyn ObjectStore>,
) -> Vec<u8> {
    match execute_inner(wire_request, privkey, client, runtime, inline_limit, sink).await {
        Ok(bytes) => bytes,
        Err(err) => function_error(&err.to_string()),
    }
}

async fn execute_inner(
    wire_request: &[u8],
    privkey: Option<&RsaPrivateKey>,
    client: &reqwest::Client,
    runtime: &WorkerRuntimeConfig,
    inline_limit: usize,
    sink: Option<&dyn ObjectStore>,
) -> anyhow::Result<Vec<u8>> {
    let wire: WireRequest = serde_json::from_slice(wire_request)?;
    let (meta, body, session_key) = envelope::open_request(&wire, privkey, sink).await?;

    let method = reqwest::Method::from_bytes(meta.method.as_bytes())?;
    let mut builder = client.request(method, &meta.url);
    for (name, value) in meta.headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let timeout = Duration::from_millis(runtime.min_millis_remaining.max(1_000));
    let response = builder.timeout(timeout).send().await?;

    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    let response_body = response.bytes().await?.to_vec();

    let reply_meta = ReplyMeta { status, headers };
    let wire_reply = envelope::seal_response(
        &reply_meta,
        Some(&response_body),
        session_key.as_ref(),
        inline_limit,
        sink,
    )
    .await?;
    Ok(serde_json::to_vec(&wire_reply)?)
}

/// Worker-side counterpart to `dispatch::stream::StreamDispatcher::proxy`:
/// dials the real upstream and the rendezvous server's `CONNECT`
/// handshake, then splices between them. Grounded in
/// `lambda/impl/stream.py`'s `stream_handler`/`connect_stream_server`.
pub async fn execute_stream(payload: &[u8]) -> Vec<u8> {
    match execute_stream_inner(payload).await {
        Ok(()) => serde_json::to_vec(&serde_json::json!({ "status": "OK" }))
            .unwrap_or_else(|_| br#"{"status":"OK"}"#.to_vec()),
        Err(err) => function_error(&err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StreamWorkerRequest {
    #[serde(rename = "socketId")]
    socket_id: String,
    #[serde(rename = "streamServer")]
    stream_server: String,
    host: String,
    port: u16,
    #[serde(rename = "idleTimeout")]
    idle_timeout: u64,
}

async fn execute_stream_inner(payload: &[u8]) -> anyhow::Result<()> {
    let request: StreamWorkerRequest = serde_json::from_slice(payload)?;
    let idle_timeout = Duration::from_secs(request.idle_timeout.max(1));

    let upstream = TcpStream::connect((request.host.as_str(), request.port)).await?;
    let rendezvous_conn = connect_rendezvous(&request.stream_server, &request.socket_id).await?;

    crate::stream::splice(rendezvous_conn, upstream, idle_timeout).await?;
    Ok(())
}

/// Dials the rendezvous server and performs the raw
/// `CONNECT /{socket_id} HTTP/1.1\r\n\r\n` handshake the rendezvous
/// server's own HTTP surface expects, returning the connected socket on
/// a `200` and an error on anything else.
async fn connect_rendezvous(stream_server: &str, socket_id: &str) -> anyhow::Result<TcpStream> {
    let mut sock = TcpStream::connect(stream_server).await?;
    sock.write_all(format!("CONNECT /{socket_id} HTTP/1.1\r\n\r\n").as_bytes())
        .await?;
    let status = read_connect_status(&mut sock).await?;
    if status != 200 {
        anyhow::bail!("rendezvous CONNECT failed with status {status}");
    }
    Ok(sock)
}

async fn read_connect_status(sock: &mut TcpStream) -> anyhow::Result<u16> {
    let mut header_bytes = Vec::new();
    let mut tail = [0u8; 4];
    loop {
        let mut byte = [0u8; 1];
        sock.read_exact(&mut byte).await?;
        header_bytes.push(byte[0]);
        tail.copy_within(1.., 0);
        tail[3] = byte[0];
        if &tail == b"\r\n\r\n" {
            break;
        }
    }
    let text = String::from_utf8_lossy(&header_bytes);
    text.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed CONNECT response status line"))
}

fn function_error(message: &str) -> Vec<u8> {
    let body = serde_json::json!({ "functionError": message });
    serde_json::to_vec(&body).unwrap_or_else(|_| br#"{"functionError":"unknown"}"#.to_vec())
}

/// Convenience used by tests and by a cleartext-only worker path: parse
/// a sealed reply back into status/headers/body without a session key.
pub async fn open_cleartext_reply(bytes: &[u8]) -> anyhow::Result<(ReplyMeta, Option<Vec<u8>>)> {
    let wire: WireReply = serde_json::from_slice(bytes)?;
    Ok(envelope::open_response(&wire, None, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_error_is_well_formed_json() {
        let bytes = function_error("spawn failed");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["functionError"], "spawn failed");
    }

    #[tokio::test]
    async fn connect_rendezvous_accepts_200_and_consumes_headers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            // leave the socket open so the caller can use it afterward
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let sock = connect_rendezvous(&addr.to_string(), "deadbeef").await.unwrap();
        drop(sock);
    }

    #[tokio::test]
    async fn connect_rendezvous_rejects_non_200() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await.unwrap();
        });

        let result = connect_rendezvous(&addr.to_string(), "deadbeef").await;
        assert!(result.is_err());
    }
}
