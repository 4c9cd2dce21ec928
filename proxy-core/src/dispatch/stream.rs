//! Stream-mode dispatch: hands a `CONNECT`-tunneled client socket to a
//! remote worker via the rendezvous server instead of dialing the
//! upstream host from this process, so the tunnel's exit IP rotates
//! with the worker. Grounded in `lib/proxies/aws_stream.py`'s
//! `StreamLambdaProxy.stream`.

use crate::errors::ProxyResult;
use crate::invoker::Invoker;
use crate::rendezvous::RendezvousServer;
use hyper::upgrade::Upgraded;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct StreamInvokeArgs<'a> {
    stream: bool,
    #[serde(rename = "socketId")]
    socket_id: &'a str,
    #[serde(rename = "streamServer")]
    stream_server: &'a str,
    host: &'a str,
    port: u16,
    #[serde(rename = "idleTimeout")]
    idle_timeout: u64,
}

pub struct StreamDispatcher {
    pub invoker: Arc<dyn Invoker>,
    pub rendezvous: Arc<RendezvousServer>,
    pub public_host_and_port: String,
    pub idle_timeout: Duration,
}

impl StreamDispatcher {
    /// Registers `client` with the rendezvous server under a fresh
    /// socket id, then invokes a stream-mode worker to bridge it to
    /// `host:port`. The actual byte relay happens later: one splice
    /// inside the worker process (upstream <-> rendezvous-dialed
    /// socket), one inside the rendezvous server's own `CONNECT` handler
    /// (worker's inbound connection <-> this registered client socket).
    pub async fn proxy(&self, client: Upgraded, host: String, port: u16) -> ProxyResult<()> {
        let socket_id = format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>());
        self.rendezvous
            .take_ownership_of_socket(socket_id.clone(), client, self.idle_timeout)
            .await;

        let args = StreamInvokeArgs {
            stream: true,
            socket_id: &socket_id,
            stream_server: &self.public_host_and_port,
            host: &host,
            port,
            idle_timeout: self.idle_timeout.as_secs(),
        };
        let payload = serde_json::to_vec(&args)?;

        let result = self.invoker.invoke(payload).await?;
        if let Some(fault) = result.function_error {
            tracing::warn!(%fault, %socket_id, "stream worker invocation failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_args_serialize_with_expected_keys() {
        let args = StreamInvokeArgs {
            stream: true,
            socket_id: "abc123",
            stream_server: "127.0.0.1:9000",
            host: "example.com",
            port: 443,
            idle_timeout: 30,
        };
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["socketId"], "abc123");
        assert_eq!(json["streamServer"], "127.0.0.1:9000");
        assert_eq!(json["host"], "example.com");
        assert_eq!(json["port"], 443);
        assert_eq!(json["idleTimeout"], 30);
    }
}
