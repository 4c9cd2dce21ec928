//! Reverse-connection rendezvous server. Lets the local listener hand a
//! client's `CONNECT`-tunneled socket over to a worker process that has
//! no direct network path back to the browser, so the worker's own
//! network location becomes the tunnel's effective exit point.
//!
//! Grounded in `lib/servers/reverse.py`'s `ReverseConnectionServer` and
//! its `RequestHandler`: `GET /` is a liveness check, `POST /{message_id}`
//! is the legacy bulk-data path (store-by-id, no relay), and
//! `CONNECT /{socket_id}` is where a worker dials back in to claim a
//! socket previously registered by [`RendezvousServer::take_ownership_of_socket`]
//! — the splice between the worker's inbound connection and the
//! registered client connection happens here, inside this server, not
//! inside the worker and not inside the local listener. A single
//! background tick reaps both maps: sockets against their own
//! `idle_timeout` (set per-registration by the caller), messages against
//! the server-wide `message_timeout`.

use crate::errors::{ProxyError, ProxyResult};
use crate::stream;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, Server};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

struct SocketSlot {
    conn: Upgraded,
    registered_at: Instant,
    idle_timeout: Duration,
}

struct MessageSlot {
    body: Vec<u8>,
    received_at: Instant,
}

pub struct RendezvousServer {
    sockets: Mutex<HashMap<String, SocketSlot>>,
    messages: Mutex<HashMap<String, MessageSlot>>,
    notify: Notify,
    conn_timeout: Duration,
    message_timeout: Duration,
}

impl RendezvousServer {
    pub fn new(conn_timeout: Duration, message_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sockets: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            conn_timeout,
            message_timeout,
        })
    }

    /// Registers `conn` under `socket_id` until a worker's inbound
    /// `CONNECT /{socket_id}` claims it via [`Self::get_socket`], or it
    /// idles out after `idle_timeout`. Called by the client-facing side
    /// (`dispatch::stream::StreamDispatcher`), mirroring
    /// `take_ownership_of_socket` in the original.
    pub async fn take_ownership_of_socket(&self, socket_id: String, conn: Upgraded, idle_timeout: Duration) {
        let mut sockets = self.sockets.lock().await;
        sockets.insert(
            socket_id,
            SocketSlot {
                conn,
                registered_at: Instant::now(),
                idle_timeout,
            },
        );
        drop(sockets);
        self.notify.notify_waiters();
    }

    /// Consumes a registered socket, waiting up to `conn_timeout` for the
    /// registration to appear. Called from inside the `CONNECT` handler
    /// when a worker dials back. Returns the connection plus the
    /// `idle_timeout` it was registered with, since the splice uses that
    /// rather than the server-wide `conn_timeout`.
    async fn get_socket(&self, socket_id: &str) -> ProxyResult<(Upgraded, Duration)> {
        let deadline = Instant::now() + self.conn_timeout;
        loop {
            {
                let mut sockets = self.sockets.lock().await;
                if let Some(slot) = sockets.remove(socket_id) {
                    return Ok((slot.conn, slot.idle_timeout));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProxyError::RendezvousMiss);
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    /// Stores a POSTed message body under `message_id` until
    /// [`Self::get_message`] claims it or it ages out after
    /// `message_timeout`. The legacy bulk-data path named in spec.md §4.7.
    async fn put_message(&self, message_id: String, body: Vec<u8>) {
        let mut messages = self.messages.lock().await;
        messages.insert(
            message_id,
            MessageSlot {
                body,
                received_at: Instant::now(),
            },
        );
    }

    /// Consumes a previously POSTed message body, if any is still on file.
    pub async fn get_message(&self, message_id: &str) -> Option<Vec<u8>> {
        let mut messages = self.messages.lock().await;
        messages.remove(message_id).map(|slot| slot.body)
    }

    pub async fn run(self: Arc<Self>, bind: SocketAddr) -> anyhow::Result<()> {
        self.clone().spawn_reaper();

        let make_svc = make_service_fn(move |_conn| {
            let this = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.handle(req).await) }
                }))
            }
        });

        tracing::info!(%bind, "rendezvous server starting");
        Server::bind(&bind).serve(make_svc).await?;
        Ok(())
    }

    async fn handle(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().trim_start_matches('/').to_string();
        match *req.method() {
            Method::GET if path.is_empty() => liveness(),
            Method::POST => self.handle_post(path, req).await,
            Method::CONNECT => self.handle_connect(req, path).await,
            _ => status_only(404),
        }
    }

    async fn handle_post(&self, message_id: String, req: Request<Body>) -> Response<Body> {
        if message_id.is_empty() {
            return status_only(400);
        }
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(b) => b.to_vec(),
            Err(_) => return status_only(400),
        };
        self.put_message(message_id, body).await;
        status_only(204)
    }

    async fn handle_connect(self: Arc<Self>, req: Request<Body>, socket_id: String) -> Response<Body> {
        let (client_conn, idle_timeout) = match self.get_socket(&socket_id).await {
            Ok(pair) => pair,
            Err(_) => return status_only(404),
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(worker_conn) => {
                    if let Err(err) = stream::splice(worker_conn, client_conn, idle_timeout).await {
                        tracing::warn!(%err, "rendezvous splice failed");
                    }
                }
                Err(err) => tracing::warn!(%err, "rendezvous CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(200)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let now = Instant::now();
                {
                    let mut sockets = self.sockets.lock().await;
                    sockets.retain(|_, slot| now.duration_since(slot.registered_at) <= slot.idle_timeout);
                }
                {
                    let mut messages = self.messages.lock().await;
                    messages.retain(|_, slot| now.duration_since(slot.received_at) <= self.message_timeout);
                }
            }
        });
    }
}

fn liveness() -> Response<Body> {
    Response::new(Body::from("Server is live!\n"))
}

fn status_only(code: u16) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_message_consumes_once() {
        let server = RendezvousServer::new(Duration::from_millis(200), Duration::from_secs(5));
        server.put_message("m1".to_string(), b"payload".to_vec()).await;
        assert_eq!(server.get_message("m1").await, Some(b"payload".to_vec()));
        assert_eq!(server.get_message("m1").await, None);
    }

    #[tokio::test]
    async fn get_message_missing_returns_none() {
        let server = RendezvousServer::new(Duration::from_millis(200), Duration::from_secs(5));
        assert_eq!(server.get_message("missing").await, None);
    }

    #[tokio::test]
    async fn messages_reap_after_message_timeout() {
        let server = RendezvousServer::new(Duration::from_millis(200), Duration::from_millis(50));
        server.put_message("m1".to_string(), b"payload".to_vec()).await;
        server.clone().spawn_reaper();
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(server.get_message("m1").await, None);
    }

    #[tokio::test]
    async fn get_socket_times_out_without_registration() {
        let server = RendezvousServer::new(Duration::from_millis(100), Duration::from_secs(5));
        let result = server.get_socket("unregistered").await;
        assert!(matches!(result, Err(ProxyError::RendezvousMiss)));
    }

    #[test]
    fn status_only_sets_empty_body_response() {
        let resp = status_only(404);
        assert_eq!(resp.status(), 404);
    }
}
