//! Local-facing listener: a raw `hyper` service (not `axum`, since a
//! `CONNECT` tunnel isn't routable through axum's extractor model)
//! dispatching `CONNECT` to a tunnel and everything else through the
//! configured [`Dispatcher`]. Grounded in `main.py`'s
//! `BaseHTTPRequestHandler` subclass.

use crate::dispatch::stream::StreamDispatcher;
use crate::dispatch::Dispatcher;
use crate::envelope::{ReplyMeta, RequestMeta};
use crate::mitm::MitmAuthority;
use crate::stream;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, Server};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

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

pub struct ProxyListener {
    pub dispatcher: Arc<Dispatcher>,
    pub mitm: Option<Arc<MitmAuthority>>,
    /// Dispatches non-MITM `CONNECT` tunnels to a remote worker via the
    /// rendezvous server instead of dialing upstream locally. `None`
    /// falls back to a direct dial from this process.
    pub stream: Option<Arc<StreamDispatcher>>,
    pub tunnel_idle_timeout: Duration,
}

impl ProxyListener {
    pub async fn run(self: Arc<Self>, bind: SocketAddr) -> anyhow::Result<()> {
        let make_svc = make_service_fn(move |_conn| {
            let this = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.handle(req).await) }
                }))
            }
        });

        tracing::info!(%bind, "local proxy listener starting");
        Server::bind(&bind).serve(make_svc).await?;
        Ok(())
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.handle_plain(req).await
    }

    async fn handle_connect(&self, req: Request<Body>) -> Response<Body> {
        let authority = match req.uri().authority().map(|a| a.to_string()) {
            Some(a) => a,
            None => return status_only(400),
        };
        let (host, port) = match split_authority(&authority) {
            Some(pair) => pair,
            None => return status_only(400),
        };

        let dispatcher = self.dispatcher.clone();
        let mitm = self.mitm.clone();
        let stream_dispatcher = self.stream.clone();
        let idle_timeout = self.tunnel_idle_timeout;

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(err) = run_tunnel(
                        upgraded,
                        host,
                        port,
                        mitm,
                        stream_dispatcher,
                        dispatcher,
                        idle_timeout,
                    )
                    .await
                    {
                        tracing::warn!(%err, "CONNECT tunnel failed");
                    }
                }
                Err(err) => tracing::warn!(%err, "CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(200)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    async fn handle_plain(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().to_string();
        let url = req.uri().to_string();
        if req.uri().scheme().is_none() {
            return status_only(400);
        }

        let mut headers = BTreeMap::new();
        for (name, value) in req.headers().iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }

        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(b) if !b.is_empty() => Some(b.to_vec()),
            Ok(_) => None,
            Err(_) => return status_only(400),
        };

        let meta = RequestMeta { method, url, headers };
        match self.dispatcher.dispatch(meta, body).await {
            Ok((reply_meta, reply_body)) => build_response(reply_meta, reply_body),
            Err(err) => {
                tracing::warn!(%err, "dispatch failed");
                status_only(err.status_code())
            }
        }
    }
}

async fn run_tunnel(
    upgraded: Upgraded,
    host: String,
    port: u16,
    mitm: Option<Arc<MitmAuthority>>,
    stream_dispatcher: Option<Arc<StreamDispatcher>>,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    match mitm {
        Some(authority) => {
            authority.intercept(upgraded, host, port, dispatcher).await?;
            Ok(())
        }
        None => match stream_dispatcher {
            Some(stream_dispatcher) => {
                stream_dispatcher.proxy(upgraded, host, port).await?;
                Ok(())
            }
            None => {
                let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
                let mut upgraded = upgraded;
                stream::splice(&mut upgraded, &mut upstream, idle_timeout).await?;
                Ok(())
            }
        },
    }
}

fn split_authority(authority: &str) -> Option<(String, u16)> {
    let mut parts = authority.rsplitn(2, ':');
    let port: u16 = parts.next()?.parse().ok()?;
    let host = parts.next()?.to_string();
    Some((host, port))
}

fn status_only(code: u16) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn build_response(meta: ReplyMeta, body: Option<Vec<u8>>) -> Response<Body> {
    let mut builder = Response::builder().status(meta.status);
    for (name, value) in meta.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder
        .header("Connection", "close")
        .header("Proxy-Connection", "close");
    builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_authority_parses_host_and_port() {
        assert_eq!(
            split_authority("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn split_authority_rejects_missing_port() {
        assert_eq!(split_authority("example.com"), None);
    }

    #[test]
    fn split_authority_handles_ipv6_host_by_rsplit() {
        // rsplitn on the last ':' is enough for bracketed IPv6 literals
        // since the port always follows the closing bracket.
        assert_eq!(
            split_authority("[::1]:8080"),
            Some(("[::1]".to_string(), 8080))
        );
    }

    #[test]
    fn build_response_drops_hop_by_hop_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("X-Custom".to_string(), "value".to_string());
        let meta = ReplyMeta { status: 200, headers };
        let resp = build_response(meta, None);
        assert_eq!(resp.headers().get("x-custom").unwrap(), "value");
    }

    #[test]
    fn build_response_always_closes_the_connection() {
        let meta = ReplyMeta { status: 200, headers: BTreeMap::new() };
        let resp = build_response(meta, None);
        assert_eq!(resp.headers().get("connection").unwrap(), "close");
        assert_eq!(resp.headers().get("proxy-connection").unwrap(), "close");
    }

    #[test]
    fn status_only_sets_empty_body_response() {
        let resp = status_only(404);
        assert_eq!(resp.status(), 404);
    }
}
