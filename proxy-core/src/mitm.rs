//! MITM TLS interceptor: per-host leaf certificates minted on demand and
//! signed by a long-lived local CA, grounded in `lib/proxies/mitm.py`'s
//! `MitmHttpsProxy`. The subject fields on minted certs (`C=US`,
//! `ST=California`, `L=Palo Alto`, `O=Stanford University`,
//! `OU=MITM Proxy`) are carried over verbatim as the default identity;
//! only `CN` varies per intercepted host.
//!
//! The original hand-parses one `\r\n\r\n`-terminated request per TLS
//! connection and always replies `Connection: close`; we serve the
//! decrypted stream with `hyper`'s connection driver instead, but every
//! reply still carries `Connection: close`, which makes the driver shut
//! the connection down right after flushing it — one request per
//! tunnel, same as the original, without hand-rolled framing.

use crate::dispatch::Dispatcher;
use crate::envelope::{ReplyMeta, RequestMeta};
use crate::errors::{ProxyError, ProxyResult};
use dashmap::DashMap;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub struct MitmAuthority {
    ca: Certificate,
    configs: DashMap<String, Arc<rustls::ServerConfig>>,
}

impl MitmAuthority {
    /// Loads an existing CA from `cert_path`/`key_path` if both exist,
    /// otherwise mints a fresh self-signed CA and writes it there so
    /// later runs (and the operator importing it into a trust store)
    /// see a stable identity.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> ProxyResult<Self> {
        let ca = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|e| ProxyError::Transport(format!("bad CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .map_err(|e| ProxyError::Transport(format!("bad CA cert: {e}")))?;
            Certificate::from_params(params)
                .map_err(|e| ProxyError::Transport(format!("reload CA failed: {e}")))?
        } else {
            let mut params = CertificateParams::default();
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.distinguished_name = ca_subject("MITM Proxy CA");
            let ca = Certificate::from_params(params)
                .map_err(|e| ProxyError::Transport(format!("generate CA failed: {e}")))?;
            if let Some(parent) = cert_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(
                cert_path,
                ca.serialize_pem()
                    .map_err(|e| ProxyError::Transport(e.to_string()))?,
            )?;
            std::fs::write(key_path, ca.serialize_private_key_pem())?;
            ca
        };

        Ok(Self {
            ca,
            configs: DashMap::new(),
        })
    }

    fn config_for_host(&self, host: &str) -> ProxyResult<Arc<rustls::ServerConfig>> {
        if let Some(existing) = self.configs.get(host) {
            return Ok(existing.clone());
        }

        let mut params = CertificateParams::new(vec![host.to_string()]);
        params.subject_alt_names = vec![SanType::DnsName(host.to_string())];
        params.distinguished_name = ca_subject(host);

        let leaf = Certificate::from_params(params)
            .map_err(|e| ProxyError::Transport(format!("leaf cert params failed: {e}")))?;
        let cert_der = leaf
            .serialize_der_with_signer(&self.ca)
            .map_err(|e| ProxyError::Transport(format!("leaf cert signing failed: {e}")))?;
        let key_der = leaf.serialize_private_key_der();

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(cert_der)],
                rustls::PrivateKey(key_der),
            )
            .map_err(|e| ProxyError::Transport(format!("tls config build failed: {e}")))?;
        let config = Arc::new(config);
        self.configs.insert(host.to_string(), config.clone());
        Ok(config)
    }

    /// Wraps `client_stream` in a per-host TLS server config and serves
    /// HTTP requests off it, forwarding each one through `dispatcher`
    /// against `https://{host}:{port}{path}`. Generic over the upgraded
    /// transport so it works equally over a plain `TcpStream` or a
    /// `hyper::upgrade::Upgraded` CONNECT tunnel.
    pub async fn intercept<IO>(
        &self,
        client_stream: IO,
        host: String,
        port: u16,
        dispatcher: Arc<Dispatcher>,
    ) -> ProxyResult<()>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config_for_host(&host)?;
        let acceptor = TlsAcceptor::from(config);
        let tls_stream = acceptor
            .accept(client_stream)
            .await
            .map_err(|e| ProxyError::TunnelParse(format!("tls handshake failed: {e}")))?;

        let origin = format!("https://{host}:{port}");
        let service = service_fn(move |req: Request<Body>| {
            let dispatcher = dispatcher.clone();
            let origin = origin.clone();
            async move { Ok::<_, std::convert::Infallible>(handle_one(req, &origin, &dispatcher).await) }
        });

        hyper::server::conn::Http::new()
            .serve_connection(tls_stream, service)
            .await
            .map_err(|e| ProxyError::TunnelParse(format!("intercepted connection failed: {e}")))
    }
}

/// Headers stripped from the request before replaying it upstream,
/// per the tunnel's step-2 denylist: these describe the client's
/// connection to *us*, not anything the origin should see.
const TUNNEL_REQUEST_DENYLIST: &[&str] = &[
    "proxy-connection",
    "connection",
    "user-agent",
    "upgrade-insecure-requests",
];

async fn handle_one(req: Request<Body>, origin: &str, dispatcher: &Dispatcher) -> Response<Body> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{origin}{path}");

    let mut headers = BTreeMap::new();
    for (name, value) in req.headers().iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if TUNNEL_REQUEST_DENYLIST.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) if !b.is_empty() => Some(b.to_vec()),
        Ok(_) => None,
        Err(_) => {
            return Response::builder()
                .status(400)
                .body(Body::empty())
                .unwrap()
        }
    };

    let meta = RequestMeta { method, url, headers };
    match dispatcher.dispatch(meta, body).await {
        Ok((reply_meta, reply_body)) => build_response(reply_meta, reply_body),
        Err(err) => {
            tracing::warn!(%err, "mitm dispatch failed");
            Response::builder()
                .status(502)
                .body(Body::empty())
                .unwrap()
        }
    }
}

fn build_response(meta: ReplyMeta, body: Option<Vec<u8>>) -> Response<Body> {
    let mut builder = Response::builder().status(meta.status);
    for (name, value) in meta.headers.iter() {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header("Connection", "close");
    builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn ca_subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::StateOrProvinceName, "California");
    dn.push(DnType::LocalityName, "Palo Alto");
    dn.push(DnType::OrganizationName, "Stanford University");
    dn.push(DnType::OrganizationalUnitName, "MITM Proxy");
    dn.push(DnType::CommonName, common_name);
    dn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_response_always_closes_the_connection() {
        let mut headers = BTreeMap::new();
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("X-Custom".to_string(), "value".to_string());
        let meta = ReplyMeta { status: 200, headers };
        let resp = build_response(meta, None);
        assert_eq!(resp.headers().get("connection").unwrap(), "close");
        assert_eq!(resp.headers().get("x-custom").unwrap(), "value");
    }

    #[test]
    fn leaf_certs_are_cached_per_host() {
        let dir = std::env::temp_dir().join(format!("proxy-core-mitm-{}", uuid::Uuid::new_v4()));
        let authority =
            MitmAuthority::load_or_generate(&dir.join("ca.pem"), &dir.join("ca.key")).unwrap();
        let a = authority.config_for_host("example.com").unwrap();
        let b = authority.config_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = authority.config_for_host("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        let _ = std::fs::remove_dir_all(dir);
    }
}
