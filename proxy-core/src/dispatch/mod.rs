//! Dispatch variants named in spec.md §9's design notes: `Local`,
//! `ShortLived`, `LongLived`, and `Hybrid`, picking between the latter
//! two per host. MITM-intercepted traffic is handled separately by
//! [`crate::mitm`]; this module only covers the plain-HTTP and
//! CONNECT-tunneled-HTTPS forwarding path.

pub mod long_lived;
pub mod short_lived;
pub mod stream;

use crate::envelope::{ReplyMeta, RequestMeta};
use crate::errors::{ProxyError, ProxyResult};
use long_lived::LongLivedDispatcher;
use short_lived::ShortLivedDispatcher;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Issues the request directly from this process; the baseline used
/// when no worker function is configured (`lib/proxies/local.py`).
pub struct LocalDispatcher {
    pub client: reqwest::Client,
}

impl LocalDispatcher {
    pub async fn dispatch(
        &self,
        meta: RequestMeta,
        body: Option<Vec<u8>>,
    ) -> ProxyResult<(ReplyMeta, Option<Vec<u8>>)> {
        let method = reqwest::Method::from_bytes(meta.method.as_bytes())
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        let mut builder = self.client.request(method, &meta.url);
        for (name, value) in meta.headers.iter() {
            if crate::worker_side::HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamDial(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = std::collections::BTreeMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?
            .to_vec();
        Ok((ReplyMeta { status, headers }, Some(body)))
    }
}

pub enum Dispatcher {
    Local(LocalDispatcher),
    ShortLived(ShortLivedDispatcher),
    LongLived(LongLivedDispatcher),
    Hybrid {
        long_lived_hosts: HashSet<String>,
        short: ShortLivedDispatcher,
        long: LongLivedDispatcher,
    },
}

impl Dispatcher {
    pub async fn dispatch(
        &self,
        meta: RequestMeta,
        body: Option<Vec<u8>>,
    ) -> ProxyResult<(ReplyMeta, Option<Vec<u8>>)> {
        match self {
            Dispatcher::Local(d) => d.dispatch(meta, body).await,
            Dispatcher::ShortLived(d) => d.dispatch(meta, body).await,
            Dispatcher::LongLived(d) => d.dispatch(meta, body).await,
            Dispatcher::Hybrid {
                long_lived_hosts,
                short,
                long,
            } => {
                if host_matches(&meta.url, long_lived_hosts) {
                    long.dispatch(meta, body).await
                } else {
                    short.dispatch(meta, body).await
                }
            }
        }
    }
}

fn host_matches(url: &str, hosts: &HashSet<String>) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|host| hosts.contains(&host))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_matching_is_exact() {
        let mut hosts = HashSet::new();
        hosts.insert("api.example.com".to_string());
        assert!(host_matches("https://api.example.com/v1", &hosts));
        assert!(!host_matches("https://other.example.com/v1", &hosts));
        assert!(!host_matches("not a url", &hosts));
    }
}
