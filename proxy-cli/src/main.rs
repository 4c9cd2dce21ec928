//! `forward_proxy_cli`: reads a TOML config, wires up the configured
//! dispatch variant, and runs the local listener. Mirrors `main.py`'s
//! `argparse`-driven entry point, translated to `argh`.

use anyhow::Context;
use argh::FromArgs;
use proxy_core::config::{DispatchMode, ProxyConfig, WorkerRuntimeConfig};
use proxy_core::crypto;
use proxy_core::dispatch::long_lived::LongLivedDispatcher;
use proxy_core::dispatch::short_lived::ShortLivedDispatcher;
use proxy_core::dispatch::stream::StreamDispatcher;
use proxy_core::dispatch::{Dispatcher, LocalDispatcher};
use proxy_core::invoker::ProcessInvoker;
use proxy_core::listener::ProxyListener;
use proxy_core::mitm::MitmAuthority;
use proxy_core::object_store::{FsObjectStore, ObjectStore};
use proxy_core::queue::InMemoryQueue;
use proxy_core::rendezvous::RendezvousServer;
use proxy_core::worker_manager::WorkerManager;
use rsa::RsaPublicKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// HTTP/HTTPS forward proxy that offloads requests to remote compute workers.
#[derive(FromArgs)]
struct Args {
    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {:?}", args.config))?;
    let config: ProxyConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing config file {:?}", args.config))?;

    let client = reqwest::Client::builder()
        .build()
        .context("building http client")?;

    let worker_pubkey = load_worker_pubkey(&config)?;

    let sink: Option<Arc<dyn ObjectStore>> = if config.object_store.enabled {
        Some(Arc::new(FsObjectStore::new(
            std::env::temp_dir().join("forward-proxy-objects"),
        )))
    } else {
        None
    };

    let dispatcher = build_dispatcher(&config, client, worker_pubkey, sink).await?;

    let mitm = if config.mitm.enabled {
        let cert_path = config
            .mitm
            .ca_cert_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("mitm-ca.pem"));
        let key_path = config
            .mitm
            .ca_key_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("mitm-ca.key"));
        Some(Arc::new(MitmAuthority::load_or_generate(
            &cert_path, &key_path,
        )?))
    } else {
        None
    };

    let rendezvous = RendezvousServer::new(
        Duration::from_secs(config.rendezvous.conn_timeout_secs),
        Duration::from_secs(config.rendezvous.message_timeout_secs),
    );
    {
        let rendezvous = rendezvous.clone();
        let bind = config.rendezvous.bind;
        tokio::spawn(async move {
            if let Err(err) = rendezvous.run(bind).await {
                tracing::error!(%err, "rendezvous server exited");
            }
        });
    }

    let tunnel_idle_timeout = Duration::from_secs(config.rendezvous.conn_timeout_secs.max(5) * 12);
    let stream_dispatcher = build_stream_dispatcher(&config, rendezvous, tunnel_idle_timeout);

    let listener = Arc::new(ProxyListener {
        dispatcher,
        mitm,
        stream: stream_dispatcher,
        tunnel_idle_timeout,
    });

    listener.run(config.listener.bind).await?;
    Ok(())
}

/// Built only when a worker binary is configured (`dispatch.functions`);
/// otherwise `CONNECT` tunnels fall back to a direct local dial.
fn build_stream_dispatcher(
    config: &ProxyConfig,
    rendezvous: Arc<RendezvousServer>,
    idle_timeout: Duration,
) -> Option<Arc<StreamDispatcher>> {
    let worker_binary = config.dispatch.functions.first()?;
    let invoker = Arc::new(ProcessInvoker::new(
        PathBuf::from(worker_binary),
        config.dispatch.max_parallel_invocations,
    ));
    Some(Arc::new(StreamDispatcher {
        invoker,
        rendezvous,
        public_host_and_port: config.rendezvous.public_host_and_port.clone(),
        idle_timeout,
    }))
}

fn load_worker_pubkey(config: &ProxyConfig) -> anyhow::Result<Option<Arc<RsaPublicKey>>> {
    if !config.encryption.enabled {
        return Ok(None);
    }
    let Some(path) = &config.encryption.worker_public_key_path else {
        return Ok(None);
    };
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading worker public key {path:?}"))?;
    Ok(Some(Arc::new(crypto::load_public_key_pem(&pem)?)))
}

async fn build_dispatcher(
    config: &ProxyConfig,
    client: reqwest::Client,
    worker_pubkey: Option<Arc<RsaPublicKey>>,
    sink: Option<Arc<dyn ObjectStore>>,
) -> anyhow::Result<Arc<Dispatcher>> {
    let inline_limit = config.object_store.inline_body_limit;

    match config.dispatch.mode() {
        DispatchMode::Local => Ok(Arc::new(Dispatcher::Local(LocalDispatcher { client }))),

        DispatchMode::Short => {
            let short = build_short_lived(config, worker_pubkey, inline_limit, sink)?;
            Ok(Arc::new(Dispatcher::ShortLived(short)))
        }

        DispatchMode::Long => {
            let manager = build_worker_manager(config, client, inline_limit, sink.clone());
            Ok(Arc::new(Dispatcher::LongLived(LongLivedDispatcher {
                manager,
                inline_limit,
                sink,
            })))
        }

        DispatchMode::Hybrid => {
            let short = build_short_lived(config, worker_pubkey, inline_limit, sink.clone())?;
            let manager = build_worker_manager(config, client, inline_limit, sink.clone());
            let long = LongLivedDispatcher {
                manager,
                inline_limit,
                sink,
            };
            Ok(Arc::new(Dispatcher::Hybrid {
                long_lived_hosts: config.dispatch.hybrid_long_lived_hosts.iter().cloned().collect(),
                short,
                long,
            }))
        }
    }
}

fn build_short_lived(
    config: &ProxyConfig,
    worker_pubkey: Option<Arc<RsaPublicKey>>,
    inline_limit: usize,
    sink: Option<Arc<dyn ObjectStore>>,
) -> anyhow::Result<ShortLivedDispatcher> {
    let worker_binary = config
        .dispatch
        .functions
        .first()
        .cloned()
        .context("dispatch.functions must name a forward_proxy_worker binary path for short/hybrid dispatch")?;
    let invoker = Arc::new(ProcessInvoker::new(
        PathBuf::from(worker_binary),
        config.dispatch.max_parallel_invocations,
    ));
    Ok(ShortLivedDispatcher {
        invoker,
        worker_pubkey,
        inline_limit,
        sink,
    })
}

fn build_worker_manager(
    config: &ProxyConfig,
    client: reqwest::Client,
    inline_limit: usize,
    sink: Option<Arc<dyn ObjectStore>>,
) -> Arc<WorkerManager> {
    let task_queue = Arc::new(InMemoryQueue::new("tasks"));
    let result_queue = Arc::new(InMemoryQueue::new("results"));
    WorkerManager::new(
        task_queue,
        result_queue,
        config.dispatch.clone(),
        WorkerRuntimeConfig::from_env(),
        client,
        inline_limit,
        sink,
    )
}
