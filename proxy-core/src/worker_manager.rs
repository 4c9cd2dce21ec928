//! Long-lived worker pool: spawn policy, per-task `Future`s, and the
//! result-polling daemon, all grounded in `lib/workers.py`'s
//! `WorkerManager`/`Future` pair.
//!
//! The original spawns Lambda invocations that loop pulling tasks off
//! an SQS queue until they run low on remaining execution time; here a
//! "worker" is a `tokio::task` running [`crate::worker_side::execute`]
//! in a loop against the in-process task/result queues. The spawn
//! policy (grow the pool while queue depth outpaces `load_factor *
//! worker_count`, capped at `max_workers`) and the single pending-task
//! map keyed by task id are carried over unchanged.

use crate::config::{DispatchConfig, WorkerRuntimeConfig};
use crate::errors::{ProxyError, ProxyResult};
use crate::object_store::ObjectStore;
use crate::queue::{FragmentAssembler, Fragmenter, MessageQueue, TASK_ID_ATTR};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

pub struct WorkerManager {
    task_queue: Arc<dyn MessageQueue>,
    result_queue: Arc<dyn MessageQueue>,
    dispatch: DispatchConfig,
    runtime: WorkerRuntimeConfig,
    client: reqwest::Client,
    inline_limit: usize,
    sink: Option<Arc<dyn ObjectStore>>,
    pending: DashMap<Uuid, oneshot::Sender<ProxyResult<Vec<u8>>>>,
    worker_count: AtomicUsize,
    self_weak: Weak<WorkerManager>,
}

impl WorkerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_queue: Arc<dyn MessageQueue>,
        result_queue: Arc<dyn MessageQueue>,
        dispatch: DispatchConfig,
        runtime: WorkerRuntimeConfig,
        client: reqwest::Client,
        inline_limit: usize,
        sink: Option<Arc<dyn ObjectStore>>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            task_queue,
            result_queue,
            dispatch,
            runtime,
            client,
            inline_limit,
            sink,
            pending: DashMap::new(),
            worker_count: AtomicUsize::new(0),
            self_weak: weak.clone(),
        });
        manager.clone().spawn_result_poller();
        manager.clone().spawn_worker();
        manager
    }

    /// Enqueues a request payload, waits for the matching reply. Mirrors
    /// `WorkerManager.submit_task` + `Future.result()` in the original.
    pub async fn submit(&self, request_payload: Vec<u8>) -> ProxyResult<Vec<u8>> {
        let task_id = Uuid::new_v4();
        let mut extra = std::collections::HashMap::new();
        extra.insert(TASK_ID_ATTR.to_string(), task_id.to_string());

        let fragmenter = Fragmenter::new(max_fragment_bytes());
        let fragments = fragmenter.fragment_with(&request_payload, &extra)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(task_id, tx);

        for (chunk, attrs) in fragments {
            if let Err(err) = self.task_queue.send(chunk, attrs).await {
                self.pending.remove(&task_id);
                return Err(err);
            }
        }

        self.maybe_grow_pool();

        match timeout(Duration::from_millis(self.runtime.min_millis_remaining * 3), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::ClientGone),
            Err(_) => {
                self.pending.remove(&task_id);
                Err(ProxyError::Timeout)
            }
        }
    }

    fn maybe_grow_pool(&self) {
        let workers = self.worker_count.load(Ordering::Relaxed);
        let backlog = self.pending.len();
        let should_spawn = workers == 0 || backlog >= workers * self.dispatch.load_factor;
        if should_spawn && workers < self.dispatch.max_workers {
            if let Some(strong) = self.self_weak.upgrade() {
                strong.spawn_worker();
            }
        }
    }

    fn spawn_result_poller(self: Arc<Self>) {
        tokio::spawn(async move {
            let assembler = FragmentAssembler::new();
            loop {
                let messages = match self.result_queue.receive(10).await {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(%err, "result queue receive failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                };
                if messages.is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                for msg in messages {
                    let task_id: Option<Uuid> = msg
                        .attributes
                        .get(TASK_ID_ATTR)
                        .and_then(|s| s.parse().ok());
                    match assembler.accept(&msg.attributes, msg.body) {
                        Ok(Some(payload)) => {
                            if let Some(task_id) = task_id {
                                if let Some((_, tx)) = self.pending.remove(&task_id) {
                                    let _ = tx.send(Ok(payload));
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!(%err, "fragment reassembly failed"),
                    }
                    let _ = self.result_queue.delete(&msg.receipt_handle).await;
                }
            }
        });
    }

    fn spawn_worker(self: Arc<Self>) {
        self.worker_count.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let assembler = FragmentAssembler::new();
            let mut idle_polls = 0u32;
            loop {
                if idle_polls >= self.runtime.max_idle_polls {
                    break;
                }
                let messages = match self.task_queue.receive(10).await {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(%err, "task queue receive failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                };
                if messages.is_empty() {
                    idle_polls += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                idle_polls = 0;
                for msg in messages {
                    let task_id = msg.attributes.get(TASK_ID_ATTR).cloned();
                    let reassembled = match assembler.accept(&msg.attributes, msg.body) {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(%err, "fragment reassembly failed on worker");
                            None
                        }
                    };
                    let _ = self.task_queue.delete(&msg.receipt_handle).await;

                    let Some(payload) = reassembled else { continue };
                    let reply = crate::worker_side::execute(
                        &payload,
                        None,
                        &self.client,
                        &self.runtime,
                        self.inline_limit,
                        self.sink.as_deref(),
                    )
                    .await;

                    let mut extra = std::collections::HashMap::new();
                    if let Some(task_id) = task_id {
                        extra.insert(TASK_ID_ATTR.to_string(), task_id);
                    }
                    let fragmenter = Fragmenter::new(max_fragment_bytes());
                    match fragmenter.fragment_with(&reply, &extra) {
                        Ok(fragments) => {
                            for (chunk, attrs) in fragments {
                                if let Err(err) = self.result_queue.send(chunk, attrs).await {
                                    tracing::warn!(%err, "result queue send failed");
                                }
                            }
                        }
                        Err(err) => tracing::warn!(%err, "fragmenting reply failed"),
                    }
                }
            }
            self.worker_count.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn max_fragment_bytes() -> usize {
    // SQS's 256KiB message cap is the origin of this constant in the
    // original; kept as the fragment size even though the in-process
    // queue here has no hard limit of its own.
    200 * 1024
}
