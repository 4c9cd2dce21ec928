//! Task/result queue pair and message fragmentation, grounded in
//! `shared/workers.py`'s `SqsMessage`/`LambdaSqsTask`/`LambdaSqsResult`
//! and `lib/workers.py`'s use of them.
//!
//! The original speaks SQS directly; we generalize to a `MessageQueue`
//! trait so the long-lived dispatch path and its tests don't need a live
//! queue service. `InMemoryQueue` is the concrete implementation used by
//! both the local listener and its test suite.

use crate::errors::{ProxyError, ProxyResult, QueueOpKind};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

pub const FRAG_ID_ATTR: &str = "FRAG_ID";
pub const FRAG_INDEX_ATTR: &str = "FRAG_INDEX";
pub const FRAG_COUNT_ATTR: &str = "FRAG_COUNT";
pub const TASK_ID_ATTR: &str = "TASK_ID";

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, body: String, attributes: HashMap<String, String>) -> ProxyResult<()>;
    async fn receive(&self, max_messages: usize) -> ProxyResult<Vec<QueueMessage>>;
    async fn delete(&self, receipt_handle: &str) -> ProxyResult<()>;
}

/// A single-process stand-in for the SQS task/result queues. FIFO,
/// at-least-once only in the trivial sense that nothing is redelivered
/// until explicitly deleted is irrelevant here — messages are removed
/// from the backing deque the moment they're handed out, matching how
/// the long-lived worker pool in this crate always deletes promptly
/// after a successful receive.
pub struct InMemoryQueue {
    name: String,
    inner: Mutex<VecDeque<QueueMessage>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, body: String, attributes: HashMap<String, String>) -> ProxyResult<()> {
        let mut guard = self.inner.lock().await;
        guard.push_back(QueueMessage {
            receipt_handle: Uuid::new_v4().to_string(),
            body,
            attributes,
        });
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> ProxyResult<Vec<QueueMessage>> {
        let mut guard = self.inner.lock().await;
        if guard.is_empty() {
            return Ok(Vec::new());
        }
        let n = max_messages.min(guard.len());
        Ok(guard.drain(..n).collect())
    }

    async fn delete(&self, _receipt_handle: &str) -> ProxyResult<()> {
        // messages are consumed on receive; delete is a no-op kept for
        // trait parity with a real SQS-backed implementation, which
        // would need it to end the visibility timeout.
        Ok(())
    }
}

impl InMemoryQueue {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Splits a gzip+base64'd payload across message-sized fragments, each
/// tagged with `FRAG_ID`/`FRAG_INDEX`/`FRAG_COUNT` attributes so the
/// receiver can reassemble out of order.
pub struct Fragmenter {
    max_fragment_bytes: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_bytes: usize) -> Self {
        Self { max_fragment_bytes }
    }

    pub fn fragment(&self, payload: &[u8]) -> ProxyResult<Vec<(String, HashMap<String, String>)>> {
        self.fragment_with(payload, &HashMap::new())
    }

    /// Same as [`Fragmenter::fragment`] but merges `extra` attributes
    /// (e.g. `TASK_ID`) onto every fragment, for correlating a
    /// multi-fragment request with its multi-fragment reply.
    pub fn fragment_with(
        &self,
        payload: &[u8],
        extra: &HashMap<String, String>,
    ) -> ProxyResult<Vec<(String, HashMap<String, String>)>> {
        let compressed = compress(payload)?;
        let frag_id = Uuid::new_v4();
        let chunks: Vec<&[u8]> = compressed.chunks(self.max_fragment_bytes).collect();
        let count = chunks.len().max(1) as u32;
        let chunks: Vec<Vec<u8>> = if compressed.is_empty() {
            vec![Vec::new()]
        } else {
            chunks.into_iter().map(|c| c.to_vec()).collect()
        };

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut attrs = extra.clone();
                attrs.insert(FRAG_ID_ATTR.to_string(), frag_id.to_string());
                attrs.insert(FRAG_INDEX_ATTR.to_string(), i.to_string());
                attrs.insert(FRAG_COUNT_ATTR.to_string(), count.to_string());
                (base64_encode(&chunk), attrs)
            })
            .collect())
    }
}

fn compress(payload: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| ProxyError::queue_op(QueueOpKind::Send, e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProxyError::queue_op(QueueOpKind::Send, e.to_string()))
}

fn decompress(payload: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProxyError::queue_op(QueueOpKind::Receive, e.to_string()))?;
    Ok(out)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

fn base64_decode(text: &str) -> ProxyResult<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(text)
        .map_err(|e| ProxyError::queue_op(QueueOpKind::Receive, e.to_string()))
}

/// Accumulates fragments addressed by `FRAG_ID` until `FRAG_COUNT` of
/// them have arrived, then decompresses the reassembled payload.
#[derive(Default)]
pub struct FragmentAssembler {
    pending: dashmap::DashMap<Uuid, PartialFragments>,
}

struct PartialFragments {
    count: u32,
    chunks: BTreeMap<u32, String>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self {
            pending: dashmap::DashMap::new(),
        }
    }

    /// Feeds one fragment in. Returns the reassembled, decompressed
    /// payload once every fragment for its `FRAG_ID` has arrived.
    pub fn accept(&self, attributes: &HashMap<String, String>, chunk: String) -> ProxyResult<Option<Vec<u8>>> {
        let frag_id: Uuid = attributes
            .get(FRAG_ID_ATTR)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProxyError::queue_op(QueueOpKind::Receive, "missing FRAG_ID"))?;
        let index: u32 = attributes
            .get(FRAG_INDEX_ATTR)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProxyError::queue_op(QueueOpKind::Receive, "missing FRAG_INDEX"))?;
        let count: u32 = attributes
            .get(FRAG_COUNT_ATTR)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProxyError::queue_op(QueueOpKind::Receive, "missing FRAG_COUNT"))?;

        let mut entry = self.pending.entry(frag_id).or_insert_with(|| PartialFragments {
            count,
            chunks: BTreeMap::new(),
        });
        entry.chunks.insert(index, chunk);

        if entry.chunks.len() as u32 >= entry.count {
            drop(entry);
            let (_, complete) = self.pending.remove(&frag_id).expect("just inserted");
            let mut compressed = Vec::new();
            for (_, piece) in complete.chunks {
                compressed.extend(base64_decode(&piece)?);
            }
            return Ok(Some(decompress(&compressed)?));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_queue_round_trips() {
        let queue = InMemoryQueue::new("tasks");
        queue
            .send("payload".to_string(), HashMap::new())
            .await
            .unwrap();
        let msgs = queue.receive(10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "payload");
        assert!(queue.receive(10).await.unwrap().is_empty());
    }

    #[test]
    fn fragments_reassemble_out_of_order() {
        let payload = b"x".repeat(10_000);
        let fragmenter = Fragmenter::new(512);
        let pieces = fragmenter.fragment(&payload).unwrap();
        assert!(pieces.len() > 1);

        let assembler = FragmentAssembler::new();
        let mut reassembled = None;
        for (chunk, attrs) in pieces.into_iter().rev() {
            reassembled = assembler.accept(&attrs, chunk).unwrap();
        }
        assert_eq!(reassembled.unwrap(), payload);
    }

    #[test]
    fn single_fragment_payload_round_trips() {
        let payload = b"small".to_vec();
        let fragmenter = Fragmenter::new(4096);
        let pieces = fragmenter.fragment(&payload).unwrap();
        assert_eq!(pieces.len(), 1);
        let assembler = FragmentAssembler::new();
        let (chunk, attrs) = pieces.into_iter().next().unwrap();
        let reassembled = assembler.accept(&attrs, chunk).unwrap().unwrap();
        assert_eq!(reassembled, payload);
    }
}
