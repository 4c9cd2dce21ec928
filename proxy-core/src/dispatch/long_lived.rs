//! Requests served by the persistent worker pool, grounded in
//! `lib/proxies/aws_long.py` and `lib/workers.py`'s `WorkerManager`.
//!
//! Envelope encryption is a short-lived-path-only feature (see
//! DESIGN.md's Open Question notes): the long-lived pool runs as
//! in-process tasks over in-memory queues, so there's no separate
//! worker process to hand a private key to, and no cross-process
//! boundary for RSA/AES-GCM to protect in the first place.

use crate::envelope::{self, ReplyMeta, RequestMeta, WireReply};
use crate::errors::ProxyResult;
use crate::object_store::ObjectStore;
use crate::worker_manager::WorkerManager;
use std::sync::Arc;

pub struct LongLivedDispatcher {
    pub manager: Arc<WorkerManager>,
    pub inline_limit: usize,
    pub sink: Option<Arc<dyn ObjectStore>>,
}

impl LongLivedDispatcher {
    pub async fn dispatch(
        &self,
        meta: RequestMeta,
        body: Option<Vec<u8>>,
    ) -> ProxyResult<(ReplyMeta, Option<Vec<u8>>)> {
        let (wire, _) = envelope::seal_request(
            &meta,
            body.as_deref(),
            None,
            self.inline_limit,
            self.sink.as_deref(),
        )
        .await?;
        let request_payload = serde_json::to_vec(&wire)?;

        let reply_payload = self.manager.submit(request_payload).await?;
        let reply: WireReply = serde_json::from_slice(&reply_payload)?;
        envelope::open_response(&reply, None, self.sink.as_deref()).await
    }
}
