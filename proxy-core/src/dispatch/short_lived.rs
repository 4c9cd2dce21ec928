//! One worker invocation per request, grounded in `lib/proxies/aws_short.py`.

use crate::envelope::{self, ReplyMeta, RequestMeta};
use crate::errors::{ProxyError, ProxyResult};
use crate::invoker::Invoker;
use crate::object_store::ObjectStore;
use rsa::RsaPublicKey;
use std::sync::Arc;

pub struct ShortLivedDispatcher {
    pub invoker: Arc<dyn Invoker>,
    pub worker_pubkey: Option<Arc<RsaPublicKey>>,
    pub inline_limit: usize,
    pub sink: Option<Arc<dyn ObjectStore>>,
}

impl ShortLivedDispatcher {
    pub async fn dispatch(
        &self,
        meta: RequestMeta,
        body: Option<Vec<u8>>,
    ) -> ProxyResult<(ReplyMeta, Option<Vec<u8>>)> {
        let (wire, session_key) = envelope::seal_request(
            &meta,
            body.as_deref(),
            self.worker_pubkey.as_deref(),
            self.inline_limit,
            self.sink.as_deref(),
        )
        .await?;
        let request_payload = serde_json::to_vec(&wire)?;

        let result = self.invoker.invoke(request_payload).await?;
        if let Some(fault) = result.function_error {
            return Err(ProxyError::RemoteFault(fault));
        }

        let reply: crate::envelope::WireReply = serde_json::from_slice(&result.payload)?;
        envelope::open_response(&reply, session_key.as_ref(), self.sink.as_deref()).await
    }
}
