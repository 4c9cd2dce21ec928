//! Request/response envelope: encodes a `RequestMeta`/body pair (or its
//! reply counterpart) onto the wire shape a worker invocation expects,
//! optionally wrapped in the hybrid RSA/AES-GCM scheme of [`crate::crypto`],
//! optionally spilling an oversized body to an [`ObjectStore`].
//!
//! One struct per direction with every field optional, rather than a
//! cleartext/encrypted enum pair — a single parse/emit path instead of
//! duck-typed dict access, matching the redesign called for in spec.md §9.

use crate::crypto::{self, SessionKey};
use crate::errors::{EnvelopeError, ProxyError, ProxyResult};
use crate::object_store::ObjectStore;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ReplyMeta {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta64: Option<String>,
    #[serde(rename = "metaTag", skip_serializing_if = "Option::is_none")]
    pub meta_tag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body64: Option<String>,
    #[serde(rename = "bodyTag", skip_serializing_if = "Option::is_none")]
    pub body_tag: Option<String>,
    #[serde(rename = "objectKey", skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(rename = "objectTag", skip_serializing_if = "Option::is_none")]
    pub object_tag: Option<String>,
}

impl WireRequest {
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireReply {
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta64: Option<String>,
    #[serde(rename = "metaTag", skip_serializing_if = "Option::is_none")]
    pub meta_tag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content64: Option<String>,
    #[serde(rename = "contentTag", skip_serializing_if = "Option::is_none")]
    pub content_tag: Option<String>,
    #[serde(rename = "objectKey", skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(rename = "objectTag", skip_serializing_if = "Option::is_none")]
    pub object_tag: Option<String>,
}

impl WireReply {
    pub fn is_encrypted(&self) -> bool {
        self.meta64.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaWire<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplyMetaWire<'a> {
    status: u16,
    headers: &'a BTreeMap<String, String>,
}

/// Builds the caller-side request envelope. Returns the session key
/// generated for this request so the caller can later decrypt the reply.
pub async fn seal_request(
    meta: &RequestMeta,
    body: Option<&[u8]>,
    worker_pubkey: Option<&RsaPublicKey>,
    inline_limit: usize,
    sink: Option<&dyn ObjectStore>,
) -> ProxyResult<(WireRequest, Option<SessionKey>)> {
    let mut wire = WireRequest::default();

    let (body64, body_tag, object_key, object_tag, session_key) = match body {
        None => (None, None, None, None, None),
        Some(bytes) if bytes.len() > inline_limit => {
            let sink = sink.ok_or(ProxyError::Envelope(EnvelopeError::TooLarge))?;
            let key = sink.put(bytes).await?;
            match worker_pubkey {
                Some(_) => {
                    let session_key = crypto::generate_session_key();
                    let (ct, tag) =
                        crypto::encrypt_with_gcm(&session_key, crypto::REQUEST_BODY_NONCE, key.as_bytes());
                    (
                        None,
                        None,
                        Some(B64.encode(ct)),
                        Some(B64.encode(tag)),
                        Some(session_key),
                    )
                }
                None => (None, None, Some(key), None, None),
            }
        }
        Some(bytes) => match worker_pubkey {
            Some(_) => {
                let session_key = crypto::generate_session_key();
                let (ct, tag) = crypto::encrypt_with_gcm(&session_key, crypto::REQUEST_BODY_NONCE, bytes);
                (
                    Some(B64.encode(ct)),
                    Some(B64.encode(tag)),
                    None,
                    None,
                    Some(session_key),
                )
            }
            None => (Some(B64.encode(bytes)), None, None, None, None),
        },
    };

    if let Some(session_key) = session_key {
        let pubkey = worker_pubkey.expect("session key only generated when encrypting");
        let meta_json = serde_json::to_vec(&MetaWire {
            method: &meta.method,
            url: &meta.url,
            headers: &meta.headers,
        })?;
        let (meta_ct, meta_tag) =
            crypto::encrypt_with_gcm(&session_key, crypto::REQUEST_META_NONCE, &meta_json);
        wire.key = Some(B64.encode(crypto::rsa_oaep_wrap(pubkey, &session_key)));
        wire.meta64 = Some(B64.encode(meta_ct));
        wire.meta_tag = Some(B64.encode(meta_tag));
        wire.body64 = body64;
        wire.body_tag = body_tag;
        wire.object_key = object_key;
        wire.object_tag = object_tag;
        return Ok((wire, Some(session_key)));
    }

    wire.method = Some(meta.method.clone());
    wire.url = Some(meta.url.clone());
    wire.headers = Some(meta.headers.clone());
    wire.body64 = body64;
    wire.object_key = object_key;
    Ok((wire, None))
}

/// Worker-side counterpart: unpacks a `WireRequest` back into meta/body,
/// returning the session key so the reply can be sealed symmetrically.
pub async fn open_request(
    wire: &WireRequest,
    worker_privkey: Option<&RsaPrivateKey>,
    source: Option<&dyn ObjectStore>,
) -> ProxyResult<(RequestMeta, Option<Vec<u8>>, Option<SessionKey>)> {
    if wire.is_encrypted() {
        let privkey = worker_privkey.ok_or_else(|| {
            ProxyError::Envelope(EnvelopeError::Malformed(
                "encrypted request but no private key configured".into(),
            ))
        })?;
        let wrapped = B64.decode(wire.key.as_deref().unwrap_or_default())
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        let session_key = crypto::rsa_oaep_unwrap(privkey, &wrapped)
            .map_err(|_| ProxyError::Envelope(EnvelopeError::Decrypt))?;

        let meta_ct = B64.decode(wire.meta64.as_deref().unwrap_or_default())
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        let meta_tag = B64.decode(wire.meta_tag.as_deref().unwrap_or_default())
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        let meta_plain =
            crypto::decrypt_with_gcm(&session_key, crypto::REQUEST_META_NONCE, &meta_ct, &meta_tag)
                .map_err(|_| ProxyError::Envelope(EnvelopeError::Decrypt))?;
        let meta_wire: MetaWireOwned = serde_json::from_slice(&meta_plain)?;

        let body = decode_body(
            wire.body64.as_deref(),
            wire.body_tag.as_deref(),
            wire.object_key.as_deref(),
            wire.object_tag.as_deref(),
            Some(&session_key),
            crypto::REQUEST_BODY_NONCE,
            source,
        )
        .await?;

        return Ok((
            RequestMeta {
                method: meta_wire.method,
                url: meta_wire.url,
                headers: meta_wire.headers,
            },
            body,
            Some(session_key),
        ));
    }

    let method = wire
        .method
        .clone()
        .ok_or_else(|| ProxyError::Envelope(EnvelopeError::Malformed("missing method".into())))?;
    let url = wire
        .url
        .clone()
        .ok_or_else(|| ProxyError::Envelope(EnvelopeError::Malformed("missing url".into())))?;
    let headers = wire.headers.clone().unwrap_or_default();

    let body = decode_body(
        wire.body64.as_deref(),
        None,
        wire.object_key.as_deref(),
        None,
        None,
        crypto::REQUEST_BODY_NONCE,
        source,
    )
    .await?;

    Ok((RequestMeta { method, url, headers }, body, None))
}

/// Worker-side: builds the reply envelope. Mirrors `seal_request` but
/// symmetric (session key was already established by the request, no
/// fresh RSA wrap needed).
pub async fn seal_response(
    meta: &ReplyMeta,
    body: Option<&[u8]>,
    session_key: Option<&SessionKey>,
    inline_limit: usize,
    sink: Option<&dyn ObjectStore>,
) -> ProxyResult<WireReply> {
    let mut wire = WireReply::default();

    let (content64, content_tag, object_key, object_tag) = match body {
        None => (None, None, None, None),
        Some(bytes) if bytes.len() > inline_limit => {
            let sink = sink.ok_or(ProxyError::Envelope(EnvelopeError::TooLarge))?;
            let key = sink.put(bytes).await?;
            match session_key {
                Some(sk) => {
                    let (ct, tag) =
                        crypto::encrypt_with_gcm(sk, crypto::RESPONSE_BODY_NONCE, key.as_bytes());
                    (None, None, Some(B64.encode(ct)), Some(B64.encode(tag)))
                }
                None => (None, None, Some(key), None),
            }
        }
        Some(bytes) => match session_key {
            Some(sk) => {
                let (ct, tag) = crypto::encrypt_with_gcm(sk, crypto::RESPONSE_BODY_NONCE, bytes);
                (Some(B64.encode(ct)), Some(B64.encode(tag)), None, None)
            }
            None => (Some(B64.encode(bytes)), None, None, None),
        },
    };

    match session_key {
        Some(sk) => {
            let meta_json = serde_json::to_vec(&ReplyMetaWire {
                status: meta.status,
                headers: &meta.headers,
            })?;
            let (meta_ct, meta_tag) =
                crypto::encrypt_with_gcm(sk, crypto::RESPONSE_META_NONCE, &meta_json);
            wire.meta64 = Some(B64.encode(meta_ct));
            wire.meta_tag = Some(B64.encode(meta_tag));
        }
        None => {
            wire.status_code = Some(meta.status);
            wire.headers = Some(meta.headers.clone());
        }
    }
    wire.content64 = content64;
    wire.content_tag = content_tag;
    wire.object_key = object_key;
    wire.object_tag = object_tag;
    Ok(wire)
}

/// Caller side: unpacks a `WireReply` back into meta/body.
pub async fn open_response(
    wire: &WireReply,
    session_key: Option<&SessionKey>,
    source: Option<&dyn ObjectStore>,
) -> ProxyResult<(ReplyMeta, Option<Vec<u8>>)> {
    let meta = if wire.is_encrypted() {
        let sk = session_key.ok_or_else(|| {
            ProxyError::Envelope(EnvelopeError::Malformed(
                "encrypted reply but no session key held".into(),
            ))
        })?;
        let meta_ct = B64.decode(wire.meta64.as_deref().unwrap_or_default())
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        let meta_tag = B64.decode(wire.meta_tag.as_deref().unwrap_or_default())
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        let meta_plain =
            crypto::decrypt_with_gcm(sk, crypto::RESPONSE_META_NONCE, &meta_ct, &meta_tag)
                .map_err(|_| ProxyError::Envelope(EnvelopeError::Decrypt))?;
        let meta_wire: ReplyMetaWireOwned = serde_json::from_slice(&meta_plain)?;
        ReplyMeta {
            status: meta_wire.status,
            headers: meta_wire.headers,
        }
    } else {
        ReplyMeta {
            status: wire.status_code.ok_or_else(|| {
                ProxyError::Envelope(EnvelopeError::Malformed("missing statusCode".into()))
            })?,
            headers: wire.headers.clone().unwrap_or_default(),
        }
    };

    let body = decode_body(
        wire.content64.as_deref(),
        wire.content_tag.as_deref(),
        wire.object_key.as_deref(),
        wire.object_tag.as_deref(),
        session_key,
        crypto::RESPONSE_BODY_NONCE,
        source,
    )
    .await?;

    Ok((meta, body))
}

#[allow(clippy::too_many_arguments)]
async fn decode_body(
    content64: Option<&str>,
    content_tag: Option<&str>,
    object_key: Option<&str>,
    object_tag: Option<&str>,
    session_key: Option<&SessionKey>,
    nonce_tag: &str,
    source: Option<&dyn ObjectStore>,
) -> ProxyResult<Option<Vec<u8>>> {
    if let Some(b64) = content64 {
        let ct = B64.decode(b64)
            .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
        return match (session_key, content_tag) {
            (Some(sk), Some(tag64)) => {
                let tag = B64.decode(tag64)
                    .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
                let plain = crypto::decrypt_with_gcm(sk, nonce_tag, &ct, &tag)
                    .map_err(|_| ProxyError::Envelope(EnvelopeError::Decrypt))?;
                Ok(Some(plain))
            }
            _ => Ok(Some(ct)),
        };
    }
    if let Some(key) = object_key {
        let source = source.ok_or(ProxyError::Envelope(EnvelopeError::TooLarge))?;
        let resolved_key = match (session_key, object_tag) {
            (Some(sk), Some(tag64)) => {
                let ct = B64.decode(key)
                    .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
                let tag = B64.decode(tag64)
                    .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?;
                let plain = crypto::decrypt_with_gcm(sk, nonce_tag, &ct, &tag)
                    .map_err(|_| ProxyError::Envelope(EnvelopeError::Decrypt))?;
                String::from_utf8(plain)
                    .map_err(|e| ProxyError::Envelope(EnvelopeError::Malformed(e.to_string())))?
            }
            _ => key.to_string(),
        };
        let body = source.get(&resolved_key).await?;
        source.delete(&resolved_key).await;
        return Ok(Some(body));
    }
    Ok(None)
}

#[derive(Debug, Deserialize)]
struct MetaWireOwned {
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ReplyMetaWireOwned {
    status: u16,
    headers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;
    use rand::thread_rng;

    fn sample_meta() -> RequestMeta {
        let mut headers = BTreeMap::new();
        headers.insert("host".into(), "example.com".into());
        RequestMeta {
            method: "GET".into(),
            url: "https://example.com/".into(),
            headers,
        }
    }

    #[tokio::test]
    async fn cleartext_round_trip() {
        let meta = sample_meta();
        let (wire, sk) = seal_request(&meta, Some(b"hello"), None, 1024, None)
            .await
            .unwrap();
        assert!(sk.is_none());
        assert!(!wire.is_encrypted());
        let (opened_meta, body, opened_sk) = open_request(&wire, None, None).await.unwrap();
        assert_eq!(opened_meta.method, "GET");
        assert_eq!(body.unwrap(), b"hello");
        assert!(opened_sk.is_none());
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        let priv_key = RsaPrivateKey::new(&mut thread_rng(), 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let meta = sample_meta();

        let (wire, sk) = seal_request(&meta, Some(b"secret payload"), Some(&pub_key), 1024, None)
            .await
            .unwrap();
        assert!(sk.is_some());
        assert!(wire.is_encrypted());

        let (opened_meta, body, opened_sk) =
            open_request(&wire, Some(&priv_key), None).await.unwrap();
        assert_eq!(opened_meta.url, meta.url);
        assert_eq!(body.unwrap(), b"secret payload");

        let reply_meta = ReplyMeta {
            status: 200,
            headers: BTreeMap::new(),
        };
        let reply = seal_response(&reply_meta, Some(b"ok"), opened_sk.as_ref(), 1024, None)
            .await
            .unwrap();
        let (opened_reply_meta, reply_body) =
            open_response(&reply, sk.as_ref(), None).await.unwrap();
        assert_eq!(opened_reply_meta.status, 200);
        assert_eq!(reply_body.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn oversized_body_spills_to_object_store() {
        let dir = std::env::temp_dir().join(format!("proxy-core-envelope-{}", uuid::Uuid::new_v4()));
        let store = FsObjectStore::new(dir.clone());
        let meta = sample_meta();
        let big = vec![7u8; 4096];
        let (wire, _) = seal_request(&meta, Some(&big), None, 16, Some(&store))
            .await
            .unwrap();
        assert!(wire.object_key.is_some());
        let (_, body, _) = open_request(&wire, None, Some(&store)).await.unwrap();
        assert_eq!(body.unwrap(), big);
        let _ = std::fs::remove_dir_all(dir);
    }
}
