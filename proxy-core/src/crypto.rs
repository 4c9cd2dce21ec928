//! Hybrid RSA-OAEP + AES-128-GCM primitives backing the envelope.
//!
//! A fresh 128-bit session key is drawn per request (spec.md §4.1), which
//! is what makes the four fixed per-direction nonces below safe to reuse
//! across requests: nonce reuse under AES-GCM is catastrophic only when
//! the *key* repeats too.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::DecodePrivateKey, Oaep, RsaPrivateKey, RsaPublicKey};

pub const SESSION_KEY_LEN: usize = 16;
pub type SessionKey = [u8; SESSION_KEY_LEN];

const GCM_TAG_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

/// The four fixed per-direction nonces named in spec.md §4.1.
pub const REQUEST_META_NONCE: &str = "request-meta";
pub const REQUEST_BODY_NONCE: &str = "request-body";
pub const RESPONSE_META_NONCE: &str = "response-meta";
pub const RESPONSE_BODY_NONCE: &str = "response-body";

fn fixed_nonce(tag: &str) -> Nonce {
    let mut bytes = [0u8; GCM_NONCE_LEN];
    let src = tag.as_bytes();
    let n = src.len().min(GCM_NONCE_LEN);
    bytes[..n].copy_from_slice(&src[..n]);
    *Nonce::from_slice(&bytes)
}

pub fn generate_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext` under `key`/`nonce_tag`, returning ciphertext and
/// detached tag separately (the wire format keeps them as distinct
/// base64 fields rather than one concatenated blob).
pub fn encrypt_with_gcm(
    key: &SessionKey,
    nonce_tag: &str,
    plaintext: &[u8],
) -> (Vec<u8>, [u8; GCM_TAG_LEN]) {
    let cipher = Aes128Gcm::new_from_slice(key).expect("16-byte key");
    let nonce = fixed_nonce(nonce_tag);
    let mut combined = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("encryption does not fail");
    let tag_start = combined.len() - GCM_TAG_LEN;
    let tag_bytes = combined.split_off(tag_start);
    let mut tag = [0u8; GCM_TAG_LEN];
    tag.copy_from_slice(&tag_bytes);
    (combined, tag)
}

pub fn decrypt_with_gcm(
    key: &SessionKey,
    nonce_tag: &str,
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, ()> {
    if tag.len() != GCM_TAG_LEN {
        return Err(());
    }
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| ())?;
    let nonce = fixed_nonce(nonce_tag);
    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: &combined,
                aad: &[],
            },
        )
        .map_err(|_| ())
}

pub fn rsa_oaep_wrap(pubkey: &RsaPublicKey, session_key: &SessionKey) -> Vec<u8> {
    let padding = Oaep::new::<sha2::Sha256>();
    pubkey
        .encrypt(&mut rand::thread_rng(), padding, session_key)
        .expect("RSA-OAEP wrap of a 16-byte key does not fail")
}

pub fn rsa_oaep_unwrap(privkey: &RsaPrivateKey, wrapped: &[u8]) -> Result<SessionKey, ()> {
    let padding = Oaep::new::<sha2::Sha256>();
    let plain = privkey.decrypt(padding, wrapped).map_err(|_| ())?;
    if plain.len() != SESSION_KEY_LEN {
        return Err(());
    }
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&plain);
    Ok(key)
}

pub fn load_public_key_pem(pem: &str) -> anyhow::Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| {
            use rsa::pkcs8::DecodePublicKey;
            RsaPublicKey::from_public_key_pem(pem)
        })
        .map_err(Into::into)
}

pub fn load_private_key_pem(pem: &str) -> anyhow::Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| {
            use rsa::pkcs1::DecodeRsaPrivateKey;
            RsaPrivateKey::from_pkcs1_pem(pem)
        })
        .map_err(Into::into)
}

/// Loads the worker's decrypt key the way `gen_rsa_kp.py` deploys it:
/// `RSA.generate(2048).exportKey('DER').encode('hex')`, i.e. hex-encoded
/// PKCS#1 DER, not PEM.
pub fn load_private_key_der_hex(hex_der: &str) -> anyhow::Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    let der = hex::decode(hex_der.trim())?;
    RsaPrivateKey::from_pkcs1_der(&der).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_round_trips() {
        let key = generate_session_key();
        let plaintext = b"hello worker";
        let (ciphertext, tag) = encrypt_with_gcm(&key, REQUEST_BODY_NONCE, plaintext);
        let decrypted = decrypt_with_gcm(&key, REQUEST_BODY_NONCE, &ciphertext, &tag).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn gcm_rejects_corrupted_tag() {
        let key = generate_session_key();
        let (ciphertext, mut tag) = encrypt_with_gcm(&key, REQUEST_META_NONCE, b"payload");
        tag[0] ^= 0xFF;
        assert!(decrypt_with_gcm(&key, REQUEST_META_NONCE, &ciphertext, &tag).is_err());
    }

    #[test]
    fn gcm_rejects_corrupted_ciphertext() {
        let key = generate_session_key();
        let (mut ciphertext, tag) = encrypt_with_gcm(&key, RESPONSE_BODY_NONCE, b"payload");
        ciphertext[0] ^= 0xFF;
        assert!(decrypt_with_gcm(&key, RESPONSE_BODY_NONCE, &ciphertext, &tag).is_err());
    }

    #[test]
    fn rsa_der_hex_round_trips() {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        let priv_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let der = priv_key.to_pkcs1_der().unwrap();
        let hex_der = hex::encode(der.as_bytes());
        let loaded = load_private_key_der_hex(&hex_der).unwrap();
        assert_eq!(loaded.to_pkcs1_der().unwrap().as_bytes(), der.as_bytes());
    }

    #[test]
    fn rsa_round_trips() {
        let priv_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let session_key = generate_session_key();
        let wrapped = rsa_oaep_wrap(&pub_key, &session_key);
        let unwrapped = rsa_oaep_unwrap(&priv_key, &wrapped).unwrap();
        assert_eq!(session_key, unwrapped);
    }
}
