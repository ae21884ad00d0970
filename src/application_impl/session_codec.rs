use crate::application_port::SessionStoreError;
use crate::domain_model::{Session, SessionId};
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit as _, Payload};
use hmac::{Hmac, KeyInit, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::borrow::Cow;
use std::fmt;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SECRET_LEN: usize = 16;
const KEY_DERIVATION_LABEL: &[u8] = b"ticketvault session payload aes-256-gcm v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("payload failed authentication")]
    Integrity,
    #[error("invalid encryption secret: {0}")]
    Configuration(String),
}

impl From<CodecError> for SessionStoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(e) => SessionStoreError::Encode(e),
            CodecError::Decode(e) => SessionStoreError::Decode(e),
            CodecError::Integrity => SessionStoreError::Integrity,
            CodecError::Configuration(e) => SessionStoreError::Configuration(e),
        }
    }
}

/// Turns sessions into stored bytes and back.
///
/// The variant is picked once from configuration. In encrypted mode the
/// output is `nonce || ciphertext || tag` and the session id is bound as
/// associated data, so an entry copied under another id fails to open.
#[derive(Clone)]
pub enum SessionCodec {
    Plain,
    Encrypted(Box<Aes256Gcm>),
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCodec::Plain => write!(f, "SessionCodec::Plain"),
            SessionCodec::Encrypted(_) => write!(f, "SessionCodec::Encrypted(..)"),
        }
    }
}

impl SessionCodec {
    pub fn from_secret(secret: Option<&str>) -> Result<Self, CodecError> {
        match secret {
            None => Ok(SessionCodec::Plain),
            Some(secret) => SessionCodec::encrypted(secret.as_bytes()),
        }
    }

    pub fn encrypted(secret: &[u8]) -> Result<Self, CodecError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CodecError::Configuration(format!(
                "secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                secret.len()
            )));
        }
        let key = derive_key(secret)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        Ok(SessionCodec::Encrypted(Box::new(cipher)))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, SessionCodec::Encrypted(_))
    }

    pub fn encode(&self, session: &Session) -> Result<Vec<u8>, CodecError> {
        let plain = serde_json::to_vec(session).map_err(|e| CodecError::Encode(e.to_string()))?;
        match self {
            SessionCodec::Plain => Ok(plain),
            SessionCodec::Encrypted(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::rng().fill_bytes(&mut nonce);
                let sealed = cipher
                    .encrypt(
                        GenericArray::from_slice(&nonce),
                        Payload {
                            msg: &plain,
                            aad: session.id.as_str().as_bytes(),
                        },
                    )
                    .map_err(|e| CodecError::Encode(format!("AES-256-GCM encryption failed: {e}")))?;

                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    /// Authenticates (when encrypted) before deserializing anything.
    pub fn decode(&self, id: &SessionId, bytes: &[u8]) -> Result<Session, CodecError> {
        let plain = match self {
            SessionCodec::Plain => Cow::Borrowed(bytes),
            SessionCodec::Encrypted(cipher) => {
                if bytes.len() < NONCE_LEN + TAG_LEN {
                    return Err(CodecError::Integrity);
                }
                let (nonce, sealed) = bytes.split_at(NONCE_LEN);
                let opened = cipher
                    .decrypt(
                        GenericArray::from_slice(nonce),
                        Payload {
                            msg: sealed,
                            aad: id.as_str().as_bytes(),
                        },
                    )
                    .map_err(|_| CodecError::Integrity)?;
                Cow::Owned(opened)
            }
        };

        let session: Session =
            serde_json::from_slice(&plain).map_err(|e| CodecError::Decode(e.to_string()))?;
        if session.id != *id {
            return Err(CodecError::Decode(format!(
                "entry belongs to session {}, expected {}",
                session.id, id
            )));
        }
        Ok(session)
    }
}

fn derive_key(secret: &[u8]) -> Result<[u8; 32], CodecError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| CodecError::Configuration(e.to_string()))?;
    mac.update(KEY_DERIVATION_LABEL);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out[..]);
    Ok(key)
}
