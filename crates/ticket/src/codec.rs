//! Storage-side encoding of tickets.
//!
//! Shared backends never see client-facing ids or plaintext payloads:
//!
//! - ids are replaced by a SHA-512 hex digest before they become storage keys
//! - payloads are serialized to JSON, then sealed by a [`TicketCipher`]
//!
//! A breach of the store therefore yields neither redeemable ids nor, with
//! [`Aes256GcmTicketCipher`], session contents.

use std::{fmt, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use ticketd_storage::StorageError;
use zeroize::Zeroizing;

use crate::{
    error::{ConfigError, TicketResult},
    ticket::{Expirable, Ticket, TicketKind},
};

const NONCE_LEN: usize = 12;

/// Seals and opens serialized ticket payloads.
pub trait TicketCipher: Send + Sync + fmt::Debug {
    /// Encrypts `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be sealed.
    fn encrypt(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>>;

    /// Decrypts bytes produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload was tampered with or
    /// sealed under another key.
    fn decrypt(&self, ciphertext: &[u8]) -> TicketResult<Vec<u8>>;
}

/// Passes payloads through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTicketCipher;

impl TicketCipher for NoopTicketCipher {
    fn encrypt(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> TicketResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM with a random 96-bit nonce prefixed to each ciphertext.
pub struct Aes256GcmTicketCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmTicketCipher {
    /// Creates a cipher from a raw 256-bit key.
    #[must_use]
    pub fn new(key: &Zeroizing<[u8; 32]>) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())) }
    }

    /// Creates a cipher from a base64-encoded 256-bit key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the key is not valid base64 or not
    /// exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            ConfigError::Invalid { field: "cipher.key", reason: e.to_string() }
        })?);
        let key: Zeroizing<[u8; 32]> =
            Zeroizing::new(decoded.as_slice().try_into().map_err(|_| ConfigError::Invalid {
                field: "cipher.key",
                reason: format!("expected 32 bytes, got {}", decoded.len()),
            })?);
        Ok(Self::new(&key))
    }
}

impl fmt::Debug for Aes256GcmTicketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256GcmTicketCipher").finish_non_exhaustive()
    }
}

impl TicketCipher for Aes256GcmTicketCipher {
    fn encrypt(&self, plaintext: &[u8]) -> TicketResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::serialization("failed to seal ticket payload"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> TicketResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(StorageError::serialization("sealed ticket payload is truncated").into());
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StorageError::serialization("ticket payload failed authentication"))?;
        Ok(plaintext)
    }
}

/// Backend-facing record of one ticket.
///
/// Carries the secondary attributes that document-style stores index on
/// alongside the sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Digest of the ticket id.
    pub id_digest: String,
    /// Kind discriminator.
    pub kind: TicketKind,
    /// Base64 of the sealed JSON payload.
    pub payload: String,
    /// Digest of the session principal, for granting tickets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_digest: Option<String>,
    /// Target service, for service and proxy tickets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Digest of the parent granting ticket id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_digest: Option<String>,
    /// Eviction deadline computed when the record was written.
    pub expires_at: DateTime<Utc>,
}

/// Digests ids and seals payloads for storage-backed registries.
#[derive(Debug, Clone)]
pub struct TicketCodec {
    digest_ids: bool,
    cipher: Arc<dyn TicketCipher>,
}

impl Default for TicketCodec {
    fn default() -> Self {
        Self::new(true, Arc::new(NoopTicketCipher))
    }
}

impl TicketCodec {
    /// Creates a codec.
    #[must_use]
    pub fn new(digest_ids: bool, cipher: Arc<dyn TicketCipher>) -> Self {
        Self { digest_ids, cipher }
    }

    /// Storage key material for a ticket id or principal.
    ///
    /// With digesting off the value is returned unchanged, which is only
    /// appropriate for single-process stores.
    #[must_use]
    pub fn digest(&self, value: &str) -> String {
        if self.digest_ids { sha512_hex(value) } else { value.to_owned() }
    }

    /// Serializes and seals a ticket.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding or sealing fails.
    pub fn seal(&self, ticket: &Ticket) -> TicketResult<Vec<u8>> {
        let json = serde_json::to_vec(ticket)
            .map_err(|e| StorageError::serialization_with_source("failed to encode ticket", e))?;
        self.cipher.encrypt(&json)
    }

    /// Opens and deserializes a ticket sealed by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload is corrupt or sealed
    /// under another key.
    pub fn open(&self, sealed: &[u8]) -> TicketResult<Ticket> {
        let json = self.cipher.decrypt(sealed)?;
        let ticket = serde_json::from_slice(&json)
            .map_err(|e| StorageError::serialization_with_source("failed to decode ticket", e))?;
        Ok(ticket)
    }

    /// Builds the backend record for `ticket` expiring at `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if sealing fails.
    pub fn record(&self, ticket: &Ticket, expires_at: DateTime<Utc>) -> TicketResult<TicketRecord> {
        Ok(TicketRecord {
            id_digest: self.digest(ticket.id()),
            kind: ticket.kind(),
            payload: BASE64.encode(self.seal(ticket)?),
            principal_digest: ticket.principal_id().map(|p| self.digest(p)),
            service: ticket.service_id().map(str::to_owned),
            parent_digest: ticket.parent_id().map(|p| self.digest(p)),
            expires_at,
        })
    }

    /// Recovers the ticket from a backend record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload is corrupt.
    pub fn ticket_from_record(&self, record: &TicketRecord) -> TicketResult<Ticket> {
        let sealed = BASE64
            .decode(&record.payload)
            .map_err(|e| StorageError::serialization_with_source("invalid ticket payload", e))?;
        self.open(&sealed)
    }
}

/// SHA-512 of `value`, lowercase hex.
#[must_use]
pub fn sha512_hex(value: &str) -> String {
    hex::encode(Sha512::digest(value.as_bytes()))
}
