//! Session encryption negotiated during the connect handshake.
//!
//! When the server advertises an encryption descriptor in its meta packet the
//! client:
//!
//! 1. generates an ephemeral X25519 key pair,
//! 2. derives a wrapping key from the ECDH shared secret and both public keys,
//! 3. draws a random 32-byte session key,
//! 4. seals the session key (and the stored token, if any) under the wrapping key,
//! 5. sends the result as [`EncryptionMaterial`] inside the connect packet.
//!
//! The token then travels only inside the encrypted material, never in the
//! clear. Every envelope after the connect packet is sealed with the session
//! key by [`SessionCipher`] and carried as an `ENCRYPTED_KIND` envelope.
//!
//! Secret key material is zeroized as soon as it has been consumed.

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::core::packet::Envelope;
use crate::core::serialization::WireFormat;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{Crypto, KEY_LEN};

use tracing::{debug, instrument};

/// The only supported scheme
pub const ENCRYPTION_KIND: &str = "x25519-xchacha20poly1305";

/// Envelope kind wrapping a sealed envelope
pub const ENCRYPTED_KIND: &str = "core:packet/encrypted";

/// What the server advertises in its meta packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionDescriptor {
    pub kind: String,
    pub public_key: [u8; 32],
}

/// What the client returns in its connect packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMaterial {
    pub kind: String,
    pub public_key: [u8; 32],
    pub wrapped_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_token: Option<Vec<u8>>,
}

/// Derive the key-wrapping key from a shared secret and both public keys
fn derive_wrapping_key(
    shared_secret: &SharedSecret,
    client_public: &[u8; 32],
    server_public: &[u8; 32],
) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();

    hasher.update(shared_secret.as_bytes());

    // order matters for domain separation
    hasher.update(b"client_public");
    hasher.update(client_public);
    hasher.update(b"server_public");
    hasher.update(server_public);

    hasher.finalize().into()
}

fn check_kind(kind: &str) -> Result<()> {
    if kind != ENCRYPTION_KIND {
        return Err(ProtocolError::HandshakeError(format!(
            "{}: {kind}",
            constants::ERR_UNSUPPORTED_ENCRYPTION
        )));
    }
    Ok(())
}

/// Client side of the key exchange.
///
/// # Returns
/// A tuple of (session cipher, material to send in the connect packet)
///
/// # Errors
/// Returns `ProtocolError::HandshakeError` for an unsupported scheme or when
/// the OS random generator fails
#[instrument(skip(descriptor, token), fields(kind = %descriptor.kind))]
pub fn client_encryption_init(
    descriptor: &EncryptionDescriptor,
    token: Option<&str>,
) -> Result<(SessionCipher, EncryptionMaterial)> {
    check_kind(&descriptor.kind)?;

    let client_secret = EphemeralSecret::random_from_rng(OsRng);
    let client_public = PublicKey::from(&client_secret).to_bytes();
    let shared_secret = client_secret.diffie_hellman(&PublicKey::from(descriptor.public_key));

    let mut wrapping_key =
        derive_wrapping_key(&shared_secret, &client_public, &descriptor.public_key);
    let wrapper = Crypto::new(&wrapping_key);
    wrapping_key.zeroize();

    let mut session_key = Crypto::generate_key()?;
    let wrapped_key = wrapper.seal(&session_key)?;
    let wrapped_token = token.map(|t| wrapper.seal(t.as_bytes())).transpose()?;
    let cipher = SessionCipher::new(&session_key);
    session_key.zeroize();

    debug!("Client sealed session key");

    Ok((
        cipher,
        EncryptionMaterial {
            kind: ENCRYPTION_KIND.to_string(),
            public_key: client_public,
            wrapped_key,
            wrapped_token,
        },
    ))
}

/// Server half of the exchange. Brokers hold one long-lived key pair.
pub struct ServerEncryptionKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerEncryptionKeys {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn descriptor(&self) -> EncryptionDescriptor {
        EncryptionDescriptor {
            kind: ENCRYPTION_KIND.to_string(),
            public_key: self.public.to_bytes(),
        }
    }

    /// Unwrap the client's session key and token.
    #[instrument(skip(self, material))]
    pub fn accept(&self, material: &EncryptionMaterial) -> Result<(SessionCipher, Option<String>)> {
        check_kind(&material.kind)?;

        let shared_secret = self
            .secret
            .diffie_hellman(&PublicKey::from(material.public_key));
        let mut wrapping_key =
            derive_wrapping_key(&shared_secret, &material.public_key, self.public.as_bytes());
        let wrapper = Crypto::new(&wrapping_key);
        wrapping_key.zeroize();

        let mut unwrapped = wrapper.open(&material.wrapped_key)?;
        if unwrapped.len() != KEY_LEN {
            unwrapped.zeroize();
            return Err(ProtocolError::HandshakeError(
                constants::ERR_MISSING_MATERIAL.into(),
            ));
        }
        let mut session_key = [0u8; KEY_LEN];
        session_key.copy_from_slice(&unwrapped);
        unwrapped.zeroize();
        let cipher = SessionCipher::new(&session_key);
        session_key.zeroize();

        let token = match &material.wrapped_token {
            Some(sealed) => {
                let bytes = wrapper.open(sealed)?;
                Some(String::from_utf8(bytes).map_err(|e| {
                    ProtocolError::HandshakeError(format!("token is not UTF-8: {e}"))
                })?)
            }
            None => None,
        };

        debug!("Server unwrapped session key");
        Ok((cipher, token))
    }
}

impl Default for ServerEncryptionKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Seals and opens envelopes with the negotiated session key.
pub struct SessionCipher {
    crypto: Crypto,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            crypto: Crypto::new(key),
        }
    }

    /// Wrap `envelope` in an `ENCRYPTED_KIND` envelope.
    pub fn encrypt(&self, envelope: &Envelope) -> Result<Envelope> {
        let sealed = self.crypto.seal(&envelope.to_bytes())?;
        Ok(Envelope::new(ENCRYPTED_KIND, sealed))
    }

    /// Open an `ENCRYPTED_KIND` envelope. Any other kind is rejected.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Envelope> {
        if envelope.kind != ENCRYPTED_KIND {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected encrypted envelope, got {}",
                envelope.kind
            )));
        }
        let plain = self.crypto.open(&envelope.payload)?;
        Envelope::from_bytes(&plain)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher")
    }
}
