//! Endpoint identifiers and the handshake key exchange that yields the
//! human-comparable authentication token.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Opaque, stable endpoint identifier. Assigned by the transport: the id a
/// frame arrives from is the id frames are sent back to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_owned())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        EndpointId(s)
    }
}

/// Handshake public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Per-connection X25519 key. A fresh one is generated for every negotiation,
/// so tokens never repeat across connections to the same endpoint.
pub struct HandshakeKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl fmt::Debug for HandshakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Alphabet for the short token: no 0/O or 1/I, 32 symbols so a byte maps without bias.
const TOKEN_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TOKEN_LEN: usize = 4;

/// Authentication token shown to both users for out-of-band comparison.
/// Not verified by the negotiator; accepting is the caller's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub code: String,
    pub raw: [u8; 32],
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Derive the token both sides of a handshake compute independently.
/// Key order is requester first, responder second, on both ends.
pub fn derive_auth_token(
    shared_secret: &[u8; 32],
    requester: &PublicKey,
    responder: &PublicKey,
) -> AuthToken {
    let mut hasher = Sha256::new();
    hasher.update(b"nearby-auth-v1");
    hasher.update(shared_secret);
    hasher.update(requester.as_bytes());
    hasher.update(responder.as_bytes());
    let raw: [u8; 32] = hasher.finalize().into();
    let code = raw[..TOKEN_LEN]
        .iter()
        .map(|b| TOKEN_ALPHABET[(*b as usize) % TOKEN_ALPHABET.len()] as char)
        .collect();
    AuthToken { code, raw }
}
