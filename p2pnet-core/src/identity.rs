//! Node identity: an Ed25519 keypair. The peer id is derived from its public half.

use libp2p::identity::Keypair;

/// Generate a new random identity.
pub fn generate() -> Keypair {
    Keypair::generate_ed25519()
}

/// Parse 64 hex characters of Ed25519 secret key material.
pub fn keypair_from_hex(s: &str) -> Result<Keypair, KeyMaterialError> {
    let mut raw = hex::decode(s.trim()).map_err(|_| KeyMaterialError::NotHex)?;
    if raw.len() != 32 {
        return Err(KeyMaterialError::Length);
    }
    Keypair::ed25519_from_bytes(&mut raw).map_err(|e| KeyMaterialError::Invalid(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum KeyMaterialError {
    #[error("identity key is not hex")]
    NotHex,
    #[error("identity key must be 32 bytes")]
    Length,
    #[error("identity key rejected: {0}")]
    Invalid(String),
}
