use std::path::Path;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};

use crate::error::AccessError;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SignError {
    #[display("declined: {_0}")]
    Declined(String),

    #[display("signing failed: {_0}")]
    Failed(String),
}
impl std::error::Error for SignError {}

/// A connected wallet able to prove ownership of its address.
#[async_trait(?Send)]
pub trait WalletSigner {
    /// base58 public address of the wallet
    fn address(&self) -> String;

    /// Raw signature bytes over `message`.
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignError>;
}

/// Local ed25519 wallet backed by a keypair file.
pub struct KeypairSigner {
    key: SigningKey,
}

impl KeypairSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Parses a JSON array of 64 bytes: secret key followed by public key.
    pub fn from_json(text: &str) -> Result<Self, AccessError> {
        let raw: Vec<u8> =
            serde_json::from_str(text).map_err(|err| AccessError::KeypairLoad(err.to_string()))?;
        let bytes: [u8; 64] = raw.try_into().map_err(|raw: Vec<u8>| {
            AccessError::KeypairLoad(format!("expected 64 bytes, got {}", raw.len()))
        })?;
        let key = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|err| AccessError::KeypairLoad(err.to_string()))?;
        Ok(Self { key })
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, AccessError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| AccessError::KeypairLoad(format!("{}: {}", path.display(), err)))?;
        Self::from_json(&text)
    }
}

#[async_trait(?Send)]
impl WalletSigner for KeypairSigner {
    fn address(&self) -> String {
        bs58::encode(self.key.verifying_key().to_bytes()).into_string()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignError> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn keypair_json(key: &SigningKey) -> String {
        serde_json::to_string(&key.to_keypair_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn signs_verifiably() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let signer = KeypairSigner::from_json(&keypair_json(&key)).unwrap();

        let raw = signer.sign_message(b"nonce-1").await.unwrap();
        let sig = Signature::from_slice(&raw).unwrap();
        key.verifying_key().verify(b"nonce-1", &sig).unwrap();

        let addr = bs58::decode(signer.address()).into_vec().unwrap();
        assert_eq!(addr, key.verifying_key().to_bytes().to_vec());
    }

    #[test]
    fn rejects_short_keypair() {
        let err = KeypairSigner::from_json("[1,2,3]").err().unwrap();
        assert!(matches!(err, AccessError::KeypairLoad(_)));
        assert!(KeypairSigner::from_json("not json").is_err());
    }
}
