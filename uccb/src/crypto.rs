//! Validator keys and the signature primitives used for echoes.
//!
//! Validators sign relay messages as EIP-191 personal messages, so anyone holding the digest of a message can
//! recover the signer's address from a 65-byte `(r, s, v)` signature.

use alloy::{
    primitives::{Address, B256, PrimitiveSignature},
    signers::{SignerSync, local::PrivateKeySigner},
};
use anyhow::{Result, anyhow};
use k256::ecdsa::SigningKey;
use serde::{
    Deserialize, Deserializer,
    de::{self, Unexpected},
};

/// Length of a serialized recoverable signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// The secret key of a validator. Its address is the identity registered with each relay.
#[derive(Clone)]
pub struct SecretKey {
    key: SigningKey,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl SecretKey {
    /// Generates a random private key.
    pub fn new() -> Result<SecretKey> {
        Self::new_from_rng(&mut rand::rngs::OsRng)
    }

    pub fn new_from_rng<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Result<SecretKey> {
        Ok(SecretKey {
            key: SigningKey::random(rng),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }

        let key = SigningKey::from_bytes(&bytes.into())?;
        Ok(SecretKey { key })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    fn signer(&self) -> PrivateKeySigner {
        PrivateKeySigner::from_signing_key(self.key.clone())
    }

    /// The address validators are registered under.
    pub fn address(&self) -> Address {
        self.signer().address()
    }

    /// Signs `message` as an EIP-191 personal message. The signature recovers against the EIP-191 hash of
    /// `message`, which is what the relay calls the digest.
    pub fn sign_message(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LENGTH]> {
        let signature = self.signer().sign_message_sync(message)?;
        Ok(signature.as_bytes())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretKey::from_hex(&s)
            .map_err(|_| de::Error::invalid_value(Unexpected::Str("[redacted]"), &"a secret key"))
    }
}

/// Recovers the address which produced `signature` over `digest`. Returns `None` for signatures which are
/// malformed or do not recover to any point.
pub fn recover_signer(digest: &B256, signature: &[u8]) -> Option<Address> {
    let signature = PrimitiveSignature::try_from(signature).ok()?;
    signature.recover_address_from_prehash(digest).ok()
}
