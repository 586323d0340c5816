//! Party identities, signing keys and name resolution
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use bech32::Bech32m;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CodecError;

/// Public identity of a party: its ed25519 verifying key, bech32m encoded.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
#[cbor(array)]
pub struct Identity(#[n(0)] String);

impl Identity {
    pub const HRP: &'static str = "party";

    pub fn from_verifying_key(key: &VerifyingKey) -> Result<Self, CodecError> {
        let hrp =
            bech32::Hrp::parse(Self::HRP).map_err(|e| CodecError::Identity(e.to_string()))?;
        let encoded = bech32::encode::<Bech32m>(hrp, key.as_bytes())
            .map_err(|e| CodecError::Identity(e.to_string()))?;

        Ok(Self(encoded))
    }

    /// Parses an encoded identity, rejecting anything that is not a valid key.
    pub fn parse(encoded: &str) -> Result<Self, CodecError> {
        let identity = Self(encoded.to_string());
        identity.verifying_key()?;
        Ok(identity)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, CodecError> {
        let (hrp, bytes) =
            bech32::decode(&self.0).map_err(|_| CodecError::Identity(self.0.clone()))?;
        if hrp.as_str() != Self::HRP {
            return Err(CodecError::Identity(self.0.clone()));
        }
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CodecError::Identity(self.0.clone()))?;

        VerifyingKey::from_bytes(&bytes).map_err(|_| CodecError::Identity(self.0.clone()))
    }

    /// True when `signature` (hex) is this identity's signature over `message`.
    pub fn verifies(&self, message: &[u8], signature: &str) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };

        key.verify(message, &signature).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named participant holding its own signing key.
#[derive(Clone)]
pub struct Party {
    name: String,
    signing_key: SigningKey,
    identity: Identity,
}

impl Party {
    pub fn generate(name: impl Into<String>) -> Result<Self, CodecError> {
        let mut rng = rand::rngs::OsRng;
        Self::with_key(name, SigningKey::generate(&mut rng))
    }

    /// Deterministic keys, mostly useful for tests and fixtures.
    pub fn from_seed(name: impl Into<String>, seed: [u8; 32]) -> Result<Self, CodecError> {
        Self::with_key(name, SigningKey::from_bytes(&seed))
    }

    fn with_key(name: impl Into<String>, signing_key: SigningKey) -> Result<Self, CodecError> {
        let identity = Identity::from_verifying_key(&signing_key.verifying_key())?;
        Ok(Self {
            name: name.into(),
            signing_key,
            identity,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Detached signature over `message`, hex encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    pub fn endorse(&self, message: &[u8]) -> Endorsement {
        Endorsement {
            signer: self.identity.clone(),
            signature: self.sign(message),
        }
    }
}

impl fmt::Debug for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Party")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// One party's signature over a transition digest.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Endorsement {
    #[n(0)]
    pub signer: Identity,
    #[n(1)]
    pub signature: String, // hex encoded ed25519 signature
}

impl Endorsement {
    pub fn verify(&self, message: &[u8]) -> bool {
        self.signer.verifies(message, &self.signature)
    }
}

/// Looks up the identity registered under a human readable name.
pub trait IdentityResolver: Send + Sync {
    fn resolve_by_name(&self, name: &str) -> Option<Identity>;
}

#[derive(Debug, Default)]
pub struct Directory {
    entries: RwLock<HashMap<String, Identity>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, identity: Identity) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), identity);
    }
}

impl IdentityResolver for Directory {
    fn resolve_by_name(&self, name: &str) -> Option<Identity> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}
