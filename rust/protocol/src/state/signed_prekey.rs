//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt;

use prost::Message;

use crate::proto::storage::SignedPreKeyRecordStructure;
use crate::{KeyPair, ProtocolError, PublicKey, Result};

/// A unique identifier selecting among this client's signed pre-keys.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SignedPreKeyId(u32);

impl From<u32> for SignedPreKeyId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SignedPreKeyId> for u32 {
    fn from(value: SignedPreKeyId) -> Self {
        value.0
    }
}

impl fmt::Display for SignedPreKeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A medium-term pre-key whose public half is signed by the owner's identity key.
#[derive(Debug, Clone)]
pub struct SignedPreKeyRecord {
    id: SignedPreKeyId,
    timestamp: u64,
    key_pair: KeyPair,
    signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    pub fn new(id: SignedPreKeyId, timestamp: u64, key_pair: &KeyPair, signature: &[u8]) -> Self {
        Self {
            id,
            timestamp,
            key_pair: *key_pair,
            signature: signature.to_vec(),
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let structure = SignedPreKeyRecordStructure::decode(data)
            .map_err(|_| ProtocolError::InvalidProtobufEncoding)?;
        Ok(Self {
            id: structure.id.into(),
            timestamp: structure.timestamp,
            key_pair: KeyPair::from_public_and_private(
                &structure.public_key,
                &structure.private_key,
            )?,
            signature: structure.signature,
        })
    }

    pub fn id(&self) -> SignedPreKeyId {
        self.id
    }

    /// Milliseconds since the Unix epoch at which the key was generated.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key
    }

    pub fn key_pair(&self) -> KeyPair {
        self.key_pair
    }

    pub fn serialize(&self) -> Vec<u8> {
        SignedPreKeyRecordStructure {
            id: self.id.into(),
            public_key: self.key_pair.public_key.serialize().into_vec(),
            private_key: self.key_pair.private_key.serialize(),
            signature: self.signature.clone(),
            timestamp: self.timestamp,
        }
        .encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::IdentityKeyPair;

    #[test]
    fn record_survives_serialization() -> Result<()> {
        let mut csprng = OsRng;
        let identity = IdentityKeyPair::generate(&mut csprng);
        let key_pair = KeyPair::generate(&mut csprng);
        let signature = identity
            .private_key()
            .calculate_signature(&key_pair.public_key.serialize(), &mut csprng);

        let record = SignedPreKeyRecord::new(2.into(), 1_600_000_000_000, &key_pair, &signature);
        let restored = SignedPreKeyRecord::deserialize(&record.serialize())?;

        assert_eq!(restored.id(), SignedPreKeyId::from(2));
        assert_eq!(restored.timestamp(), 1_600_000_000_000);
        assert_eq!(restored.public_key(), key_pair.public_key);
        assert!(identity
            .public_key()
            .verify_signature(&restored.public_key().serialize(), restored.signature()));
        Ok(())
    }
}
