//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt;

use prost::Message;

use crate::proto::storage::PreKeyRecordStructure;
use crate::{KeyPair, PrivateKey, ProtocolError, PublicKey, Result};

/// A unique identifier selecting among this client's known one-time pre-keys.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PreKeyId(u32);

impl From<u32> for PreKeyId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PreKeyId> for u32 {
    fn from(value: PreKeyId) -> Self {
        value.0
    }
}

impl fmt::Display for PreKeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-time pre-key as kept by its owner, private half included.
#[derive(Debug, Clone)]
pub struct PreKeyRecord {
    id: PreKeyId,
    key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn new(id: PreKeyId, key_pair: &KeyPair) -> Self {
        Self {
            id,
            key_pair: *key_pair,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let structure = PreKeyRecordStructure::decode(data)
            .map_err(|_| ProtocolError::InvalidProtobufEncoding)?;
        Ok(Self {
            id: structure.id.into(),
            key_pair: KeyPair::from_public_and_private(
                &structure.public_key,
                &structure.private_key,
            )?,
        })
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn key_pair(&self) -> KeyPair {
        self.key_pair
    }

    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key
    }

    pub fn private_key(&self) -> PrivateKey {
        self.key_pair.private_key
    }

    pub fn serialize(&self) -> Vec<u8> {
        PreKeyRecordStructure {
            id: self.id.into(),
            public_key: self.key_pair.public_key.serialize().into_vec(),
            private_key: self.key_pair.private_key.serialize(),
        }
        .encode_to_vec()
    }
}
