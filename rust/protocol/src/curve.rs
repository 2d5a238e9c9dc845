//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

pub(crate) mod curve25519;

use std::fmt;

use arrayref::array_ref;
use displaydoc::Display;
use rand::{CryptoRng, Rng};
use subtle::ConstantTimeEq;

use crate::{ProtocolError, Result};

#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum KeyType {
    /// <curve25519 key type>
    Djb = 0x05u8,
}

/// A Curve25519 public key, encoded on the wire as a type byte followed by 32 bytes.
#[derive(Clone, Copy)]
pub struct PublicKey {
    key: [u8; curve25519::PUBLIC_KEY_LENGTH],
}

impl PublicKey {
    pub const SERIALIZED_LENGTH: usize = 1 + curve25519::PUBLIC_KEY_LENGTH;

    pub fn deserialize(value: &[u8]) -> Result<Self> {
        let (&type_byte, key_data) = value
            .split_first()
            .ok_or(ProtocolError::NoKeyTypeIdentifier)?;
        let key_type =
            KeyType::try_from(type_byte).map_err(|e| ProtocolError::BadKeyType(e.number))?;
        match key_type {
            KeyType::Djb => {
                // Older peers append trailing data after the key; it is ignored.
                if key_data.len() < curve25519::PUBLIC_KEY_LENGTH {
                    return Err(ProtocolError::BadKeyLength(KeyType::Djb, value.len()));
                }
                Ok(PublicKey {
                    key: *array_ref![key_data, 0, curve25519::PUBLIC_KEY_LENGTH],
                })
            }
        }
    }

    pub fn from_djb_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let key = <[u8; curve25519::PUBLIC_KEY_LENGTH]>::try_from(bytes)
            .map_err(|_| ProtocolError::BadKeyLength(KeyType::Djb, bytes.len()))?;
        Ok(PublicKey { key })
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::Djb
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn serialize(&self) -> Box<[u8]> {
        let mut result = Vec::with_capacity(Self::SERIALIZED_LENGTH);
        result.push(self.key_type().into());
        result.extend_from_slice(&self.key);
        result.into_boxed_slice()
    }

    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = <&[u8; curve25519::SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        curve25519::PrivateKey::verify_signature(&self.key, &[message], signature)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::deserialize(value)
    }
}

impl ConstantTimeEq for PublicKey {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.key.ct_eq(&other.key)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &PublicKey) -> bool {
        bool::from(self.ct_eq(other))
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PublicKey {{ key_type={}, serialize={} }}",
            self.key_type(),
            hex::encode(self.serialize())
        )
    }
}

#[derive(Clone, Copy)]
pub struct PrivateKey {
    key: [u8; curve25519::PRIVATE_KEY_LENGTH],
}

impl PrivateKey {
    pub fn deserialize(value: &[u8]) -> Result<Self> {
        let key = <[u8; curve25519::PRIVATE_KEY_LENGTH]>::try_from(value)
            .map_err(|_| ProtocolError::BadKeyLength(KeyType::Djb, value.len()))?;
        // Round-trip through the curve type so the stored bytes are clamped.
        Ok(Self {
            key: curve25519::PrivateKey::from(key).private_key_bytes(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.key.to_vec()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: curve25519::PrivateKey::from(self.key).derive_public_key_bytes(),
        }
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::Djb
    }

    pub fn calculate_signature<R: CryptoRng + Rng>(
        &self,
        message: &[u8],
        csprng: &mut R,
    ) -> Box<[u8]> {
        let private_key = curve25519::PrivateKey::from(self.key);
        Box::new(private_key.calculate_signature(csprng, &[message]))
    }

    pub fn calculate_agreement(&self, their_key: &PublicKey) -> Box<[u8]> {
        let private_key = curve25519::PrivateKey::from(self.key);
        Box::new(private_key.calculate_agreement(&their_key.key))
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::deserialize(value)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("PrivateKey { .. }")
    }
}

#[derive(Copy, Clone, Debug)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn generate<R: Rng + CryptoRng>(csprng: &mut R) -> Self {
        let private_key = curve25519::PrivateKey::new(csprng);

        Self {
            public_key: PublicKey {
                key: private_key.derive_public_key_bytes(),
            },
            private_key: PrivateKey {
                key: private_key.private_key_bytes(),
            },
        }
    }

    pub fn new(public_key: PublicKey, private_key: PrivateKey) -> Self {
        Self {
            public_key,
            private_key,
        }
    }

    pub fn from_public_and_private(public_key: &[u8], private_key: &[u8]) -> Result<Self> {
        Ok(Self {
            public_key: PublicKey::try_from(public_key)?,
            private_key: PrivateKey::try_from(private_key)?,
        })
    }

    pub fn calculate_signature<R: CryptoRng + Rng>(
        &self,
        message: &[u8],
        csprng: &mut R,
    ) -> Box<[u8]> {
        self.private_key.calculate_signature(message, csprng)
    }

    pub fn calculate_agreement(&self, their_key: &PublicKey) -> Box<[u8]> {
        self.private_key.calculate_agreement(their_key)
    }
}

impl From<PrivateKey> for KeyPair {
    fn from(value: PrivateKey) -> Self {
        Self::new(value.public_key(), value)
    }
}
