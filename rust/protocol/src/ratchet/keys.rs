//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt;

use arrayref::array_ref;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::proto::storage::session_structure;
use crate::{crypto, PrivateKey, PublicKey, HKDF};

/// Single-use key material for one message: produced by one chain step, consumed by exactly one
/// encryption or decryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
    counter: u32,
}

impl MessageKeys {
    pub(crate) fn derive_keys(kdf: HKDF, input_key_material: &[u8], counter: u32) -> Self {
        let okm: [u8; 80] = kdf.derive_secrets(input_key_material, b"WhisperMessageKeys");

        MessageKeys {
            cipher_key: *array_ref![okm, 0, 32],
            mac_key: *array_ref![okm, 32, 32],
            iv: *array_ref![okm, 64, 16],
            counter,
        }
    }

    #[inline]
    pub(crate) fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    #[inline]
    pub(crate) fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    #[inline]
    pub(crate) fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    #[inline]
    pub(crate) fn counter(&self) -> u32 {
        self.counter
    }

    pub(crate) fn to_pb(&self) -> session_structure::chain::MessageKey {
        session_structure::chain::MessageKey {
            index: self.counter,
            cipher_key: self.cipher_key.to_vec(),
            mac_key: self.mac_key.to_vec(),
            iv: self.iv.to_vec(),
        }
    }

    pub(crate) fn from_pb(
        pb: &session_structure::chain::MessageKey,
    ) -> std::result::Result<Self, &'static str> {
        Ok(MessageKeys {
            cipher_key: pb
                .cipher_key
                .as_slice()
                .try_into()
                .map_err(|_| "invalid message cipher key")?,
            mac_key: pb
                .mac_key
                .as_slice()
                .try_into()
                .map_err(|_| "invalid message MAC key")?,
            iv: pb.iv.as_slice().try_into().map_err(|_| "invalid message IV")?,
            counter: pb.index,
        })
    }
}

impl fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKeys")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ChainKey {
    kdf: HKDF,
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    const MESSAGE_KEY_SEED: [u8; 1] = [0x01u8];
    const CHAIN_KEY_SEED: [u8; 1] = [0x02u8];

    pub(crate) fn new(kdf: HKDF, key: [u8; 32], index: u32) -> Self {
        Self { kdf, key, index }
    }

    #[inline]
    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.key
    }

    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn next_chain_key(&self) -> Self {
        Self {
            kdf: self.kdf,
            key: self.calculate_base_material(Self::CHAIN_KEY_SEED),
            index: self.index + 1,
        }
    }

    pub(crate) fn message_keys(&self) -> MessageKeys {
        MessageKeys::derive_keys(
            self.kdf,
            &self.calculate_base_material(Self::MESSAGE_KEY_SEED),
            self.index,
        )
    }

    fn calculate_base_material(&self, seed: [u8; 1]) -> [u8; 32] {
        crypto::hmac_sha256(&self.key, &seed)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RootKey {
    kdf: HKDF,
    key: [u8; 32],
}

impl RootKey {
    pub(crate) fn new(kdf: HKDF, key: [u8; 32]) -> Self {
        Self { kdf, key }
    }

    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// One Diffie-Hellman ratchet step: mixes `DH(ours, theirs)` into the root and returns the
    /// successor root together with a fresh chain at index 0.
    pub(crate) fn create_chain(
        &self,
        their_ratchet_key: &PublicKey,
        our_ratchet_key: &PrivateKey,
    ) -> (RootKey, ChainKey) {
        let shared_secret = our_ratchet_key.calculate_agreement(their_ratchet_key);
        let derived_secret_bytes: [u8; 64] =
            self.kdf
                .derive_salted_secrets(&shared_secret, &self.key, b"WhisperRatchet");

        (
            RootKey {
                kdf: self.kdf,
                key: *array_ref![derived_secret_bytes, 0, 32],
            },
            ChainKey {
                kdf: self.kdf,
                key: *array_ref![derived_secret_bytes, 32, 32],
                index: 0,
            },
        )
    }
}
