//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Traits defining the stores a session cipher and session builder are handed by their caller.
//!
//! Every method is synchronous. Callers must not let other writers touch a session record while
//! a [crate::SessionCipher] holds the lock for its address.

use crate::address::{DeviceId, ProtocolAddress};
use crate::error::Result;
use crate::state::{PreKeyId, PreKeyRecord, SessionRecord, SignedPreKeyId, SignedPreKeyRecord};
use crate::{IdentityKey, IdentityKeyPair};

/// Each message can be considered to have exactly two participants, a sender and receiver.
///
/// [IdentityKeyStore::is_trusted_identity] uses this to ensure the identity provided is configured
/// for the appropriate role.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    /// We are in the context of sending a message.
    Sending,
    /// We are in the context of receiving a message.
    Receiving,
}

/// Interface defining the identity store, which may be in-memory, on-disk, etc.
///
/// Clients usually use the identity store in a [TOFU] manner, but this is not required.
///
/// [TOFU]: https://en.wikipedia.org/wiki/Trust_on_first_use
pub trait IdentityKeyStore {
    /// Return the single specific identity the store is assumed to represent, with private key.
    fn get_identity_key_pair(&self) -> Result<IdentityKeyPair>;

    /// Return a [u32] specific to this store instance.
    ///
    /// This local registration id is separate from the per-device identifier used in
    /// [ProtocolAddress] and should not change run over run.
    fn get_local_registration_id(&self) -> Result<u32>;

    /// Record an identity into the store. The identity is then considered "trusted".
    ///
    /// The return value represents whether an existing identity was replaced (`Ok(true)`). If it is
    /// new or hasn't changed, the return value should be `Ok(false)`.
    fn save_identity(&mut self, address: &ProtocolAddress, identity: &IdentityKey)
        -> Result<bool>;

    /// Return whether an identity is trusted for the role specified by `direction`.
    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: Direction,
    ) -> Result<bool>;

    /// Return the public identity for the given `address`, if known.
    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>>;
}

/// Interface for storing this client's one-time pre-keys.
pub trait PreKeyStore {
    /// Look up the pre-key corresponding to `prekey_id`.
    fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord>;

    /// Set the entry for `prekey_id` to the value of `record`.
    fn save_pre_key(&mut self, prekey_id: PreKeyId, record: &PreKeyRecord) -> Result<()>;

    /// Remove the entry for `prekey_id`.
    ///
    /// Called once a pre-key message referencing the key has been decrypted and committed.
    fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<()>;
}

/// Interface for storing this client's signed pre-keys.
pub trait SignedPreKeyStore {
    /// Look up the signed pre-key corresponding to `signed_prekey_id`.
    fn get_signed_pre_key(&self, signed_prekey_id: SignedPreKeyId) -> Result<SignedPreKeyRecord>;

    /// Set the entry for `signed_prekey_id` to the value of `record`.
    fn save_signed_pre_key(
        &mut self,
        signed_prekey_id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<()>;
}

/// Interface for a client instance to store the session it holds with another particular
/// client instance.
///
/// The [SessionRecord] between a pair of clients drives the state for the forward-secret
/// message chain in the [Double Ratchet] protocol.
///
/// [Double Ratchet]: https://signal.org/docs/specifications/doubleratchet/
pub trait SessionStore {
    /// Look up the session corresponding to `address`.
    ///
    /// An address with nothing stored yields [SessionRecord::new_fresh], never an error.
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord>;

    /// Set the entry for `address` to the value of `record`.
    fn store_session(&mut self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()>;

    /// Whether anything has been stored for `address`.
    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool>;

    /// Remove the entry for `address`, if any.
    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()>;

    /// Remove every entry whose address has the given `name`, regardless of device.
    fn delete_all_sessions(&mut self, name: &str) -> Result<()>;

    /// List the device ids, other than [DeviceId::PRIMARY], that have a session stored under
    /// `name`.
    fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>>;
}

/// Mixes in all the store interfaces defined in this module.
pub trait ProtocolStore: SessionStore + PreKeyStore + SignedPreKeyStore + IdentityKeyStore {}
