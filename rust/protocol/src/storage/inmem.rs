//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::HashMap;

use crate::storage::traits;
use crate::{
    DeviceId, IdentityKey, IdentityKeyPair, PreKeyId, PreKeyRecord, ProtocolAddress, ProtocolError,
    Result, SessionRecord, SignedPreKeyId, SignedPreKeyRecord,
};

#[derive(Clone)]
pub struct InMemIdentityKeyStore {
    key_pair: IdentityKeyPair,
    registration_id: u32,
    known_keys: HashMap<ProtocolAddress, IdentityKey>,
}

impl InMemIdentityKeyStore {
    pub fn new(key_pair: IdentityKeyPair, registration_id: u32) -> Self {
        Self {
            key_pair,
            registration_id,
            known_keys: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.known_keys.clear();
    }
}

impl traits::IdentityKeyStore for InMemIdentityKeyStore {
    fn get_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        Ok(self.key_pair)
    }

    fn get_local_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }

    fn save_identity(&mut self, address: &ProtocolAddress, identity: &IdentityKey) -> Result<bool> {
        match self.known_keys.insert(address.clone(), *identity) {
            None => Ok(false), // new key
            Some(previous) => Ok(previous != *identity),
        }
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: traits::Direction,
    ) -> Result<bool> {
        match self.known_keys.get(address) {
            None => Ok(true), // first use
            Some(k) => Ok(k == identity),
        }
    }

    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>> {
        Ok(self.known_keys.get(address).copied())
    }
}

#[derive(Clone, Default)]
pub struct InMemPreKeyStore {
    pre_keys: HashMap<PreKeyId, PreKeyRecord>,
}

impl InMemPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the pre-keys still available, in ascending order.
    pub fn all_pre_key_ids(&self) -> Vec<PreKeyId> {
        let mut ids: Vec<PreKeyId> = self.pre_keys.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl traits::PreKeyStore for InMemPreKeyStore {
    fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord> {
        Ok(self
            .pre_keys
            .get(&id)
            .ok_or(ProtocolError::InvalidPreKeyId)?
            .clone())
    }

    fn save_pre_key(&mut self, id: PreKeyId, record: &PreKeyRecord) -> Result<()> {
        self.pre_keys.insert(id, record.to_owned());
        Ok(())
    }

    fn remove_pre_key(&mut self, id: PreKeyId) -> Result<()> {
        // If id does not exist this silently does nothing
        self.pre_keys.remove(&id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemSignedPreKeyStore {
    signed_pre_keys: HashMap<SignedPreKeyId, SignedPreKeyRecord>,
}

impl InMemSignedPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl traits::SignedPreKeyStore for InMemSignedPreKeyStore {
    fn get_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord> {
        Ok(self
            .signed_pre_keys
            .get(&id)
            .ok_or(ProtocolError::InvalidSignedPreKeyId)?
            .clone())
    }

    fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<()> {
        self.signed_pre_keys.insert(id, record.to_owned());
        Ok(())
    }
}

/// Keeps each record in its serialized form, so every load hands out an independent copy.
#[derive(Clone, Default)]
pub struct InMemSessionStore {
    sessions: HashMap<ProtocolAddress, Vec<u8>>,
}

impl InMemSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl traits::SessionStore for InMemSessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord> {
        match self.sessions.get(address) {
            None => Ok(SessionRecord::new_fresh()),
            Some(bytes) => SessionRecord::deserialize(bytes),
        }
    }

    fn store_session(&mut self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        self.sessions.insert(address.clone(), record.serialize());
        Ok(())
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self.sessions.contains_key(address))
    }

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()> {
        self.sessions.remove(address);
        Ok(())
    }

    fn delete_all_sessions(&mut self, name: &str) -> Result<()> {
        self.sessions.retain(|address, _| address.name() != name);
        Ok(())
    }

    fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>> {
        let mut device_ids: Vec<DeviceId> = self
            .sessions
            .keys()
            .filter(|address| address.name() == name && !address.device_id().is_primary())
            .map(|address| address.device_id())
            .collect();
        device_ids.sort();
        Ok(device_ids)
    }
}

#[derive(Clone)]
pub struct InMemProtocolStore {
    pub session_store: InMemSessionStore,
    pub pre_key_store: InMemPreKeyStore,
    pub signed_pre_key_store: InMemSignedPreKeyStore,
    pub identity_store: InMemIdentityKeyStore,
}

impl InMemProtocolStore {
    pub fn new(key_pair: IdentityKeyPair, registration_id: u32) -> Result<Self> {
        Ok(Self {
            session_store: InMemSessionStore::new(),
            pre_key_store: InMemPreKeyStore::new(),
            signed_pre_key_store: InMemSignedPreKeyStore::new(),
            identity_store: InMemIdentityKeyStore::new(key_pair, registration_id),
        })
    }
}

impl traits::IdentityKeyStore for InMemProtocolStore {
    fn get_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        self.identity_store.get_identity_key_pair()
    }

    fn get_local_registration_id(&self) -> Result<u32> {
        self.identity_store.get_local_registration_id()
    }

    fn save_identity(&mut self, address: &ProtocolAddress, identity: &IdentityKey) -> Result<bool> {
        self.identity_store.save_identity(address, identity)
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: traits::Direction,
    ) -> Result<bool> {
        self.identity_store
            .is_trusted_identity(address, identity, direction)
    }

    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>> {
        self.identity_store.get_identity(address)
    }
}

impl traits::PreKeyStore for InMemProtocolStore {
    fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord> {
        self.pre_key_store.get_pre_key(id)
    }

    fn save_pre_key(&mut self, id: PreKeyId, record: &PreKeyRecord) -> Result<()> {
        self.pre_key_store.save_pre_key(id, record)
    }

    fn remove_pre_key(&mut self, id: PreKeyId) -> Result<()> {
        self.pre_key_store.remove_pre_key(id)
    }
}

impl traits::SignedPreKeyStore for InMemProtocolStore {
    fn get_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord> {
        self.signed_pre_key_store.get_signed_pre_key(id)
    }

    fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<()> {
        self.signed_pre_key_store.save_signed_pre_key(id, record)
    }
}

impl traits::SessionStore for InMemProtocolStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord> {
        self.session_store.load_session(address)
    }

    fn store_session(&mut self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        self.session_store.store_session(address, record)
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool> {
        self.session_store.contains_session(address)
    }

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()> {
        self.session_store.delete_session(address)
    }

    fn delete_all_sessions(&mut self, name: &str) -> Result<()> {
        self.session_store.delete_all_sessions(name)
    }

    fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>> {
        self.session_store.get_sub_device_sessions(name)
    }
}

impl traits::ProtocolStore for InMemProtocolStore {}
