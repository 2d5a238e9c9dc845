//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::sync::{Arc, Mutex};

use axolotl_protocol::*;
use rand::{rngs::OsRng, CryptoRng, Rng};

#[allow(dead_code)]
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::max())
        .is_test(true)
        .try_init();
}

#[allow(dead_code)]
pub fn test_in_memory_protocol_store() -> Result<InMemProtocolStore, ProtocolError> {
    let mut csprng = OsRng;
    let identity_key = IdentityKeyPair::generate(&mut csprng);
    let registration_id: u32 = csprng.gen_range(1..16380);

    InMemProtocolStore::new(identity_key, registration_id)
}

#[allow(dead_code)]
pub fn encrypt(
    store: &mut InMemProtocolStore,
    locks: &SessionLocks,
    remote_address: &ProtocolAddress,
    msg: &str,
) -> Result<CiphertextMessage, ProtocolError> {
    SessionCipher::new(
        remote_address.clone(),
        &mut store.session_store,
        &mut store.pre_key_store,
        locks,
    )
    .encrypt(msg.as_bytes())
}

/// Decrypts either kind of message and commits the result.
#[allow(dead_code)]
pub fn decrypt(
    store: &mut InMemProtocolStore,
    locks: &SessionLocks,
    remote_address: &ProtocolAddress,
    msg: &CiphertextMessage,
) -> Result<Vec<u8>, ProtocolError> {
    let mut csprng = OsRng;
    let mut builder =
        PreKeySessionBuilder::new(&mut store.identity_store, &store.signed_pre_key_store);
    let mut cipher = SessionCipher::new(
        remote_address.clone(),
        &mut store.session_store,
        &mut store.pre_key_store,
        locks,
    );
    let plaintext = cipher.decrypt(msg, &mut builder, &mut csprng)?.commit()?;
    Ok(plaintext)
}

#[allow(dead_code)]
pub fn create_pre_key_bundle<R: Rng + CryptoRng>(
    store: &mut dyn ProtocolStore,
    mut csprng: &mut R,
) -> Result<PreKeyBundle, ProtocolError> {
    let pre_key_pair = KeyPair::generate(&mut csprng);
    let signed_pre_key_pair = KeyPair::generate(&mut csprng);

    let signed_pre_key_public = signed_pre_key_pair.public_key.serialize();
    let signed_pre_key_signature = store
        .get_identity_key_pair()?
        .private_key()
        .calculate_signature(&signed_pre_key_public, &mut csprng);

    let device_id: u32 = csprng.gen_range(1..128);
    let pre_key_id: u32 = csprng.gen();
    let signed_pre_key_id: u32 = csprng.gen();

    let pre_key_bundle = PreKeyBundle::new(
        store.get_local_registration_id()?,
        device_id.into(),
        Some((pre_key_id.into(), pre_key_pair.public_key)),
        signed_pre_key_id.into(),
        signed_pre_key_pair.public_key,
        signed_pre_key_signature.to_vec(),
        *store.get_identity_key_pair()?.identity_key(),
    );

    store.save_pre_key(
        pre_key_id.into(),
        &PreKeyRecord::new(pre_key_id.into(), &pre_key_pair),
    )?;

    let timestamp = csprng.gen();

    store.save_signed_pre_key(
        signed_pre_key_id.into(),
        &SignedPreKeyRecord::new(
            signed_pre_key_id.into(),
            timestamp,
            &signed_pre_key_pair,
            &signed_pre_key_signature,
        ),
    )?;

    Ok(pre_key_bundle)
}

fn initialize_sessions(version: u8) -> Result<(SessionRecord, SessionRecord), ProtocolError> {
    let mut csprng = OsRng;
    let alice_identity = IdentityKeyPair::generate(&mut csprng);
    let bob_identity = IdentityKeyPair::generate(&mut csprng);

    let alice_base_key = KeyPair::generate(&mut csprng);

    let bob_base_key = KeyPair::generate(&mut csprng);
    let bob_ephemeral_key = bob_base_key;

    let alice_params = AliceProtocolParameters::new(
        alice_identity,
        alice_base_key,
        *bob_identity.identity_key(),
        bob_base_key.public_key,
        bob_ephemeral_key.public_key,
    )
    .with_session_version(version);

    let alice_session = initialize_alice_session_record(&alice_params, &mut csprng)?;

    let bob_params = BobProtocolParameters::new(
        bob_identity,
        bob_base_key,
        None,
        bob_ephemeral_key,
        *alice_identity.identity_key(),
        alice_base_key.public_key,
    )
    .with_session_version(version);

    let bob_session = initialize_bob_session_record(&bob_params)?;

    Ok((alice_session, bob_session))
}

#[allow(dead_code)]
pub fn initialize_sessions_v3() -> Result<(SessionRecord, SessionRecord), ProtocolError> {
    initialize_sessions(3)
}

#[allow(dead_code)]
pub fn initialize_sessions_v2() -> Result<(SessionRecord, SessionRecord), ProtocolError> {
    initialize_sessions(2)
}

/// A pre-key store that records every removal it is asked to perform.
#[allow(dead_code)]
#[derive(Default)]
pub struct CountingPreKeyStore {
    pub inner: InMemPreKeyStore,
    pub removed: Vec<PreKeyId>,
}

impl PreKeyStore for CountingPreKeyStore {
    fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord, ProtocolError> {
        self.inner.get_pre_key(prekey_id)
    }

    fn save_pre_key(
        &mut self,
        prekey_id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), ProtocolError> {
        self.inner.save_pre_key(prekey_id, record)
    }

    fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<(), ProtocolError> {
        self.removed.push(prekey_id);
        self.inner.remove_pre_key(prekey_id)
    }
}

/// A session store that many threads can hold handles to at once.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct SharedSessionStore(pub Arc<Mutex<InMemSessionStore>>);

impl SharedSessionStore {
    fn with<T>(&self, f: impl FnOnce(&mut InMemSessionStore) -> T) -> T {
        f(&mut self.0.lock().expect("not poisoned"))
    }
}

impl SessionStore for SharedSessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord, ProtocolError> {
        self.with(|store| store.load_session(address))
    }

    fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), ProtocolError> {
        self.with(|store| store.store_session(address, record))
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, ProtocolError> {
        self.with(|store| store.contains_session(address))
    }

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<(), ProtocolError> {
        self.with(|store| store.delete_session(address))
    }

    fn delete_all_sessions(&mut self, name: &str) -> Result<(), ProtocolError> {
        self.with(|store| store.delete_all_sessions(name))
    }

    fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>, ProtocolError> {
        self.with(|store| store.get_sub_device_sessions(name))
    }
}
