//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A Double Ratchet session engine for two-party end-to-end encrypted messaging.
//!
//! [`process_prekey_bundle`] and a [`SessionBuilder`] establish sessions; a [`SessionCipher`]
//! encrypts and decrypts on them, keeping every session record in a caller-supplied
//! [`SessionStore`].

#![warn(clippy::unwrap_used)]
#![deny(unsafe_code)]

mod address;
mod consts;
mod crypto;
mod curve;
pub mod error;
mod identity_key;
mod kdf;
mod proto;
mod protocol;
mod ratchet;
mod session;
mod session_cipher;
mod session_lock;
mod state;
mod storage;

use error::Result;

pub use {
    address::{DeviceId, ProtocolAddress},
    consts::{limits, SessionLimits},
    curve::{KeyPair, KeyType, PrivateKey, PublicKey},
    error::{CallbackError, ProtocolError},
    identity_key::{IdentityKey, IdentityKeyPair},
    kdf::HKDF,
    protocol::{
        CiphertextMessage, CiphertextMessageType, PreKeyWhisperMessage, SenderKeyMessage,
        WhisperMessage,
    },
    ratchet::{
        initialize_alice_session_record, initialize_bob_session_record, AliceProtocolParameters,
        BobProtocolParameters,
    },
    session::{process_prekey_bundle, PreKeySessionBuilder, SessionBuilder},
    session_cipher::{PendingDecryption, SessionCipher},
    session_lock::{SessionLockGuard, SessionLocks},
    state::{
        PreKeyBundle, PreKeyId, PreKeyRecord, SessionRecord, SignedPreKeyId, SignedPreKeyRecord,
    },
    storage::{
        Direction, IdentityKeyStore, InMemIdentityKeyStore, InMemPreKeyStore, InMemProtocolStore,
        InMemSessionStore, InMemSignedPreKeyStore, PreKeyStore, ProtocolStore, SessionStore,
        SignedPreKeyStore,
    },
};
