//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt;

use rand::{CryptoRng, Rng};

use crate::crypto;
use crate::ratchet::{ChainKey, MessageKeys};
use crate::state::SessionState;
use crate::{
    CallbackError, CiphertextMessage, CiphertextMessageType, IdentityKey, KeyPair, PreKeyId,
    PreKeyStore, PreKeyWhisperMessage, ProtocolAddress, ProtocolError, PublicKey, Result,
    SessionBuilder, SessionLimits, SessionLockGuard, SessionLocks, SessionRecord, SessionStore,
    WhisperMessage,
};

/// Encrypts and decrypts messages exchanged with a single remote device.
///
/// Every operation loads the session record for the address, works on an in-memory copy, and
/// stores it back while holding the lock for that address in the shared [`SessionLocks`].
pub struct SessionCipher<'a> {
    remote_address: ProtocolAddress,
    session_store: &'a mut dyn SessionStore,
    pre_key_store: &'a mut dyn PreKeyStore,
    locks: &'a SessionLocks,
    limits: SessionLimits,
}

/// A successful decryption whose session update has not been saved yet.
///
/// The lock for the remote address stays held until this is committed or dropped. Dropping it
/// without calling [`commit`](Self::commit) abandons the update: the stored session is left as
/// it was, any one-time pre-key stays available, and the sender's identity is not saved, so the
/// same ciphertext can be decrypted again.
///
/// The lock is re-entrant, so the owning thread may use other ciphers in the meantime. Storing a
/// new record for the same address before committing makes the commit fail instead of
/// overwriting that record.
#[must_use = "the updated session is only saved by commit()"]
pub struct PendingDecryption<'c, 'a> {
    cipher: &'c mut SessionCipher<'a>,
    loaded: Vec<u8>,
    record: SessionRecord,
    plaintext: Vec<u8>,
    pre_key_id: Option<PreKeyId>,
    sender_identity: Option<(&'c mut dyn SessionBuilder, IdentityKey)>,
    _guard: SessionLockGuard<'a>,
}

impl PendingDecryption<'_, '_> {
    #[inline]
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// The one-time pre-key that [`commit`](Self::commit) will remove, if any.
    #[inline]
    pub fn pre_key_id(&self) -> Option<PreKeyId> {
        self.pre_key_id
    }

    /// Stores the updated session, removes the consumed one-time pre-key, saves the sender's
    /// identity, and releases the lock.
    pub fn commit(self) -> Result<Vec<u8>> {
        let Self {
            cipher,
            loaded,
            record,
            plaintext,
            pre_key_id,
            sender_identity,
            _guard,
        } = self;

        let remote_address = &cipher.remote_address;
        if cipher.session_store.load_session(remote_address)?.serialize() != loaded {
            log::error!(
                "{}: session was stored again while a decryption was pending, not committing",
                remote_address
            );
            return Err(ProtocolError::InvalidState(
                "commit",
                format!("session with {remote_address} changed since it was loaded"),
            ));
        }

        cipher.session_store.store_session(remote_address, &record)?;

        if let Some(pre_key_id) = pre_key_id {
            cipher.pre_key_store.remove_pre_key(pre_key_id)?;
        }

        if let Some((session_builder, identity_key)) = sender_identity {
            session_builder.session_committed(remote_address, &identity_key)?;
        }

        Ok(plaintext)
    }
}

impl fmt::Debug for PendingDecryption<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDecryption")
            .field("remote_address", &self.cipher.remote_address)
            .field("plaintext_len", &self.plaintext.len())
            .field("pre_key_id", &self.pre_key_id)
            .finish()
    }
}

impl<'a> SessionCipher<'a> {
    pub fn new(
        remote_address: ProtocolAddress,
        session_store: &'a mut dyn SessionStore,
        pre_key_store: &'a mut dyn PreKeyStore,
        locks: &'a SessionLocks,
    ) -> Self {
        Self {
            remote_address,
            session_store,
            pre_key_store,
            locks,
            limits: SessionLimits::default(),
        }
    }

    /// Replaces the default bounds. Fails with [`ProtocolError::InvalidArgument`] if
    /// [`SessionLimits::validate`] rejects `limits`.
    pub fn with_limits(mut self, limits: SessionLimits) -> Result<Self> {
        limits.validate()?;
        self.limits = limits;
        Ok(self)
    }

    #[inline]
    pub fn remote_address(&self) -> &ProtocolAddress {
        &self.remote_address
    }

    /// Encrypts `padded_plaintext` with the next key of the current sending chain.
    ///
    /// Until the remote side has replied, the result is a
    /// [`CiphertextMessage::PreKeyWhisperMessage`].
    pub fn encrypt(&mut self, padded_plaintext: &[u8]) -> Result<CiphertextMessage> {
        let locks = self.locks;
        let _guard = locks.lock(&self.remote_address);

        let mut session_record = self.session_store.load_session(&self.remote_address)?;
        let session_state = session_record
            .session_state_mut()
            .ok_or_else(|| ProtocolError::SessionNotFound(self.remote_address.clone()))?;

        let chain_key = session_state.get_sender_chain_key()?;

        let message_keys = chain_key.message_keys();

        let sender_ephemeral = session_state.sender_ratchet_key()?;
        let previous_counter = session_state.previous_counter();
        let session_version = u8::try_from(session_state.session_version())
            .map_err(|_| ProtocolError::InvalidSessionStructure("invalid session version"))?;

        let local_identity_key = session_state.local_identity_key()?;
        let their_identity_key = session_state.remote_identity_key()?.ok_or_else(|| {
            ProtocolError::InvalidState(
                "encrypt",
                format!("no remote identity key for {}", self.remote_address),
            )
        })?;

        let ctext = encrypt_body(session_version, &message_keys, padded_plaintext).map_err(|_| {
            log::error!("session state corrupt for {}", self.remote_address);
            ProtocolError::InvalidSessionStructure("invalid sender chain message keys")
        })?;

        let message = WhisperMessage::new(
            session_version,
            message_keys.mac_key(),
            sender_ephemeral,
            chain_key.index(),
            previous_counter,
            &ctext,
            &local_identity_key,
            &their_identity_key,
        )?;

        let message = if let Some(items) = session_state.unacknowledged_pre_key_message_items()? {
            let local_registration_id = session_state.local_registration_id();

            log::info!(
                "{}: session not yet acknowledged, sending as pre-key message (one-time pre-key {})",
                self.remote_address,
                items
                    .pre_key_id()
                    .map_or_else(|| "<none>".to_string(), |id| id.to_string())
            );

            CiphertextMessage::PreKeyWhisperMessage(PreKeyWhisperMessage::new(
                session_version,
                local_registration_id,
                items.pre_key_id(),
                items.signed_pre_key_id(),
                *items.base_key(),
                local_identity_key,
                message,
            )?)
        } else {
            CiphertextMessage::WhisperMessage(message)
        };

        session_state.set_sender_chain_key(&chain_key.next_chain_key())?;

        self.session_store
            .store_session(&self.remote_address, &session_record)?;
        Ok(message)
    }

    /// Decrypts either kind of two-party message. Sender-key messages are rejected.
    pub fn decrypt<'c, R: Rng + CryptoRng>(
        &'c mut self,
        ciphertext: &CiphertextMessage,
        session_builder: &'c mut dyn SessionBuilder,
        csprng: &mut R,
    ) -> Result<PendingDecryption<'c, 'a>> {
        match ciphertext {
            CiphertextMessage::WhisperMessage(m) => self.decrypt_signal(m, csprng),
            CiphertextMessage::PreKeyWhisperMessage(m) => {
                self.decrypt_prekey(m, session_builder, csprng)
            }
            CiphertextMessage::SenderKeyMessage(_) => Err(ProtocolError::InvalidArgument(format!(
                "SessionCipher cannot be used to decrypt {:?} messages",
                ciphertext.message_type()
            ))),
        }
    }

    /// Establishes (or reuses) the session described by `ciphertext` and decrypts the message it
    /// carries.
    ///
    /// The one-time pre-key it references is removed, and `session_builder` is told the session
    /// is in use, only when the result is committed.
    pub fn decrypt_prekey<'c, R: Rng + CryptoRng>(
        &'c mut self,
        ciphertext: &PreKeyWhisperMessage,
        session_builder: &'c mut dyn SessionBuilder,
        csprng: &mut R,
    ) -> Result<PendingDecryption<'c, 'a>> {
        let locks = self.locks;
        let guard = locks.lock(&self.remote_address);

        let mut session_record = self.session_store.load_session(&self.remote_address)?;
        let loaded = session_record.serialize();

        // Make sure we log the session state if we fail to process the pre-key.
        let pre_key_id_or_err = session_builder.process(
            &self.remote_address,
            &mut session_record,
            ciphertext,
            &*self.pre_key_store,
        );

        let pre_key_id = match pre_key_id_or_err {
            Ok(id) => id,
            Err(e) => {
                let errs = [e];
                log::error!(
                    "{}",
                    create_decryption_failure_log(
                        &self.remote_address,
                        &errs,
                        &session_record,
                        ciphertext.message()
                    )
                );
                let [e] = errs;
                return Err(e);
            }
        };

        let ptext = decrypt_message_with_record(
            &self.remote_address,
            &mut session_record,
            ciphertext.message(),
            CiphertextMessageType::PreKey,
            &self.limits,
            csprng,
        )?;

        Ok(PendingDecryption {
            cipher: self,
            loaded,
            record: session_record,
            plaintext: ptext,
            pre_key_id,
            sender_identity: Some((session_builder, *ciphertext.identity_key())),
            _guard: guard,
        })
    }

    /// Decrypts a message on an established session, trying archived states if the current one
    /// cannot.
    pub fn decrypt_signal<R: Rng + CryptoRng>(
        &mut self,
        ciphertext: &WhisperMessage,
        csprng: &mut R,
    ) -> Result<PendingDecryption<'_, 'a>> {
        let locks = self.locks;
        let guard = locks.lock(&self.remote_address);

        if !self.session_store.contains_session(&self.remote_address)? {
            return Err(ProtocolError::SessionNotFound(self.remote_address.clone()));
        }
        let mut session_record = self.session_store.load_session(&self.remote_address)?;
        let loaded = session_record.serialize();

        let ptext = decrypt_message_with_record(
            &self.remote_address,
            &mut session_record,
            ciphertext,
            CiphertextMessageType::Whisper,
            &self.limits,
            csprng,
        )?;

        Ok(PendingDecryption {
            cipher: self,
            loaded,
            record: session_record,
            plaintext: ptext,
            pre_key_id: None,
            sender_identity: None,
            _guard: guard,
        })
    }

    /// [`decrypt_prekey`](Self::decrypt_prekey), handing the plaintext to `callback` before the
    /// session update is committed. If the callback fails nothing is committed.
    ///
    /// The session lock is held while `callback` runs. The callback may use the engine for other
    /// addresses from the same thread.
    pub fn decrypt_prekey_with_callback<R, F>(
        &mut self,
        ciphertext: &PreKeyWhisperMessage,
        session_builder: &mut dyn SessionBuilder,
        csprng: &mut R,
        callback: F,
    ) -> Result<Vec<u8>>
    where
        R: Rng + CryptoRng,
        F: FnOnce(&[u8]) -> std::result::Result<(), CallbackError>,
    {
        let pending = self.decrypt_prekey(ciphertext, session_builder, csprng)?;
        run_callback(pending, callback)
    }

    /// [`decrypt_signal`](Self::decrypt_signal), handing the plaintext to `callback` before the
    /// session update is committed. If the callback fails nothing is committed.
    ///
    /// The session lock is held while `callback` runs. The callback may use the engine for other
    /// addresses from the same thread.
    pub fn decrypt_signal_with_callback<R, F>(
        &mut self,
        ciphertext: &WhisperMessage,
        csprng: &mut R,
        callback: F,
    ) -> Result<Vec<u8>>
    where
        R: Rng + CryptoRng,
        F: FnOnce(&[u8]) -> std::result::Result<(), CallbackError>,
    {
        let pending = self.decrypt_signal(ciphertext, csprng)?;
        run_callback(pending, callback)
    }
    pub fn remote_registration_id(&self) -> Result<u32> {
        let record = self.load_existing_session()?;
        self.current_state(&record)
            .map(SessionState::remote_registration_id)
    }

    pub fn session_version(&self) -> Result<u32> {
        let record = self.load_existing_session()?;
        self.current_state(&record).map(SessionState::session_version)
    }

    fn load_existing_session(&self) -> Result<SessionRecord> {
        let _guard = self.locks.lock(&self.remote_address);
        if !self.session_store.contains_session(&self.remote_address)? {
            return Err(ProtocolError::SessionNotFound(self.remote_address.clone()));
        }
        self.session_store.load_session(&self.remote_address)
    }

    fn current_state<'r>(&self, record: &'r SessionRecord) -> Result<&'r SessionState> {
        record
            .session_state()
            .ok_or_else(|| ProtocolError::SessionNotFound(self.remote_address.clone()))
    }
}

fn run_callback<F>(pending: PendingDecryption<'_, '_>, callback: F) -> Result<Vec<u8>>
where
    F: FnOnce(&[u8]) -> std::result::Result<(), CallbackError>,
{
    callback(pending.plaintext())
        .map_err(|e| ProtocolError::ApplicationCallbackError("decrypt", e))?;
    pending.commit()
}

fn encrypt_body(
    session_version: u8,
    message_keys: &MessageKeys,
    ptext: &[u8],
) -> std::result::Result<Vec<u8>, crypto::EncryptionError> {
    if session_version >= 3 {
        crypto::aes_256_cbc_encrypt(ptext, message_keys.cipher_key(), message_keys.iv())
    } else {
        crypto::aes_256_ctr_with_counter(ptext, message_keys.cipher_key(), message_keys.counter())
    }
}

fn decrypt_body(
    session_version: u8,
    message_keys: &MessageKeys,
    ctext: &[u8],
) -> std::result::Result<Vec<u8>, crypto::DecryptionError> {
    if session_version >= 3 {
        crypto::aes_256_cbc_decrypt(ctext, message_keys.cipher_key(), message_keys.iv())
    } else {
        crypto::aes_256_ctr_with_counter(ctext, message_keys.cipher_key(), message_keys.counter())
            .map_err(|_| crypto::DecryptionError::BadKeyOrIv)
    }
}

/// A multi-line summary of every candidate state, for the log line that accompanies a failed
/// decryption. `errs` lines up with the candidates in the order they were tried.
fn create_decryption_failure_log(
    remote_address: &ProtocolAddress,
    errs: &[ProtocolError],
    record: &SessionRecord,
    ciphertext: &WhisperMessage,
) -> String {
    let mut lines = vec![format!(
        "{} could not decrypt message with ratchet key {} and counter {}",
        remote_address,
        hex::encode(ciphertext.sender_ratchet_key().public_key_bytes()),
        ciphertext.counter()
    )];

    let current = record.session_state();
    if current.is_none() {
        lines.push("  no current state".to_owned());
    }

    let candidates = current
        .map(|state| (CurrentOrPrevious::Current, state))
        .into_iter()
        .chain(
            record
                .previous_session_states()
                .map(|state| (CurrentOrPrevious::Previous, state)),
        );
    let errs = errs.iter().map(Some).chain(std::iter::repeat(None));

    for (idx, ((which, state), err)) in candidates.zip(errs).enumerate() {
        let chains = state.all_receiver_chain_logging_info();
        let outcome = err.map_or_else(|| "not tried".to_owned(), |e| format!("failed with '{e}'"));
        lines.push(format!(
            "  candidate {idx} ({which}, ratchet key {}): {outcome}, {} receiver chain(s)",
            state.sender_ratchet_key_for_logging(),
            chains.len()
        ));
        for (sender_ratchet_key, index) in chains {
            lines.push(format!(
                "    receiver chain {} at index {}",
                hex::encode(sender_ratchet_key),
                index.map_or_else(|| "<missing>".to_owned(), |i| i.to_string())
            ));
        }
    }

    lines.join("\n")
}

fn decrypt_message_with_record<R: Rng + CryptoRng>(
    remote_address: &ProtocolAddress,
    record: &mut SessionRecord,
    ciphertext: &WhisperMessage,
    original_message_type: CiphertextMessageType,
    limits: &SessionLimits,
    csprng: &mut R,
) -> Result<Vec<u8>> {
    debug_assert!(matches!(
        original_message_type,
        CiphertextMessageType::Whisper | CiphertextMessageType::PreKey
    ));

    // Several candidates are usually tried, so a single failure is only a warning.
    let log_candidate_failure =
        |which: CurrentOrPrevious, state: &SessionState, error: &ProtocolError| {
            log::warn!(
                "{}: {} state (ratchet key {}, previous counter {}) rejected {:?} message \
                 with ratchet key {} and counter {}: {}",
                remote_address,
                which,
                state.sender_ratchet_key_for_logging(),
                state.previous_counter(),
                original_message_type,
                hex::encode(ciphertext.sender_ratchet_key().public_key_bytes()),
                ciphertext.counter(),
                error
            );
        };

    let mut errs = vec![];

    if let Some(current) = record.session_state() {
        let mut candidate = current.clone();
        match decrypt_message_with_state(
            CurrentOrPrevious::Current,
            &mut candidate,
            ciphertext,
            original_message_type,
            remote_address,
            limits,
            csprng,
        ) {
            Ok(ptext) => {
                log::info!(
                    "{}: decrypted {:?} message with current state",
                    remote_address,
                    original_message_type
                );
                record.set_session_state(candidate);
                return Ok(ptext);
            }
            Err(e @ ProtocolError::DuplicatedMessage(..)) => return Err(e),
            Err(e) => {
                log_candidate_failure(CurrentOrPrevious::Current, &candidate, &e);
                errs.push(e);
            }
        }
    }

    let mut promoted = None;
    for (idx, previous) in record.previous_session_states().enumerate() {
        let mut candidate = previous.clone();
        match decrypt_message_with_state(
            CurrentOrPrevious::Previous,
            &mut candidate,
            ciphertext,
            original_message_type,
            remote_address,
            limits,
            csprng,
        ) {
            Ok(ptext) => {
                promoted = Some((idx, candidate, ptext));
                break;
            }
            Err(e @ ProtocolError::DuplicatedMessage(..)) => return Err(e),
            Err(e) => {
                log_candidate_failure(CurrentOrPrevious::Previous, &candidate, &e);
                errs.push(e);
            }
        }
    }

    if let Some((idx, candidate, ptext)) = promoted {
        log::info!(
            "{}: decrypted {:?} message with archived state {}, promoting it",
            remote_address,
            original_message_type,
            idx
        );
        record.promote_old_session(idx, candidate, limits)?;
        return Ok(ptext);
    }

    log::error!(
        "no valid session for {} among {} candidate state(s)",
        remote_address,
        errs.len()
    );
    log::error!(
        "{}",
        create_decryption_failure_log(remote_address, &errs, record, ciphertext)
    );
    Err(ProtocolError::NoValidSession {
        address: remote_address.clone(),
        errors: errs,
    })
}

#[derive(Clone, Copy)]
enum CurrentOrPrevious {
    Current,
    Previous,
}

impl fmt::Display for CurrentOrPrevious {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Previous => write!(f, "previous"),
        }
    }
}

fn decrypt_message_with_state<R: Rng + CryptoRng>(
    current_or_previous: CurrentOrPrevious,
    state: &mut SessionState,
    ciphertext: &WhisperMessage,
    original_message_type: CiphertextMessageType,
    remote_address: &ProtocolAddress,
    limits: &SessionLimits,
    csprng: &mut R,
) -> Result<Vec<u8>> {
    if !state.has_sender_chain() {
        return Err(ProtocolError::UninitializedSession);
    }

    let ciphertext_version = ciphertext.message_version();
    if u32::from(ciphertext_version) != state.session_version() {
        return Err(ProtocolError::UnrecognizedMessageVersion(
            ciphertext_version.into(),
        ));
    }

    let their_ephemeral = ciphertext.sender_ratchet_key();
    let counter = ciphertext.counter();
    let chain_key = get_or_create_chain_key(state, their_ephemeral, remote_address, limits, csprng)?;
    let message_keys = get_or_create_message_key(
        state,
        their_ephemeral,
        remote_address,
        original_message_type,
        &chain_key,
        counter,
        limits,
    )?;

    let their_identity_key =
        state
            .remote_identity_key()?
            .ok_or(ProtocolError::InvalidSessionStructure(
                "cannot decrypt without remote identity key",
            ))?;

    let mac_valid = ciphertext.verify_mac(
        &their_identity_key,
        &state.local_identity_key()?,
        message_keys.mac_key(),
    )?;

    if !mac_valid {
        return Err(ProtocolError::InvalidMessage(
            original_message_type,
            "MAC verification failed",
        ));
    }

    let ptext = match decrypt_body(ciphertext_version, &message_keys, ciphertext.body()) {
        Ok(ptext) => ptext,
        Err(crypto::DecryptionError::BadKeyOrIv) => {
            log::warn!(
                "{} session state corrupt for {}",
                current_or_previous,
                remote_address,
            );
            return Err(ProtocolError::InvalidSessionStructure(
                "invalid receiver chain message keys",
            ));
        }
        Err(crypto::DecryptionError::BadCiphertext(msg)) => {
            log::warn!("failed to decrypt 1:1 message: {}", msg);
            return Err(ProtocolError::InvalidMessage(
                original_message_type,
                "failed to decrypt",
            ));
        }
    };

    state.clear_unacknowledged_pre_key_message();

    Ok(ptext)
}

fn get_or_create_chain_key<R: Rng + CryptoRng>(
    state: &mut SessionState,
    their_ephemeral: &PublicKey,
    remote_address: &ProtocolAddress,
    limits: &SessionLimits,
    csprng: &mut R,
) -> Result<ChainKey> {
    if let Some(chain) = state.get_receiver_chain_key(their_ephemeral)? {
        log::debug!("{} has existing receiver chain.", remote_address);
        return Ok(chain);
    }

    log::info!("{} creating new chains.", remote_address);

    let root_key = state.root_key()?;
    let our_ephemeral = state.sender_ratchet_private_key()?;
    let (receiver_root_key, receiver_chain_key) =
        root_key.create_chain(their_ephemeral, &our_ephemeral);
    let our_new_ephemeral = KeyPair::generate(csprng);
    let (sender_root_key, sender_chain_key) =
        receiver_root_key.create_chain(their_ephemeral, &our_new_ephemeral.private_key);

    state.set_root_key(&sender_root_key);
    state.add_receiver_chain(their_ephemeral, &receiver_chain_key, limits);

    let current_index = state.get_sender_chain_key()?.index();
    state.set_previous_counter(current_index.saturating_sub(1));
    state.set_sender_chain(&our_new_ephemeral, &sender_chain_key);

    Ok(receiver_chain_key)
}

fn get_or_create_message_key(
    state: &mut SessionState,
    their_ephemeral: &PublicKey,
    remote_address: &ProtocolAddress,
    original_message_type: CiphertextMessageType,
    chain_key: &ChainKey,
    counter: u32,
    limits: &SessionLimits,
) -> Result<MessageKeys> {
    let chain_index = chain_key.index();

    if chain_index > counter {
        return match state.get_message_keys(their_ephemeral, counter)? {
            Some(keys) => Ok(keys),
            None => {
                log::info!(
                    "{} Duplicate message for counter: {}",
                    remote_address,
                    counter
                );
                Err(ProtocolError::DuplicatedMessage(chain_index, counter))
            }
        };
    }

    let jump = (counter - chain_index) as usize;

    if jump > limits.max_forward_jumps {
        log::error!(
            "{} Exceeded future message limit: {}, index: {}, counter: {})",
            remote_address,
            limits.max_forward_jumps,
            chain_index,
            counter
        );
        return Err(ProtocolError::InvalidMessage(
            original_message_type,
            "message from too far into the future",
        ));
    }

    let mut chain_key = chain_key.clone();

    while chain_key.index() < counter {
        let message_keys = chain_key.message_keys();
        state.set_message_keys(their_ephemeral, &message_keys, limits)?;
        chain_key = chain_key.next_chain_key();
    }

    state.set_receiver_chain_key(their_ephemeral, &chain_key.next_chain_key())?;
    Ok(chain_key.message_keys())
}
