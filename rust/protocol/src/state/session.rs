//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::VecDeque;

use prost::Message;

use crate::consts::SessionLimits;
use crate::proto::storage::{session_structure, RecordStructure, SessionStructure};
use crate::ratchet::{ChainKey, MessageKeys, RootKey};
use crate::state::{PreKeyId, SignedPreKeyId};
use crate::{IdentityKey, KeyPair, PrivateKey, ProtocolError, PublicKey, Result, HKDF};

/// Bootstrap material attached to every outgoing message until the peer has replied.
#[derive(Debug, Clone)]
pub(crate) struct UnacknowledgedPreKeyMessageItems {
    pre_key_id: Option<PreKeyId>,
    signed_pre_key_id: SignedPreKeyId,
    base_key: PublicKey,
}

impl UnacknowledgedPreKeyMessageItems {
    pub(crate) fn pre_key_id(&self) -> Option<PreKeyId> {
        self.pre_key_id
    }

    pub(crate) fn signed_pre_key_id(&self) -> SignedPreKeyId {
        self.signed_pre_key_id
    }

    pub(crate) fn base_key(&self) -> &PublicKey {
        &self.base_key
    }
}

fn chain_key_from_pb(
    kdf: HKDF,
    chain_key: Option<&session_structure::chain::ChainKey>,
) -> Result<ChainKey> {
    let chain_key =
        chain_key.ok_or(ProtocolError::InvalidSessionStructure("chain has no chain key"))?;
    let key = chain_key
        .key
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::InvalidSessionStructure("invalid chain key length"))?;
    Ok(ChainKey::new(kdf, key, chain_key.index))
}

fn chain_key_to_pb(chain_key: &ChainKey) -> session_structure::chain::ChainKey {
    session_structure::chain::ChainKey {
        index: chain_key.index(),
        key: chain_key.key().to_vec(),
    }
}

/// One side's snapshot of a ratcheting session.
#[derive(Clone, Debug)]
pub(crate) struct SessionState {
    session: SessionStructure,
}

impl SessionState {
    pub(crate) fn from_session_structure(session: SessionStructure) -> Self {
        Self { session }
    }

    pub(crate) fn new(
        version: u32,
        our_identity: &IdentityKey,
        their_identity: &IdentityKey,
        root_key: &RootKey,
        alice_base_key: &PublicKey,
    ) -> Self {
        Self {
            session: SessionStructure {
                session_version: version,
                local_identity_public: our_identity.serialize().into_vec(),
                remote_identity_public: their_identity.serialize().into_vec(),
                root_key: root_key.key().to_vec(),
                previous_counter: 0,
                sender_chain: None,
                receiver_chains: vec![],
                pending_pre_key: None,
                remote_registration_id: 0,
                local_registration_id: 0,
                alice_base_key: alice_base_key.serialize().into_vec(),
            },
        }
    }

    /// Seeds a freshly initialized state with its first receiving chain.
    pub(crate) fn with_receiver_chain(mut self, sender: &PublicKey, chain_key: &ChainKey) -> Self {
        self.add_receiver_chain(sender, chain_key, &SessionLimits::default());
        self
    }

    pub(crate) fn with_sender_chain(mut self, sender: &KeyPair, next_chain_key: &ChainKey) -> Self {
        self.set_sender_chain(sender, next_chain_key);
        self
    }

    pub(crate) fn alice_base_key(&self) -> &[u8] {
        &self.session.alice_base_key
    }

    /// Sessions written before versions were recorded are version 2.
    pub(crate) fn session_version(&self) -> u32 {
        match self.session.session_version {
            0 => 2,
            v => v,
        }
    }

    fn kdf(&self) -> Result<HKDF> {
        HKDF::new(self.session_version())
    }

    pub(crate) fn remote_identity_key(&self) -> Result<Option<IdentityKey>> {
        match self.session.remote_identity_public.len() {
            0 => Ok(None),
            _ => Ok(Some(IdentityKey::decode(
                &self.session.remote_identity_public,
            )?)),
        }
    }

    pub(crate) fn local_identity_key(&self) -> Result<IdentityKey> {
        IdentityKey::decode(&self.session.local_identity_public)
    }

    pub(crate) fn previous_counter(&self) -> u32 {
        self.session.previous_counter
    }

    pub(crate) fn set_previous_counter(&mut self, ctr: u32) {
        self.session.previous_counter = ctr;
    }

    pub(crate) fn root_key(&self) -> Result<RootKey> {
        let key = self
            .session
            .root_key
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidSessionStructure("invalid root key length"))?;
        Ok(RootKey::new(self.kdf()?, key))
    }

    pub(crate) fn set_root_key(&mut self, root_key: &RootKey) {
        self.session.root_key = root_key.key().to_vec();
    }

    /// A state without a sending chain is uninitialized: it can neither encrypt nor decrypt.
    pub(crate) fn has_sender_chain(&self) -> bool {
        self.session.sender_chain.is_some()
    }

    fn sender_chain(&self) -> Result<&session_structure::Chain> {
        self.session
            .sender_chain
            .as_ref()
            .ok_or(ProtocolError::UninitializedSession)
    }

    pub(crate) fn sender_ratchet_key(&self) -> Result<PublicKey> {
        PublicKey::deserialize(&self.sender_chain()?.sender_ratchet_key)
    }

    pub(crate) fn sender_ratchet_key_for_logging(&self) -> String {
        match self.sender_ratchet_key() {
            Ok(key) => hex::encode(key.public_key_bytes()),
            Err(e) => format!("<error: {e}>"),
        }
    }

    pub(crate) fn sender_ratchet_private_key(&self) -> Result<PrivateKey> {
        PrivateKey::deserialize(&self.sender_chain()?.sender_ratchet_key_private)
    }

    pub(crate) fn get_sender_chain_key(&self) -> Result<ChainKey> {
        chain_key_from_pb(self.kdf()?, self.sender_chain()?.chain_key.as_ref())
    }

    pub(crate) fn set_sender_chain(&mut self, sender: &KeyPair, next_chain_key: &ChainKey) {
        self.session.sender_chain = Some(session_structure::Chain {
            sender_ratchet_key: sender.public_key.serialize().into_vec(),
            sender_ratchet_key_private: sender.private_key.serialize(),
            chain_key: Some(chain_key_to_pb(next_chain_key)),
            message_keys: vec![],
        });
    }

    pub(crate) fn set_sender_chain_key(&mut self, next_chain_key: &ChainKey) -> Result<()> {
        let chain = self
            .session
            .sender_chain
            .as_mut()
            .ok_or(ProtocolError::UninitializedSession)?;
        chain.chain_key = Some(chain_key_to_pb(next_chain_key));
        Ok(())
    }

    pub(crate) fn all_receiver_chain_logging_info(&self) -> Vec<(Vec<u8>, Option<u32>)> {
        self.session
            .receiver_chains
            .iter()
            .map(|chain| {
                (
                    chain.sender_ratchet_key.clone(),
                    chain.chain_key.as_ref().map(|chain_key| chain_key.index),
                )
            })
            .collect()
    }

    fn receiver_chain_index(&self, sender: &PublicKey) -> Result<Option<usize>> {
        for (idx, chain) in self.session.receiver_chains.iter().enumerate() {
            // Decode rather than compare bytes, so that keys stored with trailing data still
            // match.
            if PublicKey::deserialize(&chain.sender_ratchet_key)? == *sender {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub(crate) fn get_receiver_chain_key(&self, sender: &PublicKey) -> Result<Option<ChainKey>> {
        match self.receiver_chain_index(sender)? {
            None => Ok(None),
            Some(idx) => Ok(Some(chain_key_from_pb(
                self.kdf()?,
                self.session.receiver_chains[idx].chain_key.as_ref(),
            )?)),
        }
    }

    pub(crate) fn add_receiver_chain(
        &mut self,
        sender: &PublicKey,
        chain_key: &ChainKey,
        limits: &SessionLimits,
    ) {
        self.session.receiver_chains.push(session_structure::Chain {
            sender_ratchet_key: sender.serialize().into_vec(),
            sender_ratchet_key_private: vec![],
            chain_key: Some(chain_key_to_pb(chain_key)),
            message_keys: vec![],
        });

        let excess = self
            .session
            .receiver_chains
            .len()
            .saturating_sub(limits.max_receiver_chains);
        if excess > 0 {
            log::info!(
                "Trimming excessive receiver_chain for session with ratchet key {}, chain count: {}",
                self.sender_ratchet_key_for_logging(),
                self.session.receiver_chains.len()
            );
            self.session.receiver_chains.drain(..excess);
        }
    }

    pub(crate) fn set_receiver_chain_key(
        &mut self,
        sender: &PublicKey,
        chain_key: &ChainKey,
    ) -> Result<()> {
        let idx = self.receiver_chain_index(sender)?.ok_or_else(|| {
            ProtocolError::InvalidState("set_receiver_chain_key", "No receiver".to_owned())
        })?;
        self.session.receiver_chains[idx].chain_key = Some(chain_key_to_pb(chain_key));
        Ok(())
    }

    /// Removes and returns the cached key for `counter` on the chain for `sender`, if any.
    pub(crate) fn get_message_keys(
        &mut self,
        sender: &PublicKey,
        counter: u32,
    ) -> Result<Option<MessageKeys>> {
        let Some(idx) = self.receiver_chain_index(sender)? else {
            return Ok(None);
        };
        let chain = &mut self.session.receiver_chains[idx];
        let Some(position) = chain.message_keys.iter().position(|m| m.index == counter) else {
            return Ok(None);
        };
        let message_key = chain.message_keys.remove(position);
        MessageKeys::from_pb(&message_key)
            .map(Some)
            .map_err(ProtocolError::InvalidSessionStructure)
    }

    /// Caches a skipped key, newest first.
    ///
    /// The cap covers every receiving chain of this state. Past it, keys are evicted from the
    /// oldest chain first, lowest index first.
    pub(crate) fn set_message_keys(
        &mut self,
        sender: &PublicKey,
        message_keys: &MessageKeys,
        limits: &SessionLimits,
    ) -> Result<()> {
        let idx = self.receiver_chain_index(sender)?.ok_or_else(|| {
            ProtocolError::InvalidState("set_message_keys", "No receiver".to_owned())
        })?;
        self.session.receiver_chains[idx]
            .message_keys
            .insert(0, message_keys.to_pb());

        let cached: usize = self
            .session
            .receiver_chains
            .iter()
            .map(|chain| chain.message_keys.len())
            .sum();
        let mut excess = cached.saturating_sub(limits.max_message_keys);
        for chain in &mut self.session.receiver_chains {
            if excess == 0 {
                break;
            }
            let keep = chain.message_keys.len().saturating_sub(excess);
            excess -= chain.message_keys.len() - keep;
            chain.message_keys.truncate(keep);
        }
        Ok(())
    }

    pub(crate) fn set_unacknowledged_pre_key_message(
        &mut self,
        pre_key_id: Option<PreKeyId>,
        signed_pre_key_id: SignedPreKeyId,
        base_key: &PublicKey,
    ) {
        self.session.pending_pre_key = Some(session_structure::PendingPreKey {
            pre_key_id: pre_key_id.map(Into::into),
            signed_pre_key_id: signed_pre_key_id.into(),
            base_key: base_key.serialize().into_vec(),
        });
    }

    pub(crate) fn unacknowledged_pre_key_message_items(
        &self,
    ) -> Result<Option<UnacknowledgedPreKeyMessageItems>> {
        let Some(pending_pre_key) = &self.session.pending_pre_key else {
            return Ok(None);
        };
        Ok(Some(UnacknowledgedPreKeyMessageItems {
            pre_key_id: pending_pre_key.pre_key_id.map(Into::into),
            signed_pre_key_id: pending_pre_key.signed_pre_key_id.into(),
            base_key: PublicKey::deserialize(&pending_pre_key.base_key)?,
        }))
    }

    pub(crate) fn clear_unacknowledged_pre_key_message(&mut self) {
        self.session.pending_pre_key = None;
    }

    pub(crate) fn set_remote_registration_id(&mut self, registration_id: u32) {
        self.session.remote_registration_id = registration_id;
    }

    pub(crate) fn remote_registration_id(&self) -> u32 {
        self.session.remote_registration_id
    }

    pub(crate) fn set_local_registration_id(&mut self, registration_id: u32) {
        self.session.local_registration_id = registration_id;
    }

    pub(crate) fn local_registration_id(&self) -> u32 {
        self.session.local_registration_id
    }
}

/// A session's current state plus the states it superseded.
///
/// History is ordered newest first and bounded by
/// [`SessionLimits::max_archived_states`]; whenever a new state becomes current the old one is
/// pushed onto the front and the oldest entries fall off the back.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    current_session: Option<SessionState>,
    previous_sessions: VecDeque<SessionState>,
}

impl SessionRecord {
    pub fn new_fresh() -> Self {
        Self {
            current_session: None,
            previous_sessions: VecDeque::new(),
        }
    }

    pub(crate) fn new(state: SessionState) -> Self {
        Self {
            current_session: Some(state),
            previous_sessions: VecDeque::new(),
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let record = RecordStructure::decode(bytes)?;
        Ok(Self {
            current_session: record
                .current_session
                .map(SessionState::from_session_structure),
            previous_sessions: record
                .previous_sessions
                .into_iter()
                .map(SessionState::from_session_structure)
                .collect(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        RecordStructure {
            current_session: self.current_session.as_ref().map(|s| s.session.clone()),
            previous_sessions: self
                .previous_sessions
                .iter()
                .map(|s| s.session.clone())
                .collect(),
        }
        .encode_to_vec()
    }

    /// Whether any state, current or archived, was established from `alice_base_key`.
    pub(crate) fn has_session_state(&self, version: u32, alice_base_key: &[u8]) -> bool {
        self.current_session
            .iter()
            .chain(self.previous_sessions.iter())
            .any(|state| {
                state.session_version() == version && state.alice_base_key() == alice_base_key
            })
    }

    pub fn has_current_session_state(&self) -> bool {
        self.current_session.is_some()
    }

    pub fn previous_session_count(&self) -> usize {
        self.previous_sessions.len()
    }

    pub(crate) fn session_state(&self) -> Option<&SessionState> {
        self.current_session.as_ref()
    }

    pub(crate) fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current_session.as_mut()
    }

    pub(crate) fn set_session_state(&mut self, session: SessionState) {
        self.current_session = Some(session);
    }

    pub(crate) fn previous_session_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous_sessions.iter()
    }

    /// Replaces the archived state at `old_session` (an index into
    /// [`previous_session_states`](Self::previous_session_states)) with `updated_session` and
    /// makes it current.
    pub(crate) fn promote_old_session(
        &mut self,
        old_session: usize,
        updated_session: SessionState,
        limits: &SessionLimits,
    ) -> Result<()> {
        self.previous_sessions.remove(old_session).ok_or_else(|| {
            ProtocolError::InvalidState("promote_old_session", "out of range".into())
        })?;
        self.promote_state(updated_session, limits);
        Ok(())
    }

    pub(crate) fn promote_state(&mut self, new_state: SessionState, limits: &SessionLimits) {
        self.archive_current_state(limits);
        self.current_session = Some(new_state);
    }

    /// Moves the current state (if any) to the front of the history.
    pub fn archive_current_state(&mut self, limits: &SessionLimits) {
        let Some(current) = self.current_session.take() else {
            log::info!("Skipping archive, current session state is fresh");
            return;
        };
        self.previous_sessions.push_front(current);
        if self.previous_sessions.len() > limits.max_archived_states {
            log::debug!(
                "discarding {} archived session state(s)",
                self.previous_sessions.len() - limits.max_archived_states
            );
            self.previous_sessions.truncate(limits.max_archived_states);
        }
    }

    fn current_or_not_found(&self) -> Result<&SessionState> {
        self.current_session.as_ref().ok_or_else(|| {
            ProtocolError::InvalidState("session_state", "No session".to_owned())
        })
    }

    pub fn remote_registration_id(&self) -> Result<u32> {
        Ok(self.current_or_not_found()?.remote_registration_id())
    }

    pub fn local_registration_id(&self) -> Result<u32> {
        Ok(self.current_or_not_found()?.local_registration_id())
    }

    pub fn session_version(&self) -> Result<u32> {
        Ok(self.current_or_not_found()?.session_version())
    }

    pub fn local_identity_key_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .current_or_not_found()?
            .local_identity_key()?
            .serialize()
            .into_vec())
    }

    pub fn remote_identity_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .current_or_not_found()?
            .remote_identity_key()?
            .map(|key| key.serialize().into_vec()))
    }

    pub fn alice_base_key(&self) -> Result<&[u8]> {
        Ok(self.current_or_not_found()?.alice_base_key())
    }

    pub fn get_receiver_chain_key_bytes(&self, sender: &PublicKey) -> Result<Option<Vec<u8>>> {
        Ok(self
            .current_or_not_found()?
            .get_receiver_chain_key(sender)?
            .map(|chain_key| chain_key.key().to_vec()))
    }

    pub fn get_sender_chain_key_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .current_or_not_found()?
            .get_sender_chain_key()?
            .key()
            .to_vec())
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new_fresh()
    }
}
