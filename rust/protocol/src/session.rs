//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use rand::{CryptoRng, Rng};

use crate::ratchet::{AliceProtocolParameters, BobProtocolParameters};
use crate::{
    ratchet, CiphertextMessageType, Direction, IdentityKey, IdentityKeyStore, KeyPair,
    PreKeyBundle, PreKeyId,
    PreKeyStore, PreKeyWhisperMessage, ProtocolAddress, ProtocolError, Result, SessionLimits,
    SessionRecord, SessionStore, SignedPreKeyStore,
};

/// Folds the bootstrap material of an incoming [`PreKeyWhisperMessage`] into a session record.
///
/// [`SessionCipher::decrypt_prekey`](crate::SessionCipher::decrypt_prekey) calls this before
/// decrypting the embedded message. The pre-key store is lent read-only: the cipher itself
/// removes the returned pre-key id once the decrypted record has been committed, then calls
/// [`session_committed`](Self::session_committed).
pub trait SessionBuilder {
    /// Updates `session_record` so that it can decrypt `message`.
    ///
    /// Returns the one-time pre-key consumed by this message, if any.
    fn process(
        &mut self,
        remote_address: &ProtocolAddress,
        session_record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
        pre_key_store: &dyn PreKeyStore,
    ) -> Result<Option<PreKeyId>>;

    /// Called after a record updated by [`process`](Self::process) has been stored, with the
    /// identity the message was sent from. Not called if the decryption is abandoned.
    fn session_committed(
        &mut self,
        _remote_address: &ProtocolAddress,
        _their_identity_key: &IdentityKey,
    ) -> Result<()> {
        Ok(())
    }
}

/// The receiving half of the X3DH handshake, backed by the caller's identity and signed pre-key
/// stores.
pub struct PreKeySessionBuilder<'a> {
    identity_store: &'a mut dyn IdentityKeyStore,
    signed_pre_key_store: &'a dyn SignedPreKeyStore,
    limits: SessionLimits,
}

impl<'a> PreKeySessionBuilder<'a> {
    pub fn new(
        identity_store: &'a mut dyn IdentityKeyStore,
        signed_pre_key_store: &'a dyn SignedPreKeyStore,
    ) -> Self {
        Self {
            identity_store,
            signed_pre_key_store,
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

    fn process_impl(
        &self,
        remote_address: &ProtocolAddress,
        session_record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
        pre_key_store: &dyn PreKeyStore,
    ) -> Result<Option<PreKeyId>> {
        if session_record.has_session_state(
            message.message_version().into(),
            &message.base_key().serialize(),
        ) {
            // We've already setup a session for this message, letting bundled message fall through
            return Ok(None);
        }

        let signed_pre_key_id = message.signed_pre_key_id().ok_or(
            ProtocolError::InvalidMessage(CiphertextMessageType::PreKey, "no signed pre key id"),
        )?;
        let our_signed_pre_key_pair = self
            .signed_pre_key_store
            .get_signed_pre_key(signed_pre_key_id)?
            .key_pair();

        let our_one_time_pre_key_pair = if let Some(pre_key_id) = message.pre_key_id() {
            log::info!("processing PreKey message from {}", remote_address);
            Some(pre_key_store.get_pre_key(pre_key_id)?.key_pair())
        } else {
            log::warn!(
                "processing PreKey message from {} which had no one-time prekey",
                remote_address
            );
            None
        };

        let parameters = BobProtocolParameters::new(
            self.identity_store.get_identity_key_pair()?,
            our_signed_pre_key_pair, // signed pre key
            our_one_time_pre_key_pair,
            our_signed_pre_key_pair, // ratchet key
            *message.identity_key(),
            *message.base_key(),
        )
        .with_session_version(message.message_version());

        let mut new_session = ratchet::initialize_bob_session(&parameters)?;

        new_session.set_local_registration_id(self.identity_store.get_local_registration_id()?);
        new_session.set_remote_registration_id(message.registration_id());

        session_record.promote_state(new_session, &self.limits);

        Ok(message.pre_key_id())
    }
}

impl SessionBuilder for PreKeySessionBuilder<'_> {
    fn process(
        &mut self,
        remote_address: &ProtocolAddress,
        session_record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
        pre_key_store: &dyn PreKeyStore,
    ) -> Result<Option<PreKeyId>> {
        if message.message_version() != 3 {
            return Err(ProtocolError::UnrecognizedMessageVersion(
                message.message_version().into(),
            ));
        }

        let their_identity_key = message.identity_key();

        if !self.identity_store.is_trusted_identity(
            remote_address,
            their_identity_key,
            Direction::Receiving,
        )? {
            return Err(ProtocolError::UntrustedIdentity(remote_address.clone()));
        }

        self.process_impl(remote_address, session_record, message, pre_key_store)
    }

    fn session_committed(
        &mut self,
        remote_address: &ProtocolAddress,
        their_identity_key: &IdentityKey,
    ) -> Result<()> {
        self.identity_store
            .save_identity(remote_address, their_identity_key)?;
        Ok(())
    }
}

/// The initiating half of the X3DH handshake: builds a session with the owner of `bundle` and
/// stores it, ready for [`SessionCipher::encrypt`](crate::SessionCipher::encrypt).
///
/// Messages sent on the new session are wrapped as [`PreKeyWhisperMessage`]s until the first reply
/// arrives.
pub fn process_prekey_bundle<R: Rng + CryptoRng>(
    remote_address: &ProtocolAddress,
    session_store: &mut dyn SessionStore,
    identity_store: &mut dyn IdentityKeyStore,
    bundle: &PreKeyBundle,
    limits: &SessionLimits,
    mut csprng: &mut R,
) -> Result<()> {
    limits.validate()?;

    let their_identity_key = bundle.identity_key();

    if !identity_store.is_trusted_identity(remote_address, their_identity_key, Direction::Sending)?
    {
        return Err(ProtocolError::UntrustedIdentity(remote_address.clone()));
    }

    if !their_identity_key.public_key().verify_signature(
        &bundle.signed_pre_key_public().serialize(),
        bundle.signed_pre_key_signature(),
    ) {
        return Err(ProtocolError::SignatureValidationFailed);
    }

    let mut session_record = session_store.load_session(remote_address)?;

    let our_base_key_pair = KeyPair::generate(&mut csprng);
    let their_signed_prekey = bundle.signed_pre_key_public();

    let their_one_time_prekey_id = bundle.pre_key_id();

    let our_identity_key_pair = identity_store.get_identity_key_pair()?;

    let mut parameters = AliceProtocolParameters::new(
        our_identity_key_pair,
        our_base_key_pair,
        *their_identity_key,
        their_signed_prekey,
        their_signed_prekey,
    );
    if let Some(key) = bundle.pre_key_public() {
        parameters = parameters.with_their_one_time_pre_key(key);
    }

    let mut session = ratchet::initialize_alice_session(&parameters, csprng)?;

    log::info!(
        "set_unacknowledged_pre_key_message for: {} with preKeyId: {}",
        remote_address,
        their_one_time_prekey_id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
    );

    session.set_unacknowledged_pre_key_message(
        their_one_time_prekey_id,
        bundle.signed_pre_key_id(),
        &our_base_key_pair.public_key,
    );

    session.set_local_registration_id(identity_store.get_local_registration_id()?);
    session.set_remote_registration_id(bundle.registration_id());

    identity_store.save_identity(remote_address, their_identity_key)?;

    session_record.promote_state(session, limits);

    session_store.store_session(remote_address, &session_record)?;

    Ok(())
}
