//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

mod keys;
mod params;

use arrayref::array_ref;
use rand::{CryptoRng, Rng};

pub(crate) use self::keys::{ChainKey, MessageKeys, RootKey};
pub use self::params::{AliceProtocolParameters, BobProtocolParameters};
use crate::state::SessionState;
use crate::{KeyPair, Result, SessionRecord, HKDF};

/// Accumulates the X3DH agreements for `version`; one-time pre-keys and the leading
/// discontinuity block only exist from version 3 on.
struct MasterSecret {
    version: u8,
    secrets: Vec<u8>,
}

impl MasterSecret {
    fn new(version: u8) -> Self {
        let mut secrets = Vec::with_capacity(32 * 5);
        if version >= 3 {
            secrets.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"
        }
        Self { version, secrets }
    }

    fn mix(&mut self, agreement: &[u8]) {
        self.secrets.extend_from_slice(agreement);
    }

    fn mix_one_time(&mut self, agreement: Option<Box<[u8]>>) {
        if self.version >= 3 {
            if let Some(agreement) = agreement {
                self.mix(&agreement);
            }
        }
    }

    fn derive_keys(self) -> Result<(RootKey, ChainKey)> {
        let kdf = HKDF::new(self.version.into())?;
        let secrets: [u8; 64] = kdf.derive_secrets(&self.secrets, b"WhisperText");
        Ok((
            RootKey::new(kdf, *array_ref![secrets, 0, 32]),
            ChainKey::new(kdf, *array_ref![secrets, 32, 32], 0),
        ))
    }
}

pub(crate) fn initialize_alice_session<R: Rng + CryptoRng>(
    parameters: &AliceProtocolParameters,
    csprng: &mut R,
) -> Result<SessionState> {
    let local_identity = parameters.our_identity_key_pair().identity_key();
    let our_base_private_key = parameters.our_base_key_pair().private_key;

    let mut secrets = MasterSecret::new(parameters.session_version());
    secrets.mix(
        &parameters
            .our_identity_key_pair()
            .private_key()
            .calculate_agreement(parameters.their_signed_pre_key()),
    );
    secrets.mix(
        &our_base_private_key.calculate_agreement(parameters.their_identity_key().public_key()),
    );
    secrets.mix(&our_base_private_key.calculate_agreement(parameters.their_signed_pre_key()));
    secrets.mix_one_time(
        parameters
            .their_one_time_pre_key()
            .map(|key| our_base_private_key.calculate_agreement(key)),
    );

    let (root_key, chain_key) = secrets.derive_keys()?;

    let sending_ratchet_key = KeyPair::generate(csprng);
    let (sending_chain_root_key, sending_chain_chain_key) =
        root_key.create_chain(parameters.their_ratchet_key(), &sending_ratchet_key.private_key);

    Ok(SessionState::new(
        parameters.session_version().into(),
        local_identity,
        parameters.their_identity_key(),
        &sending_chain_root_key,
        &parameters.our_base_key_pair().public_key,
    )
    .with_receiver_chain(parameters.their_ratchet_key(), &chain_key)
    .with_sender_chain(&sending_ratchet_key, &sending_chain_chain_key))
}

pub(crate) fn initialize_bob_session(parameters: &BobProtocolParameters) -> Result<SessionState> {
    let local_identity = parameters.our_identity_key_pair().identity_key();
    let our_signed_pre_key = parameters.our_signed_pre_key_pair().private_key;

    let mut secrets = MasterSecret::new(parameters.session_version());
    secrets.mix(&our_signed_pre_key.calculate_agreement(parameters.their_identity_key().public_key()));
    secrets.mix(
        &parameters
            .our_identity_key_pair()
            .private_key()
            .calculate_agreement(parameters.their_base_key()),
    );
    secrets.mix(&our_signed_pre_key.calculate_agreement(parameters.their_base_key()));
    secrets.mix_one_time(
        parameters
            .our_one_time_pre_key_pair()
            .map(|key_pair| key_pair.private_key.calculate_agreement(parameters.their_base_key())),
    );

    let (root_key, chain_key) = secrets.derive_keys()?;

    Ok(SessionState::new(
        parameters.session_version().into(),
        local_identity,
        parameters.their_identity_key(),
        &root_key,
        parameters.their_base_key(),
    )
    .with_sender_chain(parameters.our_ratchet_key_pair(), &chain_key))
}

pub fn initialize_alice_session_record<R: Rng + CryptoRng>(
    parameters: &AliceProtocolParameters,
    csprng: &mut R,
) -> Result<SessionRecord> {
    Ok(SessionRecord::new(initialize_alice_session(
        parameters, csprng,
    )?))
}

pub fn initialize_bob_session_record(parameters: &BobProtocolParameters) -> Result<SessionRecord> {
    Ok(SessionRecord::new(initialize_bob_session(parameters)?))
}
