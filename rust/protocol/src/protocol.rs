//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use hmac::{Hmac, Mac};
use prost::Message;
use rand::{CryptoRng, Rng};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::state::{PreKeyId, SignedPreKeyId};
use crate::{proto, IdentityKey, PrivateKey, ProtocolError, PublicKey, Result};

pub(crate) const CIPHERTEXT_MESSAGE_CURRENT_VERSION: u8 = 3;
// Versions at or below this one are no longer accepted.
pub(crate) const CIPHERTEXT_MESSAGE_UNSUPPORTED_VERSION: u8 = 1;
pub(crate) const SENDERKEY_MESSAGE_CURRENT_VERSION: u8 = 3;

#[derive(Debug, Clone)]
pub enum CiphertextMessage {
    WhisperMessage(WhisperMessage),
    PreKeyWhisperMessage(PreKeyWhisperMessage),
    SenderKeyMessage(SenderKeyMessage),
}

#[derive(
    Copy, Clone, Eq, PartialEq, Debug, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum CiphertextMessageType {
    Whisper = 2,
    PreKey = 3,
    SenderKey = 4,
}

impl CiphertextMessage {
    /// Parses `bytes` as the kind of message named by `message_type`.
    ///
    /// The type travels out of band alongside the bytes; nothing in the serialized form
    /// distinguishes a `WhisperMessage` from a `PreKeyWhisperMessage`.
    pub fn deserialize(message_type: CiphertextMessageType, bytes: &[u8]) -> Result<Self> {
        Ok(match message_type {
            CiphertextMessageType::Whisper => {
                CiphertextMessage::WhisperMessage(WhisperMessage::try_from(bytes)?)
            }
            CiphertextMessageType::PreKey => {
                CiphertextMessage::PreKeyWhisperMessage(PreKeyWhisperMessage::try_from(bytes)?)
            }
            CiphertextMessageType::SenderKey => {
                CiphertextMessage::SenderKeyMessage(SenderKeyMessage::try_from(bytes)?)
            }
        })
    }

    pub fn message_type(&self) -> CiphertextMessageType {
        match self {
            CiphertextMessage::WhisperMessage(_) => CiphertextMessageType::Whisper,
            CiphertextMessage::PreKeyWhisperMessage(_) => CiphertextMessageType::PreKey,
            CiphertextMessage::SenderKeyMessage(_) => CiphertextMessageType::SenderKey,
        }
    }

    pub fn serialize(&self) -> &[u8] {
        match self {
            CiphertextMessage::WhisperMessage(x) => x.serialized(),
            CiphertextMessage::PreKeyWhisperMessage(x) => x.serialized(),
            CiphertextMessage::SenderKeyMessage(x) => x.serialized(),
        }
    }
}

fn version_byte(message_version: u8) -> u8 {
    ((message_version & 0xF) << 4) | CIPHERTEXT_MESSAGE_CURRENT_VERSION
}

fn check_message_version(value: &[u8]) -> Result<u8> {
    let message_version = value[0] >> 4;
    if message_version <= CIPHERTEXT_MESSAGE_UNSUPPORTED_VERSION {
        return Err(ProtocolError::LegacyCiphertextVersion(message_version));
    }
    if message_version > CIPHERTEXT_MESSAGE_CURRENT_VERSION {
        return Err(ProtocolError::UnrecognizedCiphertextVersion(message_version));
    }
    Ok(message_version)
}

/// A single ratchet step's worth of ciphertext, authenticated with a truncated HMAC.
///
/// Serialized as `version_byte || protobuf_body || mac[..8]`.
#[derive(Debug, Clone)]
pub struct WhisperMessage {
    message_version: u8,
    sender_ratchet_key: PublicKey,
    counter: u32,
    previous_counter: u32,
    ciphertext: Box<[u8]>,
    serialized: Box<[u8]>,
}

impl WhisperMessage {
    const MAC_LENGTH: usize = 8;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_version: u8,
        mac_key: &[u8],
        sender_ratchet_key: PublicKey,
        counter: u32,
        previous_counter: u32,
        ciphertext: &[u8],
        sender_identity_key: &IdentityKey,
        receiver_identity_key: &IdentityKey,
    ) -> Result<Self> {
        let message = proto::wire::WhisperMessage {
            ratchet_key: Some(sender_ratchet_key.serialize().into_vec()),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(Vec::<u8>::from(ciphertext)),
        };
        let mut serialized = Vec::with_capacity(1 + message.encoded_len() + Self::MAC_LENGTH);
        serialized.push(version_byte(message_version));
        message
            .encode(&mut serialized)
            .expect("can always append to a buffer");
        let mac = Self::compute_mac(
            message_version,
            sender_identity_key,
            receiver_identity_key,
            mac_key,
            &serialized,
        )?;
        serialized.extend_from_slice(&mac);
        Ok(Self {
            message_version,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext: ciphertext.into(),
            serialized: serialized.into_boxed_slice(),
        })
    }

    /// True if `bytes` carries a version marker this implementation no longer speaks.
    pub fn is_legacy(bytes: &[u8]) -> bool {
        !bytes.is_empty() && (bytes[0] >> 4) <= CIPHERTEXT_MESSAGE_UNSUPPORTED_VERSION
    }

    #[inline]
    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    #[inline]
    pub fn sender_ratchet_key(&self) -> &PublicKey {
        &self.sender_ratchet_key
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    #[inline]
    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    #[inline]
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn verify_mac(
        &self,
        sender_identity_key: &IdentityKey,
        receiver_identity_key: &IdentityKey,
        mac_key: &[u8],
    ) -> Result<bool> {
        let our_mac = &Self::compute_mac(
            self.message_version,
            sender_identity_key,
            receiver_identity_key,
            mac_key,
            &self.serialized[..self.serialized.len() - Self::MAC_LENGTH],
        )?;
        let their_mac = &self.serialized[self.serialized.len() - Self::MAC_LENGTH..];
        let result: bool = our_mac.ct_eq(their_mac).into();
        if !result {
            log::warn!(
                "Bad Mac! Their Mac: {} Our Mac: {}",
                hex::encode(their_mac),
                hex::encode(our_mac)
            );
        }
        Ok(result)
    }

    fn compute_mac(
        message_version: u8,
        sender_identity_key: &IdentityKey,
        receiver_identity_key: &IdentityKey,
        mac_key: &[u8],
        message: &[u8],
    ) -> Result<[u8; Self::MAC_LENGTH]> {
        if mac_key.len() != 32 {
            return Err(ProtocolError::InvalidMacKeyLength(mac_key.len()));
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(mac_key)
            .expect("HMAC-SHA256 should accept any size key");

        // Version 2 sessions authenticate the message alone.
        if message_version >= 3 {
            mac.update(sender_identity_key.public_key().serialize().as_ref());
            mac.update(receiver_identity_key.public_key().serialize().as_ref());
        }
        mac.update(message);
        let mut result = [0u8; Self::MAC_LENGTH];
        result.copy_from_slice(&mac.finalize().into_bytes()[..Self::MAC_LENGTH]);
        Ok(result)
    }
}

impl AsRef<[u8]> for WhisperMessage {
    fn as_ref(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for WhisperMessage {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < WhisperMessage::MAC_LENGTH + 1 {
            return Err(ProtocolError::CiphertextMessageTooShort(value.len()));
        }
        let message_version = check_message_version(value)?;

        let proto_structure =
            proto::wire::WhisperMessage::decode(&value[1..value.len() - WhisperMessage::MAC_LENGTH])
                .map_err(|_| ProtocolError::InvalidProtobufEncoding)?;

        let incomplete =
            || ProtocolError::InvalidMessage(CiphertextMessageType::Whisper, "incomplete message");

        let sender_ratchet_key = proto_structure.ratchet_key.ok_or_else(incomplete)?;
        let sender_ratchet_key = PublicKey::deserialize(&sender_ratchet_key)?;
        let counter = proto_structure.counter.ok_or_else(incomplete)?;
        let previous_counter = proto_structure.previous_counter.unwrap_or(0);
        let ciphertext = proto_structure
            .ciphertext
            .ok_or_else(incomplete)?
            .into_boxed_slice();

        Ok(WhisperMessage {
            message_version,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized: Box::from(value),
        })
    }
}

/// The first message(s) of a session, carrying what the receiver needs to build the session
/// before decrypting the wrapped [`WhisperMessage`].
#[derive(Debug, Clone)]
pub struct PreKeyWhisperMessage {
    message_version: u8,
    registration_id: u32,
    pre_key_id: Option<PreKeyId>,
    signed_pre_key_id: Option<SignedPreKeyId>,
    base_key: PublicKey,
    identity_key: IdentityKey,
    message: WhisperMessage,
    serialized: Box<[u8]>,
}

impl PreKeyWhisperMessage {
    pub fn new(
        message_version: u8,
        registration_id: u32,
        pre_key_id: Option<PreKeyId>,
        signed_pre_key_id: SignedPreKeyId,
        base_key: PublicKey,
        identity_key: IdentityKey,
        message: WhisperMessage,
    ) -> Result<Self> {
        let proto_message = proto::wire::PreKeyWhisperMessage {
            registration_id: Some(registration_id),
            pre_key_id: pre_key_id.map(|id| id.into()),
            signed_pre_key_id: Some(signed_pre_key_id.into()),
            base_key: Some(base_key.serialize().into_vec()),
            identity_key: Some(identity_key.serialize().into_vec()),
            message: Some(Vec::from(message.as_ref())),
        };
        let mut serialized = Vec::with_capacity(1 + proto_message.encoded_len());
        serialized.push(version_byte(message_version));
        proto_message
            .encode(&mut serialized)
            .expect("can always append to a buffer");
        Ok(Self {
            message_version,
            registration_id,
            pre_key_id,
            signed_pre_key_id: Some(signed_pre_key_id),
            base_key,
            identity_key,
            message,
            serialized: serialized.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    #[inline]
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    #[inline]
    pub fn pre_key_id(&self) -> Option<PreKeyId> {
        self.pre_key_id
    }

    /// Absent only in version 2 messages, which predate signed pre-keys.
    #[inline]
    pub fn signed_pre_key_id(&self) -> Option<SignedPreKeyId> {
        self.signed_pre_key_id
    }

    #[inline]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    #[inline]
    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    #[inline]
    pub fn message(&self) -> &WhisperMessage {
        &self.message
    }

    #[inline]
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl AsRef<[u8]> for PreKeyWhisperMessage {
    fn as_ref(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for PreKeyWhisperMessage {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.is_empty() {
            return Err(ProtocolError::CiphertextMessageTooShort(value.len()));
        }
        let message_version = check_message_version(value)?;

        let proto_structure = proto::wire::PreKeyWhisperMessage::decode(&value[1..])
            .map_err(|_| ProtocolError::InvalidProtobufEncoding)?;

        let incomplete =
            || ProtocolError::InvalidMessage(CiphertextMessageType::PreKey, "incomplete message");

        if message_version == 2 && proto_structure.pre_key_id.is_none() {
            return Err(incomplete());
        }
        if message_version == 3 && proto_structure.signed_pre_key_id.is_none() {
            return Err(incomplete());
        }
        let base_key = proto_structure.base_key.ok_or_else(incomplete)?;
        let identity_key = proto_structure.identity_key.ok_or_else(incomplete)?;
        let message = proto_structure.message.ok_or_else(incomplete)?;

        Ok(PreKeyWhisperMessage {
            message_version,
            registration_id: proto_structure.registration_id.unwrap_or(0),
            pre_key_id: proto_structure.pre_key_id.map(PreKeyId::from),
            signed_pre_key_id: proto_structure.signed_pre_key_id.map(SignedPreKeyId::from),
            base_key: PublicKey::deserialize(&base_key)?,
            identity_key: IdentityKey::try_from(identity_key.as_ref())?,
            message: WhisperMessage::try_from(message.as_ref())?,
            serialized: Box::from(value),
        })
    }
}

/// A group message body signed by the sender's signing key.
///
/// Serialized as `version_byte || protobuf_body || signature`.
#[derive(Debug, Clone)]
pub struct SenderKeyMessage {
    message_version: u8,
    key_id: u32,
    iteration: u32,
    ciphertext: Box<[u8]>,
    serialized: Box<[u8]>,
}

impl SenderKeyMessage {
    const SIGNATURE_LEN: usize = 64;

    pub fn new<R: CryptoRng + Rng>(
        key_id: u32,
        iteration: u32,
        ciphertext: &[u8],
        signature_key: &PrivateKey,
        csprng: &mut R,
    ) -> Result<Self> {
        let proto_message = proto::wire::SenderKeyMessage {
            id: Some(key_id),
            iteration: Some(iteration),
            ciphertext: Some(ciphertext.to_vec()),
        };
        let mut serialized =
            Vec::with_capacity(1 + proto_message.encoded_len() + Self::SIGNATURE_LEN);
        serialized.push(
            ((SENDERKEY_MESSAGE_CURRENT_VERSION & 0xF) << 4) | SENDERKEY_MESSAGE_CURRENT_VERSION,
        );
        proto_message
            .encode(&mut serialized)
            .expect("can always append to a buffer");
        let signature = signature_key.calculate_signature(&serialized, csprng);
        serialized.extend_from_slice(&signature);
        Ok(Self {
            message_version: SENDERKEY_MESSAGE_CURRENT_VERSION,
            key_id,
            iteration,
            ciphertext: ciphertext.into(),
            serialized: serialized.into_boxed_slice(),
        })
    }

    pub fn verify_signature(&self, signature_key: &PublicKey) -> bool {
        let split = self.serialized.len() - Self::SIGNATURE_LEN;
        signature_key.verify_signature(&self.serialized[..split], &self.serialized[split..])
    }

    #[inline]
    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    #[inline]
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    #[inline]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    #[inline]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    #[inline]
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl AsRef<[u8]> for SenderKeyMessage {
    fn as_ref(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for SenderKeyMessage {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 1 + Self::SIGNATURE_LEN {
            return Err(ProtocolError::CiphertextMessageTooShort(value.len()));
        }
        let message_version = value[0] >> 4;
        if message_version < SENDERKEY_MESSAGE_CURRENT_VERSION {
            return Err(ProtocolError::LegacyCiphertextVersion(message_version));
        }
        if message_version > SENDERKEY_MESSAGE_CURRENT_VERSION {
            return Err(ProtocolError::UnrecognizedCiphertextVersion(message_version));
        }
        let proto_structure =
            proto::wire::SenderKeyMessage::decode(&value[1..value.len() - Self::SIGNATURE_LEN])
                .map_err(|_| ProtocolError::InvalidProtobufEncoding)?;

        let incomplete = || {
            ProtocolError::InvalidMessage(CiphertextMessageType::SenderKey, "incomplete message")
        };
        let key_id = proto_structure.id.ok_or_else(incomplete)?;
        let iteration = proto_structure.iteration.ok_or_else(incomplete)?;
        let ciphertext = proto_structure
            .ciphertext
            .ok_or_else(incomplete)?
            .into_boxed_slice();

        Ok(SenderKeyMessage {
            message_version,
            key_id,
            iteration,
            ciphertext,
            serialized: Box::from(value),
        })
    }
}
