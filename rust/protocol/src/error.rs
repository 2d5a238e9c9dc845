//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::error::Error;

use crate::curve::KeyType;
use crate::{CiphertextMessageType, ProtocolAddress};

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Boxed failure raised by an application callback.
pub type CallbackError = Box<dyn Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state for call to {0} to succeed: {1}")]
    InvalidState(&'static str, String),

    #[error("failed to decode protobuf: {0}")]
    ProtobufDecodingError(#[from] prost::DecodeError),
    #[error("protobuf encoding was invalid")]
    InvalidProtobufEncoding,

    #[error("ciphertext serialized bytes were too short <{0}>")]
    CiphertextMessageTooShort(usize),
    #[error("ciphertext version was too old <{0}>")]
    LegacyCiphertextVersion(u8),
    #[error("ciphertext version was unrecognized <{0}>")]
    UnrecognizedCiphertextVersion(u8),
    #[error("unrecognized message version <{0}>")]
    UnrecognizedMessageVersion(u32),

    #[error("no key type identifier")]
    NoKeyTypeIdentifier,
    #[error("bad key type <{0:#04x}>")]
    BadKeyType(u8),
    #[error("bad key length <{1}> for key with type <{0}>")]
    BadKeyLength(KeyType, usize),
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("invalid signature detected")]
    SignatureValidationFailed,

    #[error("untrusted identity for address {0}")]
    UntrustedIdentity(ProtocolAddress),

    #[error("invalid prekey identifier")]
    InvalidPreKeyId,
    #[error("invalid signed prekey identifier")]
    InvalidSignedPreKeyId,

    #[error("invalid MAC key length <{0}>")]
    InvalidMacKeyLength(usize),

    #[error("session with {0} not found")]
    SessionNotFound(ProtocolAddress),
    #[error("session state has no sending chain")]
    UninitializedSession,
    #[error("invalid session structure: {0}")]
    InvalidSessionStructure(&'static str),

    #[error("message with old counter {0} / {1}")]
    DuplicatedMessage(u32, u32),
    #[error("invalid {0:?} message: {1}")]
    InvalidMessage(CiphertextMessageType, &'static str),
    #[error("no valid session for {address}: {} candidate state(s) failed", .errors.len())]
    NoValidSession {
        address: ProtocolAddress,
        errors: Vec<ProtocolError>,
    },

    #[error("application callback {0} failed with {1}")]
    ApplicationCallbackError(&'static str, CallbackError),
}

impl ProtocolError {
    /// True for failures that mean "this ciphertext could not be authenticated or decrypted",
    /// including an aggregate whose every candidate state failed.
    pub fn is_invalid_message(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMessage(..) | ProtocolError::NoValidSession { .. }
        )
    }
}
