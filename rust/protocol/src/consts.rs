//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

#![warn(missing_docs)]

//! Magic numbers, and the configurable bounds derived from them.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// Various positive integers bounding the maximum size of other data structures.
pub mod limits {
    /// How far ahead of a receiving chain's index an incoming counter may be before the message
    /// is rejected as coming "from too far into the future".
    pub const MAX_FORWARD_JUMPS: usize = 2000;
    /// The maximum number of skipped message keys retained per session state, summed over the
    /// `message_keys` of every receiving [crate::proto::storage::session_structure::Chain].
    pub const MAX_MESSAGE_KEYS: usize = 2000;
    /// The maximum number of receiving chains kept in
    /// [crate::proto::storage::SessionStructure::receiver_chains].
    pub const MAX_RECEIVER_CHAINS: usize = 5;
    /// The maximum number of sessions allowed for
    /// [crate::proto::storage::RecordStructure::previous_sessions].
    pub const ARCHIVED_STATES_MAX_LENGTH: usize = 40;
}

/// Runtime bounds on session state growth.
///
/// Defaults match [limits]. Every field is optional when deserializing, so a configuration file
/// only needs to name the bounds it changes:
///
/// ```
/// # use axolotl_protocol::SessionLimits;
/// let limits: SessionLimits = serde_json::from_str(r#"{"max_receiver_chains": 8}"#).unwrap();
/// assert_eq!(limits.max_receiver_chains, 8);
/// assert_eq!(limits.max_forward_jumps, SessionLimits::default().max_forward_jumps);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// See [limits::MAX_FORWARD_JUMPS].
    pub max_forward_jumps: usize,
    /// See [limits::MAX_MESSAGE_KEYS].
    pub max_message_keys: usize,
    /// See [limits::MAX_RECEIVER_CHAINS].
    pub max_receiver_chains: usize,
    /// See [limits::ARCHIVED_STATES_MAX_LENGTH].
    pub max_archived_states: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_forward_jumps: limits::MAX_FORWARD_JUMPS,
            max_message_keys: limits::MAX_MESSAGE_KEYS,
            max_receiver_chains: limits::MAX_RECEIVER_CHAINS,
            max_archived_states: limits::ARCHIVED_STATES_MAX_LENGTH,
        }
    }
}

impl SessionLimits {
    /// Rejects configurations that would make sessions unusable.
    ///
    /// A session always needs room for at least one receiving chain; the other bounds may be
    /// zero (which disables out-of-order delivery or state history respectively).
    pub fn validate(&self) -> Result<()> {
        if self.max_receiver_chains == 0 {
            return Err(ProtocolError::InvalidArgument(
                "max_receiver_chains must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
