//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Protobuf schemas for persisted state ([storage]) and for messages exchanged with peers
//! ([wire]).

pub mod storage;
pub mod wire;
