//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionStructure {
    #[prost(uint32, tag = "1")]
    pub session_version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub local_identity_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub remote_identity_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub root_key: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub previous_counter: u32,
    #[prost(message, optional, tag = "6")]
    pub sender_chain: Option<session_structure::Chain>,
    /// Newest last.
    #[prost(message, repeated, tag = "7")]
    pub receiver_chains: Vec<session_structure::Chain>,
    #[prost(message, optional, tag = "9")]
    pub pending_pre_key: Option<session_structure::PendingPreKey>,
    #[prost(uint32, tag = "10")]
    pub remote_registration_id: u32,
    #[prost(uint32, tag = "11")]
    pub local_registration_id: u32,
    #[prost(bytes = "vec", tag = "13")]
    pub alice_base_key: Vec<u8>,
}

pub mod session_structure {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Chain {
        #[prost(bytes = "vec", tag = "1")]
        pub sender_ratchet_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub sender_ratchet_key_private: Vec<u8>,
        #[prost(message, optional, tag = "3")]
        pub chain_key: Option<chain::ChainKey>,
        /// Newest first.
        #[prost(message, repeated, tag = "4")]
        pub message_keys: Vec<chain::MessageKey>,
    }

    pub mod chain {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ChainKey {
            #[prost(uint32, tag = "1")]
            pub index: u32,
            #[prost(bytes = "vec", tag = "2")]
            pub key: Vec<u8>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct MessageKey {
            #[prost(uint32, tag = "1")]
            pub index: u32,
            #[prost(bytes = "vec", tag = "2")]
            pub cipher_key: Vec<u8>,
            #[prost(bytes = "vec", tag = "3")]
            pub mac_key: Vec<u8>,
            #[prost(bytes = "vec", tag = "4")]
            pub iv: Vec<u8>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PendingPreKey {
        #[prost(uint32, optional, tag = "1")]
        pub pre_key_id: Option<u32>,
        #[prost(uint32, tag = "3")]
        pub signed_pre_key_id: u32,
        #[prost(bytes = "vec", tag = "2")]
        pub base_key: Vec<u8>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordStructure {
    #[prost(message, optional, tag = "1")]
    pub current_session: Option<SessionStructure>,
    /// Newest first.
    #[prost(message, repeated, tag = "2")]
    pub previous_sessions: Vec<SessionStructure>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyRecordStructure {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub private_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedPreKeyRecordStructure {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub private_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
    #[prost(fixed64, tag = "5")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdentityKeyPairStructure {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
}
