//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//
mod support;

use std::sync::Arc;
use std::thread;

use assert_matches::assert_matches;
use axolotl_protocol::*;
use proptest::prelude::*;
use rand::rngs::OsRng;
use support::*;

type TestResult = Result<(), ProtocolError>;

fn alice_address() -> ProtocolAddress {
    ProtocolAddress::new("+14151111111".to_owned(), DeviceId::PRIMARY)
}

fn bob_address() -> ProtocolAddress {
    ProtocolAddress::new("+14151111112".to_owned(), DeviceId::PRIMARY)
}

/// Alice fetches a fresh bundle from Bob and builds a new session with it.
fn alice_processes_bundle(
    alice_store: &mut InMemProtocolStore,
    bob_store: &mut InMemProtocolStore,
) -> TestResult {
    let mut csprng = OsRng;
    let bob_bundle = create_pre_key_bundle(bob_store, &mut csprng)?;
    process_prekey_bundle(
        &bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.identity_store,
        &bob_bundle,
        &SessionLimits::default(),
        &mut csprng,
    )
}

/// Runs a full handshake: Alice's pre-key message, then Bob's reply.
fn establish_session(
    alice_store: &mut InMemProtocolStore,
    bob_store: &mut InMemProtocolStore,
    locks: &SessionLocks,
) -> TestResult {
    alice_processes_bundle(alice_store, bob_store)?;

    let hello = encrypt(alice_store, locks, &bob_address(), "hello")?;
    assert_eq!(hello.message_type(), CiphertextMessageType::PreKey);
    assert_eq!(decrypt(bob_store, locks, &alice_address(), &hello)?, b"hello");

    let reply = encrypt(bob_store, locks, &alice_address(), "hi")?;
    assert_eq!(reply.message_type(), CiphertextMessageType::Whisper);
    assert_eq!(decrypt(alice_store, locks, &bob_address(), &reply)?, b"hi");

    Ok(())
}

fn carol_address() -> ProtocolAddress {
    ProtocolAddress::new("+14151111113".to_owned(), DeviceId::PRIMARY)
}

/// Stores for two parties holding an already initialized v3 session, with no pre-key step.
fn initialized_stores(
    first: &ProtocolAddress,
    second: &ProtocolAddress,
) -> Result<(InMemProtocolStore, InMemProtocolStore), ProtocolError> {
    let (first_record, second_record) = initialize_sessions_v3()?;
    let mut first_store = test_in_memory_protocol_store()?;
    let mut second_store = test_in_memory_protocol_store()?;
    first_store.store_session(second, &first_record)?;
    second_store.store_session(first, &second_record)?;
    Ok((first_store, second_store))
}

fn whisper_message(message: CiphertextMessage) -> WhisperMessage {
    match message {
        CiphertextMessage::WhisperMessage(m) => m,
        CiphertextMessage::PreKeyWhisperMessage(m) => m.message().clone(),
        CiphertextMessage::SenderKeyMessage(_) => panic!("not a two-party message"),
    }
}

fn decrypt_signal_with_limits(
    store: &mut InMemProtocolStore,
    locks: &SessionLocks,
    remote_address: &ProtocolAddress,
    message: &WhisperMessage,
    limits: SessionLimits,
) -> Result<Vec<u8>, ProtocolError> {
    let mut cipher = SessionCipher::new(
        remote_address.clone(),
        &mut store.session_store,
        &mut store.pre_key_store,
        locks,
    )
    .with_limits(limits)?;
    let plaintext = cipher.decrypt_signal(message, &mut OsRng)?.commit()?;
    Ok(plaintext)
}

fn stored_session_bytes(store: &InMemProtocolStore, address: &ProtocolAddress) -> Vec<u8> {
    store
        .load_session(address)
        .expect("loadable session")
        .serialize()
}

#[test]
fn test_basic_prekey_v3() -> TestResult {
    init_logger();
    let mut csprng = OsRng;
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    let bob_bundle = create_pre_key_bundle(&mut bob_store, &mut csprng)?;
    let bob_pre_key_id = bob_bundle.pre_key_id().expect("bundle has a one-time pre-key");

    process_prekey_bundle(
        &bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.identity_store,
        &bob_bundle,
        &SessionLimits::default(),
        &mut csprng,
    )?;

    assert!(alice_store.contains_session(&bob_address())?);
    assert_eq!(
        alice_store.load_session(&bob_address())?.session_version()?,
        3
    );

    let original_message = "L'homme est condamné à être libre";
    let outgoing_message = encrypt(&mut alice_store, &locks, &bob_address(), original_message)?;
    assert_eq!(
        outgoing_message.message_type(),
        CiphertextMessageType::PreKey
    );
    assert_eq!(outgoing_message.serialize()[0], 0x33);

    let incoming_message = CiphertextMessage::PreKeyWhisperMessage(
        PreKeyWhisperMessage::try_from(outgoing_message.serialize())?,
    );

    let mut bob_pre_keys = CountingPreKeyStore {
        inner: bob_store.pre_key_store.clone(),
        removed: vec![],
    };

    let decrypt_as_bob = |bob_store: &mut InMemProtocolStore,
                          bob_pre_keys: &mut CountingPreKeyStore|
     -> Result<Vec<u8>, ProtocolError> {
        let mut builder = PreKeySessionBuilder::new(
            &mut bob_store.identity_store,
            &bob_store.signed_pre_key_store,
        );
        let mut cipher = SessionCipher::new(
            alice_address(),
            &mut bob_store.session_store,
            bob_pre_keys,
            &locks,
        );
        let plaintext = cipher
            .decrypt(&incoming_message, &mut builder, &mut OsRng)?
            .commit()?;
        Ok(plaintext)
    };

    let ptext = decrypt_as_bob(&mut bob_store, &mut bob_pre_keys)?;
    assert_eq!(
        String::from_utf8(ptext).expect("valid utf8"),
        original_message
    );
    assert_eq!(bob_pre_keys.removed, vec![bob_pre_key_id]);
    assert_matches!(
        bob_pre_keys.inner.get_pre_key(bob_pre_key_id),
        Err(ProtocolError::InvalidPreKeyId)
    );

    assert_eq!(
        bob_store.load_session(&alice_address())?.session_version()?,
        3
    );
    assert_eq!(
        bob_store
            .load_session(&alice_address())?
            .remote_registration_id()?,
        alice_store.get_local_registration_id()?
    );

    // The same pre-key message again is a replay, and nothing more is removed.
    assert_matches!(
        decrypt_as_bob(&mut bob_store, &mut bob_pre_keys),
        Err(ProtocolError::DuplicatedMessage(1, 0))
    );
    assert_eq!(bob_pre_keys.removed.len(), 1);

    let bobs_response = "Who watches the watchers?";
    let bob_outgoing = encrypt(&mut bob_store, &locks, &alice_address(), bobs_response)?;
    assert_eq!(bob_outgoing.message_type(), CiphertextMessageType::Whisper);

    let alice_decrypts = decrypt(&mut alice_store, &locks, &bob_address(), &bob_outgoing)?;
    assert_eq!(
        String::from_utf8(alice_decrypts).expect("valid utf8"),
        bobs_response
    );

    // Bob's reply acknowledged the session, so Alice stops sending pre-key messages.
    let alice_outgoing = encrypt(&mut alice_store, &locks, &bob_address(), "ack")?;
    assert_eq!(
        alice_outgoing.message_type(),
        CiphertextMessageType::Whisper
    );
    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &alice_outgoing)?,
        b"ack"
    );

    Ok(())
}

#[test]
fn test_prekey_bundle_without_one_time_pre_key() -> TestResult {
    let mut csprng = OsRng;
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    let full_bundle = create_pre_key_bundle(&mut bob_store, &mut csprng)?;
    let bob_bundle = PreKeyBundle::new(
        full_bundle.registration_id(),
        full_bundle.device_id(),
        None,
        full_bundle.signed_pre_key_id(),
        full_bundle.signed_pre_key_public(),
        full_bundle.signed_pre_key_signature().to_vec(),
        *full_bundle.identity_key(),
    );

    process_prekey_bundle(
        &bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.identity_store,
        &bob_bundle,
        &SessionLimits::default(),
        &mut csprng,
    )?;

    let outgoing = encrypt(&mut alice_store, &locks, &bob_address(), "no one-time key")?;
    let CiphertextMessage::PreKeyWhisperMessage(prekey_message) = &outgoing else {
        panic!("expected a pre-key message, got {:?}", outgoing.message_type());
    };
    assert_eq!(prekey_message.pre_key_id(), None);
    assert_eq!(
        prekey_message.signed_pre_key_id(),
        Some(bob_bundle.signed_pre_key_id())
    );

    let pre_keys_before = bob_store.pre_key_store.all_pre_key_ids();
    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &outgoing)?,
        b"no one-time key"
    );
    assert_eq!(bob_store.pre_key_store.all_pre_key_ids(), pre_keys_before);

    Ok(())
}

#[test]
fn test_bad_signed_pre_key_signature() -> TestResult {
    let mut csprng = OsRng;

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    let good_bundle = create_pre_key_bundle(&mut bob_store, &mut csprng)?;
    let good_signature = good_bundle.signed_pre_key_signature().to_vec();

    for i in 0..good_signature.len() {
        let mut bad_signature = good_signature.clone();
        bad_signature[i] ^= 0x01;

        let bad_bundle = PreKeyBundle::new(
            good_bundle.registration_id(),
            good_bundle.device_id(),
            good_bundle.pre_key_id().zip(good_bundle.pre_key_public()),
            good_bundle.signed_pre_key_id(),
            good_bundle.signed_pre_key_public(),
            bad_signature,
            *good_bundle.identity_key(),
        );

        assert_matches!(
            process_prekey_bundle(
                &bob_address(),
                &mut alice_store.session_store,
                &mut alice_store.identity_store,
                &bad_bundle,
                &SessionLimits::default(),
                &mut csprng,
            ),
            Err(ProtocolError::SignatureValidationFailed)
        );
    }

    assert!(!alice_store.contains_session(&bob_address())?);

    process_prekey_bundle(
        &bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.identity_store,
        &good_bundle,
        &SessionLimits::default(),
        &mut csprng,
    )?;
    assert!(alice_store.contains_session(&bob_address())?);

    Ok(())
}

#[test]
fn test_changed_identity_is_untrusted() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    // Bob reinstalls and comes back with a new identity.
    let mut new_bob_store = test_in_memory_protocol_store()?;
    assert_matches!(
        alice_processes_bundle(&mut alice_store, &mut new_bob_store),
        Err(ProtocolError::UntrustedIdentity(address)) if address == bob_address()
    );

    // Mallory, claiming to be Alice, cannot start a session with Bob either.
    let mut mallory_store = test_in_memory_protocol_store()?;
    alice_processes_bundle(&mut mallory_store, &mut bob_store)?;
    let forged = encrypt(&mut mallory_store, &locks, &bob_address(), "it's me")?;
    assert_matches!(
        decrypt(&mut bob_store, &locks, &alice_address(), &forged),
        Err(ProtocolError::UntrustedIdentity(_))
    );

    // Once the user accepts the change, the new identity is usable.
    alice_store.identity_store.reset();
    alice_processes_bundle(&mut alice_store, &mut new_bob_store)?;
    let message = encrypt(&mut alice_store, &locks, &bob_address(), "welcome back")?;
    assert_eq!(
        decrypt(&mut new_bob_store, &locks, &alice_address(), &message)?,
        b"welcome back"
    );

    Ok(())
}

#[test]
fn test_ping_pong() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    for round in 0..10 {
        let alice_burst: Vec<_> = (0..round % 3 + 1)
            .map(|i| encrypt(&mut alice_store, &locks, &bob_address(), &format!("a{round}.{i}")))
            .collect::<Result<_, _>>()?;
        for (i, message) in alice_burst.iter().enumerate() {
            assert_eq!(message.message_type(), CiphertextMessageType::Whisper);
            assert_eq!(
                decrypt(&mut bob_store, &locks, &alice_address(), message)?,
                format!("a{round}.{i}").as_bytes()
            );
        }

        let bob_message = encrypt(&mut bob_store, &locks, &alice_address(), &format!("b{round}"))?;
        assert_eq!(
            decrypt(&mut alice_store, &locks, &bob_address(), &bob_message)?,
            format!("b{round}").as_bytes()
        );
    }

    // Every turn of the conversation stepped the DH ratchet; none of it archived state.
    assert_eq!(alice_store.load_session(&bob_address())?.previous_session_count(), 0);
    assert_eq!(bob_store.load_session(&alice_address())?.previous_session_count(), 0);

    Ok(())
}

#[test]
fn test_out_of_order() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let messages: Vec<_> = ["m0", "m1", "m2"]
        .into_iter()
        .map(|text| encrypt(&mut alice_store, &locks, &bob_address(), text))
        .collect::<Result<_, _>>()?;

    assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &messages[2])?, b"m2");
    assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &messages[0])?, b"m0");
    assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &messages[1])?, b"m1");

    for message in &messages {
        assert_matches!(
            decrypt(&mut bob_store, &locks, &alice_address(), message),
            Err(ProtocolError::DuplicatedMessage(_, _))
        );
    }

    Ok(())
}

#[test]
fn test_out_of_order_across_ratchet_steps() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let late = encrypt(&mut alice_store, &locks, &bob_address(), "late")?;
    let on_time = encrypt(&mut alice_store, &locks, &bob_address(), "on time")?;
    assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &on_time)?, b"on time");

    // Two full ratchet steps happen before the delayed message shows up.
    for _ in 0..2 {
        let from_bob = encrypt(&mut bob_store, &locks, &alice_address(), "ping")?;
        decrypt(&mut alice_store, &locks, &bob_address(), &from_bob)?;
        let from_alice = encrypt(&mut alice_store, &locks, &bob_address(), "pong")?;
        decrypt(&mut bob_store, &locks, &alice_address(), &from_alice)?;
    }

    assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &late)?, b"late");
    assert_matches!(
        decrypt(&mut bob_store, &locks, &alice_address(), &late),
        Err(ProtocolError::DuplicatedMessage(_, _))
    );

    Ok(())
}

#[test]
fn test_previous_counter_after_ratchet_step() -> TestResult {
    let locks = SessionLocks::global();

    // Bob ratchets when Alice's first message arrives, after sending some on his initial chain.
    for sent_before in [0u32, 1, 7] {
        let (mut alice_store, mut bob_store) = initialized_stores(&alice_address(), &bob_address())?;

        for i in 0..sent_before {
            let message = encrypt(&mut bob_store, &locks, &alice_address(), &format!("b{i}"))?;
            assert_eq!(
                decrypt(&mut alice_store, &locks, &bob_address(), &message)?,
                format!("b{i}").as_bytes()
            );
        }

        let from_alice = encrypt(&mut alice_store, &locks, &bob_address(), "a0")?;
        assert_eq!(whisper_message(from_alice.clone()).previous_counter(), 0);
        assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &from_alice)?, b"a0");

        let reply = encrypt(&mut bob_store, &locks, &alice_address(), "reply")?;
        let parsed = WhisperMessage::try_from(reply.serialize())?;
        assert_eq!(parsed.counter(), 0);
        assert_eq!(parsed.previous_counter(), sent_before.saturating_sub(1));
        assert_eq!(decrypt(&mut alice_store, &locks, &bob_address(), &reply)?, b"reply");
    }

    // Alice ratchets when Bob's reply arrives on his new chain.
    for sent_before in [1u32, 4] {
        let (mut alice_store, mut bob_store) = initialized_stores(&alice_address(), &bob_address())?;

        for i in 0..sent_before {
            let message = encrypt(&mut alice_store, &locks, &bob_address(), &format!("a{i}"))?;
            decrypt(&mut bob_store, &locks, &alice_address(), &message)?;
        }
        let reply = encrypt(&mut bob_store, &locks, &alice_address(), "reply")?;
        decrypt(&mut alice_store, &locks, &bob_address(), &reply)?;

        let next = encrypt(&mut alice_store, &locks, &bob_address(), "next")?;
        let parsed = WhisperMessage::try_from(next.serialize())?;
        assert_eq!(parsed.counter(), 0);
        assert_eq!(parsed.previous_counter(), sent_before - 1);
        assert_eq!(decrypt(&mut bob_store, &locks, &alice_address(), &next)?, b"next");
    }

    Ok(())
}

#[test]
fn test_skipped_key_cap_spans_ratchet_steps() -> TestResult {
    const PER_CHAIN: u32 = 1600;
    let locks = SessionLocks::global();
    let cap = SessionLimits::default().max_message_keys as u32;

    let (mut alice_store, mut bob_store) = initialized_stores(&alice_address(), &bob_address())?;

    let first_chain: Vec<_> = (0..PER_CHAIN)
        .map(|i| encrypt(&mut alice_store, &locks, &bob_address(), &format!("first {i}")))
        .collect::<Result<_, _>>()?;
    decrypt(&mut bob_store, &locks, &alice_address(), &first_chain[PER_CHAIN as usize - 1])?;

    let reply = encrypt(&mut bob_store, &locks, &alice_address(), "reply")?;
    decrypt(&mut alice_store, &locks, &bob_address(), &reply)?;

    let second_chain: Vec<_> = (0..PER_CHAIN)
        .map(|i| encrypt(&mut alice_store, &locks, &bob_address(), &format!("second {i}")))
        .collect::<Result<_, _>>()?;
    decrypt(&mut bob_store, &locks, &alice_address(), &second_chain[PER_CHAIN as usize - 1])?;

    // Bob skipped 2 * (PER_CHAIN - 1) keys; the lowest indices of the first chain went first.
    let evicted = 2 * (PER_CHAIN - 1) - cap;
    for i in [0, evicted - 1] {
        assert_matches!(
            decrypt(&mut bob_store, &locks, &alice_address(), &first_chain[i as usize]),
            Err(ProtocolError::DuplicatedMessage(_, _))
        );
    }
    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &first_chain[evicted as usize])?,
        format!("first {evicted}").as_bytes()
    );
    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &second_chain[0])?,
        b"second 0"
    );

    Ok(())
}

#[test]
fn test_too_far_into_the_future() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let max_forward_jumps = SessionLimits::default().max_forward_jumps;
    let messages: Vec<_> = (0..=max_forward_jumps + 1)
        .map(|i| {
            encrypt(&mut alice_store, &locks, &bob_address(), &i.to_string()).map(whisper_message)
        })
        .collect::<Result<_, _>>()?;

    let too_far = &messages[max_forward_jumps + 1];
    let just_in_range = &messages[max_forward_jumps];

    let before = stored_session_bytes(&bob_store, &alice_address());
    let err = decrypt(
        &mut bob_store,
        &locks,
        &alice_address(),
        &CiphertextMessage::WhisperMessage(too_far.clone()),
    )
    .expect_err("counter past the skip bound");
    assert!(err.is_invalid_message());
    assert_matches!(
        &err,
        ProtocolError::NoValidSession { errors, .. }
            if matches!(errors.as_slice(), [ProtocolError::InvalidMessage(CiphertextMessageType::Whisper, _)])
    );
    assert_eq!(stored_session_bytes(&bob_store, &alice_address()), before);

    assert_eq!(
        decrypt(
            &mut bob_store,
            &locks,
            &alice_address(),
            &CiphertextMessage::WhisperMessage(just_in_range.clone()),
        )?,
        max_forward_jumps.to_string().as_bytes()
    );

    // The chain has caught up, so the message that was too far ahead is now the next one.
    assert_eq!(
        decrypt(
            &mut bob_store,
            &locks,
            &alice_address(),
            &CiphertextMessage::WhisperMessage(too_far.clone()),
        )?,
        (max_forward_jumps + 1).to_string().as_bytes()
    );

    // Skipped keys are still available for the earlier messages.
    assert_eq!(
        decrypt(
            &mut bob_store,
            &locks,
            &alice_address(),
            &CiphertextMessage::WhisperMessage(messages[7].clone()),
        )?,
        b"7"
    );

    Ok(())
}

#[test]
fn test_custom_forward_jump_limit() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let limits = SessionLimits {
        max_forward_jumps: 10,
        ..SessionLimits::default()
    };
    limits.validate()?;

    let messages: Vec<_> = (0..12)
        .map(|i| {
            encrypt(&mut alice_store, &locks, &bob_address(), &i.to_string()).map(whisper_message)
        })
        .collect::<Result<_, _>>()?;

    let err = decrypt_signal_with_limits(
        &mut bob_store,
        &locks,
        &alice_address(),
        &messages[11],
        limits,
    )
    .expect_err("beyond the configured bound");
    assert!(err.is_invalid_message());

    assert_eq!(
        decrypt_signal_with_limits(&mut bob_store, &locks, &alice_address(), &messages[10], limits)?,
        b"10"
    );

    Ok(())
}

#[test]
fn test_unusable_limits_are_rejected() -> TestResult {
    let locks = SessionLocks::global();
    let limits = SessionLimits {
        max_receiver_chains: 0,
        ..Default::default()
    };

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    let cipher = SessionCipher::new(
        bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.pre_key_store,
        &locks,
    )
    .with_limits(limits);
    assert_matches!(cipher.err(), Some(ProtocolError::InvalidArgument(_)));

    let builder =
        PreKeySessionBuilder::new(&mut bob_store.identity_store, &bob_store.signed_pre_key_store)
            .with_limits(limits);
    assert_matches!(builder.err(), Some(ProtocolError::InvalidArgument(_)));

    let bob_bundle = create_pre_key_bundle(&mut bob_store, &mut OsRng)?;
    assert_matches!(
        process_prekey_bundle(
            &bob_address(),
            &mut alice_store.session_store,
            &mut alice_store.identity_store,
            &bob_bundle,
            &limits,
            &mut OsRng,
        ),
        Err(ProtocolError::InvalidArgument(_))
    );
    assert!(!alice_store.contains_session(&bob_address())?);

    Ok(())
}

#[test]
fn test_archived_state_history_is_bounded() -> TestResult {
    let locks = SessionLocks::global();
    let max_archived_states = SessionLimits::default().max_archived_states;

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    alice_processes_bundle(&mut alice_store, &mut bob_store)?;
    let first = encrypt(&mut alice_store, &locks, &bob_address(), "first")?;
    decrypt(&mut bob_store, &locks, &alice_address(), &first)?;
    let old_message = whisper_message(encrypt(
        &mut alice_store,
        &locks,
        &bob_address(),
        "from the first session",
    )?);

    let rekey = |alice_store: &mut InMemProtocolStore,
                 bob_store: &mut InMemProtocolStore|
     -> TestResult {
        alice_processes_bundle(alice_store, bob_store)?;
        let message = encrypt(alice_store, &locks, &bob_address(), "rekey")?;
        assert_eq!(message.message_type(), CiphertextMessageType::PreKey);
        decrypt(bob_store, &locks, &alice_address(), &message)?;
        Ok(())
    };

    for _ in 0..max_archived_states {
        rekey(&mut alice_store, &mut bob_store)?;
    }

    assert_eq!(
        bob_store
            .load_session(&alice_address())?
            .previous_session_count(),
        max_archived_states
    );

    {
        let mut cipher = SessionCipher::new(
            alice_address(),
            &mut bob_store.session_store,
            &mut bob_store.pre_key_store,
            &locks,
        );
        let pending = cipher.decrypt_signal(&old_message, &mut OsRng)?;
        assert_eq!(pending.plaintext(), b"from the first session");
        // Dropped without committing, so the oldest state stays archived.
    }

    rekey(&mut alice_store, &mut bob_store)?;
    assert_eq!(
        bob_store
            .load_session(&alice_address())?
            .previous_session_count(),
        max_archived_states
    );

    let err = decrypt(
        &mut bob_store,
        &locks,
        &alice_address(),
        &CiphertextMessage::WhisperMessage(old_message),
    )
    .expect_err("oldest state was evicted");
    assert_matches!(
        err,
        ProtocolError::NoValidSession { address, errors }
            if address == alice_address() && errors.len() == max_archived_states + 1
    );

    Ok(())
}

#[test]
fn test_message_from_previous_session_promotes_it() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    // Alice keeps a copy of the old session while a new one is negotiated.
    let mut old_alice_store = alice_store.clone();
    alice_processes_bundle(&mut alice_store, &mut bob_store)?;
    let rekey = encrypt(&mut alice_store, &locks, &bob_address(), "new session")?;
    decrypt(&mut bob_store, &locks, &alice_address(), &rekey)?;

    let bob_record = bob_store.load_session(&alice_address())?;
    assert_eq!(bob_record.previous_session_count(), 1);
    let new_base_key = bob_record.alice_base_key()?.to_vec();

    let stale = encrypt(&mut old_alice_store, &locks, &bob_address(), "old session")?;
    assert_eq!(stale.message_type(), CiphertextMessageType::Whisper);
    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &stale)?,
        b"old session"
    );

    let bob_record = bob_store.load_session(&alice_address())?;
    assert_eq!(bob_record.previous_session_count(), 1);
    assert_ne!(bob_record.alice_base_key()?, new_base_key.as_slice());

    Ok(())
}

#[test]
fn test_version_gate() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let message = encrypt(&mut alice_store, &locks, &bob_address(), "versioned")?;
    let bytes = message.serialize().to_vec();
    assert_eq!(bytes[0], 0x33);

    let with_version_byte = |byte: u8| {
        let mut bytes = bytes.clone();
        bytes[0] = byte;
        bytes
    };

    assert_matches!(
        WhisperMessage::try_from(with_version_byte(0x13).as_slice()),
        Err(ProtocolError::LegacyCiphertextVersion(1))
    );
    assert_matches!(
        WhisperMessage::try_from(with_version_byte(0x43).as_slice()),
        Err(ProtocolError::UnrecognizedCiphertextVersion(4))
    );
    assert!(WhisperMessage::is_legacy(&with_version_byte(0x13)));
    assert!(!WhisperMessage::is_legacy(&bytes));

    // A well-formed version 2 header does not make a version 3 session speak version 2.
    let downgraded = CiphertextMessage::deserialize(
        CiphertextMessageType::Whisper,
        &with_version_byte(0x23),
    )?;
    assert_matches!(
        decrypt(&mut bob_store, &locks, &alice_address(), &downgraded),
        Err(ProtocolError::NoValidSession { errors, .. })
            if matches!(errors.as_slice(), [ProtocolError::UnrecognizedMessageVersion(2)])
    );

    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &message)?,
        b"versioned"
    );

    Ok(())
}

#[test]
fn test_tampered_messages_are_rejected() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let message = encrypt(&mut alice_store, &locks, &bob_address(), "do not touch")?;
    let bytes = message.serialize().to_vec();

    for i in 0..bytes.len() {
        let mut tampered = bytes.clone();
        tampered[i] ^= 0x01;

        let mut bob_copy = bob_store.clone();
        let result = CiphertextMessage::deserialize(CiphertextMessageType::Whisper, &tampered)
            .and_then(|m| decrypt(&mut bob_copy, &locks, &alice_address(), &m));
        assert!(result.is_err(), "flipping byte {i} went unnoticed");
    }

    assert_eq!(
        decrypt(&mut bob_store, &locks, &alice_address(), &message)?,
        b"do not touch"
    );

    Ok(())
}

#[test]
fn test_abandoned_decryption_leaves_session_unchanged() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let message = whisper_message(encrypt(&mut alice_store, &locks, &bob_address(), "twice")?);
    let before = stored_session_bytes(&bob_store, &alice_address());

    {
        let mut cipher = SessionCipher::new(
            alice_address(),
            &mut bob_store.session_store,
            &mut bob_store.pre_key_store,
            &locks,
        );
        let pending = cipher.decrypt_signal(&message, &mut OsRng)?;
        assert_eq!(pending.plaintext(), b"twice");
        assert_eq!(pending.pre_key_id(), None);
        drop(pending);
    }
    assert_eq!(stored_session_bytes(&bob_store, &alice_address()), before);

    assert_eq!(
        decrypt_signal_with_limits(
            &mut bob_store,
            &locks,
            &alice_address(),
            &message,
            SessionLimits::default()
        )?,
        b"twice"
    );
    assert_ne!(stored_session_bytes(&bob_store, &alice_address()), before);

    assert_matches!(
        decrypt_signal_with_limits(
            &mut bob_store,
            &locks,
            &alice_address(),
            &message,
            SessionLimits::default()
        ),
        Err(ProtocolError::DuplicatedMessage(_, _))
    );

    Ok(())
}

#[test]
fn test_failing_callback_does_not_commit() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let message = whisper_message(encrypt(&mut alice_store, &locks, &bob_address(), "persist me")?);
    let before = stored_session_bytes(&bob_store, &alice_address());

    let mut cipher = SessionCipher::new(
        alice_address(),
        &mut bob_store.session_store,
        &mut bob_store.pre_key_store,
        &locks,
    );

    let result = cipher.decrypt_signal_with_callback(&message, &mut OsRng, |plaintext| {
        assert_eq!(plaintext, b"persist me");
        Err("disk full".into())
    });
    assert_matches!(
        result,
        Err(ProtocolError::ApplicationCallbackError("decrypt", e)) if e.to_string() == "disk full"
    );

    let mut seen = None;
    let plaintext = cipher.decrypt_signal_with_callback(&message, &mut OsRng, |plaintext| {
        seen = Some(plaintext.to_vec());
        Ok(())
    })?;
    assert_eq!(plaintext, b"persist me");
    assert_eq!(seen.as_deref(), Some(&b"persist me"[..]));
    drop(cipher);

    assert_ne!(stored_session_bytes(&bob_store, &alice_address()), before);

    Ok(())
}

#[test]
fn test_callback_can_encrypt_to_another_address() -> TestResult {
    let locks = SessionLocks::global();

    let (mut alice_store, bob_store) = initialized_stores(&alice_address(), &bob_address())?;
    let (bob_store_for_carol, mut carol_store) =
        initialized_stores(&bob_address(), &carol_address())?;

    let bob_sessions = SharedSessionStore::default();
    let mut handle = bob_sessions.clone();
    handle.store_session(&alice_address(), &bob_store.load_session(&alice_address())?)?;
    handle.store_session(
        &carol_address(),
        &bob_store_for_carol.load_session(&carol_address())?,
    )?;

    let message = whisper_message(encrypt(&mut alice_store, &locks, &bob_address(), "pass it on")?);

    let mut forwarded = None;
    let mut pre_key_store = InMemPreKeyStore::new();
    let mut cipher = SessionCipher::new(alice_address(), &mut handle, &mut pre_key_store, &locks);
    let plaintext = cipher.decrypt_signal_with_callback(&message, &mut OsRng, |plaintext| {
        let mut carol_sessions = bob_sessions.clone();
        let mut carol_pre_keys = InMemPreKeyStore::new();
        let mut to_carol = SessionCipher::new(
            carol_address(),
            &mut carol_sessions,
            &mut carol_pre_keys,
            &locks,
        );
        forwarded = Some(to_carol.encrypt(plaintext)?);
        Ok(())
    })?;
    assert_eq!(plaintext, b"pass it on");
    drop(cipher);

    let forwarded = forwarded.expect("callback ran");
    assert_eq!(
        decrypt(&mut carol_store, &locks, &bob_address(), &forwarded)?,
        b"pass it on"
    );
    // The decryption was committed once the callback succeeded.
    let mut cipher = SessionCipher::new(alice_address(), &mut handle, &mut pre_key_store, &locks);
    assert_matches!(
        cipher.decrypt_signal(&message, &mut OsRng),
        Err(ProtocolError::DuplicatedMessage(_, _))
    );

    Ok(())
}

#[test]
fn test_commit_refuses_to_overwrite_a_newer_record() -> TestResult {
    let locks = SessionLocks::global();

    let (mut alice_store, bob_store) = initialized_stores(&alice_address(), &bob_address())?;
    let bob_sessions = SharedSessionStore::default();
    bob_sessions
        .clone()
        .store_session(&alice_address(), &bob_store.load_session(&alice_address())?)?;

    let message = whisper_message(encrypt(&mut alice_store, &locks, &bob_address(), "hello")?);

    let mut inbound = bob_sessions.clone();
    let mut pre_key_store = InMemPreKeyStore::new();
    let mut cipher = SessionCipher::new(alice_address(), &mut inbound, &mut pre_key_store, &locks);
    let pending = cipher.decrypt_signal(&message, &mut OsRng)?;

    // The same thread replies to Alice before the decryption is committed.
    let mut outbound = bob_sessions.clone();
    let mut outbound_pre_keys = InMemPreKeyStore::new();
    let reply = SessionCipher::new(alice_address(), &mut outbound, &mut outbound_pre_keys, &locks)
        .encrypt(b"reply")?;
    let after_reply = bob_sessions.load_session(&alice_address())?.serialize();

    assert_matches!(pending.commit(), Err(ProtocolError::InvalidState("commit", _)));
    assert_eq!(
        bob_sessions.load_session(&alice_address())?.serialize(),
        after_reply
    );

    assert_eq!(decrypt(&mut alice_store, &locks, &bob_address(), &reply)?, b"reply");
    let plaintext = cipher.decrypt_signal(&message, &mut OsRng)?.commit()?;
    assert_eq!(plaintext, b"hello");

    Ok(())
}

#[test]
fn test_abandoned_prekey_decryption_keeps_pre_key() -> TestResult {
    let mut csprng = OsRng;
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    let bob_bundle = create_pre_key_bundle(&mut bob_store, &mut csprng)?;
    let bob_pre_key_id = bob_bundle.pre_key_id().expect("bundle has a one-time pre-key");
    process_prekey_bundle(
        &bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.identity_store,
        &bob_bundle,
        &SessionLimits::default(),
        &mut csprng,
    )?;

    let CiphertextMessage::PreKeyWhisperMessage(message) =
        encrypt(&mut alice_store, &locks, &bob_address(), "first contact")?
    else {
        panic!("expected a pre-key message");
    };

    let decrypt_prekey = |bob_store: &mut InMemProtocolStore,
                          commit: bool|
     -> Result<Vec<u8>, ProtocolError> {
        let mut builder = PreKeySessionBuilder::new(
            &mut bob_store.identity_store,
            &bob_store.signed_pre_key_store,
        );
        let mut cipher = SessionCipher::new(
            alice_address(),
            &mut bob_store.session_store,
            &mut bob_store.pre_key_store,
            &locks,
        );
        let pending = cipher.decrypt_prekey(&message, &mut builder, &mut OsRng)?;
        assert_eq!(pending.pre_key_id(), Some(bob_pre_key_id));
        if commit {
            pending.commit()
        } else {
            let plaintext = pending.plaintext().to_vec();
            Ok(plaintext)
        }
    };

    assert_eq!(decrypt_prekey(&mut bob_store, false)?, b"first contact");
    assert!(!bob_store.contains_session(&alice_address())?);
    bob_store.get_pre_key(bob_pre_key_id)?;
    assert_eq!(bob_store.identity_store.get_identity(&alice_address())?, None);

    assert_eq!(decrypt_prekey(&mut bob_store, true)?, b"first contact");
    assert!(bob_store.contains_session(&alice_address())?);
    assert_eq!(
        bob_store.identity_store.get_identity(&alice_address())?,
        Some(*alice_store.get_identity_key_pair()?.identity_key())
    );
    assert_matches!(
        bob_store.get_pre_key(bob_pre_key_id),
        Err(ProtocolError::InvalidPreKeyId)
    );

    Ok(())
}

#[test]
fn test_no_session() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;

    {
        let cipher = SessionCipher::new(
            bob_address(),
            &mut alice_store.session_store,
            &mut alice_store.pre_key_store,
            &locks,
        );
        assert_matches!(cipher.session_version(), Err(ProtocolError::SessionNotFound(_)));
        assert_matches!(
            cipher.remote_registration_id(),
            Err(ProtocolError::SessionNotFound(_))
        );
    }
    assert_matches!(
        encrypt(&mut alice_store, &locks, &bob_address(), "anyone there?"),
        Err(ProtocolError::SessionNotFound(address)) if address == bob_address()
    );

    establish_session(&mut alice_store, &mut bob_store, &locks)?;
    let message = whisper_message(encrypt(&mut alice_store, &locks, &bob_address(), "hi")?);

    // Carol has never talked to Alice.
    let mut carol_store = test_in_memory_protocol_store()?;
    {
        let mut cipher = SessionCipher::new(
            alice_address(),
            &mut carol_store.session_store,
            &mut carol_store.pre_key_store,
            &locks,
        );
        assert_matches!(
            cipher.decrypt_signal(&message, &mut OsRng),
            Err(ProtocolError::SessionNotFound(_))
        );
    }

    let cipher = SessionCipher::new(
        bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.pre_key_store,
        &locks,
    );
    assert_eq!(cipher.session_version()?, 3);
    assert_eq!(
        cipher.remote_registration_id()?,
        bob_store.get_local_registration_id()?
    );

    Ok(())
}

#[test]
fn test_sender_key_messages_are_rejected() -> TestResult {
    let mut csprng = OsRng;
    let locks = SessionLocks::global();

    let mut bob_store = test_in_memory_protocol_store()?;
    let signing_key = KeyPair::generate(&mut csprng);
    let message = CiphertextMessage::SenderKeyMessage(SenderKeyMessage::new(
        7,
        0,
        b"group ciphertext",
        &signing_key.private_key,
        &mut csprng,
    )?);

    assert_matches!(
        decrypt(&mut bob_store, &locks, &alice_address(), &message),
        Err(ProtocolError::InvalidArgument(_))
    );

    Ok(())
}

#[test]
fn test_basic_simultaneous_initiate_v2() -> TestResult {
    let locks = SessionLocks::global();

    let (alice_record, bob_record) = initialize_sessions_v2()?;
    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    alice_store.store_session(&bob_address(), &alice_record)?;
    bob_store.store_session(&alice_address(), &bob_record)?;

    for i in 0..3 {
        let from_alice = encrypt(&mut alice_store, &locks, &bob_address(), &format!("v2 a{i}"))?;
        assert_eq!(from_alice.message_type(), CiphertextMessageType::Whisper);
        assert_eq!(from_alice.serialize()[0], 0x23);
        assert_eq!(
            decrypt(&mut bob_store, &locks, &alice_address(), &from_alice)?,
            format!("v2 a{i}").as_bytes()
        );

        let from_bob = encrypt(&mut bob_store, &locks, &alice_address(), &format!("v2 b{i}"))?;
        assert_eq!(from_bob.serialize()[0], 0x23);
        assert_eq!(
            decrypt(&mut alice_store, &locks, &bob_address(), &from_bob)?,
            format!("v2 b{i}").as_bytes()
        );
    }

    let cipher = SessionCipher::new(
        alice_address(),
        &mut bob_store.session_store,
        &mut bob_store.pre_key_store,
        &locks,
    );
    assert_eq!(cipher.session_version()?, 2);

    Ok(())
}

#[test]
fn test_session_record_survives_serialization() -> TestResult {
    let locks = SessionLocks::global();

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let skipped = encrypt(&mut alice_store, &locks, &bob_address(), "skipped")?;
    let delivered = encrypt(&mut alice_store, &locks, &bob_address(), "delivered")?;
    decrypt(&mut bob_store, &locks, &alice_address(), &delivered)?;

    let record = bob_store.load_session(&alice_address())?;
    let restored = SessionRecord::deserialize(&record.serialize())?;
    assert_eq!(restored.serialize(), record.serialize());

    let mut restored_store = test_in_memory_protocol_store()?;
    restored_store.store_session(&alice_address(), &restored)?;
    assert_eq!(
        decrypt(&mut restored_store, &locks, &alice_address(), &skipped)?,
        b"skipped"
    );

    Ok(())
}

#[test]
fn test_concurrent_decryption_of_distinct_sessions() -> TestResult {
    const SENDERS: usize = 4;
    const MESSAGES_PER_SENDER: usize = 8;

    let locks = Arc::new(SessionLocks::sharded(16));
    let mut bob_store = test_in_memory_protocol_store()?;
    let shared = SharedSessionStore::default();

    let mut inboxes = vec![];
    for sender in 0..SENDERS {
        let sender_address =
            ProtocolAddress::new(format!("+1415555000{sender}"), DeviceId::PRIMARY);
        let mut sender_store = test_in_memory_protocol_store()?;

        alice_processes_bundle(&mut sender_store, &mut bob_store)?;
        let hello = encrypt(&mut sender_store, &locks, &bob_address(), "hello")?;
        decrypt(&mut bob_store, &locks, &sender_address, &hello)?;

        let mut shared_handle = shared.clone();
        shared_handle.store_session(&sender_address, &bob_store.load_session(&sender_address)?)?;

        let messages: Vec<_> = (0..MESSAGES_PER_SENDER)
            .map(|i| {
                encrypt(&mut sender_store, &locks, &bob_address(), &format!("{sender}:{i}"))
                    .map(whisper_message)
            })
            .collect::<Result<_, _>>()?;
        inboxes.push((sender_address, messages));
    }

    thread::scope(|scope| {
        for (sender, (sender_address, messages)) in inboxes.iter().enumerate() {
            let mut session_store = shared.clone();
            let locks = Arc::clone(&locks);
            scope.spawn(move || {
                let mut pre_key_store = InMemPreKeyStore::new();
                let mut cipher = SessionCipher::new(
                    sender_address.clone(),
                    &mut session_store,
                    &mut pre_key_store,
                    &locks,
                );
                for (i, message) in messages.iter().enumerate() {
                    let plaintext = cipher
                        .decrypt_signal(message, &mut OsRng)
                        .and_then(PendingDecryption::commit)
                        .expect("decrypts");
                    assert_eq!(plaintext, format!("{sender}:{i}").as_bytes());
                }
            });
        }
    });

    let mut session_store = shared.clone();
    for (sender, (sender_address, messages)) in inboxes.iter().enumerate() {
        let mut pre_key_store = InMemPreKeyStore::new();
        let mut cipher =
            SessionCipher::new(sender_address.clone(), &mut session_store, &mut pre_key_store, &locks);
        for message in messages {
            assert_matches!(
                cipher.decrypt_signal(message, &mut OsRng),
                Err(ProtocolError::DuplicatedMessage(_, _)),
                "sender {sender}"
            );
        }
    }

    Ok(())
}

#[test]
fn test_concurrent_decryption_of_one_session() -> TestResult {
    const THREADS: usize = 4;
    const MESSAGES_PER_THREAD: usize = 10;

    let locks = Arc::new(SessionLocks::sharded(8));
    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    establish_session(&mut alice_store, &mut bob_store, &locks)?;

    let shared = SharedSessionStore::default();
    shared
        .clone()
        .store_session(&alice_address(), &bob_store.load_session(&alice_address())?)?;

    let messages: Vec<_> = (0..THREADS * MESSAGES_PER_THREAD)
        .map(|i| {
            encrypt(&mut alice_store, &locks, &bob_address(), &i.to_string()).map(whisper_message)
        })
        .collect::<Result<_, _>>()?;

    // Thread t takes messages t, t + THREADS, ..., so every thread skips ahead of the others.
    thread::scope(|scope| {
        for t in 0..THREADS {
            let mut session_store = shared.clone();
            let locks = Arc::clone(&locks);
            let messages = &messages;
            scope.spawn(move || {
                let mut pre_key_store = InMemPreKeyStore::new();
                let mut cipher = SessionCipher::new(
                    alice_address(),
                    &mut session_store,
                    &mut pre_key_store,
                    &locks,
                );
                for i in (t..messages.len()).step_by(THREADS) {
                    let plaintext = cipher
                        .decrypt_signal(&messages[i], &mut OsRng)
                        .and_then(PendingDecryption::commit)
                        .expect("no update is lost");
                    assert_eq!(plaintext, i.to_string().as_bytes());
                }
            });
        }
    });

    let mut session_store = shared.clone();
    let mut pre_key_store = InMemPreKeyStore::new();
    let mut cipher = SessionCipher::new(
        alice_address(),
        &mut session_store,
        &mut pre_key_store,
        &locks,
    );
    for message in &messages {
        assert_matches!(
            cipher.decrypt_signal(message, &mut OsRng),
            Err(ProtocolError::DuplicatedMessage(_, _))
        );
    }

    Ok(())
}

fn round_trip(payload: &[u8]) -> Result<(CiphertextMessage, Vec<u8>), ProtocolError> {
    let locks = SessionLocks::global();
    let (alice_record, bob_record) = initialize_sessions_v3()?;

    let mut alice_store = test_in_memory_protocol_store()?;
    let mut bob_store = test_in_memory_protocol_store()?;
    alice_store.store_session(&bob_address(), &alice_record)?;
    bob_store.store_session(&alice_address(), &bob_record)?;

    let ciphertext = SessionCipher::new(
        bob_address(),
        &mut alice_store.session_store,
        &mut alice_store.pre_key_store,
        &locks,
    )
    .encrypt(payload)?;
    let plaintext = decrypt(&mut bob_store, &locks, &alice_address(), &ciphertext)?;
    Ok((ciphertext, plaintext))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_arbitrary_payloads_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let (ciphertext, plaintext) = round_trip(&payload).expect("round trip");
        prop_assert_eq!(ciphertext.message_type(), CiphertextMessageType::Whisper);
        prop_assert_eq!(plaintext, payload);
    }
}
