use super::*;
use crate::frame::AUTH_TAG_LEN;

fn incrementing_material() -> KeyMaterial {
    let raw: Vec<u8> = (1..=32).collect();
    KeyMaterial::new(&raw).unwrap()
}

fn send_context(material: KeyMaterial, index: u8) -> Context {
    let mut ctx = Context::new(16, 0);
    ctx.set_key(material, index).unwrap();
    ctx
}

fn receive_context(material: KeyMaterial, index: u8) -> Context {
    let mut ctx = Context::new(16, 8);
    ctx.set_key(material, index).unwrap();
    ctx
}

#[test]
fn test_encrypt_audio_frame_layout() -> crate::Result<()> {
    let mut sender = send_context(incrementing_material(), 0);
    sender.send_counters.insert(0x11223344, 0);

    let payload = Bytes::from_static(&[0x42, 0x43, 0x44]);
    let encrypted = sender.encrypt_frame(FrameKind::Audio, 0x11223344, 0xAABBCCDD, &payload)?;

    // prefix(1) + ciphertext+tag(2 + 16) + IV(12) + key index(1)
    assert_eq!(encrypted.len(), 32);
    assert_eq!(encrypted[0], 0x42);
    assert_eq!(
        &encrypted[19..31],
        &[0x11, 0x22, 0x33, 0x44, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(encrypted[31], 0x00);

    let mut receiver = receive_context(incrementing_material(), 0);
    match receiver.decrypt_frame(FrameKind::Audio, &encrypted)? {
        DecryptOutcome::Plaintext(plaintext) => assert_eq!(plaintext, payload),
        outcome => panic!("expected plaintext, got {outcome:?}"),
    }
    Ok(())
}

#[test]
fn test_round_trip_all_frame_kinds() -> crate::Result<()> {
    let material = KeyMaterial::generate();
    let mut sender = send_context(material.clone(), 3);
    let mut receiver = receive_context(material, 3);

    let payload = Bytes::from((0u8..64).collect::<Vec<u8>>());
    for kind in [FrameKind::KeyVideo, FrameKind::DeltaVideo, FrameKind::Audio] {
        let encrypted = sender.encrypt_frame(kind, 0xDEADBEEF, 90_000, &payload)?;
        assert_eq!(
            encrypted.len(),
            payload.len() + AUTH_TAG_LEN + TRAILER_LEN,
            "{kind:?}"
        );
        // The prefix is carried verbatim.
        let prefix_len = kind.unencrypted_bytes();
        assert_eq!(&encrypted[..prefix_len], &payload[..prefix_len]);

        match receiver.decrypt_frame(kind, &encrypted)? {
            DecryptOutcome::Plaintext(plaintext) => assert_eq!(plaintext, payload, "{kind:?}"),
            outcome => panic!("expected plaintext for {kind:?}, got {outcome:?}"),
        }
    }
    Ok(())
}

#[test]
fn test_send_counter_advances_per_frame() -> crate::Result<()> {
    let mut sender = send_context(KeyMaterial::generate(), 0);
    sender.send_counters.insert(1, 0xFFFE);

    let payload = Bytes::from_static(&[0x42, 0x43, 0x44]);
    let first = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    let second = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    let third = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;

    let counter = |frame: &Bytes| frame[frame.len() - 5..frame.len() - 1].to_vec();
    assert_eq!(counter(&first), [0x00, 0x00, 0xFF, 0xFE]);
    assert_eq!(counter(&second), [0x00, 0x00, 0xFF, 0xFF]);
    // Wraps mod 2^16.
    assert_eq!(counter(&third), [0x00, 0x00, 0x00, 0x00]);
    Ok(())
}

#[test]
fn test_no_key_is_passthrough() -> crate::Result<()> {
    let mut sender = Context::new(16, 0);
    let payload = Bytes::from_static(&[1, 2, 3, 4]);
    let out = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    assert_eq!(out, payload);
    // No counter was consumed for a passthrough frame.
    assert!(sender.send_counters.is_empty());
    Ok(())
}

#[test]
fn test_unknown_key_index_is_passthrough() -> crate::Result<()> {
    let material = KeyMaterial::generate();
    let mut sender = send_context(material.clone(), 0);
    let mut receiver = Context::new(16, 8);
    receiver.set_key(material, 1)?;

    let payload = Bytes::from_static(&[1, 2, 3, 4]);
    let encrypted = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    match receiver.decrypt_frame(FrameKind::Audio, &encrypted)? {
        DecryptOutcome::Passthrough(out) => assert_eq!(out, encrypted),
        outcome => panic!("expected passthrough, got {outcome:?}"),
    }
    Ok(())
}

#[test]
fn test_key_rollover_across_indices() -> crate::Result<()> {
    let m0 = KeyMaterial::generate();
    let m1 = KeyMaterial::generate();

    let mut sender = send_context(m0.clone(), 0);
    let payload = Bytes::from_static(&[9, 8, 7, 6, 5]);
    let first = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;

    sender.set_key(m1.clone(), 1)?;
    let second = sender.encrypt_frame(FrameKind::Audio, 1, 960, &payload)?;
    assert_eq!(first[first.len() - 1], 0);
    assert_eq!(second[second.len() - 1], 1);

    // A receiver holding both entries decrypts both.
    let mut both = receive_context(m0, 0);
    both.set_key(m1.clone(), 1)?;
    assert!(matches!(
        both.decrypt_frame(FrameKind::Audio, &first)?,
        DecryptOutcome::Plaintext(ref p) if *p == payload
    ));
    assert!(matches!(
        both.decrypt_frame(FrameKind::Audio, &second)?,
        DecryptOutcome::Plaintext(ref p) if *p == payload
    ));

    // A receiver with only the new entry passes the old frame through.
    let mut latecomer = receive_context(m1, 1);
    assert!(matches!(
        latecomer.decrypt_frame(FrameKind::Audio, &first)?,
        DecryptOutcome::Passthrough(_)
    ));
    assert!(matches!(
        latecomer.decrypt_frame(FrameKind::Audio, &second)?,
        DecryptOutcome::Plaintext(_)
    ));
    Ok(())
}

#[test]
fn test_tampered_prefix_fails_authentication() -> crate::Result<()> {
    let material = KeyMaterial::generate();
    let mut sender = send_context(material.clone(), 0);
    let mut receiver = receive_context(material, 0);

    let payload = Bytes::from((0u8..32).collect::<Vec<u8>>());
    let encrypted = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;

    let mut tampered = encrypted.to_vec();
    tampered[0] ^= 0x01;
    assert_eq!(
        receiver.decrypt_frame(FrameKind::Audio, &Bytes::from(tampered)),
        Err(Error::FailedToDecryptFrame)
    );

    // The untampered frame still decrypts: recovery attempts left the
    // installed material alone.
    assert!(matches!(
        receiver.decrypt_frame(FrameKind::Audio, &encrypted)?,
        DecryptOutcome::Plaintext(_)
    ));
    Ok(())
}

#[test]
fn test_short_frame_with_known_index_is_malformed() -> crate::Result<()> {
    let mut receiver = receive_context(KeyMaterial::generate(), 0);

    // 13 bytes ending in a recognized key index: shorter than the minimum
    // envelope of prefix(1) + trailer(13).
    let short = Bytes::from(vec![0u8; 13]);
    assert_eq!(
        receiver.decrypt_frame(FrameKind::Audio, &short),
        Err(Error::FrameTooShort(13, 14))
    );

    let empty = Bytes::new();
    assert!(matches!(
        receiver.decrypt_frame(FrameKind::Audio, &empty)?,
        DecryptOutcome::Passthrough(_)
    ));
    Ok(())
}

#[test]
fn test_ratchet_recovery_within_window() -> crate::Result<()> {
    let m0 = incrementing_material();
    let mut receiver = receive_context(m0.clone(), 0);

    // The sender ratcheted twice past the receiver's announcement.
    let ahead = m0.ratchet()?.ratchet()?;
    let mut sender = send_context(ahead, 0);

    let payload = Bytes::from_static(&[1, 2, 3, 4, 5]);
    let first = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    assert!(matches!(
        receiver.decrypt_frame(FrameKind::Audio, &first)?,
        DecryptOutcome::Plaintext(ref p) if *p == payload
    ));

    // The advanced material was written back: the next frame authenticates
    // on the first try even with recovery disabled.
    receiver.ratchet_window = 0;
    let second = sender.encrypt_frame(FrameKind::Audio, 1, 960, &payload)?;
    assert!(matches!(
        receiver.decrypt_frame(FrameKind::Audio, &second)?,
        DecryptOutcome::Plaintext(ref p) if *p == payload
    ));
    Ok(())
}

#[test]
fn test_ratchet_recovery_window_is_bounded() -> crate::Result<()> {
    let m0 = incrementing_material();
    let mut receiver = receive_context(m0.clone(), 0);

    let mut ahead = m0;
    for _ in 0..9 {
        ahead = ahead.ratchet()?;
    }
    let mut sender = send_context(ahead, 0);

    let payload = Bytes::from_static(&[1, 2, 3, 4, 5]);
    let encrypted = sender.encrypt_frame(FrameKind::Audio, 1, 0, &payload)?;
    assert_eq!(
        receiver.decrypt_frame(FrameKind::Audio, &encrypted),
        Err(Error::FailedToDecryptFrame)
    );
    Ok(())
}
