//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{ProtocolError, Result};

/// HKDF-SHA256 as spoken by a particular session version.
///
/// Version 3 is RFC 5869. Version 2 numbers its expansion blocks starting from 0 instead of 1,
/// which changes every output byte; it is kept so that old sessions keep decrypting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HKDF {
    iteration_start_offset: u8,
}

impl HKDF {
    const HASH_OUTPUT_SIZE: usize = 32;

    pub fn new(message_version: u32) -> Result<Self> {
        match message_version {
            2 => Ok(HKDF {
                iteration_start_offset: 0,
            }),
            3 => Ok(HKDF {
                iteration_start_offset: 1,
            }),
            _ => Err(ProtocolError::UnrecognizedMessageVersion(message_version)),
        }
    }

    pub fn derive_secrets<const N: usize>(self, input_key_material: &[u8], info: &[u8]) -> [u8; N] {
        self.derive_salted_secrets(input_key_material, &[0u8; Self::HASH_OUTPUT_SIZE], info)
    }

    pub fn derive_salted_secrets<const N: usize>(
        self,
        input_key_material: &[u8],
        salt: &[u8],
        info: &[u8],
    ) -> [u8; N] {
        let mut okm = [0u8; N];
        let (prk, hkdf) = hkdf::Hkdf::<Sha256>::extract(Some(salt), input_key_material);
        if self.iteration_start_offset == 1 {
            hkdf.expand(info, &mut okm).expect("valid output length");
        } else {
            Self::expand_from_zero(&prk, info, &mut okm);
        }
        okm
    }

    fn expand_from_zero(prk: &[u8], info: &[u8], okm: &mut [u8]) {
        let mut previous: Option<[u8; Self::HASH_OUTPUT_SIZE]> = None;
        for (i, block) in okm.chunks_mut(Self::HASH_OUTPUT_SIZE).enumerate() {
            let mut mac = Hmac::<Sha256>::new_from_slice(prk)
                .expect("HMAC-SHA256 should accept any size key");
            if let Some(previous) = &previous {
                mac.update(previous);
            }
            mac.update(info);
            mac.update(&[i as u8]);
            let step: [u8; Self::HASH_OUTPUT_SIZE] = mac.finalize().into_bytes().into();
            block.copy_from_slice(&step[..block.len()]);
            previous = Some(step);
        }
    }
}
