// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers to create key material quickly in tests.
use crate::crypto::rsa::RsaKeyPair;
use crate::published_key::PublishedKey;

/// Small modulus to keep key generation fast in tests. Never use this outside of tests.
pub const TEST_RSA_MODULUS_BITS: usize = 1024;

pub fn rsa_key_pair() -> RsaKeyPair {
    RsaKeyPair::generate(TEST_RSA_MODULUS_BITS).unwrap()
}

pub fn published_key(label: &str) -> PublishedKey {
    PublishedKey::issue(label, TEST_RSA_MODULUS_BITS, parley_core::now_millis()).unwrap()
}
