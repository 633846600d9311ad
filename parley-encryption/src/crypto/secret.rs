// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Fixed-size symmetric key material.
///
/// Bytes are wiped from memory when the value is dropped, compared in constant time and never
/// printed. Only this crate can read them.
#[derive(Clone, Eq, ZeroizeOnDrop)]
pub struct Secret<const N: usize>([u8; N]);

impl<const N: usize> Secret<N> {
    /// Fills a new secret from the operating system's random number generator.
    pub(crate) fn random() -> Self {
        let mut bytes = [0u8; N];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn debug_output_hides_bytes() {
        let secret = Secret::from_bytes([42u8; 4]);
        assert_eq!(format!("{secret:?}"), "Secret<4>(***)");
    }

    #[test]
    fn random_secrets_differ() {
        let secret = Secret::<32>::random();
        assert_ne!(secret, Secret::<32>::random());
        assert_eq!(secret, secret.clone());
        assert_ne!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([2u8; 8]));
    }
}
