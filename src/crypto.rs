//! Cryptographic primitives capability: CSRF `state` generation for the
//! OAuth2 flow.
//!
//! Injected like every other capability in [`crate::cloud_factory::InitData`]
//! — the core never reaches for a global RNG.

use rand::RngCore;

/// Random state generation used by the auth module to mint unguessable CSRF
/// tokens for one authorization flow.
pub trait CryptoCapability: Send + Sync {
    /// A fresh, unguessable CSRF `state` token for one authorization flow.
    fn random_state(&self) -> String;
}

/// Default implementation backed by `rand`, matching the crate already used
/// elsewhere in this crate's OAuth and provider code.
#[derive(Default)]
pub struct DefaultCrypto;

impl CryptoCapability for DefaultCrypto {
    fn random_state(&self) -> String {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_state_is_nonempty_and_varies() {
        let crypto = DefaultCrypto;
        let a = crypto.random_state();
        let b = crypto.random_state();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
