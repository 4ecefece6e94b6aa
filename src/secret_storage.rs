// Copyright 2026 The megolm-engine contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Short-lived secret-storage key material.
//!
//! The private half of a secret-storage key only ever lives inside a
//! [`SecretStorageKey`]. Dropping the handle wipes the bytes, on every exit
//! path including unwinding, so forgetting to release it is impossible by
//! construction.

use rand::RngCore;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::Zeroizing;

/// A freshly generated or imported secret-storage key.
pub struct SecretStorageKey {
    private_key: Zeroizing<[u8; 32]>,
    public_key: Curve25519PublicKey,
}

impl SecretStorageKey {
    /// Generate a new random key.
    pub fn new() -> Self {
        let mut private_key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut *private_key);

        Self::from_private_key(private_key)
    }

    /// Import a key from its raw private bytes.
    pub fn from_private_key(private_key: Zeroizing<[u8; 32]>) -> Self {
        let secret = Curve25519SecretKey::from_slice(&private_key);
        let public_key = Curve25519PublicKey::from(&secret);

        Self {
            private_key,
            public_key,
        }
    }

    /// The public half of the key, safe to store and share.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// Check whether this key is the private counterpart of the given
    /// public key.
    pub fn matches(&self, expected: &Curve25519PublicKey) -> bool {
        self.public_key == *expected
    }

    /// Borrow the raw private bytes, for handing to an encryption
    /// primitive. The borrow can't outlive the wiping of the handle.
    pub fn private_key_bytes(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl Default for SecretStorageKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretStorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStorageKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Run a closure with a freshly generated secret-storage key.
///
/// The private key material is wiped when the closure returns, no matter
/// how it returns.
pub fn with_new_secret_storage_key<F, R>(f: F) -> R
where
    F: FnOnce(&SecretStorageKey) -> R,
{
    let key = SecretStorageKey::new();
    f(&key)
}

#[cfg(test)]
mod tests {
    use zeroize::Zeroizing;

    use super::{with_new_secret_storage_key, SecretStorageKey};

    #[test]
    fn private_key_check() {
        let key = SecretStorageKey::new();
        let public_key = key.public_key();

        let reimported =
            SecretStorageKey::from_private_key(Zeroizing::new(*key.private_key_bytes()));
        assert!(reimported.matches(&public_key));

        let other = SecretStorageKey::new();
        assert!(!other.matches(&public_key));
    }

    #[test]
    fn scoped_key_returns_closure_result() {
        let public_key = with_new_secret_storage_key(|key| key.public_key());

        // The key itself is gone, only the public half escaped the scope.
        let other = SecretStorageKey::new();
        assert_ne!(other.public_key(), public_key);
    }
}
