//! Encryption abstraction consumed by the boosting protocol

use fedgb_core::Result;
use std::fmt::Debug;

/// Additively homomorphic encryption scheme
///
/// Keys and ciphertexts are opaque to the protocol. They cross party
/// boundaries only in their string form, so every type must round-trip
/// through its `serialize_*`/`restore_*` pair.
pub trait EncryptionTool: Clone + Send + Sync + 'static {
    type PrivateKey: Clone + Debug + Send + Sync;
    type PublicKey: Clone + Debug + Send + Sync;
    type Ciphertext: Clone + Debug + Send + Sync;

    /// Generate a fresh private key of the given modulus size
    fn key_generate(&self, bits: usize) -> Result<Self::PrivateKey>;

    /// Public half of a private key
    fn public_key(&self, private_key: &Self::PrivateKey) -> Self::PublicKey;

    fn encrypt(&self, value: f64, public_key: &Self::PublicKey) -> Result<Self::Ciphertext>;

    fn decrypt(&self, ciphertext: &Self::Ciphertext, private_key: &Self::PrivateKey) -> Result<f64>;

    /// Homomorphic addition: decrypt(add(a, b)) == decrypt(a) + decrypt(b)
    fn add(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
        public_key: &Self::PublicKey,
    ) -> Self::Ciphertext;

    fn serialize_ciphertext(&self, ciphertext: &Self::Ciphertext) -> String;

    fn restore_ciphertext(&self, s: &str) -> Result<Self::Ciphertext>;

    fn serialize_public_key(&self, public_key: &Self::PublicKey) -> String;

    fn restore_public_key(&self, s: &str) -> Result<Self::PublicKey>;

    fn serialize_private_key(&self, private_key: &Self::PrivateKey) -> String;

    fn restore_private_key(&self, s: &str) -> Result<Self::PrivateKey>;

    /// Homomorphic sum of a sequence, None when the sequence is empty
    fn sum<'a, I>(&self, ciphertexts: I, public_key: &Self::PublicKey) -> Option<Self::Ciphertext>
    where
        I: IntoIterator<Item = &'a Self::Ciphertext>,
        Self::Ciphertext: 'a,
    {
        ciphertexts.into_iter().fold(None, |acc, c| match acc {
            None => Some(c.clone()),
            Some(acc) => Some(self.add(&acc, c, public_key)),
        })
    }
}
