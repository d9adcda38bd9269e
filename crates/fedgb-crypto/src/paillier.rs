//! Paillier cryptosystem with fixed-point encoding of signed reals
//!
//! Uses the `g = n + 1` variant, so encryption is
//! `c = (1 + m·n) · r^n mod n²` and decryption is
//! `m = L(c^φ mod n²) · φ⁻¹ mod n` with `L(x) = (x - 1) / n`.
//! Negative values are encoded as `n - |m|`; anything above `n / 2`
//! decodes as negative.

use crate::tool::EncryptionTool;
use fedgb_core::{Error, Result};
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use num_traits::{One, ToPrimitive, Zero};
use tracing::debug;

/// Default number of fractional bits in the fixed-point encoding
pub const DEFAULT_FRACTION_BITS: u32 = 32;

/// Largest encodable magnitude before scaling, in bits
const MAX_MAGNITUDE_BITS: u32 = 100;

/// Paillier public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaillierPublicKey {
    n: BigUint,
    n_squared: BigUint,
}

impl PaillierPublicKey {
    fn new(n: BigUint) -> Self {
        let n_squared = &n * &n;
        Self { n, n_squared }
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.n.bits()
    }
}

/// Paillier private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaillierPrivateKey {
    phi: BigUint,
    mu: BigUint,
    public: PaillierPublicKey,
}

impl PaillierPrivateKey {
    fn from_primes(p: &BigUint, q: &BigUint) -> Self {
        let one = BigUint::one();
        let n = p * q;
        let phi = (p - &one) * (q - &one);
        // gcd(φ, n) = 1 for equal-size primes, so φ⁻¹ = φ^(φ(n) - 1) mod n
        let mu = phi.modpow(&(&phi - &one), &n);
        Self {
            phi,
            mu,
            public: PaillierPublicKey::new(n),
        }
    }
}

/// Paillier ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaillierCiphertext(BigUint);

/// Paillier implementation of [`EncryptionTool`]
#[derive(Debug, Clone)]
pub struct PaillierTool {
    fraction_bits: u32,
}

impl Default for PaillierTool {
    fn default() -> Self {
        Self::new(DEFAULT_FRACTION_BITS)
    }
}

impl PaillierTool {
    pub fn new(fraction_bits: u32) -> Self {
        Self { fraction_bits }
    }

    fn scale(&self) -> f64 {
        2f64.powi(self.fraction_bits as i32)
    }

    fn encode(&self, value: f64, public_key: &PaillierPublicKey) -> Result<BigUint> {
        if !value.is_finite() {
            return Err(Error::Encryption {
                message: format!("cannot encode non-finite value {value}"),
            });
        }
        let scaled = (value * self.scale()).round();
        if scaled.abs() >= 2f64.powi(MAX_MAGNITUDE_BITS as i32) {
            return Err(Error::Encryption {
                message: format!("value {value} exceeds the fixed-point range"),
            });
        }

        let magnitude = BigUint::from(scaled.abs() as u128);
        if scaled < 0.0 && !magnitude.is_zero() {
            Ok(&public_key.n - magnitude)
        } else {
            Ok(magnitude)
        }
    }

    fn decode(&self, m: &BigUint, public_key: &PaillierPublicKey) -> Result<f64> {
        let half = &public_key.n >> 1usize;
        let (negative, magnitude) = if m > &half {
            (true, &public_key.n - m)
        } else {
            (false, m.clone())
        };
        let magnitude = magnitude.to_u128().ok_or_else(|| Error::Encryption {
            message: "decrypted plaintext out of range".to_string(),
        })?;

        let value = magnitude as f64 / self.scale();
        Ok(if negative { -value } else { value })
    }
}

fn parse_hex(s: &str, what: &str) -> Result<BigUint> {
    BigUint::parse_bytes(s.trim().as_bytes(), 16).ok_or_else(|| Error::Encryption {
        message: format!("malformed {what}"),
    })
}

impl EncryptionTool for PaillierTool {
    type PrivateKey = PaillierPrivateKey;
    type PublicKey = PaillierPublicKey;
    type Ciphertext = PaillierCiphertext;

    fn key_generate(&self, bits: usize) -> Result<PaillierPrivateKey> {
        if bits < 128 || bits % 2 != 0 {
            return Err(Error::Encryption {
                message: format!("unsupported key size {bits}"),
            });
        }

        let mut rng = rand::thread_rng();
        let p = rng.gen_prime(bits / 2);
        let mut q = rng.gen_prime(bits / 2);
        while q == p {
            q = rng.gen_prime(bits / 2);
        }

        let key = PaillierPrivateKey::from_primes(&p, &q);
        debug!(bits = key.public.bits(), "Generated Paillier key pair");
        Ok(key)
    }

    fn public_key(&self, private_key: &PaillierPrivateKey) -> PaillierPublicKey {
        private_key.public.clone()
    }

    fn encrypt(&self, value: f64, public_key: &PaillierPublicKey) -> Result<PaillierCiphertext> {
        let m = self.encode(value, public_key)?;
        let n = &public_key.n;
        let n_squared = &public_key.n_squared;

        let mut rng = rand::thread_rng();
        let mut r = rng.gen_biguint_below(n);
        while r.is_zero() {
            r = rng.gen_biguint_below(n);
        }

        let g_m = (BigUint::one() + &m * n) % n_squared;
        let r_n = r.modpow(n, n_squared);
        Ok(PaillierCiphertext((g_m * r_n) % n_squared))
    }

    fn decrypt(
        &self,
        ciphertext: &PaillierCiphertext,
        private_key: &PaillierPrivateKey,
    ) -> Result<f64> {
        let public = &private_key.public;
        if ciphertext.0 >= public.n_squared || ciphertext.0.is_zero() {
            return Err(Error::Encryption {
                message: "ciphertext outside the key's group".to_string(),
            });
        }

        let u = ciphertext.0.modpow(&private_key.phi, &public.n_squared);
        if u.is_zero() {
            return Err(Error::Encryption {
                message: "ciphertext shares a factor with the modulus".to_string(),
            });
        }
        let l = (u - BigUint::one()) / &public.n;
        let m = (l * &private_key.mu) % &public.n;
        self.decode(&m, public)
    }

    fn add(
        &self,
        a: &PaillierCiphertext,
        b: &PaillierCiphertext,
        public_key: &PaillierPublicKey,
    ) -> PaillierCiphertext {
        PaillierCiphertext((&a.0 * &b.0) % &public_key.n_squared)
    }

    fn serialize_ciphertext(&self, ciphertext: &PaillierCiphertext) -> String {
        ciphertext.0.to_str_radix(16)
    }

    fn restore_ciphertext(&self, s: &str) -> Result<PaillierCiphertext> {
        parse_hex(s, "ciphertext").map(PaillierCiphertext)
    }

    fn serialize_public_key(&self, public_key: &PaillierPublicKey) -> String {
        public_key.n.to_str_radix(16)
    }

    fn restore_public_key(&self, s: &str) -> Result<PaillierPublicKey> {
        parse_hex(s, "public key").map(PaillierPublicKey::new)
    }

    fn serialize_private_key(&self, private_key: &PaillierPrivateKey) -> String {
        format!(
            "{}:{}:{}",
            private_key.phi.to_str_radix(16),
            private_key.mu.to_str_radix(16),
            private_key.public.n.to_str_radix(16)
        )
    }

    fn restore_private_key(&self, s: &str) -> Result<PaillierPrivateKey> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Encryption {
                message: "malformed private key".to_string(),
            });
        }
        Ok(PaillierPrivateKey {
            phi: parse_hex(parts[0], "private key")?,
            mu: parse_hex(parts[1], "private key")?,
            public: PaillierPublicKey::new(parse_hex(parts[2], "private key")?),
        })
    }
}
