//! fedgb crypto - Homomorphic encryption for federated boosting
//!
//! The boosting protocol only needs an additively homomorphic scheme:
//!
//! - **EncryptionTool**: opaque key/ciphertext types with encrypt, decrypt,
//!   homomorphic add and string (de)serialization
//! - **PaillierTool**: Paillier over `num-bigint-dig` with fixed-point
//!   encoding of signed reals
//!
//! # Example
//!
//! ```
//! use fedgb_crypto::{EncryptionTool, PaillierTool};
//!
//! let tool = PaillierTool::default();
//! let sk = tool.key_generate(256).unwrap();
//! let pk = tool.public_key(&sk);
//! let sum = tool.add(&tool.encrypt(1.5, &pk).unwrap(), &tool.encrypt(-0.5, &pk).unwrap(), &pk);
//! assert!((tool.decrypt(&sum, &sk).unwrap() - 1.0).abs() < 1e-6);
//! ```

pub mod paillier;
pub mod tool;

pub use paillier::{PaillierCiphertext, PaillierPrivateKey, PaillierPublicKey, PaillierTool};
pub use tool::EncryptionTool;
