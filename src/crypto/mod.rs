//! Content obfuscation
//!
//! A fixed-key XOR stream transform applied to files that live in the
//! encrypted directory. It only guarantees round-trip correctness; it is not
//! meant to provide confidentiality.

mod xor;

pub use xor::XorCipher;
