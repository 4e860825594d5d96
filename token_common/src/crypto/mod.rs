//! The crypto provider capability.
//!
//! The SDK consumes cryptographic primitives exclusively through the
//! [`CryptoProvider`] trait, so that the secure channel and session code
//! never depend on a concrete primitive library. [`SoftwareCrypto`] is the
//! bundled implementation on top of the RustCrypto crates.

mod software;

pub use self::software::SoftwareCrypto;

use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("input length {0} is not a multiple of the AES block size")]
    UnalignedInput(usize),
    #[error("invalid EC private key for {0}")]
    InvalidPrivateKey(EcCurve),
    #[error("invalid EC public point for {0}")]
    InvalidPublicPoint(EcCurve),
    #[error("malformed ECDSA signature")]
    InvalidSignature,
}

/// NIST curves supported for key agreement and signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EcCurve {
    #[display("P-256")]
    P256,
    #[display("P-384")]
    P384,
}

impl EcCurve {
    /// Size of a field element (and thus a private scalar) in bytes.
    pub fn field_size(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
        }
    }

    /// Size of an uncompressed SEC1 point encoding in bytes.
    pub fn point_size(self) -> usize {
        1 + 2 * self.field_size()
    }
}

/// An EC key pair held in host memory. The private scalar is wiped on drop.
pub struct EcKeyPair {
    pub curve: EcCurve,
    pub private: Zeroizing<Vec<u8>>,
    /// Uncompressed SEC1 point encoding.
    pub public: Vec<u8>,
}

pub trait CryptoProvider: Send + Sync {
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    fn aes_cmac(&self, key: &[u8; 16], data: &[u8]) -> [u8; 16];

    fn aes_ecb_encrypt_block(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16];

    /// CBC without padding; the input must be a multiple of the block size.
    fn aes_cbc_encrypt(&self, key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// CBC without padding; the input must be a multiple of the block size.
    fn aes_cbc_decrypt(&self, key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn sha1(&self, data: &[u8]) -> [u8; 20];

    fn sha256(&self, data: &[u8]) -> [u8; 32];

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    /// Constant-time equality; only the length of the inputs may leak.
    fn ct_eq(&self, a: &[u8], b: &[u8]) -> bool;

    fn generate_ec_key_pair(&self, curve: EcCurve) -> EcKeyPair;

    /// X9.63 key agreement: the raw X coordinate of the shared point.
    fn ecdh(&self, key_pair: &EcKeyPair, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// ECDSA over SHA-2, returning a DER-encoded signature.
    fn ecdsa_sign(&self, key_pair: &EcKeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify a DER-encoded ECDSA signature against an uncompressed SEC1 public point.
    fn ecdsa_verify(
        &self,
        curve: EcCurve,
        public: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;
}
