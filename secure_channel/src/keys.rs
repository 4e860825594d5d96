use zeroize::{Zeroize, ZeroizeOnDrop};

use token_common::crypto::{EcCurve, EcKeyPair};

/// The well-known factory default static SCP03 key, bytes `0x40` through
/// `0x4F`, used for all three key slots until personalised.
pub const DEFAULT_STATIC_KEY: [u8; 16] = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4c, 0x4d, 0x4e, 0x4f,
];

bitflags::bitflags! {
    /// Negotiated protection level of a secure channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityLevel: u8 {
        const C_MAC = 0x01;
        const C_DECRYPTION = 0x02;
        const R_MAC = 0x10;
        const R_ENCRYPTION = 0x20;
    }
}

impl SecurityLevel {
    /// Full protection in both directions.
    pub const FULL: SecurityLevel = SecurityLevel::C_MAC
        .union(SecurityLevel::C_DECRYPTION)
        .union(SecurityLevel::R_MAC)
        .union(SecurityLevel::R_ENCRYPTION);
}

/// The four derived session keys. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub enc: [u8; 16],
    pub mac: [u8; 16],
    pub rmac: [u8; 16],
    pub dek: [u8; 16],
}

/// Static channel keys for SCP03. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Scp03KeyParams {
    #[zeroize(skip)]
    pub key_version: u8,
    pub enc: [u8; 16],
    pub mac: [u8; 16],
    pub dek: [u8; 16],
}

impl Scp03KeyParams {
    pub fn new(key_version: u8, enc: [u8; 16], mac: [u8; 16], dek: [u8; 16]) -> Self {
        Scp03KeyParams {
            key_version,
            enc,
            mac,
            dek,
        }
    }

    /// The factory default key set under the given key version.
    pub fn default_keys(key_version: u8) -> Self {
        Scp03KeyParams::new(key_version, DEFAULT_STATIC_KEY, DEFAULT_STATIC_KEY, DEFAULT_STATIC_KEY)
    }
}

/// Which party authenticates with a static key, and whether certificate
/// chains are exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scp11Variant {
    /// Mutual authentication with host certificate chain.
    A,
    /// Card-only authentication; no host certificate.
    B,
    /// Mutual authentication with delegated token verification.
    C,
}

/// Key agreement parameters for SCP11.
pub struct Scp11KeyParams {
    pub variant: Scp11Variant,
    pub key_version: u8,
    pub key_id: u8,
    pub curve: EcCurve,
    /// The security domain's static public key, uncompressed SEC1.
    pub security_domain_public_key: Vec<u8>,
    /// Host static key; required for the mutually authenticated variants.
    pub host_key: Option<EcKeyPair>,
    /// Host certificate chain, leaf last; required with `host_key`.
    pub certificates: Vec<Vec<u8>>,
}

/// Key material for either protocol variant.
pub enum ScpKeyParams {
    Scp03(Scp03KeyParams),
    Scp11(Scp11KeyParams),
}

impl From<Scp03KeyParams> for ScpKeyParams {
    fn from(params: Scp03KeyParams) -> Self {
        ScpKeyParams::Scp03(params)
    }
}

impl From<Scp11KeyParams> for ScpKeyParams {
    fn from(params: Scp11KeyParams) -> Self {
        ScpKeyParams::Scp11(params)
    }
}
