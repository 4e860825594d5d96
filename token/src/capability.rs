bitflags::bitflags! {
    /// Functional capabilities of the token, per transport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capability: u16 {
        const OTP = 0x0001;
        const U2F = 0x0002;
        const OPENPGP = 0x0008;
        const PIV = 0x0010;
        const OATH = 0x0020;
        const HSM_AUTH = 0x0100;
        const FIDO2 = 0x0200;
    }
}

/// Bit positions used by the FIPS capable/approved masks, which do not
/// line up with the capability bitmap itself.
const FIPS_BIT_TABLE: [(u16, Capability); 5] = [
    (0x0001, Capability::FIDO2),
    (0x0002, Capability::PIV),
    (0x0004, Capability::OPENPGP),
    (0x0008, Capability::OATH),
    (0x0010, Capability::HSM_AUTH),
];

impl Capability {
    /// Translate a FIPS status mask into the capabilities it covers.
    pub fn from_fips_bits(bits: u16) -> Capability {
        FIPS_BIT_TABLE
            .iter()
            .filter(|(bit, _)| bits & bit != 0)
            .fold(Capability::empty(), |acc, (_, capability)| acc | *capability)
    }
}
