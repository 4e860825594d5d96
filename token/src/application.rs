/// The ISO 7816 applications exposed by the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Application {
    #[strum(serialize = "Management")]
    Management,
    #[strum(serialize = "OTP")]
    Otp,
    #[strum(serialize = "FIDO U2F")]
    FidoU2f,
    #[strum(serialize = "FIDO2")]
    Fido2,
    #[strum(serialize = "PIV")]
    Piv,
    #[strum(serialize = "OATH")]
    Oath,
    #[strum(serialize = "OpenPGP")]
    OpenPgp,
    #[strum(serialize = "HSM Auth")]
    HsmAuth,
}

impl Application {
    /// The application identifier used in SELECT.
    pub fn aid(self) -> &'static [u8] {
        match self {
            Application::Management => &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17],
            Application::Otp => &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01, 0x01],
            Application::FidoU2f => &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x10, 0x02],
            Application::Fido2 => &[0xa0, 0x00, 0x00, 0x06, 0x47, 0x2f, 0x00, 0x01],
            Application::Piv => &[0xa0, 0x00, 0x00, 0x03, 0x08],
            Application::Oath => &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01],
            Application::OpenPgp => &[0xd2, 0x76, 0x00, 0x01, 0x24, 0x01],
            Application::HsmAuth => &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x07, 0x01],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_management_aid() {
        assert_eq!(
            Application::Management.aid(),
            &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17]
        );
    }

    #[test]
    fn test_fido_applets_have_distinct_aids() {
        assert_eq!(Application::FidoU2f.aid(), &[0xa0, 0x00, 0x00, 0x05, 0x27, 0x10, 0x02]);
        assert_eq!(Application::Fido2.aid(), &[0xa0, 0x00, 0x00, 0x06, 0x47, 0x2f, 0x00, 0x01]);
        assert_ne!(Application::FidoU2f.aid(), Application::Fido2.aid());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Application::Management.to_string(), "Management");
        assert_eq!(Application::Fido2.to_string(), "FIDO2");
        assert_eq!(Application::OpenPgp.to_string(), "OpenPGP");
    }
}
