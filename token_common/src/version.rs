use std::str;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("version field must be exactly 3 bytes, got {0}")]
    InvalidLength(usize),
    #[error("could not parse version from string")]
    Unparseable,
}

/// Firmware version triple, totally ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, derive_more::Display)]
#[display("{major}.{minor}.{patch}")]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Version { major, minor, patch }
    }

    /// Decode the fixed 3-byte wire representation used in device info TLVs.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VersionError> {
        let [major, minor, patch] = <[u8; 3]>::try_from(bytes).map_err(|_| VersionError::InvalidLength(bytes.len()))?;

        Ok(Version { major, minor, patch })
    }

    /// Parse a version from the trailing `a.b.c` token of a UTF-8 string,
    /// as returned by SELECT on application AIDs.
    pub fn from_select_response(response: &[u8]) -> Result<Self, VersionError> {
        let text = str::from_utf8(response).map_err(|_| VersionError::Unparseable)?;
        let token = text
            .trim_end_matches('\0')
            .split_whitespace()
            .last()
            .ok_or(VersionError::Unparseable)?;

        let mut parts = token.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse::<u8>().ok())
                .ok_or(VersionError::Unparseable)
        };
        let version = Version::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(VersionError::Unparseable);
        }

        Ok(version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum VersionQualifierKind {
    Alpha = 0,
    Beta = 1,
    #[default]
    Final = 2,
}

/// Pre-release qualifier attached to a firmware version.
///
/// A non-final qualifier overrides the behavioural version used for feature
/// gating with its own triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionQualifier {
    pub version: Version,
    pub kind: VersionQualifierKind,
    pub iteration: u32,
}

impl VersionQualifier {
    pub fn is_final(&self) -> bool {
        self.kind == VersionQualifierKind::Final
    }

    /// The version the firmware behaves as, given the reported `firmware` version.
    pub fn behavioural_version(&self, firmware: Version) -> Version {
        if self.is_final() {
            firmware
        } else {
            self.version
        }
    }
}

impl std::fmt::Display for VersionQualifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_final() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}-{}.{}", self.version, self.kind, self.iteration)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_version_ordering_is_lexicographic() {
        assert!(Version::new(5, 0, 0) > Version::new(4, 9, 9));
        assert!(Version::new(5, 1, 0) > Version::new(5, 0, 255));
        assert!(Version::new(5, 1, 2) == Version::new(5, 1, 2));
        assert!(Version::new(4, 1, 0) >= Version::new(4, 1, 0));
    }

    #[rstest]
    #[case(b"Applet version 5.4.3", Version::new(5, 4, 3))]
    #[case(b"5.0.0", Version::new(5, 0, 0))]
    #[case(b"Firmware 1.2.3\0\0", Version::new(1, 2, 3))]
    fn test_version_from_select_response(#[case] response: &[u8], #[case] expected: Version) {
        assert_eq!(Version::from_select_response(response).unwrap(), expected);
    }

    #[rstest]
    #[case(b"" as &[u8])]
    #[case(b"no version here")]
    #[case(b"1.2")]
    #[case(b"1.2.3.4")]
    #[case(b"1.2.x")]
    #[case(&[0xff, 0xfe, 0x31])]
    fn test_version_from_select_response_error(#[case] response: &[u8]) {
        assert_matches!(Version::from_select_response(response), Err(VersionError::Unparseable));
    }

    #[test]
    fn test_version_from_bytes() {
        assert_eq!(Version::from_bytes(&[5, 7, 1]).unwrap(), Version::new(5, 7, 1));
        assert_matches!(Version::from_bytes(&[5, 7]), Err(VersionError::InvalidLength(2)));
    }

    #[test]
    fn test_qualifier_overrides_behavioural_version() {
        let firmware = Version::new(5, 7, 2);

        let qualifier = VersionQualifier {
            version: Version::new(5, 8, 0),
            kind: VersionQualifierKind::Beta,
            iteration: 3,
        };
        assert_eq!(qualifier.behavioural_version(firmware), Version::new(5, 8, 0));
        assert_eq!(qualifier.to_string(), "5.8.0-beta.3");

        let qualifier = VersionQualifier {
            version: Version::new(5, 8, 0),
            kind: VersionQualifierKind::Final,
            iteration: 0,
        };
        assert_eq!(qualifier.behavioural_version(firmware), firmware);
        assert_eq!(qualifier.to_string(), "5.8.0");
    }
}
