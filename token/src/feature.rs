use token_common::version::Version;

/// A named operation gated on a minimum firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature {
    pub name: &'static str,
    pub minimum: Version,
}

impl Feature {
    pub const fn new(name: &'static str, minimum: Version) -> Self {
        Feature { name, minimum }
    }

    pub fn supported_by(&self, version: Version) -> bool {
        version >= self.minimum
    }
}

/// TLV-encoded device information readback.
pub const DEVICE_INFO: Feature = Feature::new("device info", Version::new(4, 1, 0));

/// Device configuration writes with the lock code interlock.
pub const DEVICE_CONFIG: Feature = Feature::new("device config", Version::new(5, 0, 0));

/// Whole-device factory reset.
pub const DEVICE_RESET: Feature = Feature::new("device reset", Version::new(5, 6, 0));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_thresholds() {
        assert!(!DEVICE_CONFIG.supported_by(Version::new(4, 9, 9)));
        assert!(DEVICE_CONFIG.supported_by(Version::new(5, 0, 0)));
        assert!(DEVICE_CONFIG.supported_by(Version::new(5, 7, 1)));

        assert!(!DEVICE_RESET.supported_by(Version::new(5, 5, 9)));
        assert!(DEVICE_RESET.supported_by(Version::new(5, 6, 0)));
    }
}
