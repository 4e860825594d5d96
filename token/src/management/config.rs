//! Encoding of the device configuration write payload.

use token_common::tlv::{self, TlvDict};

use crate::capability::Capability;
use crate::session::SessionError;

const TAG_USB_ENABLED: u32 = 0x03;
const TAG_AUTO_EJECT_TIMEOUT: u32 = 0x06;
const TAG_CHALRESP_TIMEOUT: u32 = 0x07;
const TAG_DEVICE_FLAGS: u32 = 0x08;
const TAG_NEW_LOCK_CODE: u32 = 0x0a;
const TAG_CURRENT_LOCK_CODE: u32 = 0x0b;
const TAG_REBOOT: u32 = 0x0c;
const TAG_NFC_ENABLED: u32 = 0x0e;
const TAG_NFC_RESTRICTED: u32 = 0x17;

pub const LOCK_CODE_LEN: usize = 16;

/// The whole TLV sequence must fit its one-byte length prefix.
const MAX_PAYLOAD_LEN: usize = 255;

/// The writable subset of the device configuration. `None` fields are left
/// untouched by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub usb_enabled: Option<Capability>,
    pub nfc_enabled: Option<Capability>,
    pub auto_eject_timeout: Option<u16>,
    pub challenge_response_timeout: Option<u8>,
    pub device_flags: Option<u8>,
    pub nfc_restricted: Option<bool>,
}

fn lock_code(code: &[u8]) -> Result<Vec<u8>, SessionError> {
    if code.len() != LOCK_CODE_LEN {
        return Err(SessionError::InvalidArgument(format!(
            "lock code must be {LOCK_CODE_LEN} bytes, got {}",
            code.len()
        )));
    }

    Ok(code.to_vec())
}

/// Prefix an encoded TLV sequence with its one-byte length.
pub(crate) fn length_prefixed(tlvs: Vec<u8>) -> Result<Vec<u8>, SessionError> {
    if tlvs.len() > MAX_PAYLOAD_LEN {
        return Err(SessionError::InvalidArgument(format!(
            "device configuration of {} bytes exceeds the maximum of {MAX_PAYLOAD_LEN}",
            tlvs.len()
        )));
    }

    let mut payload = Vec::with_capacity(1 + tlvs.len());
    payload.push(tlvs.len() as u8);
    payload.extend_from_slice(&tlvs);

    Ok(payload)
}

impl DeviceConfig {
    /// Build the length-prefixed wire payload, tags in ascending order.
    pub(crate) fn to_payload(
        &self,
        reboot: bool,
        current_lock_code: Option<&[u8]>,
        new_lock_code: Option<&[u8]>,
    ) -> Result<Vec<u8>, SessionError> {
        let mut dict = TlvDict::new();

        if let Some(usb_enabled) = self.usb_enabled {
            dict.insert(TAG_USB_ENABLED, usb_enabled.bits().to_be_bytes().to_vec());
        }
        if let Some(nfc_enabled) = self.nfc_enabled {
            dict.insert(TAG_NFC_ENABLED, nfc_enabled.bits().to_be_bytes().to_vec());
        }
        if let Some(timeout) = self.auto_eject_timeout {
            dict.insert(TAG_AUTO_EJECT_TIMEOUT, timeout.to_be_bytes().to_vec());
        }
        if let Some(timeout) = self.challenge_response_timeout {
            dict.insert(TAG_CHALRESP_TIMEOUT, vec![timeout]);
        }
        if let Some(flags) = self.device_flags {
            dict.insert(TAG_DEVICE_FLAGS, vec![flags]);
        }
        if let Some(restricted) = self.nfc_restricted {
            dict.insert(TAG_NFC_RESTRICTED, vec![u8::from(restricted)]);
        }
        if reboot {
            dict.insert(TAG_REBOOT, Vec::new());
        }
        if let Some(code) = current_lock_code {
            dict.insert(TAG_CURRENT_LOCK_CODE, lock_code(code)?);
        }
        if let Some(code) = new_lock_code {
            dict.insert(TAG_NEW_LOCK_CODE, lock_code(code)?);
        }

        length_prefixed(tlv::encode_dict(&dict))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_payload_tags_ascend() {
        let config = DeviceConfig {
            usb_enabled: Some(Capability::OATH | Capability::PIV),
            nfc_enabled: Some(Capability::empty()),
            auto_eject_timeout: Some(30),
            challenge_response_timeout: Some(15),
            device_flags: Some(0x80),
            nfc_restricted: Some(true),
        };

        let payload = config.to_payload(true, None, None).unwrap();

        let expected = hex!(
            "17"  // total length
            "03 02 0030"  // usb enabled
            "06 02 001e"  // auto eject timeout
            "07 01 0f"  // challenge-response timeout
            "08 01 80"  // device flags
            "0c 00"  // reboot
            "0e 02 0000"  // nfc enabled
            "17 01 01"  // nfc restricted
        );
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_lock_codes_must_be_16_bytes() {
        let config = DeviceConfig::default();

        let result = config.to_payload(false, Some(&[0xaa; 15]), None);
        assert_matches!(result, Err(SessionError::InvalidArgument(_)));

        let result = config.to_payload(false, None, Some(&[0xbb; 17]));
        assert_matches!(result, Err(SessionError::InvalidArgument(_)));

        let payload = config
            .to_payload(false, Some(&[0xaa; 16]), Some(&[0xbb; 16]))
            .unwrap();
        assert_eq!(payload[0], 36);
        assert_eq!(&payload[1..3], hex!("0a10"));
        assert_eq!(&payload[19..21], hex!("0b10"));
    }

    #[test]
    fn test_payload_size_bounds() {
        // A 255-byte TLV sequence is accepted with a leading length byte
        // of 0xff.
        let max = tlv::encode(&[token_common::tlv::Tlv::new(0x7f, vec![0xee; 252])]);
        assert_eq!(max.len(), 255);
        let payload = length_prefixed(max).unwrap();
        assert_eq!(payload[0], 0xff);
        assert_eq!(payload.len(), 256);

        // One more byte is rejected.
        let over = tlv::encode(&[token_common::tlv::Tlv::new(0x7f, vec![0xee; 253])]);
        assert_eq!(over.len(), 256);
        assert_matches!(length_prefixed(over), Err(SessionError::InvalidArgument(_)));
    }
}
