//! Decoding of the device information TLV aggregate.

use token_common::tlv;
use token_common::version::{Version, VersionQualifier, VersionQualifierKind};

use crate::capability::Capability;
use crate::session::SessionError;

const TAG_USB_SUPPORTED: u32 = 0x01;
const TAG_SERIAL: u32 = 0x02;
const TAG_USB_ENABLED: u32 = 0x03;
const TAG_FORM_FACTOR: u32 = 0x04;
const TAG_FIRMWARE_VERSION: u32 = 0x05;
const TAG_AUTO_EJECT_TIMEOUT: u32 = 0x06;
const TAG_CHALRESP_TIMEOUT: u32 = 0x07;
const TAG_DEVICE_FLAGS: u32 = 0x08;
const TAG_CONFIG_LOCKED: u32 = 0x0a;
const TAG_NFC_SUPPORTED: u32 = 0x0d;
const TAG_NFC_ENABLED: u32 = 0x0e;
const TAG_PART_NUMBER: u32 = 0x13;
const TAG_FIPS_CAPABLE: u32 = 0x14;
const TAG_FIPS_APPROVED: u32 = 0x15;
const TAG_PIN_COMPLEXITY: u32 = 0x16;
const TAG_NFC_RESTRICTED: u32 = 0x17;
const TAG_RESET_BLOCKED: u32 = 0x18;
const TAG_VERSION_QUALIFIER: u32 = 0x19;
const TAG_FPS_VERSION: u32 = 0x20;
const TAG_STM_VERSION: u32 = 0x21;

const TAG_QUALIFIER_VERSION: u32 = 0x01;
const TAG_QUALIFIER_KIND: u32 = 0x02;
const TAG_QUALIFIER_ITERATION: u32 = 0x03;
const QUALIFIER_PAYLOAD_LEN: usize = 14;

const FORM_FACTOR_FIPS_FLAG: u8 = 0x80;
const FORM_FACTOR_SKY_FLAG: u8 = 0x40;

/// Physical package of the token, from the low nibble of tag `0x04`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::FromRepr)]
#[repr(u8)]
pub enum FormFactor {
    #[default]
    Unknown = 0,
    UsbAKeychain = 1,
    UsbANano = 2,
    UsbCKeychain = 3,
    UsbCNano = 4,
    UsbCLightning = 5,
    UsbABiometric = 6,
    UsbCBiometric = 7,
}

/// The decoded device information aggregate. Every field is optional on
/// the wire; absent tags decode to `None` or an empty default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub serial: Option<u32>,
    pub form_factor: FormFactor,
    pub is_fips: bool,
    pub is_sky: bool,
    pub firmware_version: Option<Version>,
    pub version_qualifier: Option<VersionQualifier>,
    pub usb_supported: Capability,
    pub usb_enabled: Capability,
    pub nfc_supported: Capability,
    pub nfc_enabled: Capability,
    pub auto_eject_timeout: Option<u16>,
    pub challenge_response_timeout: Option<u8>,
    pub device_flags: Option<u8>,
    pub config_locked: bool,
    pub part_number: Option<String>,
    pub fips_capable: Capability,
    pub fips_approved: Capability,
    pub pin_complexity: bool,
    pub nfc_restricted: bool,
    pub reset_blocked: Capability,
    pub fps_version: Option<Version>,
    pub stm_version: Option<Version>,
}

fn u8_field(value: &[u8]) -> Result<u8, SessionError> {
    let [byte] = <[u8; 1]>::try_from(value).map_err(|_| SessionError::BadResponse("field is not a single byte"))?;

    Ok(byte)
}

fn u16_field(value: &[u8]) -> Result<u16, SessionError> {
    match value {
        [single] => Ok(u16::from(*single)),
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(SessionError::BadResponse("field is not a big-endian u16")),
    }
}

fn u32_field(value: &[u8]) -> Result<u32, SessionError> {
    let bytes = <[u8; 4]>::try_from(value).map_err(|_| SessionError::BadResponse("field is not a big-endian u32"))?;

    Ok(u32::from_be_bytes(bytes))
}

fn version_field(value: &[u8]) -> Result<Version, SessionError> {
    Version::from_bytes(value).map_err(|_| SessionError::BadResponse("version field is not 3 bytes"))
}

fn capability_field(value: &[u8]) -> Result<Capability, SessionError> {
    Ok(Capability::from_bits_truncate(u16_field(value)?))
}

fn bool_field(value: &[u8]) -> Result<bool, SessionError> {
    Ok(u8_field(value)? != 0)
}

fn qualifier_field(value: &[u8]) -> Result<VersionQualifier, SessionError> {
    if value.len() != QUALIFIER_PAYLOAD_LEN {
        return Err(SessionError::BadResponse("version qualifier is not 14 bytes"));
    }
    let dict = tlv::decode_dict(value)?;

    let version = version_field(
        dict.get(&TAG_QUALIFIER_VERSION)
            .ok_or(SessionError::BadResponse("version qualifier misses its version"))?,
    )?;
    let kind = u8_field(
        dict.get(&TAG_QUALIFIER_KIND)
            .ok_or(SessionError::BadResponse("version qualifier misses its kind"))?,
    )?;
    let kind = VersionQualifierKind::from_repr(kind)
        .ok_or(SessionError::BadResponse("unknown version qualifier kind"))?;
    let iteration = u32_field(
        dict.get(&TAG_QUALIFIER_ITERATION)
            .ok_or(SessionError::BadResponse("version qualifier misses its iteration"))?,
    )?;

    Ok(VersionQualifier {
        version,
        kind,
        iteration,
    })
}

impl DeviceInfo {
    /// Decode the concatenated TLVs of all device info pages. Unknown tags
    /// are ignored; known tags with malformed content are an error.
    pub fn from_tlv_data(data: &[u8]) -> Result<Self, SessionError> {
        let mut info = DeviceInfo::default();

        for record in tlv::decode(data)? {
            let value = record.value.as_slice();
            match record.tag {
                TAG_USB_SUPPORTED => info.usb_supported = capability_field(value)?,
                TAG_SERIAL => info.serial = Some(u32_field(value)?),
                TAG_USB_ENABLED => info.usb_enabled = capability_field(value)?,
                TAG_FORM_FACTOR => {
                    let byte = u8_field(value)?;
                    info.form_factor = FormFactor::from_repr(byte & 0x0f).unwrap_or_default();
                    info.is_fips = byte & FORM_FACTOR_FIPS_FLAG != 0;
                    info.is_sky = byte & FORM_FACTOR_SKY_FLAG != 0;
                }
                TAG_FIRMWARE_VERSION => info.firmware_version = Some(version_field(value)?),
                TAG_AUTO_EJECT_TIMEOUT => info.auto_eject_timeout = Some(u16_field(value)?),
                TAG_CHALRESP_TIMEOUT => info.challenge_response_timeout = Some(u8_field(value)?),
                TAG_DEVICE_FLAGS => info.device_flags = Some(u8_field(value)?),
                TAG_CONFIG_LOCKED => info.config_locked = bool_field(value)?,
                TAG_NFC_SUPPORTED => info.nfc_supported = capability_field(value)?,
                TAG_NFC_ENABLED => info.nfc_enabled = capability_field(value)?,
                TAG_PART_NUMBER => info.part_number = String::from_utf8(record.value.clone()).ok(),
                TAG_FIPS_CAPABLE => info.fips_capable = Capability::from_fips_bits(u16_field(value)?),
                TAG_FIPS_APPROVED => info.fips_approved = Capability::from_fips_bits(u16_field(value)?),
                TAG_PIN_COMPLEXITY => info.pin_complexity = bool_field(value)?,
                TAG_NFC_RESTRICTED => info.nfc_restricted = bool_field(value)?,
                TAG_RESET_BLOCKED => info.reset_blocked = Capability::from_bits_truncate(u16_field(value)?),
                TAG_VERSION_QUALIFIER => info.version_qualifier = Some(qualifier_field(value)?),
                TAG_FPS_VERSION => info.fps_version = Some(version_field(value)?),
                TAG_STM_VERSION => info.stm_version = Some(version_field(value)?),
                _ => {}
            }
        }

        Ok(info)
    }
}
