//! The Management application: device information, device configuration
//! and factory reset.

mod config;
mod device_info;

pub use self::config::DeviceConfig;
pub use self::device_info::{DeviceInfo, FormFactor};

use tracing::{info, instrument};

use smartcard::apdu::CommandApdu;
use smartcard::pcsc::Pcsc;
use smartcard::Connection;
use token_common::tlv;

use crate::application::Application;
use crate::feature;
use crate::session::{Session, SessionError};

pub const INS_GET_DEVICE_INFO: u8 = 0x1d;
pub const INS_SET_DEVICE_CONFIG: u8 = 0x1c;
pub const INS_DEVICE_RESET: u8 = 0x1f;

/// Tag `0x10` with value `0x01` marks that further info pages follow.
const TAG_MORE_DATA: u32 = 0x10;

/// Hard bound on info pages, well above anything firmware produces.
const MAX_INFO_PAGES: u8 = 16;

/// Session with the Management application.
#[derive(Debug)]
pub struct ManagementSession<B: Pcsc> {
    session: Session<B>,
}

impl<B: Pcsc> ManagementSession<B> {
    pub fn new(connection: Connection<B>) -> Result<Self, SessionError> {
        let session = Session::select(connection, Application::Management)?;

        Ok(ManagementSession { session })
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<B> {
        &mut self.session
    }

    /// Read and decode the paged device information.
    ///
    /// The TLV-reported firmware version is authoritative and replaces the
    /// version parsed from the SELECT header for later feature gating.
    #[instrument(skip(self))]
    pub fn get_device_info(&mut self) -> Result<DeviceInfo, SessionError> {
        self.session.ensure_supports(&feature::DEVICE_INFO)?;

        let mut tlv_data = Vec::new();

        for page in 0..MAX_INFO_PAGES {
            let command = CommandApdu::new(0x00, INS_GET_DEVICE_INFO, page, 0x00).with_ne(256);
            let data = self.session.transmit(&command)?;

            let (&length, body) = data
                .split_first()
                .ok_or(SessionError::BadResponse("empty device info page"))?;
            let body = body
                .get(..length as usize)
                .ok_or(SessionError::BadResponse("device info shorter than its length byte"))?;
            tlv_data.extend_from_slice(body);

            let more = tlv::decode(body)?
                .iter()
                .any(|record| record.tag == TAG_MORE_DATA && record.value == [0x01]);
            if !more {
                break;
            }
        }

        let info = DeviceInfo::from_tlv_data(&tlv_data)?;

        if let Some(firmware) = info.firmware_version {
            let version = match info.version_qualifier {
                Some(qualifier) => qualifier.behavioural_version(firmware),
                None => firmware,
            };
            self.session.set_version(version);
        }
        info!(serial = ?info.serial, "device info read");

        Ok(info)
    }

    /// Write the device configuration. Gated on firmware 5.0.0.
    ///
    /// When the configuration is lock-code protected, `current_lock_code`
    /// authorises the write; `new_lock_code` replaces it. Both must be
    /// exactly 16 bytes.
    #[instrument(skip_all)]
    pub fn set_device_config(
        &mut self,
        config: &DeviceConfig,
        reboot: bool,
        current_lock_code: Option<&[u8]>,
        new_lock_code: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        self.session.ensure_supports(&feature::DEVICE_CONFIG)?;

        let payload = config.to_payload(reboot, current_lock_code, new_lock_code)?;
        let command = CommandApdu::new(0x00, INS_SET_DEVICE_CONFIG, 0x00, 0x00).with_data(payload);
        self.session.transmit(&command)?;
        info!("device configuration written");

        Ok(())
    }

    /// Factory reset the whole device. Gated on firmware 5.6.0.
    #[instrument(skip_all)]
    pub fn reset_device(&mut self) -> Result<(), SessionError> {
        self.session.ensure_supports(&feature::DEVICE_RESET)?;

        let command = CommandApdu::new(0x00, INS_DEVICE_RESET, 0x00, 0x00);
        self.session.transmit(&command)?;
        info!("device reset issued");

        Ok(())
    }
}
