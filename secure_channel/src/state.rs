//! The keyed data layer: per-APDU MAC chaining and encryption.

use std::sync::Arc;

use smartcard::apdu::{CommandApdu, ResponseApdu};
use smartcard::{ApduTransform, TransformError};
use token_common::crypto::CryptoProvider;

use crate::keys::{SecurityLevel, SessionKeys};
use crate::ScpError;

/// Upper bound on wrapped commands per session; the 8-byte MAC's birthday
/// bound makes longer sessions unsafe.
pub const MAX_COMMANDS_PER_SESSION: usize = 1 << 20;

const SECURE_CLA: u8 = 0x04;
const MAC_SIZE: usize = 8;
const BLOCK_SIZE: usize = 16;

/// Live secure channel state: session keys, MAC chain and encryption
/// counter. Installed on a connection as its [`ApduTransform`].
pub struct ScpState {
    keys: SessionKeys,
    security_level: SecurityLevel,
    mac_chain: [u8; 16],
    enc_counter: u32,
    commands: usize,
    provider: Arc<dyn CryptoProvider>,
}

impl ScpState {
    pub(crate) fn new(keys: SessionKeys, security_level: SecurityLevel, provider: Arc<dyn CryptoProvider>) -> Self {
        ScpState {
            keys,
            security_level,
            mac_chain: [0; 16],
            enc_counter: 1,
            commands: 0,
            provider,
        }
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// The full CMAC of the last wrapped command.
    pub fn mac_chain(&self) -> &[u8; 16] {
        &self.mac_chain
    }

    pub fn enc_counter(&self) -> u32 {
        self.enc_counter
    }

    /// Append the command MAC: first 8 bytes of the CMAC over the chain
    /// value, the header and the length-prefixed data. Advances the chain.
    pub(crate) fn mac_command(&mut self, command: CommandApdu) -> CommandApdu {
        let mut command = command;
        command.cla |= SECURE_CLA;

        let total_len = command.data.len() + MAC_SIZE;
        let extended = total_len > 255 || command.ne > 256;

        let mut to_mac = Vec::with_capacity(16 + 4 + 3 + command.data.len());
        to_mac.extend_from_slice(&self.mac_chain);
        to_mac.extend_from_slice(&[command.cla, command.ins, command.p1, command.p2]);
        if extended {
            to_mac.push(0x00);
            to_mac.extend_from_slice(&(total_len as u16).to_be_bytes());
        } else {
            to_mac.push(total_len as u8);
        }
        to_mac.extend_from_slice(&command.data);

        let full_mac = self.provider.aes_cmac(&self.keys.mac, &to_mac);
        self.mac_chain = full_mac;
        command.data.extend_from_slice(&full_mac[..MAC_SIZE]);

        command
    }

    fn wrap(&mut self, command: CommandApdu) -> Result<CommandApdu, ScpError> {
        if self.commands >= MAX_COMMANDS_PER_SESSION {
            return Err(ScpError::SessionLimitReached);
        }
        self.commands += 1;

        let mut command = command;
        if self.security_level.contains(SecurityLevel::C_DECRYPTION) && !command.data.is_empty() {
            let icv = self
                .provider
                .aes_ecb_encrypt_block(&self.keys.enc, &command_icv_input(self.enc_counter));
            let padded = pad_iso7816(&command.data);
            command.data = self.provider.aes_cbc_encrypt(&self.keys.enc, &icv, &padded)?;
        }
        // One counter tick per wrapped command, data or not.
        self.enc_counter = self.enc_counter.wrapping_add(1);

        Ok(self.mac_command(command))
    }

    fn unwrap(&mut self, response: ResponseApdu) -> Result<ResponseApdu, ScpError> {
        // The card only protects success responses.
        if !response.sw.is_success() {
            return Ok(response);
        }

        let mut payload = response.data;

        if self.security_level.contains(SecurityLevel::R_MAC) {
            if payload.len() < MAC_SIZE {
                return Err(ScpError::BadResponse("response shorter than its MAC"));
            }
            let rmac = payload.split_off(payload.len() - MAC_SIZE);

            let mut to_mac = Vec::with_capacity(16 + payload.len() + 2);
            to_mac.extend_from_slice(&self.mac_chain);
            to_mac.extend_from_slice(&payload);
            to_mac.extend_from_slice(&[response.sw.sw1(), response.sw.sw2()]);

            let expected = self.provider.aes_cmac(&self.keys.rmac, &to_mac);
            if !self.provider.ct_eq(&expected[..MAC_SIZE], &rmac) {
                return Err(ScpError::MacFailure);
            }
        }

        if self.security_level.contains(SecurityLevel::R_ENCRYPTION) && !payload.is_empty() {
            let icv = self
                .provider
                .aes_ecb_encrypt_block(&self.keys.enc, &response_icv_input(self.enc_counter.wrapping_sub(1)));
            let plaintext = self.provider.aes_cbc_decrypt(&self.keys.enc, &icv, &payload)?;
            payload = unpad_iso7816(plaintext)?;
        }

        Ok(ResponseApdu::new(payload, response.sw))
    }
}

impl ApduTransform for ScpState {
    fn wrap_command(&mut self, command: CommandApdu) -> Result<CommandApdu, TransformError> {
        self.wrap(command).map_err(TransformError::from)
    }

    fn unwrap_response(&mut self, response: ResponseApdu) -> Result<ResponseApdu, TransformError> {
        self.unwrap(response).map_err(TransformError::from)
    }
}

/// The command ICV input: the counter over the full block, big-endian.
fn command_icv_input(counter: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[12..].copy_from_slice(&counter.to_be_bytes());

    block
}

/// The response ICV input: high bit set to separate the directions.
fn response_icv_input(counter: u32) -> [u8; 16] {
    let mut block = command_icv_input(counter);
    block[0] = 0x80;

    block
}

fn pad_iso7816(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    padded.resize(padded.len().next_multiple_of(BLOCK_SIZE), 0x00);

    padded
}

fn unpad_iso7816(mut data: Vec<u8>) -> Result<Vec<u8>, ScpError> {
    loop {
        match data.pop() {
            Some(0x00) => continue,
            Some(0x80) => return Ok(data),
            _ => return Err(ScpError::BadResponse("invalid response padding")),
        }
    }
}
