//! SCP03: symmetric key agreement over static AES channel keys.

use std::sync::Arc;

use tracing::debug;

use smartcard::apdu::CommandApdu;
use smartcard::pcsc::Pcsc;
use smartcard::Connection;
use token_common::crypto::CryptoProvider;

use crate::kdf;
use crate::keys::{Scp03KeyParams, SecurityLevel, SessionKeys};
use crate::state::ScpState;
use crate::ScpError;

pub const INS_INITIALIZE_UPDATE: u8 = 0x50;
pub const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;

const CHALLENGE_SIZE: usize = 8;
const CRYPTOGRAM_SIZE: usize = 8;

// SP 800-108 derivation constants.
const CONSTANT_CARD_CRYPTOGRAM: u8 = 0x00;
const CONSTANT_HOST_CRYPTOGRAM: u8 = 0x01;
const CONSTANT_S_ENC: u8 = 0x04;
const CONSTANT_S_MAC: u8 = 0x06;
const CONSTANT_S_RMAC: u8 = 0x07;
const CONSTANT_S_DEK: u8 = 0x0b;

/// Derive the session key set from the static keys and both challenges.
pub(crate) fn derive_session_keys(
    provider: &dyn CryptoProvider,
    params: &Scp03KeyParams,
    context: &[u8],
) -> SessionKeys {
    let derive = |key: &[u8; 16], constant| {
        let derived = kdf::derive_cmac(provider, key, constant, context, 16);
        let mut out = [0u8; 16];
        out.copy_from_slice(&derived);
        out
    };

    SessionKeys {
        enc: derive(&params.enc, CONSTANT_S_ENC),
        mac: derive(&params.mac, CONSTANT_S_MAC),
        rmac: derive(&params.mac, CONSTANT_S_RMAC),
        dek: derive(&params.dek, CONSTANT_S_DEK),
    }
}

pub(crate) fn cryptogram(provider: &dyn CryptoProvider, s_mac: &[u8; 16], constant: u8, context: &[u8]) -> Vec<u8> {
    kdf::derive_cmac(provider, s_mac, constant, context, CRYPTOGRAM_SIZE)
}

/// INITIALIZE UPDATE / EXTERNAL AUTHENTICATE handshake.
pub fn authenticate<B: Pcsc>(
    connection: &mut Connection<B>,
    params: &Scp03KeyParams,
    security_level: SecurityLevel,
    provider: Arc<dyn CryptoProvider>,
) -> Result<ScpState, ScpError> {
    let host_challenge = provider.random_bytes(CHALLENGE_SIZE);

    let initialize_update = CommandApdu::new(0x80, INS_INITIALIZE_UPDATE, params.key_version, 0x00)
        .with_data(host_challenge.clone())
        .with_ne(256);
    let response = connection.transmit(&initialize_update)?;
    if !response.sw.is_success() {
        return Err(ScpError::Protocol(response.sw));
    }

    // Key diversification data (10), key information (3), card challenge
    // (8), card cryptogram (8), optional sequence counter (3).
    if response.data.len() < 29 {
        return Err(ScpError::BadResponse("short INITIALIZE UPDATE response"));
    }
    let card_challenge = &response.data[13..21];
    let card_cryptogram = &response.data[21..29];

    let mut context = Vec::with_capacity(2 * CHALLENGE_SIZE);
    context.extend_from_slice(&host_challenge);
    context.extend_from_slice(card_challenge);

    let keys = derive_session_keys(provider.as_ref(), params, &context);

    let expected = cryptogram(provider.as_ref(), &keys.mac, CONSTANT_CARD_CRYPTOGRAM, &context);
    if !provider.ct_eq(&expected, card_cryptogram) {
        return Err(ScpError::AuthenticationFailed);
    }

    let host_cryptogram = cryptogram(provider.as_ref(), &keys.mac, CONSTANT_HOST_CRYPTOGRAM, &context);
    debug!(key_version = params.key_version, "card cryptogram verified");

    let mut state = ScpState::new(keys, security_level, provider);

    // EXTERNAL AUTHENTICATE carries its own C-MAC under the fresh chain.
    let external_authenticate = state.mac_command(
        CommandApdu::new(0x84, INS_EXTERNAL_AUTHENTICATE, security_level.bits(), 0x00).with_data(host_cryptogram),
    );
    let response = connection.transmit(&external_authenticate)?;
    if !response.sw.is_success() {
        return Err(ScpError::Protocol(response.sw));
    }

    Ok(state)
}
