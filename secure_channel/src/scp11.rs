//! SCP11: elliptic-curve key agreement.
//!
//! The host sends a control reference template and an ephemeral public key;
//! the security domain answers with its own ephemeral key and a receipt.
//! Both sides combine the ephemeral-ephemeral and static key agreements and
//! feed the shared secret plus the negotiation transcript into the KDF.

use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use smartcard::apdu::CommandApdu;
use smartcard::pcsc::Pcsc;
use smartcard::Connection;
use token_common::crypto::CryptoProvider;
use token_common::tlv::{self, Tlv};

use crate::kdf;
use crate::keys::{Scp11KeyParams, Scp11Variant, SecurityLevel, SessionKeys};
use crate::state::ScpState;
use crate::ScpError;

pub const INS_PERFORM_SECURITY_OPERATION: u8 = 0x2a;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
pub const INS_MUTUAL_AUTHENTICATE: u8 = 0x82;

const TAG_CONTROL_REFERENCE: u32 = 0xa6;
const TAG_SCP_PARAMETERS: u32 = 0x90;
const TAG_KEY_USAGE: u32 = 0x95;
const TAG_KEY_TYPE: u32 = 0x80;
const TAG_KEY_LENGTH: u32 = 0x81;
const TAG_EPHEMERAL_PUBLIC_KEY: u32 = 0x5f49;
const TAG_RECEIPT: u32 = 0x86;

const SCP_IDENTIFIER: u8 = 0x11;
const KEY_TYPE_AES: u8 = 0x88;
const KEY_LENGTH_AES_128: u8 = 0x10;
// Secure messaging with C-MAC, C-DECRYPTION, R-MAC and R-ENCRYPTION.
const KEY_USAGE_FULL: u8 = 0x3c;
// Five keys: receipt verification plus the session set.
const DERIVED_LEN: usize = 5 * 16;
const KDF_CONSTANT_SESSION: u8 = 0x11;

impl Scp11Variant {
    fn parameter(self) -> u8 {
        match self {
            Scp11Variant::B => 0x00,
            Scp11Variant::A => 0x01,
            Scp11Variant::C => 0x03,
        }
    }

    fn authenticate_ins(self) -> u8 {
        match self {
            Scp11Variant::B => INS_INTERNAL_AUTHENTICATE,
            Scp11Variant::A | Scp11Variant::C => INS_MUTUAL_AUTHENTICATE,
        }
    }
}

/// Ship the host certificate chain, chaining all but the last command.
fn send_certificate_chain<B: Pcsc>(
    connection: &mut Connection<B>,
    params: &Scp11KeyParams,
) -> Result<(), ScpError> {
    if params.certificates.is_empty() {
        return Err(ScpError::InvalidKeyParams(
            "mutually authenticated variants require a certificate chain",
        ));
    }

    let last = params.certificates.len() - 1;
    for (index, certificate) in params.certificates.iter().enumerate() {
        let cla = if index == last { 0x80 } else { 0x90 };
        let command = CommandApdu::new(cla, INS_PERFORM_SECURITY_OPERATION, params.key_version, params.key_id)
            .with_data(certificate.clone());

        let response = connection.transmit(&command)?;
        if !response.sw.is_success() {
            return Err(ScpError::Protocol(response.sw));
        }
    }

    Ok(())
}

pub fn authenticate<B: Pcsc>(
    connection: &mut Connection<B>,
    params: &Scp11KeyParams,
    security_level: SecurityLevel,
    provider: Arc<dyn CryptoProvider>,
) -> Result<ScpState, ScpError> {
    if params.variant != Scp11Variant::B {
        if params.host_key.is_none() {
            return Err(ScpError::InvalidKeyParams(
                "mutually authenticated variants require a host key",
            ));
        }
        send_certificate_chain(connection, params)?;
    }

    let ephemeral = provider.generate_ec_key_pair(params.curve);

    let control_reference = tlv::encode(&[Tlv::new(
        TAG_CONTROL_REFERENCE,
        tlv::encode(&[
            Tlv::new(TAG_SCP_PARAMETERS, [SCP_IDENTIFIER, params.variant.parameter()]),
            Tlv::new(TAG_KEY_USAGE, [KEY_USAGE_FULL]),
            Tlv::new(TAG_KEY_TYPE, [KEY_TYPE_AES]),
            Tlv::new(TAG_KEY_LENGTH, [KEY_LENGTH_AES_128]),
        ]),
    )]);

    let mut data = control_reference;
    data.extend_from_slice(&tlv::encode(&[Tlv::new(TAG_EPHEMERAL_PUBLIC_KEY, ephemeral.public.clone())]));

    let command = CommandApdu::new(0x80, params.variant.authenticate_ins(), params.key_version, params.key_id)
        .with_data(data.clone())
        .with_ne(256);
    let response = connection.transmit(&command)?;
    if !response.sw.is_success() {
        return Err(ScpError::Protocol(response.sw));
    }

    let records = tlv::decode(&response.data)?;
    let card_ephemeral = records
        .iter()
        .find(|record| record.tag == TAG_EPHEMERAL_PUBLIC_KEY)
        .ok_or(ScpError::BadResponse("missing card ephemeral key"))?
        .value
        .clone();
    let receipt = records
        .iter()
        .find(|record| record.tag == TAG_RECEIPT)
        .ok_or(ScpError::BadResponse("missing receipt"))?
        .value
        .clone();

    // Ephemeral-ephemeral agreement, then the static agreement: against the
    // security domain key with the host's ephemeral (11b) or static key.
    let ephemeral_agreement = provider.ecdh(&ephemeral, &card_ephemeral)?;
    let static_agreement = match params.variant {
        Scp11Variant::B => provider.ecdh(&ephemeral, &params.security_domain_public_key)?,
        Scp11Variant::A | Scp11Variant::C => {
            let host_key = params
                .host_key
                .as_ref()
                .ok_or(ScpError::InvalidKeyParams("missing host key"))?;
            provider.ecdh(host_key, &params.security_domain_public_key)?
        }
    };
    let mut shared_secret = Zeroizing::new(Vec::with_capacity(2 * params.curve.field_size()));
    shared_secret.extend_from_slice(&ephemeral_agreement);
    shared_secret.extend_from_slice(&static_agreement);

    // The transcript covers everything both parties contributed.
    let mut transcript = data;
    transcript.extend_from_slice(&tlv::encode(&[Tlv::new(TAG_EPHEMERAL_PUBLIC_KEY, card_ephemeral)]));

    let derived = kdf::derive_hmac(
        provider.as_ref(),
        &shared_secret,
        KDF_CONSTANT_SESSION,
        &transcript,
        DERIVED_LEN,
    );

    let key = |index: usize| {
        let mut out = [0u8; 16];
        out.copy_from_slice(&derived[index * 16..(index + 1) * 16]);
        out
    };
    let receipt_key = key(0);
    let keys = SessionKeys {
        enc: key(1),
        mac: key(2),
        rmac: key(3),
        dek: key(4),
    };

    let expected_receipt = provider.aes_cmac(&receipt_key, &transcript);
    if !provider.ct_eq(&expected_receipt, &receipt) {
        return Err(ScpError::AuthenticationFailed);
    }
    debug!(variant = ?params.variant, "secure channel receipt verified");

    Ok(ScpState::new(keys, security_level, provider))
}
