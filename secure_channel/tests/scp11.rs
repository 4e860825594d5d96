//! SCP11b key agreement against a card side holding the security domain
//! keys.

use std::sync::{Arc, Mutex};

use hex_literal::hex;

use secure_channel::kdf;
use secure_channel::keys::{Scp11KeyParams, Scp11Variant, SecurityLevel};
use secure_channel::{ScpError, ScpKeyParams};
use smartcard::pcsc::{MockPcsc, ShareMode};
use smartcard::Connection;
use token_common::crypto::{CryptoProvider, EcCurve, SoftwareCrypto};
use token_common::tlv::{self, Tlv};

const TAG_EPHEMERAL_PUBLIC_KEY: u32 = 0x5f49;
const TAG_RECEIPT: u32 = 0x86;

struct SecurityDomain {
    static_key: token_common::crypto::EcKeyPair,
    corrupt_receipt: bool,
}

impl SecurityDomain {
    fn new() -> Self {
        SecurityDomain {
            static_key: SoftwareCrypto.generate_ec_key_pair(EcCurve::P256),
            corrupt_receipt: false,
        }
    }

    /// INTERNAL AUTHENTICATE: agree on the same shared secret from the
    /// other side and hand back an ephemeral key plus receipt.
    fn handle_authenticate(&self, apdu: &[u8]) -> Vec<u8> {
        assert_eq!(&apdu[..2], hex!("8088"));
        let lc = apdu[4] as usize;
        let data = &apdu[5..5 + lc];

        let records = tlv::decode(data).expect("malformed authenticate payload");
        let host_ephemeral = &records
            .iter()
            .find(|record| record.tag == TAG_EPHEMERAL_PUBLIC_KEY)
            .expect("missing host ephemeral key")
            .value;

        let card_ephemeral = SoftwareCrypto.generate_ec_key_pair(EcCurve::P256);

        let mut shared = SoftwareCrypto.ecdh(&card_ephemeral, host_ephemeral).unwrap().to_vec();
        shared.extend_from_slice(&SoftwareCrypto.ecdh(&self.static_key, host_ephemeral).unwrap());

        let mut transcript = data.to_vec();
        transcript.extend_from_slice(&tlv::encode(&[Tlv::new(
            TAG_EPHEMERAL_PUBLIC_KEY,
            card_ephemeral.public.clone(),
        )]));

        let derived = kdf::derive_hmac(&SoftwareCrypto, &shared, 0x11, &transcript, 80);
        let receipt_key = <[u8; 16]>::try_from(&derived[..16]).unwrap();
        let mut receipt = SoftwareCrypto.aes_cmac(&receipt_key, &transcript);
        if self.corrupt_receipt {
            receipt[3] ^= 0x80;
        }

        let mut response = tlv::encode(&[
            Tlv::new(TAG_EPHEMERAL_PUBLIC_KEY, card_ephemeral.public),
            Tlv::new(TAG_RECEIPT, receipt),
        ]);
        response.extend_from_slice(&hex!("9000"));

        response
    }
}

fn setup(domain: Arc<Mutex<SecurityDomain>>) -> (MockPcsc, Connection<MockPcsc>) {
    let mock = MockPcsc::new();
    mock.add_reader("Mock Reader 00");
    mock.insert_card("Mock Reader 00", &hex!("3bfd13"));
    {
        let domain = Arc::clone(&domain);
        mock.on_transmit(move |apdu| domain.lock().unwrap().handle_authenticate(apdu));
    }

    let connection = Connection::open(mock.clone(), "Mock Reader 00", ShareMode::Shared)
        .expect("could not open mock connection");

    (mock, connection)
}

fn params_for(domain: &SecurityDomain) -> ScpKeyParams {
    ScpKeyParams::Scp11(Scp11KeyParams {
        variant: Scp11Variant::B,
        key_version: 0x01,
        key_id: 0x03,
        curve: EcCurve::P256,
        security_domain_public_key: domain.static_key.public.clone(),
        host_key: None,
        certificates: Vec::new(),
    })
}

#[test]
fn test_scp11b_key_agreement_succeeds() {
    let domain = Arc::new(Mutex::new(SecurityDomain::new()));
    let (mock, mut connection) = setup(Arc::clone(&domain));

    let params = params_for(&domain.lock().unwrap());
    let state = secure_channel::authenticate(
        &mut connection,
        &params,
        SecurityLevel::FULL,
        Arc::new(SoftwareCrypto),
    )
    .expect("key agreement failed");

    // Fresh channel: zero MAC chain, counter at one.
    assert_eq!(state.mac_chain(), &[0u8; 16]);
    assert_eq!(state.enc_counter(), 1);

    let wire = mock.transmitted();
    assert_eq!(wire.len(), 1);
    // One INTERNAL AUTHENTICATE carrying the control reference template and
    // the host ephemeral key.
    assert_eq!(&wire[0][..2], hex!("8088"));
    let records = tlv::decode(&wire[0][5..5 + wire[0][4] as usize]).unwrap();
    assert!(records.iter().any(|record| record.tag == 0xa6));
    assert!(records.iter().any(|record| record.tag == TAG_EPHEMERAL_PUBLIC_KEY));
}

#[test]
fn test_scp11b_tampered_receipt_fails() {
    let domain = Arc::new(Mutex::new(SecurityDomain::new()));
    domain.lock().unwrap().corrupt_receipt = true;
    let (_mock, mut connection) = setup(Arc::clone(&domain));

    let params = params_for(&domain.lock().unwrap());
    let result = secure_channel::authenticate(
        &mut connection,
        &params,
        SecurityLevel::FULL,
        Arc::new(SoftwareCrypto),
    );

    assert!(matches!(result, Err(ScpError::AuthenticationFailed)));
}

#[test]
fn test_scp11a_requires_host_key_and_certificates() {
    let domain = Arc::new(Mutex::new(SecurityDomain::new()));
    let (_mock, mut connection) = setup(Arc::clone(&domain));

    let params = ScpKeyParams::Scp11(Scp11KeyParams {
        variant: Scp11Variant::A,
        key_version: 0x01,
        key_id: 0x03,
        curve: EcCurve::P256,
        security_domain_public_key: domain.lock().unwrap().static_key.public.clone(),
        host_key: None,
        certificates: Vec::new(),
    });

    let result = secure_channel::authenticate(
        &mut connection,
        &params,
        SecurityLevel::FULL,
        Arc::new(SoftwareCrypto),
    );

    assert!(matches!(result, Err(ScpError::InvalidKeyParams(_))));
}
