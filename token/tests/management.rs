//! Management session against a scripted card.

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use hex_literal::hex;

use smartcard::pcsc::{MockPcsc, ShareMode};
use smartcard::Connection;
use token::{Capability, DeviceConfig, ManagementSession, SessionError};
use token_common::version::Version;

const INS_SELECT: u8 = 0xa4;
const INS_GET_DEVICE_INFO: u8 = 0x1d;
const INS_SET_DEVICE_CONFIG: u8 = 0x1c;
const INS_DEVICE_RESET: u8 = 0x1f;

/// Card behaviour shared between the tests.
struct ManagementCard {
    select_response: Vec<u8>,
    info_pages: Vec<Vec<u8>>,
}

impl ManagementCard {
    fn new(select_version: &str, info_pages: Vec<Vec<u8>>) -> Self {
        ManagementCard {
            select_response: select_version.as_bytes().to_vec(),
            info_pages,
        }
    }

    fn handle(&mut self, apdu: &[u8]) -> Vec<u8> {
        match apdu[1] {
            INS_SELECT => {
                let mut response = self.select_response.clone();
                response.extend_from_slice(&hex!("9000"));
                response
            }
            INS_GET_DEVICE_INFO => {
                let page = apdu[2] as usize;
                match self.info_pages.get(page) {
                    Some(tlvs) => {
                        let mut response = vec![tlvs.len() as u8];
                        response.extend_from_slice(tlvs);
                        response.extend_from_slice(&hex!("9000"));
                        response
                    }
                    None => hex!("6a86").to_vec(),
                }
            }
            INS_SET_DEVICE_CONFIG | INS_DEVICE_RESET => hex!("9000").to_vec(),
            _ => hex!("6d00").to_vec(),
        }
    }
}

fn management_session(card: ManagementCard) -> (MockPcsc, ManagementSession<MockPcsc>) {
    let mock = MockPcsc::new();
    mock.add_reader("Mock Reader 00");
    mock.insert_card("Mock Reader 00", &hex!("3bfd13"));

    let card = Arc::new(Mutex::new(card));
    mock.on_transmit(move |apdu| card.lock().unwrap().handle(apdu));

    let connection = Connection::open(mock.clone(), "Mock Reader 00", ShareMode::Shared)
        .expect("could not open mock connection");
    let session = ManagementSession::new(connection).expect("could not select management");

    (mock, session)
}

#[test]
fn test_select_parses_trailing_version_token() {
    let (_mock, session) = management_session(ManagementCard::new("Applet 5.4.3", vec![]));

    assert_eq!(session.session().version(), Version::new(5, 4, 3));
}

#[test]
fn test_select_failure_is_fatal() {
    let mock = MockPcsc::new();
    mock.add_reader("Mock Reader 00");
    mock.insert_card("Mock Reader 00", &hex!("3bfd13"));
    mock.on_transmit(|_| hex!("6a82").to_vec());

    let connection = Connection::open(mock, "Mock Reader 00", ShareMode::Shared).unwrap();
    let result = ManagementSession::new(connection);

    assert_matches!(
        result,
        Err(SessionError::Application(sw)) if sw == smartcard::StatusWord::FILE_NOT_FOUND
    );
}

#[test]
fn test_paged_device_info_merges_both_pages() {
    // Page 0 carries the serial, firmware version and the more-data
    // marker; page 1 carries the NFC capabilities.
    let page0 = hex!(
        "02 04 00bc614e"
        "05 03 050701"
        "10 01 01"
    )
    .to_vec();
    let page1 = hex!(
        "0d 02 023f"
        "0e 02 0220"
    )
    .to_vec();
    let (mock, mut session) = management_session(ManagementCard::new("Applet 5.4.3", vec![page0, page1]));

    let info = session.get_device_info().expect("device info failed");

    assert_eq!(info.serial, Some(12_345_678));
    assert_eq!(info.firmware_version, Some(Version::new(5, 7, 1)));
    assert_eq!(info.nfc_enabled, Capability::FIDO2 | Capability::OATH);

    // Exactly two GET DEVICE INFO commands, page 0 then page 1.
    let info_commands: Vec<_> = mock
        .transmitted()
        .into_iter()
        .filter(|apdu| apdu[1] == INS_GET_DEVICE_INFO)
        .collect();
    assert_eq!(info_commands.len(), 2);
    assert_eq!(info_commands[0][2], 0x00);
    assert_eq!(info_commands[1][2], 0x01);

    // The TLV firmware version replaces the SELECT header parse.
    assert_eq!(session.session().version(), Version::new(5, 7, 1));
}

#[test]
fn test_device_info_single_page_stops_without_marker() {
    let page0 = hex!("02 04 00000001").to_vec();
    let (mock, mut session) = management_session(ManagementCard::new("Applet 5.4.3", vec![page0]));

    let info = session.get_device_info().expect("device info failed");

    assert_eq!(info.serial, Some(1));
    let info_commands: Vec<_> = mock
        .transmitted()
        .into_iter()
        .filter(|apdu| apdu[1] == INS_GET_DEVICE_INFO)
        .collect();
    assert_eq!(info_commands.len(), 1);
}

#[test]
fn test_set_device_config_writes_length_prefixed_tlvs() {
    let (mock, mut session) = management_session(ManagementCard::new("Applet 5.4.3", vec![]));

    let config = DeviceConfig {
        usb_enabled: Some(Capability::OATH | Capability::PIV),
        auto_eject_timeout: Some(30),
        ..DeviceConfig::default()
    };
    session
        .set_device_config(&config, false, None, None)
        .expect("config write failed");

    let wire = mock.transmitted();
    let command = wire.last().unwrap();
    assert_eq!(&command[..4], hex!("001c0000"));
    assert_eq!(command[4], 9); // Lc
    assert_eq!(&command[5..], hex!("08 03020030 0602001e"));
}

#[test]
fn test_set_device_config_is_version_gated() {
    let (_mock, mut session) = management_session(ManagementCard::new("Applet 4.3.7", vec![]));

    let result = session.set_device_config(&DeviceConfig::default(), false, None, None);

    assert_matches!(
        result,
        Err(SessionError::FeatureUnsupported { feature, required, actual })
            if feature == "device config" && required == Version::new(5, 0, 0) && actual == Version::new(4, 3, 7)
    );
}

#[test]
fn test_set_device_config_rejects_short_lock_code() {
    let (_mock, mut session) = management_session(ManagementCard::new("Applet 5.4.3", vec![]));

    let result = session.set_device_config(&DeviceConfig::default(), false, Some(&[0x11; 12]), None);

    assert_matches!(result, Err(SessionError::InvalidArgument(_)));
}

#[test]
fn test_reset_device_is_version_gated() {
    let (mock, mut session) = management_session(ManagementCard::new("Applet 5.4.3", vec![]));

    assert_matches!(
        session.reset_device(),
        Err(SessionError::FeatureUnsupported { feature, .. }) if feature == "device reset"
    );

    // No reset APDU reached the card.
    assert!(mock.transmitted().iter().all(|apdu| apdu[1] != INS_DEVICE_RESET));
}

#[test]
fn test_reset_device_issues_the_reset_instruction() {
    let (mock, mut session) = management_session(ManagementCard::new("Applet 5.7.1", vec![]));

    session.reset_device().expect("reset failed");

    let wire = mock.transmitted();
    assert_eq!(&wire.last().unwrap()[..4], hex!("001f0000"));
}
