//! GlobalPlatform secure channel protocols.
//!
//! SCP03 authenticates with static AES keys and challenge exchange; SCP11
//! adds ephemeral elliptic-curve key agreement. Both end in the same place:
//! four 16-byte session keys and a zeroed MAC chain, after which the
//! [`ScpState`] data layer wraps every APDU with command MAC chaining and
//! optional encryption in both directions.

pub mod kdf;
pub mod keys;
pub mod scp03;
pub mod scp11;
pub mod state;

pub use self::keys::{Scp03KeyParams, Scp11KeyParams, Scp11Variant, ScpKeyParams, SecurityLevel, SessionKeys};
pub use self::state::ScpState;

use std::sync::Arc;

use smartcard::apdu::StatusWord;
use smartcard::pcsc::Pcsc;
use smartcard::{Connection, SmartCardError};
use token_common::crypto::{CryptoError, CryptoProvider};
use token_common::tlv::TlvError;

#[derive(Debug, thiserror::Error)]
pub enum ScpError {
    #[error("smart card error: {0}")]
    SmartCard(#[from] SmartCardError),
    #[error("card returned status {0}")]
    Protocol(StatusWord),
    #[error("card cryptogram verification failed")]
    AuthenticationFailed,
    #[error("response MAC verification failed")]
    MacFailure,
    #[error("secure channel command limit reached")]
    SessionLimitReached,
    #[error("malformed secure channel response: {0}")]
    BadResponse(&'static str),
    #[error("invalid key parameters: {0}")]
    InvalidKeyParams(&'static str),
    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("malformed TLV in secure channel response: {0}")]
    Tlv(#[from] TlvError),
}

/// Run the key agreement for `params` and return the keyed data layer,
/// ready to be installed on the connection's transmit path.
pub fn authenticate<B: Pcsc>(
    connection: &mut Connection<B>,
    params: &ScpKeyParams,
    security_level: SecurityLevel,
    provider: Arc<dyn CryptoProvider>,
) -> Result<ScpState, ScpError> {
    match params {
        ScpKeyParams::Scp03(params) => scp03::authenticate(connection, params, security_level, provider),
        ScpKeyParams::Scp11(params) => scp11::authenticate(connection, params, security_level, provider),
    }
}
