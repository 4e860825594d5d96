//! Application session base: SELECT, version gating and the secure channel
//! hook.

use std::sync::Arc;

use tracing::{info, instrument};

use secure_channel::{ScpError, ScpKeyParams, SecurityLevel};
use smartcard::apdu::{CommandApdu, ResponseApdu, StatusWord};
use smartcard::pcsc::Pcsc;
use smartcard::{Connection, SmartCardError, TransactionGuard};
use token_common::crypto::CryptoProvider;
use token_common::tlv::TlvError;
use token_common::version::{Version, VersionError};

use crate::application::Application;
use crate::feature::Feature;

const INS_SELECT: u8 = 0xa4;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("smart card error: {0}")]
    SmartCard(#[from] SmartCardError),
    #[error("application returned status {0}")]
    Application(StatusWord),
    #[error("{feature} requires firmware {required}, device has {actual}")]
    FeatureUnsupported {
        feature: &'static str,
        required: Version,
        actual: Version,
    },
    #[error("malformed application response: {0}")]
    BadResponse(&'static str),
    #[error("malformed TLV in application response: {0}")]
    Tlv(#[from] TlvError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("secure channel error: {0}")]
    SecureChannel(#[from] ScpError),
    #[error("could not parse application version: {0}")]
    Version(#[from] VersionError),
}

/// A session with one on-card application over one connection.
///
/// Sessions are not thread safe; all APDUs within a session are totally
/// ordered through its exclusive ownership of the connection.
pub struct Session<B: Pcsc> {
    connection: Connection<B>,
    application: Application,
    version: Version,
}

impl<B: Pcsc> Session<B> {
    /// SELECT the application and parse its version from the trailing
    /// token of the response string, where the application reports one.
    #[instrument(skip(connection))]
    pub fn select(mut connection: Connection<B>, application: Application) -> Result<Self, SessionError> {
        let command = CommandApdu::new(0x00, INS_SELECT, 0x04, 0x00)
            .with_data(application.aid())
            .with_ne(256);

        let response = connection.transmit(&command)?;
        if !response.sw.is_success() {
            return Err(SessionError::Application(response.sw));
        }

        let version = Version::from_select_response(&response.data).unwrap_or_default();
        info!(%application, %version, "application selected");

        Ok(Session {
            connection,
            application,
            version,
        })
    }

    pub fn application(&self) -> Application {
        self.application
    }

    /// The firmware version used for feature gating.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Replace the gating version with a more authoritative source, such
    /// as the device information TLV.
    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn supports(&self, feature: &Feature) -> bool {
        feature.supported_by(self.version)
    }

    pub fn ensure_supports(&self, feature: &Feature) -> Result<(), SessionError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(SessionError::FeatureUnsupported {
                feature: feature.name,
                required: feature.minimum,
                actual: self.version,
            })
        }
    }

    /// Transmit expecting success; any other status word is returned as an
    /// application error.
    pub fn transmit(&mut self, command: &CommandApdu) -> Result<Vec<u8>, SessionError> {
        let response = self.connection.transmit(command)?;
        if !response.sw.is_success() {
            return Err(SessionError::Application(response.sw));
        }

        Ok(response.data)
    }

    /// Transmit without interpreting the status word.
    pub fn transmit_raw(&mut self, command: &CommandApdu) -> Result<ResponseApdu, SessionError> {
        Ok(self.connection.transmit(command)?)
    }

    /// Scope a run of APDUs under an exclusive card transaction. The flag
    /// reports whether the card was reset getting there; if so, any secure
    /// channel must be re-established and the application re-selected.
    pub fn transaction(&mut self) -> Result<(TransactionGuard<'_, B>, bool), SessionError> {
        Ok(self.connection.begin_transaction()?)
    }

    /// Negotiate a secure channel and install it on the transmit path.
    pub fn open_secure_channel(
        &mut self,
        params: &ScpKeyParams,
        security_level: SecurityLevel,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<(), SessionError> {
        let state = secure_channel::authenticate(&mut self.connection, params, security_level, provider)?;
        self.connection.set_transform(Some(Box::new(state)));
        info!(application = %self.application, "secure channel established");

        Ok(())
    }

    pub fn close_secure_channel(&mut self) {
        self.connection.set_transform(None);
    }

    pub fn is_secured(&self) -> bool {
        self.connection.has_transform()
    }

    /// True once the card was reset under this session; the secure channel
    /// state is already discarded when this reports true.
    pub fn take_card_reset(&mut self) -> bool {
        self.connection.take_card_reset()
    }
}

impl<B: Pcsc> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("application", &self.application)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
