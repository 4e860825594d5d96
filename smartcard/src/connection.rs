//! Single-card channel on top of the platform capability.
//!
//! A [`Connection`] owns one context and one card handle. Transmission
//! drives GET RESPONSE chaining, applies an injected secure channel
//! transform, and recovers once from a card reset; transactions are scoped
//! by a guard that always releases, leaving the card untouched.

use std::mem;
use std::ops::{Deref, DerefMut};

use tracing::{debug, trace, warn};

use crate::apdu::{self, CommandApdu, ResponseApdu};
use crate::error::{SmartCardError, TransformError};
use crate::pcsc::{
    Disposition, Pcsc, Protocol, Protocols, ReaderState, ScardError, Scope, ShareMode, StateFlags,
};

/// A secure channel hook around the transmit path.
///
/// The command transform runs before serialisation; the response transform
/// runs once per exchange, on the fully reassembled response after any
/// GET RESPONSE continuation.
pub trait ApduTransform: Send {
    fn wrap_command(&mut self, command: CommandApdu) -> Result<CommandApdu, TransformError>;

    fn unwrap_response(&mut self, response: ResponseApdu) -> Result<ResponseApdu, TransformError>;
}

/// A reader with an attached (or recently attached) card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    atr: Vec<u8>,
}

impl Device {
    pub fn new(name: impl Into<String>, atr: impl Into<Vec<u8>>) -> Self {
        Device {
            name: name.into(),
            atr: atr.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The answer-to-reset captured when the device was last seen.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Connect to the card in this reader over a fresh context.
    pub fn connect<B: Pcsc>(&self, backend: B, share_mode: ShareMode) -> Result<Connection<B>, SmartCardError> {
        Connection::open(backend, &self.name, share_mode)
    }
}

/// Enumerate readers that currently hold a card.
///
/// Zero readers is not an error: the result is simply empty.
pub fn list_devices<B: Pcsc>(backend: &B) -> Result<Vec<Device>, SmartCardError> {
    let context = backend.establish(Scope::User)?;
    let result = list_devices_in(backend, &context);
    backend.release(&context);

    result
}

fn list_devices_in<B: Pcsc>(backend: &B, context: &B::Context) -> Result<Vec<Device>, SmartCardError> {
    let names = backend.list_readers(context)?;
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let mut states: Vec<ReaderState> = names.into_iter().map(ReaderState::new).collect();
    backend.get_status_change(context, Some(std::time::Duration::ZERO), &mut states)?;

    let devices = states
        .into_iter()
        .filter(|state| state.event.contains(StateFlags::PRESENT))
        .map(|state| Device::new(state.name, state.atr))
        .collect();

    Ok(devices)
}

/// Exclusive owner of a context and card handle pair.
pub struct Connection<B: Pcsc> {
    backend: B,
    context: Option<B::Context>,
    card: Option<B::Card>,
    reader: String,
    protocol: Protocol,
    transform: Option<Box<dyn ApduTransform>>,
    card_reset: bool,
}

impl<B: Pcsc> Connection<B> {
    /// Establish a context and connect to the card in `reader`.
    ///
    /// Each native resource stays owned by this constructor until the
    /// finished connection takes both over in one step.
    pub fn open(backend: B, reader: &str, share_mode: ShareMode) -> Result<Self, SmartCardError> {
        let context = backend.establish(Scope::User)?;

        let (card, protocol) = match backend.connect(&context, reader, share_mode, Protocols::ANY) {
            Ok(connected) => connected,
            Err(error) => {
                backend.release(&context);
                return Err(error.into());
            }
        };

        debug!(reader, %protocol, "connected to card");

        Ok(Connection {
            backend,
            context: Some(context),
            card: Some(card),
            reader: reader.to_string(),
            protocol,
            transform: None,
            card_reset: false,
        })
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Install or remove the secure channel transform on the transmit path.
    pub fn set_transform(&mut self, transform: Option<Box<dyn ApduTransform>>) {
        self.transform = transform;
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    /// True once the card has been reset underneath this connection since
    /// the last call; any session state on the card is gone.
    pub fn take_card_reset(&mut self) -> bool {
        mem::take(&mut self.card_reset)
    }

    fn card(&self) -> &B::Card {
        self.card.as_ref().expect("card handle released while connection in use")
    }

    /// Transmit one command, driving GET RESPONSE chaining and the secure
    /// channel transform.
    pub fn transmit(&mut self, command: &CommandApdu) -> Result<ResponseApdu, SmartCardError> {
        let command = match self.transform.as_mut() {
            Some(transform) => transform
                .wrap_command(command.clone())
                .map_err(SmartCardError::SecureChannel)?,
            None => command.clone(),
        };

        let response = apdu::drive_chaining(&command, |cmd| self.transmit_raw(cmd))?;

        // The response MAC and encryption cover the reassembled payload
        // and the final status word, so unwrapping happens only once the
        // chaining has converged.
        match self.transform.as_mut() {
            Some(transform) => transform
                .unwrap_response(response)
                .map_err(SmartCardError::SecureChannel),
            None => Ok(response),
        }
    }

    fn transmit_raw(&mut self, command: &CommandApdu) -> Result<ResponseApdu, SmartCardError> {
        let bytes = command.encode();
        if self.transform.is_none() {
            trace!(apdu = %hex::encode(&bytes), "transmit");
        }

        let received = match self.backend.transmit(self.card(), &bytes) {
            Ok(received) => received,
            Err(ScardError::ResetCard) => {
                self.recover_from_reset()?;
                self.backend.transmit(self.card(), &bytes)?
            }
            Err(error) => return Err(error.into()),
        };

        ResponseApdu::decode(&received)
    }

    /// Begin an exclusive transaction, reconnecting once if the card was
    /// reset since the last operation. The returned flag reports whether
    /// such a reset happened.
    pub fn begin_transaction(&mut self) -> Result<(TransactionGuard<'_, B>, bool), SmartCardError> {
        if let Err(error) = self.backend.begin_transaction(self.card()) {
            match error {
                ScardError::ResetCard => {
                    self.recover_from_reset()?;
                    self.backend.begin_transaction(self.card())?;
                }
                error => return Err(error.into()),
            }
        }

        let card_was_reset = self.take_card_reset();

        Ok((TransactionGuard { connection: self }, card_was_reset))
    }

    /// Reconnect after a card reset: exclusive access, reset disposition.
    ///
    /// A second reset surfacing from the reconnect itself is not retried.
    fn recover_from_reset(&mut self) -> Result<(), SmartCardError> {
        warn!(reader = %self.reader, "card was reset, reconnecting");

        let card = self.card.as_mut().expect("card handle released while connection in use");
        self.protocol =
            self.backend
                .reconnect(card, ShareMode::Exclusive, Protocols::ANY, Disposition::ResetCard)?;

        self.card_reset = true;
        // The secure channel keys died with the card state.
        self.transform = None;

        Ok(())
    }
}

impl<B: Pcsc> Drop for Connection<B> {
    fn drop(&mut self) {
        if let Some(mut card) = self.card.take() {
            self.backend.disconnect(&mut card, Disposition::LeaveCard);
        }
        if let Some(context) = self.context.take() {
            self.backend.release(&context);
        }
    }
}

impl<B: Pcsc> std::fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("reader", &self.reader)
            .field("protocol", &self.protocol)
            .field("secured", &self.transform.is_some())
            .finish_non_exhaustive()
    }
}

/// Scoped exclusive access to the card.
///
/// The transaction ends on every exit path, leaving the card untouched.
pub struct TransactionGuard<'a, B: Pcsc> {
    connection: &'a mut Connection<B>,
}

impl<B: Pcsc> Deref for TransactionGuard<'_, B> {
    type Target = Connection<B>;

    fn deref(&self) -> &Self::Target {
        self.connection
    }
}

impl<B: Pcsc> DerefMut for TransactionGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
    }
}

impl<B: Pcsc> Drop for TransactionGuard<'_, B> {
    fn drop(&mut self) {
        let backend = &self.connection.backend;
        if let Some(card) = self.connection.card.as_ref() {
            if let Err(error) = backend.end_transaction(card, Disposition::LeaveCard) {
                warn!(%error, "could not end card transaction");
            }
        }
    }
}
