//! Scripted in-memory PC/SC backend.
//!
//! Tests drive reader topology and card presence through the script
//! methods; blocking status change calls wake up exactly like the native
//! stack would, including cancellation, injected service failures and the
//! notification reader's event counter semantics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{
    Disposition, Pcsc, Protocol, Protocols, ReaderState, ScardError, Scope, ShareMode, StateFlags,
};

type TransmitHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct MockReader {
    name: String,
    present: bool,
    atr: Vec<u8>,
    event_count: u16,
}

#[derive(Default)]
struct MockState {
    readers: Vec<MockReader>,
    /// Bumped on every reader set mutation; reported through the
    /// notification reader's event counter.
    list_version: u16,
    pnp_supported: bool,
    cancelled: bool,
    status_change_errors: VecDeque<ScardError>,
    begin_transaction_errors: VecDeque<ScardError>,
    transmit_errors: VecDeque<ScardError>,
    transmit_handler: Option<TransmitHandler>,
    transmitted: Vec<Vec<u8>>,
    protocol: Option<Protocol>,
    begin_count: usize,
    end_count: usize,
    end_dispositions: Vec<Disposition>,
    reconnect_count: usize,
    reconnect_share_modes: Vec<ShareMode>,
}

struct Inner {
    state: Mutex<MockState>,
    wakeup: Condvar,
}

/// Scripted PC/SC backend; clones share the same state.
#[derive(Clone)]
pub struct MockPcsc {
    inner: Arc<Inner>,
}

/// Opaque mock context token.
pub struct MockContext;

/// Mock card handle bound to a reader by name.
pub struct MockCard {
    reader: String,
}

impl Default for MockPcsc {
    fn default() -> Self {
        MockPcsc::new()
    }
}

impl MockPcsc {
    pub fn new() -> Self {
        let state = MockState {
            pnp_supported: true,
            protocol: Some(Protocol::T1),
            ..MockState::default()
        };

        MockPcsc {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Simulate a platform that does not signal notification reader changes.
    pub fn without_pnp_notification(self) -> Self {
        self.inner.state.lock().pnp_supported = false;
        self
    }

    pub fn with_protocol(self, protocol: Protocol) -> Self {
        self.inner.state.lock().protocol = Some(protocol);
        self
    }

    pub fn add_reader(&self, name: &str) {
        let mut state = self.inner.state.lock();
        state.readers.push(MockReader {
            name: name.to_string(),
            present: false,
            atr: Vec::new(),
            event_count: 0,
        });
        state.list_version = state.list_version.wrapping_add(1);
        self.inner.wakeup.notify_all();
    }

    pub fn remove_reader(&self, name: &str) {
        let mut state = self.inner.state.lock();
        state.readers.retain(|reader| reader.name != name);
        state.list_version = state.list_version.wrapping_add(1);
        self.inner.wakeup.notify_all();
    }

    pub fn insert_card(&self, reader: &str, atr: &[u8]) {
        let mut state = self.inner.state.lock();
        if let Some(reader) = state.readers.iter_mut().find(|r| r.name == reader) {
            reader.present = true;
            reader.atr = atr.to_vec();
            reader.event_count = reader.event_count.wrapping_add(1);
        }
        self.inner.wakeup.notify_all();
    }

    pub fn remove_card(&self, reader: &str) {
        let mut state = self.inner.state.lock();
        if let Some(reader) = state.readers.iter_mut().find(|r| r.name == reader) {
            reader.present = false;
            reader.atr = Vec::new();
            reader.event_count = reader.event_count.wrapping_add(1);
        }
        self.inner.wakeup.notify_all();
    }

    /// Make the next blocking status change call fail with `error`.
    pub fn fail_next_status_change(&self, error: ScardError) {
        self.inner.state.lock().status_change_errors.push_back(error);
        self.inner.wakeup.notify_all();
    }

    pub fn fail_next_begin_transaction(&self, error: ScardError) {
        self.inner.state.lock().begin_transaction_errors.push_back(error);
    }

    pub fn fail_next_transmit(&self, error: ScardError) {
        self.inner.state.lock().transmit_errors.push_back(error);
    }

    /// Install the card side of the conversation: a handler mapping each
    /// transmitted APDU to its response bytes.
    pub fn on_transmit(&self, handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.inner.state.lock().transmit_handler = Some(Box::new(handler));
    }

    /// All APDUs transmitted so far, in order.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().transmitted.clone()
    }

    pub fn begin_transaction_count(&self) -> usize {
        self.inner.state.lock().begin_count
    }

    pub fn end_transaction_count(&self) -> usize {
        self.inner.state.lock().end_count
    }

    pub fn end_transaction_dispositions(&self) -> Vec<Disposition> {
        self.inner.state.lock().end_dispositions.clone()
    }

    pub fn reconnect_count(&self) -> usize {
        self.inner.state.lock().reconnect_count
    }

    pub fn reconnect_share_modes(&self) -> Vec<ShareMode> {
        self.inner.state.lock().reconnect_share_modes.clone()
    }
}

impl MockState {
    /// Fill in event state for the requested readers; true when any entry
    /// reports a change against its acknowledged current state.
    fn compute_events(&self, states: &mut [ReaderState]) -> bool {
        let mut any_changed = false;

        for state in states.iter_mut() {
            if state.is_pnp_notification() {
                let known_version = (state.current.bits() >> 16) as u16;
                let mut event = StateFlags::from_bits_retain(u32::from(self.list_version) << 16);
                if !self.pnp_supported {
                    event |= StateFlags::UNKNOWN;
                }

                let changed = known_version != self.list_version
                    || (!self.pnp_supported && !state.current.contains(StateFlags::UNKNOWN));
                if changed {
                    event |= StateFlags::CHANGED;
                    any_changed = true;
                }
                state.event = event;
                continue;
            }

            match self.readers.iter().find(|reader| reader.name == state.name) {
                None => {
                    let changed = !state.current.contains(StateFlags::UNKNOWN);
                    let mut event = StateFlags::UNKNOWN | StateFlags::IGNORE;
                    if changed {
                        event |= StateFlags::CHANGED;
                        any_changed = true;
                    }
                    state.event = event;
                }
                Some(reader) => {
                    let presence = if reader.present {
                        StateFlags::PRESENT
                    } else {
                        StateFlags::EMPTY
                    };
                    let known_count = (state.current.bits() >> 16) as u16;
                    let known_presence = state.current & (StateFlags::PRESENT | StateFlags::EMPTY);

                    let changed = known_presence != presence || known_count != reader.event_count;
                    let mut event = presence | StateFlags::from_bits_retain(u32::from(reader.event_count) << 16);
                    if changed {
                        event |= StateFlags::CHANGED;
                        any_changed = true;
                    }
                    state.event = event;
                    if reader.present {
                        state.atr = reader.atr.clone();
                    }
                }
            }
        }

        any_changed
    }
}

impl Pcsc for MockPcsc {
    type Context = MockContext;
    type Card = MockCard;

    fn establish(&self, _scope: Scope) -> Result<Self::Context, ScardError> {
        Ok(MockContext)
    }

    fn release(&self, _context: &Self::Context) {}

    fn cancel(&self, _context: &Self::Context) -> Result<(), ScardError> {
        self.inner.state.lock().cancelled = true;
        self.inner.wakeup.notify_all();

        Ok(())
    }

    fn list_readers(&self, _context: &Self::Context) -> Result<Vec<String>, ScardError> {
        let names = self
            .inner
            .state
            .lock()
            .readers
            .iter()
            .map(|reader| reader.name.clone())
            .collect();

        Ok(names)
    }

    fn get_status_change(
        &self,
        _context: &Self::Context,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), ScardError> {
        let mut state = self.inner.state.lock();

        loop {
            if let Some(error) = state.status_change_errors.pop_front() {
                return Err(error);
            }
            if state.cancelled {
                state.cancelled = false;
                return Err(ScardError::Cancelled);
            }

            if state.compute_events(states) {
                return Ok(());
            }

            match timeout {
                Some(duration) if duration.is_zero() => return Err(ScardError::Timeout),
                Some(duration) => {
                    if self.inner.wakeup.wait_for(&mut state, duration).timed_out() {
                        return Err(ScardError::Timeout);
                    }
                }
                None => self.inner.wakeup.wait(&mut state),
            }
        }
    }

    fn connect(
        &self,
        _context: &Self::Context,
        reader: &str,
        _share_mode: ShareMode,
        _protocols: Protocols,
    ) -> Result<(Self::Card, Protocol), ScardError> {
        let state = self.inner.state.lock();
        let known = state
            .readers
            .iter()
            .find(|r| r.name == reader)
            .ok_or(ScardError::UnknownReader)?;
        if !known.present {
            return Err(ScardError::NoSmartCard);
        }
        let protocol = state.protocol.ok_or(ScardError::InvalidValue)?;

        Ok((
            MockCard {
                reader: reader.to_string(),
            },
            protocol,
        ))
    }

    fn reconnect(
        &self,
        card: &mut Self::Card,
        share_mode: ShareMode,
        _protocols: Protocols,
        _initialization: Disposition,
    ) -> Result<Protocol, ScardError> {
        let mut state = self.inner.state.lock();
        if !state.readers.iter().any(|r| r.name == card.reader && r.present) {
            return Err(ScardError::RemovedCard);
        }
        state.reconnect_count += 1;
        state.reconnect_share_modes.push(share_mode);

        state.protocol.ok_or(ScardError::InvalidValue)
    }

    fn disconnect(&self, _card: &mut Self::Card, _disposition: Disposition) {}

    fn begin_transaction(&self, _card: &Self::Card) -> Result<(), ScardError> {
        let mut state = self.inner.state.lock();
        if let Some(error) = state.begin_transaction_errors.pop_front() {
            return Err(error);
        }
        state.begin_count += 1;

        Ok(())
    }

    fn end_transaction(&self, _card: &Self::Card, disposition: Disposition) -> Result<(), ScardError> {
        let mut state = self.inner.state.lock();
        state.end_count += 1;
        state.end_dispositions.push(disposition);

        Ok(())
    }

    fn transmit(&self, _card: &Self::Card, send: &[u8]) -> Result<Vec<u8>, ScardError> {
        let mut state = self.inner.state.lock();
        if let Some(error) = state.transmit_errors.pop_front() {
            return Err(error);
        }
        state.transmitted.push(send.to_vec());

        let response = match state.transmit_handler.as_mut() {
            Some(handler) => handler(send),
            None => vec![0x6d, 0x00],
        };

        Ok(response)
    }
}
