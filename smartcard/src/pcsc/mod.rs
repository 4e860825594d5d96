//! The platform smart card capability.
//!
//! [`Pcsc`] is a thin trait over the operating system PC/SC interface.
//! [`PlatformPcsc`] (behind the `platform` feature) binds it to the native
//! stack through `pcsc-sys`; [`MockPcsc`] (behind the `mock` feature and in
//! tests) is a scripted in-memory replacement.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "platform")]
pub mod platform;

#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockPcsc;
#[cfg(feature = "platform")]
pub use self::platform::PlatformPcsc;

use std::time::Duration;

/// Reader name used by the resource manager to signal reader list changes.
pub const PNP_NOTIFICATION_READER: &str = "\\\\?PnP?\\Notification";

/// Maximum number of bytes in an answer-to-reset.
pub const MAX_ATR_SIZE: usize = 33;

/// Native status codes the rest of the SDK has a policy for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScardError {
    #[error("the card was reset")]
    ResetCard,
    #[error("the card was removed")]
    RemovedCard,
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("the smart card service is not running")]
    NoService,
    #[error("the smart card service has stopped")]
    ServiceStopped,
    #[error("no smart card readers are available")]
    NoReadersAvailable,
    #[error("the operation timed out")]
    Timeout,
    #[error("the card is in use by another process")]
    SharingViolation,
    #[error("no card in the reader")]
    NoSmartCard,
    #[error("unknown reader name")]
    UnknownReader,
    #[error("the reader is unavailable")]
    ReaderUnavailable,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("receive buffer too small")]
    InsufficientBuffer,
    #[error("invalid parameter value")]
    InvalidValue,
    #[error("communication error")]
    CommError,
    #[error("smart card error {0:#010x}")]
    Other(u32),
}

impl ScardError {
    /// Non-critical resource manager failures after which the listener
    /// re-establishes its context and continues.
    pub fn is_service_unavailable(self) -> bool {
        matches!(
            self,
            ScardError::NoService | ScardError::ServiceStopped | ScardError::NoReadersAvailable
        )
    }
}

/// Scope of a resource manager context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    System,
}

/// How a card connection is shared with other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    Exclusive,
    Shared,
    Direct,
}

/// The active transmission protocol of a connected card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Protocol {
    #[display("T=0")]
    T0,
    #[display("T=1")]
    T1,
    #[display("RAW")]
    Raw,
}

bitflags::bitflags! {
    /// Protocols acceptable when connecting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protocols: u32 {
        const T0 = 0x0001;
        const T1 = 0x0002;
        const RAW = 0x0004;
    }
}

impl Protocols {
    pub const ANY: Protocols = Protocols::T0.union(Protocols::T1);
}

/// Disposition of the card when a connection or transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    LeaveCard,
    ResetCard,
    UnpowerCard,
    EjectCard,
}

bitflags::bitflags! {
    /// Membership state bits of a reader, as reported by the platform.
    ///
    /// The upper 16 bits carry the platform's card event counter and are
    /// preserved verbatim; without them the notification reader is reported
    /// as changed on every call on some platforms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const IGNORE = 0x0001;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const UNAVAILABLE = 0x0008;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
        const ATRMATCH = 0x0040;
        const EXCLUSIVE = 0x0080;
        const INUSE = 0x0100;
        const MUTE = 0x0200;
        const UNPOWERED = 0x0400;

        const _ = !0;
    }
}

/// Tracked state of one reader across status change calls.
#[derive(Debug, Clone)]
pub struct ReaderState {
    pub name: String,
    pub current: StateFlags,
    pub event: StateFlags,
    /// Last answer-to-reset the platform reported; kept when a removal
    /// event no longer carries one.
    pub atr: Vec<u8>,
}

impl ReaderState {
    pub fn new(name: impl Into<String>) -> Self {
        ReaderState {
            name: name.into(),
            current: StateFlags::empty(),
            event: StateFlags::empty(),
            atr: Vec::new(),
        }
    }

    /// The notification entry whose `changed` event bit signals reader list
    /// membership changes.
    pub fn pnp_notification() -> Self {
        ReaderState::new(PNP_NOTIFICATION_READER)
    }

    pub fn is_pnp_notification(&self) -> bool {
        self.name == PNP_NOTIFICATION_READER
    }

    /// Acknowledge the last reported event, event counter included.
    pub fn sync_current_state(&mut self) {
        self.current = self.event;
    }
}

/// Capability over the operating system PC/SC stack.
///
/// One in-flight operation per card handle; a context may be shared by
/// several card handles, but `cancel` wakes every blocking call on it.
pub trait Pcsc {
    type Context: Send + Sync + 'static;
    type Card: Send + 'static;

    fn establish(&self, scope: Scope) -> Result<Self::Context, ScardError>;

    /// Release a context. The context must not be used afterwards.
    fn release(&self, context: &Self::Context);

    /// Wake any blocking [`Pcsc::get_status_change`] on this context.
    fn cancel(&self, context: &Self::Context) -> Result<(), ScardError>;

    /// Names of all connected readers; an empty list when there are none.
    fn list_readers(&self, context: &Self::Context) -> Result<Vec<String>, ScardError>;

    /// Block until one of `states` changes, `timeout` elapses or the
    /// context is cancelled. Event bits and (when reported) ATRs are
    /// written back into `states`; a `None` timeout blocks indefinitely.
    fn get_status_change(
        &self,
        context: &Self::Context,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), ScardError>;

    fn connect(
        &self,
        context: &Self::Context,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<(Self::Card, Protocol), ScardError>;

    fn reconnect(
        &self,
        card: &mut Self::Card,
        share_mode: ShareMode,
        protocols: Protocols,
        initialization: Disposition,
    ) -> Result<Protocol, ScardError>;

    fn disconnect(&self, card: &mut Self::Card, disposition: Disposition);

    fn begin_transaction(&self, card: &Self::Card) -> Result<(), ScardError>;

    fn end_transaction(&self, card: &Self::Card, disposition: Disposition) -> Result<(), ScardError>;

    fn transmit(&self, card: &Self::Card, send: &[u8]) -> Result<Vec<u8>, ScardError>;
}
