//! Smart card reader access for the token SDK.
//!
//! This crate wraps the host PC/SC stack behind the [`Pcsc`] capability,
//! frames ISO 7816 APDUs, owns the single-card [`Connection`] with its
//! transaction scoping and reset recovery, and runs the background
//! [`DeviceListener`] that turns blocking status-change calls into
//! arrival and removal events.

pub mod apdu;
pub mod connection;
pub mod listener;
pub mod pcsc;

mod error;

pub use self::apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use self::connection::{list_devices, ApduTransform, Connection, Device, TransactionGuard};
pub use self::error::{SmartCardError, TransformError};
pub use self::listener::{DeviceEvent, DeviceListener, HandlerKey};
pub use self::pcsc::{
    Disposition, Pcsc, Protocol, Protocols, ReaderState, ScardError, Scope, ShareMode, StateFlags,
};

#[cfg(any(test, feature = "mock"))]
pub use self::pcsc::MockPcsc;
#[cfg(feature = "platform")]
pub use self::pcsc::PlatformPcsc;
