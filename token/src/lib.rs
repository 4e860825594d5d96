//! Application sessions for the security token.
//!
//! A [`Session`] selects an on-card application, tracks its firmware
//! version for feature gating, and can install a secure channel on its
//! transmit path. [`ManagementSession`] drives the Management application:
//! paged device information readback, device configuration writes and
//! factory reset.

pub mod application;
pub mod capability;
pub mod feature;
pub mod management;
pub mod session;

pub use self::application::Application;
pub use self::capability::Capability;
pub use self::feature::Feature;
pub use self::management::{DeviceConfig, DeviceInfo, FormFactor, ManagementSession};
pub use self::session::{Session, SessionError};
