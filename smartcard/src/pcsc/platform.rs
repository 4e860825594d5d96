//! Native PC/SC backend over `pcsc-sys`.
//!
//! The ASCII variants of the native functions are used throughout, which
//! `pcsc-sys` exposes under the unsuffixed names on every platform.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::ptr;
use std::time::Duration;

use pcsc_sys::{DWORD, LONG, SCARDCONTEXT, SCARDHANDLE};

use super::{
    Disposition, Pcsc, Protocol, Protocols, ReaderState, ScardError, Scope, ShareMode, StateFlags,
};

/// Maximum number of bytes in an extended APDU response plus status word.
const MAX_RECEIVE_SIZE: usize = 4 + 3 + 65536 + 3 + 2;

fn check(rv: LONG) -> Result<(), ScardError> {
    if rv == pcsc_sys::SCARD_S_SUCCESS {
        Ok(())
    } else {
        Err(ScardError::from_raw(rv))
    }
}

impl ScardError {
    pub(crate) fn from_raw(rv: LONG) -> Self {
        let code = rv as u32;
        if code == pcsc_sys::SCARD_W_RESET_CARD as u32 {
            ScardError::ResetCard
        } else if code == pcsc_sys::SCARD_W_REMOVED_CARD as u32 {
            ScardError::RemovedCard
        } else if code == pcsc_sys::SCARD_E_CANCELLED as u32 {
            ScardError::Cancelled
        } else if code == pcsc_sys::SCARD_E_NO_SERVICE as u32 {
            ScardError::NoService
        } else if code == pcsc_sys::SCARD_E_SERVICE_STOPPED as u32 {
            ScardError::ServiceStopped
        } else if code == pcsc_sys::SCARD_E_NO_READERS_AVAILABLE as u32 {
            ScardError::NoReadersAvailable
        } else if code == pcsc_sys::SCARD_E_TIMEOUT as u32 {
            ScardError::Timeout
        } else if code == pcsc_sys::SCARD_E_SHARING_VIOLATION as u32 {
            ScardError::SharingViolation
        } else if code == pcsc_sys::SCARD_E_NO_SMARTCARD as u32 {
            ScardError::NoSmartCard
        } else if code == pcsc_sys::SCARD_E_UNKNOWN_READER as u32 {
            ScardError::UnknownReader
        } else if code == pcsc_sys::SCARD_E_READER_UNAVAILABLE as u32 {
            ScardError::ReaderUnavailable
        } else if code == pcsc_sys::SCARD_E_INVALID_HANDLE as u32 {
            ScardError::InvalidHandle
        } else if code == pcsc_sys::SCARD_E_INSUFFICIENT_BUFFER as u32 {
            ScardError::InsufficientBuffer
        } else if code == pcsc_sys::SCARD_E_INVALID_VALUE as u32 {
            ScardError::InvalidValue
        } else if code == pcsc_sys::SCARD_F_COMM_ERROR as u32 {
            ScardError::CommError
        } else {
            ScardError::Other(code)
        }
    }
}

impl Scope {
    fn into_raw(self) -> DWORD {
        match self {
            Scope::User => pcsc_sys::SCARD_SCOPE_USER,
            Scope::System => pcsc_sys::SCARD_SCOPE_SYSTEM,
        }
    }
}

impl ShareMode {
    fn into_raw(self) -> DWORD {
        match self {
            ShareMode::Exclusive => pcsc_sys::SCARD_SHARE_EXCLUSIVE,
            ShareMode::Shared => pcsc_sys::SCARD_SHARE_SHARED,
            ShareMode::Direct => pcsc_sys::SCARD_SHARE_DIRECT,
        }
    }
}

impl Protocols {
    fn into_raw(self) -> DWORD {
        let mut raw = pcsc_sys::SCARD_PROTOCOL_UNDEFINED;
        if self.contains(Protocols::T0) {
            raw |= pcsc_sys::SCARD_PROTOCOL_T0;
        }
        if self.contains(Protocols::T1) {
            raw |= pcsc_sys::SCARD_PROTOCOL_T1;
        }
        if self.contains(Protocols::RAW) {
            raw |= pcsc_sys::SCARD_PROTOCOL_RAW;
        }

        raw
    }
}

impl Protocol {
    fn from_raw(raw: DWORD) -> Result<Protocol, ScardError> {
        match raw {
            pcsc_sys::SCARD_PROTOCOL_T0 => Ok(Protocol::T0),
            pcsc_sys::SCARD_PROTOCOL_T1 => Ok(Protocol::T1),
            pcsc_sys::SCARD_PROTOCOL_RAW => Ok(Protocol::Raw),
            _ => Err(ScardError::InvalidValue),
        }
    }

    fn pci(self) -> &'static pcsc_sys::SCARD_IO_REQUEST {
        unsafe {
            match self {
                Protocol::T0 => &pcsc_sys::g_rgSCardT0Pci,
                Protocol::T1 => &pcsc_sys::g_rgSCardT1Pci,
                Protocol::Raw => &pcsc_sys::g_rgSCardRawPci,
            }
        }
    }
}

impl Disposition {
    fn into_raw(self) -> DWORD {
        match self {
            Disposition::LeaveCard => pcsc_sys::SCARD_LEAVE_CARD,
            Disposition::ResetCard => pcsc_sys::SCARD_RESET_CARD,
            Disposition::UnpowerCard => pcsc_sys::SCARD_UNPOWER_CARD,
            Disposition::EjectCard => pcsc_sys::SCARD_EJECT_CARD,
        }
    }
}

/// The native resource manager context handle.
pub struct PlatformContext {
    handle: SCARDCONTEXT,
}

// The native context handle is a process-wide token; the resource manager
// serialises operations on it, and cancellation from another thread is the
// documented use of SCardCancel.
unsafe impl Send for PlatformContext {}
unsafe impl Sync for PlatformContext {}

/// A connected native card handle and its active protocol.
pub struct PlatformCard {
    handle: SCARDHANDLE,
    protocol: Protocol,
}

unsafe impl Send for PlatformCard {}

/// The production PC/SC backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformPcsc;

impl Pcsc for PlatformPcsc {
    type Context = PlatformContext;
    type Card = PlatformCard;

    fn establish(&self, scope: Scope) -> Result<Self::Context, ScardError> {
        let mut handle: SCARDCONTEXT = 0;
        check(unsafe {
            pcsc_sys::SCardEstablishContext(scope.into_raw(), ptr::null(), ptr::null(), &mut handle)
        })?;

        Ok(PlatformContext { handle })
    }

    fn release(&self, context: &Self::Context) {
        // Failure here leaves nothing for the caller to do; the handle is
        // gone either way.
        let _ = unsafe { pcsc_sys::SCardReleaseContext(context.handle) };
    }

    fn cancel(&self, context: &Self::Context) -> Result<(), ScardError> {
        check(unsafe { pcsc_sys::SCardCancel(context.handle) })
    }

    fn list_readers(&self, context: &Self::Context) -> Result<Vec<String>, ScardError> {
        let mut len: DWORD = 0;
        let rv = unsafe {
            pcsc_sys::SCardListReaders(context.handle, ptr::null(), ptr::null_mut(), &mut len)
        };
        if rv as u32 == pcsc_sys::SCARD_E_NO_READERS_AVAILABLE as u32 {
            return Ok(Vec::new());
        }
        check(rv)?;

        let mut buffer = vec![0u8; len as usize];
        let rv = unsafe {
            pcsc_sys::SCardListReaders(
                context.handle,
                ptr::null(),
                buffer.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rv as u32 == pcsc_sys::SCARD_E_NO_READERS_AVAILABLE as u32 {
            return Ok(Vec::new());
        }
        check(rv)?;
        buffer.truncate(len as usize);

        // The buffer is a multi-string: NUL-terminated names followed by a
        // final empty entry.
        let names = buffer
            .split(|&byte| byte == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();

        Ok(names)
    }

    fn get_status_change(
        &self,
        context: &Self::Context,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), ScardError> {
        let timeout_ms = match timeout {
            Some(duration) => {
                let millis = duration
                    .as_secs()
                    .saturating_mul(1000)
                    .saturating_add(u64::from(duration.subsec_millis()));
                millis.min(pcsc_sys::INFINITE as u64) as DWORD
            }
            None => pcsc_sys::INFINITE,
        };

        let names: Vec<CString> = states
            .iter()
            .map(|state| CString::new(state.name.as_str()).map_err(|_| ScardError::InvalidValue))
            .collect::<Result<_, _>>()?;

        let mut raw_states: Vec<pcsc_sys::SCARD_READERSTATE> = names
            .iter()
            .zip(states.iter())
            .map(|(name, state)| pcsc_sys::SCARD_READERSTATE {
                szReader: name.as_ptr(),
                pvUserData: ptr::null_mut(),
                dwCurrentState: state.current.bits() as DWORD,
                dwEventState: 0,
                cbAtr: 0,
                rgbAtr: [0; pcsc_sys::ATR_BUFFER_SIZE],
            })
            .collect();

        check(unsafe {
            pcsc_sys::SCardGetStatusChange(
                context.handle,
                timeout_ms,
                raw_states.as_mut_ptr(),
                raw_states.len() as DWORD,
            )
        })?;

        for (state, raw) in states.iter_mut().zip(raw_states.iter()) {
            state.event = StateFlags::from_bits_retain(raw.dwEventState as u32);
            let atr_len = (raw.cbAtr as usize).min(raw.rgbAtr.len());
            if atr_len > 0 {
                state.atr = raw.rgbAtr[..atr_len].to_vec();
            }
        }

        Ok(())
    }

    fn connect(
        &self,
        context: &Self::Context,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<(Self::Card, Protocol), ScardError> {
        let reader = CString::new(reader).map_err(|_| ScardError::InvalidValue)?;
        let mut handle: SCARDHANDLE = 0;
        let mut active: DWORD = 0;

        check(unsafe {
            pcsc_sys::SCardConnect(
                context.handle,
                reader.as_ptr(),
                share_mode.into_raw(),
                protocols.into_raw(),
                &mut handle,
                &mut active,
            )
        })?;

        let protocol = Protocol::from_raw(active)?;

        Ok((PlatformCard { handle, protocol }, protocol))
    }

    fn reconnect(
        &self,
        card: &mut Self::Card,
        share_mode: ShareMode,
        protocols: Protocols,
        initialization: Disposition,
    ) -> Result<Protocol, ScardError> {
        let mut active: DWORD = 0;
        check(unsafe {
            pcsc_sys::SCardReconnect(
                card.handle,
                share_mode.into_raw(),
                protocols.into_raw(),
                initialization.into_raw(),
                &mut active,
            )
        })?;

        card.protocol = Protocol::from_raw(active)?;

        Ok(card.protocol)
    }

    fn disconnect(&self, card: &mut Self::Card, disposition: Disposition) {
        let _ = unsafe { pcsc_sys::SCardDisconnect(card.handle, disposition.into_raw()) };
    }

    fn begin_transaction(&self, card: &Self::Card) -> Result<(), ScardError> {
        check(unsafe { pcsc_sys::SCardBeginTransaction(card.handle) })
    }

    fn end_transaction(&self, card: &Self::Card, disposition: Disposition) -> Result<(), ScardError> {
        check(unsafe { pcsc_sys::SCardEndTransaction(card.handle, disposition.into_raw()) })
    }

    fn transmit(&self, card: &Self::Card, send: &[u8]) -> Result<Vec<u8>, ScardError> {
        let mut receive = vec![0u8; MAX_RECEIVE_SIZE];
        let mut receive_len = receive.len() as DWORD;

        check(unsafe {
            pcsc_sys::SCardTransmit(
                card.handle,
                card.protocol.pci(),
                send.as_ptr(),
                send.len() as DWORD,
                ptr::null_mut(),
                receive.as_mut_ptr(),
                &mut receive_len,
            )
        })?;
        receive.truncate(receive_len as usize);

        Ok(receive)
    }
}

impl std::fmt::Debug for PlatformContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformContext").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PlatformCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCard")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
