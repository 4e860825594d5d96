//! ISO 7816-4 APDU framing.
//!
//! Short form is used whenever the command fits (data up to 255 bytes and
//! an expected response length up to 256); anything larger switches the
//! whole command to extended form. Response chaining through GET RESPONSE
//! is driven here as well, bounded by [`MAX_CHAINED_RESPONSE`].

use crate::error::SmartCardError;

pub const INS_GET_RESPONSE: u8 = 0xc0;

/// Upper bound on the accumulated size of a chained response.
pub const MAX_CHAINED_RESPONSE: usize = 32 * 1024;

/// A command APDU prior to serialisation.
///
/// `ne` is the number of response bytes expected, 0 through 65536; zero
/// omits the Le field entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub ne: u32,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        CommandApdu {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            ne: 0,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_ne(mut self, ne: u32) -> Self {
        self.ne = ne;
        self
    }

    fn is_extended(&self) -> bool {
        self.data.len() > 255 || self.ne > 256
    }

    /// Parse a serialised command back into its structure.
    pub fn decode(bytes: &[u8]) -> Result<Self, SmartCardError> {
        if bytes.len() < 4 {
            return Err(SmartCardError::BadResponse("command shorter than a header"));
        }
        let mut command = CommandApdu::new(bytes[0], bytes[1], bytes[2], bytes[3]);

        match &bytes[4..] {
            [] => {}
            [le] => command.ne = ne_from_le_byte(*le),
            // A leading zero marks the extended form; a short Lc is never
            // zero.
            [0x00, rest @ ..] => {
                if let [hi, lo] = rest {
                    command.ne = extended_ne(u16::from_be_bytes([*hi, *lo]));
                } else {
                    let length = rest
                        .get(..2)
                        .map(|bytes| usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
                        .ok_or(SmartCardError::BadResponse("truncated extended Lc"))?;
                    let data = rest
                        .get(2..2 + length)
                        .ok_or(SmartCardError::BadResponse("command data shorter than Lc"))?;
                    command.data = data.to_vec();
                    match &rest[2 + length..] {
                        [] => {}
                        [hi, lo] => command.ne = extended_ne(u16::from_be_bytes([*hi, *lo])),
                        _ => return Err(SmartCardError::BadResponse("malformed extended Le")),
                    }
                }
            }
            [lc, rest @ ..] => {
                let data = rest
                    .get(..usize::from(*lc))
                    .ok_or(SmartCardError::BadResponse("command data shorter than Lc"))?;
                command.data = data.to_vec();
                match &rest[usize::from(*lc)..] {
                    [] => {}
                    [le] => command.ne = ne_from_le_byte(*le),
                    _ => return Err(SmartCardError::BadResponse("malformed Le")),
                }
            }
        }

        Ok(command)
    }

    /// Serialise into wire form: header, Lc, data, Le.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.data.len() <= 65535);
        debug_assert!(self.ne <= 65536);

        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if self.is_extended() {
            if !self.data.is_empty() {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
            }
            if self.ne > 0 {
                // Without an extended Lc the extended Le carries its own
                // leading zero byte.
                if self.data.is_empty() {
                    out.push(0x00);
                }
                // 65536 encodes as two zero bytes.
                out.extend_from_slice(&((self.ne % 65536) as u16).to_be_bytes());
            }
        } else {
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if self.ne > 0 {
                // 256 encodes as a zero Le byte.
                out.push((self.ne % 256) as u8);
            }
        }

        out
    }
}

/// A decoded status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{_0:04X}")]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord(0x6982);
    pub const AUTH_METHOD_BLOCKED: StatusWord = StatusWord(0x6983);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6a82);
    pub const INCORRECT_PARAMETERS: StatusWord = StatusWord(0x6a86);
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord(0x6d00);

    pub fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn is_success(self) -> bool {
        self == StatusWord::SUCCESS
    }

    /// `61 xx`: more response data is held by the card; issue GET RESPONSE
    /// with the returned Le (zero meaning 256).
    pub fn more_data(self) -> Option<u8> {
        (self.sw1() == 0x61).then(|| self.sw2())
    }

    /// `6C xx`: wrong Le; retry the last command with the returned value.
    pub fn wrong_length(self) -> Option<u8> {
        (self.sw1() == 0x6c).then(|| self.sw2())
    }

    /// `63 Cx`: PIN verification failed with `x` retries remaining.
    pub fn pin_retries(self) -> Option<u8> {
        (self.sw1() == 0x63 && self.sw2() & 0xf0 == 0xc0).then(|| self.sw2() & 0x0f)
    }
}

/// A decoded response APDU: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl ResponseApdu {
    pub fn new(data: impl Into<Vec<u8>>, sw: StatusWord) -> Self {
        ResponseApdu {
            data: data.into(),
            sw,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SmartCardError> {
        if bytes.len() < 2 {
            return Err(SmartCardError::BadResponse("response shorter than a status word"));
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);

        Ok(ResponseApdu {
            data: data.to_vec(),
            sw: StatusWord(u16::from_be_bytes([sw[0], sw[1]])),
        })
    }
}

fn ne_from_le_byte(le: u8) -> u32 {
    if le == 0 {
        256
    } else {
        u32::from(le)
    }
}

fn extended_ne(le: u16) -> u32 {
    if le == 0 {
        65536
    } else {
        u32::from(le)
    }
}

/// Issue `command` and drive `6C xx` / `61 xx` continuation until the card
/// has nothing further to report, concatenating the data parts in order.
pub fn drive_chaining<F>(command: &CommandApdu, mut transmit: F) -> Result<ResponseApdu, SmartCardError>
where
    F: FnMut(&CommandApdu) -> Result<ResponseApdu, SmartCardError>,
{
    let mut response = transmit(command)?;

    // Wrong expected length: a single retry with the corrected Le.
    if let Some(le) = response.sw.wrong_length() {
        let retry = command.clone().with_ne(ne_from_le_byte(le));
        response = transmit(&retry)?;
    }

    let mut data = response.data;
    let mut sw = response.sw;

    while let Some(le) = sw.more_data() {
        if data.len() > MAX_CHAINED_RESPONSE {
            return Err(SmartCardError::ResponseOverflow {
                limit: MAX_CHAINED_RESPONSE,
            });
        }

        let get_response =
            CommandApdu::new(0x00, INS_GET_RESPONSE, 0x00, 0x00).with_ne(ne_from_le_byte(le));
        let next = transmit(&get_response)?;

        data.extend_from_slice(&next.data);
        sw = next.sw;
    }

    if data.len() > MAX_CHAINED_RESPONSE {
        return Err(SmartCardError::ResponseOverflow {
            limit: MAX_CHAINED_RESPONSE,
        });
    }

    Ok(ResponseApdu { data, sw })
}
