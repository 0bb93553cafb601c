pub mod commands;

use std::fmt;

type Result<T> = std::result::Result<T, ApduError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short: {0} bytes, minimum 4 bytes required")]
    TooShort(usize),

    #[error("APDU length mismatch: header announces {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Extended APDU announces an empty body")]
    EmptyExtendedBody,

    #[error("Short APDU announces an empty body")]
    EmptyShortBody,

    #[error("Response APDU too short to contain a status word: {0} bytes")]
    MissingStatusWord(usize),
}

/// ISO7816 instructions used by the emulated tag and the record layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ins {
    Unknown = 0x00,
    Select = 0xA4,
    ReadBinary = 0xB0,
    UpdateBinary = 0xD6,
}

impl From<u8> for Ins {
    fn from(value: u8) -> Self {
        match value {
            0xA4 => Self::Select,
            0xB0 => Self::ReadBinary,
            0xD6 => Self::UpdateBinary,
            _ => Self::Unknown,
        }
    }
}

/// ISO7816 status words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const FUNC_NOT_SUPPORTED: StatusWord = StatusWord(0x6A81);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6E00);

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Builds a full response APDU: `data || SW1 SW2`.
    pub fn with_data(self, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(data.len() + 2);
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&self.to_bytes());
        bytes
    }
}

impl From<StatusWord> for Vec<u8> {
    fn from(sw: StatusWord) -> Self {
        sw.to_bytes().to_vec()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Command APDU as received from the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u32>,
}

impl CommandApdu {
    const SHORT_MAX_LC: usize = 0xFF;
    const SHORT_MAX_LE: u32 = 0x0100;
    const EXTENDED_MAX_LE: u32 = 0x010000;

    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>, le: Option<u32>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: data.into(),
            le,
        }
    }

    /// Decodes a command APDU in any of the ISO 7816-4 cases (short and extended).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(ApduError::TooShort(bytes.len()));
        }

        let (header, body) = bytes.split_at(4);
        let mut apdu = Self::new(header[0], header[1], header[2], header[3], Vec::new(), None);

        match body {
            // Case 1
            [] => {}
            // Case 2S
            [le] => apdu.le = Some(short_le(*le)),
            // Extended cases start with a zero byte followed by two length bytes
            [0x00, rest @ ..] if rest.len() >= 2 => {
                let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let rest = &rest[2..];
                if rest.is_empty() {
                    // Case 2E
                    apdu.le = Some(extended_le(len));
                } else {
                    if len == 0 {
                        return Err(ApduError::EmptyExtendedBody);
                    }
                    match rest.len() {
                        // Case 3E
                        n if n == len => apdu.data = rest.to_vec(),
                        // Case 4E
                        n if n == len + 2 => {
                            apdu.data = rest[..len].to_vec();
                            let le = u16::from_be_bytes([rest[len], rest[len + 1]]) as usize;
                            apdu.le = Some(extended_le(le));
                        }
                        n => {
                            return Err(ApduError::LengthMismatch {
                                expected: len,
                                actual: n,
                            });
                        }
                    }
                }
            }
            [0x00, _] => return Err(ApduError::EmptyShortBody),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                match rest.len() {
                    // Case 3S
                    n if n == lc => apdu.data = rest.to_vec(),
                    // Case 4S
                    n if n == lc + 1 => {
                        apdu.data = rest[..lc].to_vec();
                        apdu.le = Some(short_le(rest[lc]));
                    }
                    n => {
                        return Err(ApduError::LengthMismatch {
                            expected: lc,
                            actual: n,
                        });
                    }
                }
            }
        }

        Ok(apdu)
    }

    pub fn instruction(&self) -> Ins {
        self.ins.into()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.cla, self.ins, self.p1, self.p2];
        let extended = self.data.len() > Self::SHORT_MAX_LC
            || self.le.is_some_and(|le| le > Self::SHORT_MAX_LE);

        if !self.data.is_empty() {
            if extended {
                bytes.push(0x00);
                bytes.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                bytes.push(self.data.len() as u8);
            }
            bytes.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            if extended {
                if self.data.is_empty() {
                    bytes.push(0x00);
                }
                let le = if le >= Self::EXTENDED_MAX_LE { 0 } else { le as u16 };
                bytes.extend_from_slice(&le.to_be_bytes());
            } else {
                bytes.push(if le >= Self::SHORT_MAX_LE { 0x00 } else { le as u8 });
            }
        }
        bytes
    }
}

fn short_le(le: u8) -> u32 {
    if le == 0 { 0x100 } else { le as u32 }
}

fn extended_le(le: usize) -> u32 {
    if le == 0 { 0x10000 } else { le as u32 }
}

/// Response APDU split into its data field and trailing status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ResponseApdu {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(ApduError::MissingStatusWord(bytes.len()));
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            status: StatusWord(u16::from_be_bytes([sw[0], sw[1]])),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
