//! NDEF messages and the Type 4 tag file layout they are stored in.

use super::{RecordError, Transceive};
use crate::apdu::commands::{
    CC_FILE_ID, NDEF_APPLICATION_AID, read_binary, select_by_name, select_file, update_binary,
};
use crate::apdu::{CommandApdu, ResponseApdu};

type Result<T> = std::result::Result<T, RecordError>;

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

const CC_LEN: usize = 15;
const NDEF_FILE_CONTROL_TAG: u8 = 0x04;
const NDEF_FILE_CONTROL_LEN: u8 = 0x06;
const NLEN_SIZE: usize = 2;
const ACCESS_GRANTED: u8 = 0x00;
const SHORT_CHUNK_MAX: u16 = 0xFF;
// READ/UPDATE BINARY offsets are 15 bits in P1-P2
const MAX_NDEF_FILE_SIZE: u16 = 0x7FFF;

/// Type Name Format of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tnf {
    Empty = 0x00,
    WellKnown = 0x01,
    Media = 0x02,
    AbsoluteUri = 0x03,
    External = 0x04,
    Unknown = 0x05,
    Unchanged = 0x06,
}

impl TryFrom<u8> for Tnf {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Self::Empty,
            0x01 => Self::WellKnown,
            0x02 => Self::Media,
            0x03 => Self::AbsoluteUri,
            0x04 => Self::External,
            0x05 => Self::Unknown,
            0x06 => Self::Unchanged,
            other => {
                return Err(RecordError::MalformedMessage(format!(
                    "reserved TNF {other:#04x}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    pub fn new(tnf: Tnf, record_type: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tnf,
            record_type: record_type.into(),
            id: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NdefMessage {
    records: Vec<NdefRecord>,
}

impl NdefMessage {
    pub fn new(records: Vec<NdefRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[NdefRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decodes a complete NDEF message. An empty buffer is an empty message.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let mut records = Vec::new();

        while !cursor.is_at_end() {
            let header = cursor.byte()?;
            if records.is_empty() && header & FLAG_MB == 0 {
                return Err(malformed("first record lacks the message-begin flag"));
            }
            if header & FLAG_CF != 0 {
                return Err(malformed("chunked records are not supported"));
            }

            let tnf = Tnf::try_from(header & TNF_MASK)?;
            let type_len = cursor.byte()? as usize;
            let payload_len = if header & FLAG_SR != 0 {
                cursor.byte()? as usize
            } else {
                let len = cursor.take(4)?;
                u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize
            };
            let id_len = if header & FLAG_IL != 0 {
                cursor.byte()? as usize
            } else {
                0
            };

            records.push(NdefRecord {
                tnf,
                record_type: cursor.take(type_len)?.to_vec(),
                id: cursor.take(id_len)?.to_vec(),
                payload: cursor.take(payload_len)?.to_vec(),
            });

            if header & FLAG_ME != 0 {
                if !cursor.is_at_end() {
                    return Err(malformed("trailing bytes after message end"));
                }
                break;
            }
            if cursor.is_at_end() {
                return Err(malformed("last record lacks the message-end flag"));
            }
        }

        Ok(Self { records })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let last = self.records.len().saturating_sub(1);

        for (index, record) in self.records.iter().enumerate() {
            if record.record_type.len() > u8::MAX as usize || record.id.len() > u8::MAX as usize {
                return Err(malformed("record type and id are limited to 255 bytes"));
            }
            let short = record.payload.len() <= u8::MAX as usize;

            let mut header = record.tnf as u8;
            if index == 0 {
                header |= FLAG_MB;
            }
            if index == last {
                header |= FLAG_ME;
            }
            if short {
                header |= FLAG_SR;
            }
            if !record.id.is_empty() {
                header |= FLAG_IL;
            }

            bytes.push(header);
            bytes.push(record.record_type.len() as u8);
            if short {
                bytes.push(record.payload.len() as u8);
            } else {
                let len = u32::try_from(record.payload.len())
                    .map_err(|_| malformed("payload exceeds 4 GiB"))?;
                bytes.extend_from_slice(&len.to_be_bytes());
            }
            if !record.id.is_empty() {
                bytes.push(record.id.len() as u8);
            }
            bytes.extend_from_slice(&record.record_type);
            bytes.extend_from_slice(&record.id);
            bytes.extend_from_slice(&record.payload);
        }

        Ok(bytes)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| malformed("record extends past the end of the message"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn malformed(reason: &str) -> RecordError {
    RecordError::MalformedMessage(reason.to_string())
}

/// Capability container of a Type 4 tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityContainer {
    pub mapping_version: u8,
    /// Maximum data size of a single READ BINARY response
    pub max_le: u16,
    /// Maximum data size of a single UPDATE BINARY command
    pub max_lc: u16,
    pub ndef_file_id: u16,
    pub max_ndef_size: u16,
    pub read_access: u8,
    pub write_access: u8,
}

impl CapabilityContainer {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let invalid = |reason: &str| RecordError::MalformedCapabilityContainer(reason.to_string());

        if bytes.len() < CC_LEN {
            return Err(invalid("shorter than 15 bytes"));
        }
        let be = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);

        if (be(0) as usize) < CC_LEN {
            return Err(invalid("CCLEN below 15 bytes"));
        }
        if bytes[7] != NDEF_FILE_CONTROL_TAG || bytes[8] != NDEF_FILE_CONTROL_LEN {
            return Err(invalid("missing NDEF file control TLV"));
        }

        let cc = Self {
            mapping_version: bytes[2],
            max_le: be(3),
            max_lc: be(5),
            ndef_file_id: be(9),
            max_ndef_size: be(11),
            read_access: bytes[13],
            write_access: bytes[14],
        };
        if cc.max_le == 0 || cc.max_lc == 0 {
            return Err(invalid("zero MLe or MLc"));
        }
        if (cc.max_ndef_size as usize) < NLEN_SIZE {
            return Err(invalid("NDEF file cannot hold NLEN"));
        }
        if cc.max_ndef_size > MAX_NDEF_FILE_SIZE {
            return Err(invalid("NDEF file exceeds the short offset range"));
        }
        Ok(cc)
    }

    fn read_chunk(&self) -> usize {
        self.max_le.min(SHORT_CHUNK_MAX) as usize
    }

    fn write_chunk(&self) -> usize {
        self.max_lc.min(SHORT_CHUNK_MAX) as usize
    }

    fn capacity(&self) -> usize {
        self.max_ndef_size as usize - NLEN_SIZE
    }
}

/// Record connection to a Type 4 tag reached through `T`.
#[derive(Debug)]
pub struct NdefConnection<T> {
    transport: T,
    cc: CapabilityContainer,
    message: NdefMessage,
}

impl<T: Transceive> NdefConnection<T> {
    /// Selects the NDEF application, reads the capability container and drains the
    /// current NDEF message.
    pub async fn open(transport: T) -> Result<Self> {
        exchange(&transport, "SELECT NDEF application", select_by_name(&NDEF_APPLICATION_AID))
            .await?;
        exchange(&transport, "SELECT capability container", select_file(CC_FILE_ID)).await?;
        let cc_bytes = exchange(
            &transport,
            "READ capability container",
            read_binary(0, CC_LEN as u8),
        )
        .await?;
        let cc = CapabilityContainer::parse(&cc_bytes)?;
        if cc.read_access != ACCESS_GRANTED {
            return Err(RecordError::Unreadable);
        }

        let mut connection = Self {
            transport,
            cc,
            message: NdefMessage::default(),
        };
        connection.message = connection.read_records().await?;
        Ok(connection)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(transport: T, cc: CapabilityContainer, message: NdefMessage) -> Self {
        Self {
            transport,
            cc,
            message,
        }
    }

    /// The message read when the connection was opened.
    pub fn records(&self) -> &NdefMessage {
        &self.message
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reads the NDEF message currently stored on the tag.
    pub async fn read_records(&self) -> Result<NdefMessage> {
        self.select_ndef_file().await?;

        let nlen = exchange(&self.transport, "READ NLEN", read_binary(0, NLEN_SIZE as u8)).await?;
        if nlen.len() != NLEN_SIZE {
            return Err(RecordError::MalformedMessage(format!(
                "NLEN of {} bytes",
                nlen.len()
            )));
        }
        let nlen = u16::from_be_bytes([nlen[0], nlen[1]]) as usize;
        if nlen > self.cc.capacity() {
            return Err(RecordError::TooLarge {
                size: nlen,
                max: self.cc.capacity(),
            });
        }

        let mut content = Vec::with_capacity(nlen);
        while content.len() < nlen {
            let offset = (NLEN_SIZE + content.len()) as u16;
            let le = self.cc.read_chunk().min(nlen - content.len());
            let chunk = exchange(&self.transport, "READ BINARY", read_binary(offset, le as u8)).await?;
            if chunk.is_empty() {
                return Err(malformed("tag returned no data before NLEN was reached"));
            }
            content.extend_from_slice(&chunk);
        }
        content.truncate(nlen);

        NdefMessage::parse(&content)
    }

    /// Replaces the NDEF message stored on the tag.
    pub async fn write_records(&self, message: &NdefMessage) -> Result<()> {
        if self.cc.write_access != ACCESS_GRANTED {
            return Err(RecordError::ReadOnly);
        }
        let bytes = message.to_bytes()?;
        if bytes.len() > self.cc.capacity() {
            return Err(RecordError::TooLarge {
                size: bytes.len(),
                max: self.cc.capacity(),
            });
        }

        self.select_ndef_file().await?;
        // NLEN stays zero while the body is incomplete
        exchange(&self.transport, "UPDATE NLEN", update_binary(0, &[0x00, 0x00])).await?;
        let chunk_size = self.cc.write_chunk();
        for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
            let offset = (NLEN_SIZE + index * chunk_size) as u16;
            exchange(&self.transport, "UPDATE BINARY", update_binary(offset, chunk)).await?;
        }
        exchange(
            &self.transport,
            "UPDATE NLEN",
            update_binary(0, &(bytes.len() as u16).to_be_bytes()),
        )
        .await?;
        Ok(())
    }

    async fn select_ndef_file(&self) -> Result<()> {
        exchange(&self.transport, "SELECT NDEF file", select_file(self.cc.ndef_file_id)).await?;
        Ok(())
    }
}

async fn exchange<T: Transceive + ?Sized>(
    transport: &T,
    command: &'static str,
    apdu: CommandApdu,
) -> Result<Vec<u8>> {
    let response = ResponseApdu::parse(&transport.transceive(&apdu.to_bytes()).await?)?;
    if !response.is_success() {
        return Err(RecordError::Status {
            command,
            status: response.status,
        });
    }
    Ok(response.data)
}
