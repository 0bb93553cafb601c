use crate::apdu::{CommandApdu, Ins};

const CLA_ISO: u8 = 0x00;

const SELECT_P1_BY_NAME: u8 = 0x04;
const SELECT_P1_BY_FILE_ID: u8 = 0x00;
const SELECT_P2_FIRST: u8 = 0x00;
const SELECT_P2_NO_RESPONSE: u8 = 0x0C;

/// NFC Forum Type 4 tag NDEF application
pub const NDEF_APPLICATION_AID: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
/// Capability container file of a Type 4 tag
pub const CC_FILE_ID: u16 = 0xE103;

/// Selects an application by its AID.
pub fn select_by_name(aid: &[u8]) -> CommandApdu {
    CommandApdu::new(
        CLA_ISO,
        Ins::Select as u8,
        SELECT_P1_BY_NAME,
        SELECT_P2_FIRST,
        aid,
        Some(0x100),
    )
}

/// Selects an elementary file by its identifier.
pub fn select_file(fid: u16) -> CommandApdu {
    CommandApdu::new(
        CLA_ISO,
        Ins::Select as u8,
        SELECT_P1_BY_FILE_ID,
        SELECT_P2_NO_RESPONSE,
        fid.to_be_bytes(),
        None,
    )
}

/// Reads `le` bytes of the selected file starting at `offset`.
pub fn read_binary(offset: u16, le: u8) -> CommandApdu {
    let [p1, p2] = offset.to_be_bytes();
    CommandApdu::new(
        CLA_ISO,
        Ins::ReadBinary as u8,
        p1,
        p2,
        Vec::new(),
        Some(if le == 0 { 0x100 } else { le as u32 }),
    )
}

/// Writes `data` into the selected file starting at `offset`.
pub fn update_binary(offset: u16, data: &[u8]) -> CommandApdu {
    let [p1, p2] = offset.to_be_bytes();
    CommandApdu::new(CLA_ISO, Ins::UpdateBinary as u8, p1, p2, data, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_ndef_application() {
        assert_eq!(
            hex::encode_upper(select_by_name(&NDEF_APPLICATION_AID).to_bytes()),
            "00A4040007D276000085010100"
        );
    }

    #[test]
    fn test_file_commands() {
        assert_eq!(hex::encode_upper(select_file(CC_FILE_ID).to_bytes()), "00A4000C02E103");
        assert_eq!(hex::encode_upper(read_binary(0x0002, 0x0F).to_bytes()), "00B000020F");
        assert_eq!(hex::encode_upper(read_binary(0, 0).to_bytes()), "00B0000000");
        assert_eq!(
            hex::encode_upper(update_binary(0x0100, &[0xAA, 0xBB]).to_bytes()),
            "00D6010002AABB"
        );
    }
}
