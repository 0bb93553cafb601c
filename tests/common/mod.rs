#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use hce_core::{
    apdu::{CommandApdu, Ins, StatusWord, commands::{CC_FILE_ID, NDEF_APPLICATION_AID, select_by_name}},
    config::Config,
    connection::CoordinatorStats,
    service::{EmulationRuntime, HceService},
};
use tokio::runtime::Handle;
use tokio::sync::watch;

pub const AID: &str = "F0010203040506";
pub const NDEF_FILE_ID: u16 = 0xE104;
pub const URI_RECORD: &[u8] = b"\xd1\x01\x0b\x55opensk.dev/";

const CONNECT: [u8; 4] = [0x80, 0x10, 0x00, 0x00];
const DISCONNECT: [u8; 4] = [0x80, 0x14, 0x00, 0x00];
const MAX_POLLS: usize = 10_000;

pub fn start_runtime(aid: &str) -> EmulationRuntime {
    let mut env_vars = HashMap::new();
    env_vars.insert("emulation.aid".to_string(), aid.to_string());
    let config = Config::load_with_sources(Some(env_vars)).unwrap();
    EmulationRuntime::start(&config, Handle::current())
}

/// Selects the application and opens a reverse connection.
pub fn connect(service: &mut HceService) {
    let select = select_by_name(&hex::decode(AID).unwrap()).to_bytes();
    assert_eq!(service.process_command_apdu(&select), vec![0x90, 0x00]);
    assert_eq!(service.process_command_apdu(&CONNECT), vec![0x90, 0x00]);
}

pub async fn wait_for_stats(
    stats: &mut watch::Receiver<CoordinatorStats>,
    condition: impl FnMut(&CoordinatorStats) -> bool,
) -> CoordinatorStats {
    *tokio::time::timeout(Duration::from_secs(5), stats.wait_for(condition))
        .await
        .expect("coordinator did not settle in time")
        .unwrap()
}

/// In-memory Type 4 tag standing behind the reader.
pub struct Type4Tag {
    formatted: bool,
    app_selected: bool,
    selected: Option<u16>,
    cc: Vec<u8>,
    ndef: Vec<u8>,
}

impl Type4Tag {
    pub fn new(message: &[u8]) -> Self {
        let mut cc = hex::decode("000F20003B0034").unwrap();
        cc.extend([0x04, 0x06, 0xE1, 0x04, 0x08, 0x00, 0x00, 0x00]);
        let mut ndef = (message.len() as u16).to_be_bytes().to_vec();
        ndef.extend_from_slice(message);
        Self {
            formatted: true,
            app_selected: false,
            selected: None,
            cc,
            ndef,
        }
    }

    /// A tag without the NDEF application.
    pub fn unformatted() -> Self {
        Self {
            formatted: false,
            ..Self::new(&[])
        }
    }

    /// Current NDEF message, without its length prefix.
    pub fn message(&self) -> &[u8] {
        let len = u16::from_be_bytes([self.ndef[0], self.ndef[1]]) as usize;
        &self.ndef[2..2 + len]
    }

    pub fn respond(&mut self, command: &[u8]) -> Vec<u8> {
        let Ok(command) = CommandApdu::parse(command) else {
            return StatusWord::WRONG_LENGTH.into();
        };
        let offset = u16::from_be_bytes([command.p1, command.p2]) as usize;

        match (command.instruction(), command.p1) {
            (Ins::Select, 0x04) if self.formatted && command.data == NDEF_APPLICATION_AID => {
                self.app_selected = true;
                StatusWord::SUCCESS.into()
            }
            (Ins::Select, 0x00) if self.app_selected && command.data.len() == 2 => {
                let fid = u16::from_be_bytes([command.data[0], command.data[1]]);
                if fid == CC_FILE_ID || fid == NDEF_FILE_ID {
                    self.selected = Some(fid);
                    StatusWord::SUCCESS.into()
                } else {
                    StatusWord::FILE_NOT_FOUND.into()
                }
            }
            (Ins::Select, _) => StatusWord::FILE_NOT_FOUND.into(),
            (Ins::ReadBinary, _) => {
                let file = match self.selected {
                    Some(CC_FILE_ID) => &self.cc,
                    Some(_) => &self.ndef,
                    None => return StatusWord::CONDITIONS_NOT_SATISFIED.into(),
                };
                let le = command.le.unwrap_or(0x100) as usize;
                let end = (offset + le).min(file.len());
                StatusWord::SUCCESS.with_data(&file[offset.min(end)..end])
            }
            (Ins::UpdateBinary, _) if self.selected == Some(NDEF_FILE_ID) => {
                let end = offset + command.data.len();
                if self.ndef.len() < end {
                    self.ndef.resize(end, 0);
                }
                self.ndef[offset..end].copy_from_slice(&command.data);
                StatusWord::SUCCESS.into()
            }
            _ => StatusWord::INS_NOT_SUPPORTED.into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DriveEnd {
    Done,
    /// The channel asked to close and the reader acknowledged.
    Closed,
    /// The service answered with something other than a poll result.
    Stopped(Vec<u8>),
}

/// Plays the reader: polls `service` and answers queued commands from `tag`
/// until `done` holds or the connection ends.
pub async fn drive(
    service: &mut HceService,
    tag: &mut Type4Tag,
    mut done: impl FnMut() -> bool,
) -> DriveEnd {
    let mut response = Vec::new();
    for _ in 0..MAX_POLLS {
        if done() {
            return DriveEnd::Done;
        }

        let poll = CommandApdu::new(0x80, 0x12, 0x00, 0x00, std::mem::take(&mut response), None);
        let reply = service.process_command_apdu(&poll.to_bytes());
        match reply.as_slice() {
            [command @ .., 0x90, 0x00] if !command.is_empty() => response = tag.respond(command),
            [0x91, 0x00] => tokio::time::sleep(Duration::from_millis(2)).await,
            [0x91, 0x01] => {
                assert_eq!(service.process_command_apdu(&DISCONNECT), vec![0x90, 0x00]);
                return DriveEnd::Closed;
            }
            _ => return DriveEnd::Stopped(reply),
        }
    }
    panic!("reader polled {MAX_POLLS} times without finishing");
}
