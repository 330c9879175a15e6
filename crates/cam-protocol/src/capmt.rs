//! CAPMT (CA Program Map Table) framing
//!
//! The CAM receives the PMT section as delivered by the demux, with the
//! list-management tag layered in front and the command ID appended.
//!
//! # Frame Format
//! ```text
//! [list_management:1] [PMT section incl. 3-byte header] [ca_pmt_cmd_id:1]
//! ```
//!
//! The list-management tag tells the CAM how this program fits into the set
//! it is descrambling. A changed program set must be bracketed FIRST, MORE...,
//! LAST (or a lone ONLY); ADD and UPDATE touch a single program.

use std::fmt;

use tracing::warn;

use crate::error::ParseError;
use crate::pmt::{PmtSection, PMT_HEADER_LEN};
use crate::{EncodeMessage, ProtocolCodec};

/// CAPMT list management values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ListManagement {
    /// Neither first nor last of a batch
    More = 0x00,
    /// First of a batch
    First = 0x01,
    /// Last of a batch
    Last = 0x02,
    /// The only program of the batch
    Only = 0x03,
    /// Add one program to the existing set
    Add = 0x04,
    /// Replace the PMT of a program already in the set
    Update = 0x05,
}

impl ListManagement {
    /// Lowercase name used in log output
    pub fn name(&self) -> &'static str {
        match self {
            Self::More => "more",
            Self::First => "first",
            Self::Last => "last",
            Self::Only => "only",
            Self::Add => "add",
            Self::Update => "update",
        }
    }
}

impl TryFrom<u8> for ListManagement {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::More),
            0x01 => Ok(Self::First),
            0x02 => Ok(Self::Last),
            0x03 => Ok(Self::Only),
            0x04 => Ok(Self::Add),
            0x05 => Ok(Self::Update),
            other => Err(ParseError::UnknownListManagement(other)),
        }
    }
}

impl fmt::Display for ListManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CAPMT command IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CapmtCommand {
    /// Start descrambling
    OkDescrambling = 0x01,
    /// CAM may open an MMI dialogue first
    OkMmi = 0x02,
    /// Ask whether descrambling is possible
    Query = 0x03,
    /// Stop descrambling this program
    NotSelected = 0x04,
}

impl TryFrom<u8> for CapmtCommand {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::OkDescrambling),
            0x02 => Ok(Self::OkMmi),
            0x03 => Ok(Self::Query),
            0x04 => Ok(Self::NotSelected),
            other => Err(ParseError::UnknownCommand(other)),
        }
    }
}

/// A CAPMT message ready for a CAM slot
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capmt {
    /// Position of this program in the batch
    pub list_management: ListManagement,
    /// What the CAM should do with it
    pub command: CapmtCommand,
    /// The PMT section, header included
    pub pmt: PmtSection,
}

impl Capmt {
    /// Create a CAPMT for the given section
    pub fn new(list_management: ListManagement, command: CapmtCommand, pmt: PmtSection) -> Self {
        Self {
            list_management,
            command,
            pmt,
        }
    }

    /// Decode a frame produced by [`EncodeMessage::encode`]
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let min = 1 + PMT_HEADER_LEN + 1;
        if data.len() < min {
            return Err(ParseError::Incomplete {
                needed: min - data.len(),
            });
        }

        let list_management = ListManagement::try_from(data[0])?;
        let command = CapmtCommand::try_from(data[data.len() - 1])?;
        let pmt = PmtSection::new(data[1..data.len() - 1].to_vec())?;

        if pmt.section_length() != pmt.payload().len() {
            return Err(ParseError::InvalidFrame(format!(
                "section_length {} does not match payload of {} bytes",
                pmt.section_length(),
                pmt.payload().len()
            )));
        }

        Ok(Self {
            list_management,
            command,
            pmt,
        })
    }
}

impl EncodeMessage for Capmt {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pmt.len() + 2);
        out.push(self.list_management as u8);
        out.extend_from_slice(self.pmt.as_bytes());
        out.push(self.command as u8);
        out
    }
}

/// Longest CAPMT frame: tag, 3-byte header, 12-bit section, command
const MAX_CAPMT_LEN: usize = 1 + PMT_HEADER_LEN + 0x0FFF + 1;

/// Streaming splitter for CAPMT frames written back to back to a CA device
///
/// Frames are delimited by the `section_length` of the embedded PMT header.
pub struct CapmtCodec {
    buffer: Vec<u8>,
}

impl CapmtCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
        }
    }

    fn frame_len(&self) -> Option<usize> {
        if self.buffer.len() < 1 + PMT_HEADER_LEN {
            return None;
        }
        let section_length = (((self.buffer[2] & 0x0F) as usize) << 8) | self.buffer[3] as usize;
        Some(1 + PMT_HEADER_LEN + section_length + 1)
    }
}

impl Default for CapmtCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCodec for CapmtCodec {
    type Message = Capmt;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_CAPMT_LEN * 2 {
            warn!(
                "CAPMT buffer overflow ({} bytes), discarding",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    fn next_message(&mut self) -> Option<Self::Message> {
        loop {
            let len = self.frame_len()?;
            if self.buffer.len() < len {
                return None;
            }
            let frame: Vec<u8> = self.buffer.drain(..len).collect();
            match Capmt::decode(&frame) {
                Ok(capmt) => return Some(capmt),
                Err(e) => warn!("Dropping malformed CAPMT: {}", e),
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}
