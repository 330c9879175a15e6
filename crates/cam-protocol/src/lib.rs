//! CAM Protocol Library
//!
//! This crate provides parsing and encoding for the messages a DVB host
//! exchanges with a Conditional Access Module:
//!
//! - **CAPMT**: the PMT section forwarded to a CAM slot with a list-management
//!   tag in front and a command ID behind
//! - **PMT**: an owned section buffer with a payload view and CA descriptor
//!   extraction, used to find which CAIDs a service needs
//! - **CI+ Content Control**: APDUs of the CC resource (`CC_OPEN_REQ/CNF`,
//!   `CC_DATA_REQ/CNF`) with their ASN.1 length field
//!
//! # Example
//!
//! ```rust
//! use cam_protocol::capmt::{Capmt, CapmtCommand, ListManagement};
//! use cam_protocol::pmt::build_pmt_section;
//! use cam_protocol::EncodeMessage;
//!
//! let pmt = build_pmt_section(0x0101, &[(0x02, 0x0100, &[0x0100])]).unwrap();
//! let capmt = Capmt::new(ListManagement::Only, CapmtCommand::OkDescrambling, pmt);
//!
//! let bytes = capmt.encode();
//! assert_eq!(bytes[0], ListManagement::Only as u8);
//! assert_eq!(*bytes.last().unwrap(), CapmtCommand::OkDescrambling as u8);
//! ```

pub mod capmt;
pub mod ciplus;
pub mod cursor;
pub mod error;
pub mod pmt;

pub use capmt::{Capmt, CapmtCodec, CapmtCommand, ListManagement};
pub use ciplus::{CcApdu, CcCodec, CcDataReq, CcMessage, HandshakeContext};
pub use error::{ParseError, ProtocolError};
pub use pmt::{CaDescriptor, PmtCaInfo, PmtSection};

/// Conditional Access system identifier
pub type Caid = u16;

/// Trait for codecs that split an incoming byte stream into messages
pub trait ProtocolCodec {
    /// The message type produced by this codec
    type Message;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete message from the buffer
    fn next_message(&mut self) -> Option<Self::Message>;

    /// Clear the internal buffer
    fn clear(&mut self);
}

/// Trait for messages that can be encoded to bytes
pub trait EncodeMessage {
    /// Encode this message to its wire format
    fn encode(&self) -> Vec<u8>;
}
