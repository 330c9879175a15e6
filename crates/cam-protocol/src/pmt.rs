//! Program Map Table sections
//!
//! A [`PmtSection`] owns the complete section as received from the demux,
//! including the 3-byte table header (`table_id`, `section_syntax_indicator`
//! and `section_length`). The CAPMT codec forwards the whole frame to the CAM
//! verbatim, while the payload view is used to pull out CA descriptors.
//!
//! # Section Layout
//! ```text
//! [table_id] [flags|len_hi] [len_lo]            <- 3-byte header
//! [program_number:2] [version:1] [sec:1] [last:1]
//! [pcr_pid:2] [program_info_length:2] [descriptors...]
//! { [stream_type:1] [pid:2] [es_info_length:2] [descriptors...] }*
//! [crc32:4]
//! ```

use crate::cursor::Cursor;
use crate::error::{ParseError, ProtocolError};

/// Length of the table header that precedes the section payload
pub const PMT_HEADER_LEN: usize = 3;
/// Table ID of a program map section
pub const PMT_TABLE_ID: u8 = 0x02;
/// Descriptor tag of a conditional access descriptor
pub const CA_DESCRIPTOR_TAG: u8 = 0x09;

/// Largest `section_length` a PMT may declare
pub const MAX_SECTION_LENGTH: usize = 1021;

const CRC_LEN: usize = 4;
/// Fixed fields between the header and the program info descriptors
const FIXED_FIELDS_LEN: usize = 9;

/// An owned PMT section (header + payload)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "Vec<u8>", into = "Vec<u8>")
)]
pub struct PmtSection {
    frame: Vec<u8>,
}

impl PmtSection {
    /// Wrap a complete section, header included
    pub fn new(frame: Vec<u8>) -> Result<Self, ParseError> {
        if frame.len() < PMT_HEADER_LEN {
            return Err(ParseError::Incomplete {
                needed: PMT_HEADER_LEN - frame.len(),
            });
        }
        Ok(Self { frame })
    }

    /// Build a section from its header and payload
    pub fn from_parts(header: [u8; PMT_HEADER_LEN], payload: &[u8]) -> Self {
        let mut frame = Vec::with_capacity(PMT_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        Self { frame }
    }

    /// The complete frame as sent to the CAM
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Total frame length including the header
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Always false; a section holds at least its header
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// The 3-byte table header
    pub fn header(&self) -> &[u8] {
        &self.frame[..PMT_HEADER_LEN]
    }

    /// Everything after the table header
    pub fn payload(&self) -> &[u8] {
        &self.frame[PMT_HEADER_LEN..]
    }

    /// Table ID (0x02 for a PMT)
    pub fn table_id(&self) -> u8 {
        self.frame[0]
    }

    /// The 12-bit `section_length` declared in the header
    pub fn section_length(&self) -> usize {
        (((self.frame[1] & 0x0F) as usize) << 8) | self.frame[2] as usize
    }

    /// Program number, if the payload is long enough to carry it
    pub fn program_number(&self) -> Option<u16> {
        let p = self.payload();
        (p.len() >= 2).then(|| u16::from_be_bytes([p[0], p[1]]))
    }

    /// 5-bit version number, if present
    pub fn version(&self) -> Option<u8> {
        self.payload().get(2).map(|b| (b >> 1) & 0x1F)
    }

    /// Parse the program and elementary stream loops for CA descriptors
    pub fn ca_descriptors(&self) -> Result<PmtCaInfo, ParseError> {
        let payload = self.payload();
        let declared = self.section_length().min(payload.len());
        if declared < FIXED_FIELDS_LEN + CRC_LEN {
            return Err(ParseError::InvalidFrame(format!(
                "PMT section too short: {} bytes",
                declared
            )));
        }

        let mut cur = Cursor::new(&payload[..declared - CRC_LEN]);
        let program_number = cur.read_u16()?;
        cur.skip(3)?;
        let pcr_pid = cur.read_u16()? & 0x1FFF;
        let program_info_len = (cur.read_u16()? & 0x0FFF) as usize;
        let program_caids = parse_ca_loop(cur.sub(program_info_len)?)?;

        let mut streams = Vec::new();
        while !cur.is_empty() {
            let stream_type = cur.read_u8()?;
            let pid = cur.read_u16()? & 0x1FFF;
            let es_info_len = (cur.read_u16()? & 0x0FFF) as usize;
            let ca = parse_ca_loop(cur.sub(es_info_len)?)?;
            streams.push(PmtStream {
                stream_type,
                pid,
                ca,
            });
        }

        Ok(PmtCaInfo {
            program_number,
            pcr_pid,
            program_ca: program_caids,
            streams,
        })
    }
}

impl AsRef<[u8]> for PmtSection {
    fn as_ref(&self) -> &[u8] {
        &self.frame
    }
}

/// A single CA descriptor (tag 0x09)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaDescriptor {
    /// Conditional Access system ID
    pub caid: u16,
    /// PID carrying ECMs for this system
    pub ca_pid: u16,
}

/// An elementary stream entry from the PMT
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PmtStream {
    /// MPEG stream type
    pub stream_type: u8,
    /// Elementary PID
    pub pid: u16,
    /// CA descriptors in the ES info loop
    pub ca: Vec<CaDescriptor>,
}

/// CA-relevant content of a PMT section
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PmtCaInfo {
    /// Program number
    pub program_number: u16,
    /// PCR PID
    pub pcr_pid: u16,
    /// CA descriptors from the program info loop (apply to every stream)
    pub program_ca: Vec<CaDescriptor>,
    /// Elementary streams in section order
    pub streams: Vec<PmtStream>,
}

impl PmtCaInfo {
    /// CAIDs of a stream, program-level ones first, without duplicates
    pub fn stream_caids(&self, stream: &PmtStream) -> Vec<u16> {
        let mut caids: Vec<u16> = Vec::new();
        for d in self.program_ca.iter().chain(stream.ca.iter()) {
            if !caids.contains(&d.caid) {
                caids.push(d.caid);
            }
        }
        caids
    }
}

impl TryFrom<Vec<u8>> for PmtSection {
    type Error = ParseError;

    fn try_from(frame: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(frame)
    }
}

impl From<PmtSection> for Vec<u8> {
    fn from(section: PmtSection) -> Self {
        section.frame
    }
}

fn parse_ca_loop(mut cur: Cursor<'_>) -> Result<Vec<CaDescriptor>, ParseError> {
    let mut out = Vec::new();
    while !cur.is_empty() {
        let tag = cur.read_u8()?;
        let len = cur.read_u8()? as usize;
        let mut body = cur.sub(len)?;
        if tag == CA_DESCRIPTOR_TAG && len >= 4 {
            let caid = body.read_u16()?;
            let ca_pid = body.read_u16()? & 0x1FFF;
            out.push(CaDescriptor { caid, ca_pid });
        }
    }
    Ok(out)
}

/// Build a minimal PMT section carrying the given streams
///
/// Each stream is `(stream_type, pid, caids)`. The CRC is zero-filled; CAMs
/// driven through this crate receive whatever the demux delivered, so this is
/// only used by simulators and tests. Fails with [`ProtocolError::Oversized`]
/// when the streams do not fit in [`MAX_SECTION_LENGTH`].
pub fn build_pmt_section(
    program_number: u16,
    streams: &[(u8, u16, &[u16])],
) -> Result<PmtSection, ProtocolError> {
    let mut body = Vec::new();
    body.extend_from_slice(&program_number.to_be_bytes());
    body.push(0xC1); // version 0, current_next
    body.push(0x00);
    body.push(0x00);
    let pcr_pid = streams.first().map(|s| s.1).unwrap_or(0x1FFF);
    body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    body.extend_from_slice(&0xF000u16.to_be_bytes());

    for (stream_type, pid, caids) in streams {
        let es_info_len = caids.len() * 6;
        if body.len() + 5 + es_info_len + CRC_LEN > MAX_SECTION_LENGTH {
            return Err(ProtocolError::Oversized(body.len() + 5 + es_info_len + CRC_LEN));
        }
        body.push(*stream_type);
        body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        body.extend_from_slice(&(0xF000 | es_info_len as u16).to_be_bytes());
        for (i, caid) in caids.iter().enumerate() {
            body.push(CA_DESCRIPTOR_TAG);
            body.push(4);
            body.extend_from_slice(&caid.to_be_bytes());
            body.extend_from_slice(&(0xE000 | (0x0100 + i as u16)).to_be_bytes());
        }
    }
    body.extend_from_slice(&[0; CRC_LEN]);

    let len = body.len();
    let header = [PMT_TABLE_ID, 0xB0 | (len >> 8) as u8, len as u8];
    Ok(PmtSection::from_parts(header, &body))
}
