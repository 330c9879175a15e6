//! CI+ Content Control (CC) handshake messages
//!
//! The CC resource pairs a host with a CI+ CAM. Messages are APDUs with a
//! 3-byte tag and an ASN.1 length (EN 50221 section 7).
//!
//! # APDU Format
//! ```text
//! [tag:3] [length:1..3] [body...]
//! ```
//!
//! # CC_DATA_REQ / CC_DATA_CNF body
//! ```text
//! [cc_system_id_bitmask:1]
//! [send_datatype_nbr:1] { [datatype_id:1] [datatype_length:2] [data...] }*
//! [request_datatype_nbr:1] { [datatype_id:1] }*      <- CC_DATA_REQ only
//! ```
//!
//! Example CC_DATA_REQ carrying a nonce and asking for four datatypes:
//! ```text
//! 9F 90 03 2A 01 01 13 00 20 [32 nonce bytes] 04 0D 11 0F 07
//! ```

use tracing::{debug, trace, warn};

use crate::cursor::Cursor;
use crate::error::{ParseError, ProtocolError};

/// CC_OPEN_REQ tag (CAM -> host)
pub const TAG_CC_OPEN_REQ: u32 = 0x9F9001;
/// CC_OPEN_CNF tag (host -> CAM)
pub const TAG_CC_OPEN_CNF: u32 = 0x9F9002;
/// CC_DATA_REQ tag (CAM -> host)
pub const TAG_CC_DATA_REQ: u32 = 0x9F9003;
/// CC_DATA_CNF tag (host -> CAM)
pub const TAG_CC_DATA_CNF: u32 = 0x9F9004;

/// Datatype: host brand certificate
pub const DATATYPE_HOST_BRANDCERT: u8 = 0x07;
/// Datatype: Diffie-Hellman public key of the host
pub const DATATYPE_DHPH: u8 = 0x0D;
/// Datatype: host device certificate
pub const DATATYPE_HOST_DEVCERT: u8 = 0x0F;
/// Datatype: signature over the nonce
pub const DATATYPE_NONCE_SIGNATURE_A: u8 = 0x11;
/// Datatype: authentication nonce
pub const DATATYPE_NONCE: u8 = 0x13;

/// Size of the authentication nonce
pub const NONCE_LEN: usize = 32;

/// CC_OPEN_CNF status byte meaning "OK"
const CC_OPEN_STATUS_OK: u8 = 0x01;

/// Fixed CC_OPEN_CNF reply: tag, length 1, status OK
pub const CC_OPEN_CNF: [u8; 5] = [0x9F, 0x90, 0x02, 0x01, CC_OPEN_STATUS_OK];

/// Upper bound on a buffered APDU before the stream codec resynchronises
const MAX_APDU_LEN: usize = 0x1_0000 + 7;

/// Build the CC_OPEN_CNF response
pub fn build_cc_open_cnf() -> [u8; 5] {
    CC_OPEN_CNF
}

/// Decode an ASN.1 length field
///
/// - high bit clear: the byte itself is the length
/// - `0x81`: length is the next byte
/// - `0x82`: length is the next two bytes, big-endian
pub fn decode_length(cur: &mut Cursor<'_>) -> Result<usize, ParseError> {
    let first = cur.read_u8()?;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    match first & 0x7F {
        1 => Ok(cur.read_u8()? as usize),
        2 => Ok(cur.read_u16()? as usize),
        _ => Err(ParseError::InvalidLength(first)),
    }
}

/// Encode a length in the shortest ASN.1 form
pub fn encode_length(len: usize) -> Result<Vec<u8>, ProtocolError> {
    match len {
        0..=0x7F => Ok(vec![len as u8]),
        0x80..=0xFF => Ok(vec![0x81, len as u8]),
        0x100..=0xFFFF => Ok(vec![0x82, (len >> 8) as u8, len as u8]),
        _ => Err(ProtocolError::Oversized(len)),
    }
}

/// A CC datatype with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DatatypeEntry {
    /// Datatype ID
    pub id: u8,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl DatatypeEntry {
    /// Create an entry
    pub fn new(id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::Oversized(self.payload.len()))?;
        out.push(self.id);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Encode a `send_datatype_nbr` loop
fn write_send_datatypes(out: &mut Vec<u8>, entries: &[DatatypeEntry]) -> Result<(), ProtocolError> {
    let count = u8::try_from(entries.len()).map_err(|_| ProtocolError::Oversized(entries.len()))?;
    out.push(count);
    for entry in entries {
        entry.write(out)?;
    }
    Ok(())
}

/// Parsed CC_DATA_REQ
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CcDataReq {
    /// CC system versions supported by the CAM
    pub system_id_bitmask: u8,
    /// Datatypes the CAM sent
    pub send: Vec<DatatypeEntry>,
    /// Datatype IDs the CAM wants back
    pub requested: Vec<u8>,
}

impl CcDataReq {
    /// The nonce payload, if the CAM sent one
    pub fn nonce(&self) -> Option<&[u8]> {
        self.send
            .iter()
            .find(|e| e.id == DATATYPE_NONCE)
            .map(|e| e.payload.as_slice())
    }

    fn parse_body(mut cur: Cursor<'_>) -> Result<Self, ParseError> {
        let system_id_bitmask = cur.read_u8()?;
        let send = parse_send_datatypes(&mut cur)?;

        let request_nbr = cur.read_u8()?;
        let mut requested = Vec::with_capacity(request_nbr as usize);
        for _ in 0..request_nbr {
            let id = cur.read_u8()?;
            trace!("request datatype_id {:02x}", id);
            requested.push(id);
        }

        Ok(Self {
            system_id_bitmask,
            send,
            requested,
        })
    }

    /// Encode as a complete APDU (used by simulated CAMs)
    pub fn to_apdu(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = vec![self.system_id_bitmask];
        write_send_datatypes(&mut body, &self.send)?;
        let request_nbr = u8::try_from(self.requested.len())
            .map_err(|_| ProtocolError::Oversized(self.requested.len()))?;
        body.push(request_nbr);
        body.extend_from_slice(&self.requested);
        CcApdu::new(TAG_CC_DATA_REQ, body).try_encode()
    }
}

/// Parsed CC_DATA_CNF
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CcDataCnf {
    /// CC system version chosen by the host
    pub system_id_bitmask: u8,
    /// Datatypes returned to the CAM
    pub send: Vec<DatatypeEntry>,
}

impl CcDataCnf {
    fn parse_body(mut cur: Cursor<'_>) -> Result<Self, ParseError> {
        let system_id_bitmask = cur.read_u8()?;
        let send = parse_send_datatypes(&mut cur)?;
        Ok(Self {
            system_id_bitmask,
            send,
        })
    }
}

fn parse_send_datatypes(cur: &mut Cursor<'_>) -> Result<Vec<DatatypeEntry>, ParseError> {
    let send_nbr = cur.read_u8()?;
    let mut send = Vec::with_capacity(send_nbr as usize);
    for _ in 0..send_nbr {
        let id = cur.read_u8()?;
        let len = cur.read_u16()? as usize;
        let payload = cur.read_bytes(len)?;
        trace!("send datatype_id {:02x} len {}", id, len);
        send.push(DatatypeEntry::new(id, payload));
    }
    Ok(send)
}

/// Parse a complete CC_DATA_REQ message
///
/// The body is bounded by the declared length, so trailing bytes belong to the
/// next APDU and a short buffer fails with [`ParseError::Incomplete`].
pub fn parse_cc_data_req(data: &[u8]) -> Result<CcDataReq, ParseError> {
    let apdu = CcApdu::parse(data)?.0;
    if apdu.tag != TAG_CC_DATA_REQ {
        return Err(ParseError::InvalidTag {
            expected: TAG_CC_DATA_REQ,
            actual: apdu.tag,
        });
    }
    CcDataReq::parse_body(Cursor::new(&apdu.body))
}

/// Build a CC_DATA_CNF carrying the given datatypes
pub fn build_cc_data_cnf(
    system_id_bitmask: u8,
    entries: &[DatatypeEntry],
) -> Result<Vec<u8>, ProtocolError> {
    let mut body = vec![system_id_bitmask];
    write_send_datatypes(&mut body, entries)?;
    CcApdu::new(TAG_CC_DATA_CNF, body).try_encode()
}

/// A raw CC APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcApdu {
    /// 24-bit tag
    pub tag: u32,
    /// Body after the length field
    pub body: Vec<u8>,
}

impl CcApdu {
    /// Create an APDU
    pub fn new(tag: u32, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    /// Parse one APDU from the front of `data`, returning it and the bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut cur = Cursor::new(data);
        let tag = cur.read_u24()?;
        let len = decode_length(&mut cur)?;
        let body = cur.read_bytes(len)?.to_vec();
        Ok((Self { tag, body }, cur.position()))
    }

    /// Encode, failing if the body exceeds the 3-byte length form
    pub fn try_encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = encode_length(self.body.len())?;
        let mut out = Vec::with_capacity(3 + len.len() + self.body.len());
        out.extend_from_slice(&self.tag.to_be_bytes()[1..]);
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

/// Decoded CC resource message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcMessage {
    /// CAM opens the CC session
    OpenReq,
    /// Host confirms the session
    OpenCnf { status: u8 },
    /// CAM sends datatypes and asks for others
    DataReq(CcDataReq),
    /// Host answers a data request
    DataCnf(CcDataCnf),
    /// Any other tag of the CC resource
    Unknown { tag: u32, body: Vec<u8> },
}

impl TryFrom<&CcApdu> for CcMessage {
    type Error = ParseError;

    fn try_from(apdu: &CcApdu) -> Result<Self, Self::Error> {
        match apdu.tag {
            TAG_CC_OPEN_REQ => Ok(Self::OpenReq),
            TAG_CC_OPEN_CNF => {
                let status = Cursor::new(&apdu.body).read_u8()?;
                Ok(Self::OpenCnf { status })
            }
            TAG_CC_DATA_REQ => CcDataReq::parse_body(Cursor::new(&apdu.body)).map(Self::DataReq),
            TAG_CC_DATA_CNF => CcDataCnf::parse_body(Cursor::new(&apdu.body)).map(Self::DataCnf),
            tag => Ok(Self::Unknown {
                tag,
                body: apdu.body.clone(),
            }),
        }
    }
}

/// Streaming splitter for CC APDUs arriving over a session
pub struct CcCodec {
    buffer: Vec<u8>,
}

impl CcCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }
}

impl Default for CcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::ProtocolCodec for CcCodec {
    type Message = CcApdu;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_APDU_LEN * 2 {
            warn!(
                "CC buffer overflow ({} bytes), discarding",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    fn next_message(&mut self) -> Option<Self::Message> {
        match CcApdu::parse(&self.buffer) {
            Ok((apdu, used)) => {
                self.buffer.drain(..used);
                Some(apdu)
            }
            Err(ParseError::Incomplete { .. }) => None,
            Err(e) => {
                warn!("Failed to parse CC APDU: {}", e);
                self.buffer.clear();
                None
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Host side state of one CC handshake
///
/// Only the nonce and the requested datatype list are retained; signature
/// verification and key derivation happen elsewhere.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    opened: bool,
    system_id_bitmask: u8,
    nonce: Option<[u8; NONCE_LEN]>,
    requested: Vec<u8>,
}

impl HandshakeContext {
    /// Create a fresh context
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether CC_OPEN_CNF has been produced
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// The captured CAM nonce
    pub fn nonce(&self) -> Option<&[u8; NONCE_LEN]> {
        self.nonce.as_ref()
    }

    /// Datatype IDs requested by the last CC_DATA_REQ
    pub fn requested_datatypes(&self) -> &[u8] {
        &self.requested
    }

    /// CC system bitmask from the last CC_DATA_REQ
    pub fn system_id_bitmask(&self) -> u8 {
        self.system_id_bitmask
    }

    /// Answer CC_OPEN_REQ
    pub fn open_cnf(&mut self) -> [u8; 5] {
        self.opened = true;
        build_cc_open_cnf()
    }

    /// Parse a CC_DATA_REQ and capture its nonce
    ///
    /// The context is only updated once the whole message parsed cleanly.
    pub fn handle_cc_data_req(&mut self, data: &[u8]) -> Result<CcDataReq, ParseError> {
        let req = parse_cc_data_req(data)?;
        self.apply_data_req(&req)?;
        Ok(req)
    }

    fn apply_data_req(&mut self, req: &CcDataReq) -> Result<(), ParseError> {
        let nonce = match req.nonce() {
            Some(bytes) => {
                let nonce: [u8; NONCE_LEN] =
                    bytes
                        .try_into()
                        .map_err(|_| ParseError::InvalidDatatypeLength {
                            id: DATATYPE_NONCE,
                            expected: NONCE_LEN,
                            actual: bytes.len(),
                        })?;
                Some(nonce)
            }
            None => None,
        };

        for entry in req.send.iter().filter(|e| e.id != DATATYPE_NONCE) {
            debug!("ignoring CC datatype 0x{:02x}", entry.id);
        }

        if nonce.is_some() {
            self.nonce = nonce;
        }
        self.system_id_bitmask = req.system_id_bitmask;
        self.requested = req.requested.clone();
        Ok(())
    }

    /// Build the CC_DATA_CNF envelope for the last request
    ///
    /// No datatypes are answered: certificates and signatures are produced by
    /// the key exchange layer, which is not part of this crate.
    pub fn build_cc_data_cnf(&self) -> Result<Vec<u8>, ProtocolError> {
        build_cc_data_cnf(self.system_id_bitmask, &[])
    }

    /// Handle one APDU from the CAM, returning the reply to send (if any)
    pub fn handle_apdu(&mut self, apdu: &CcApdu) -> Result<Option<Vec<u8>>, ProtocolError> {
        match CcMessage::try_from(apdu)? {
            CcMessage::OpenReq => Ok(Some(self.open_cnf().to_vec())),
            CcMessage::DataReq(req) => {
                self.apply_data_req(&req)?;
                self.build_cc_data_cnf().map(Some)
            }
            CcMessage::Unknown { tag, .. } => {
                debug!("unhandled CC tag 0x{:06x}", tag);
                Ok(None)
            }
            other => Err(ProtocolError::UnexpectedMessage(format!("{:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolCodec;

    const NONCE: [u8; NONCE_LEN] = [
        0xFB, 0x37, 0x02, 0x29, 0xC1, 0xC2, 0x92, 0x7D, 0x6F, 0x8D, 0x01, 0x71, 0xCC, 0xA4, 0x31,
        0xE6, 0xB0, 0xB1, 0xB3, 0x77, 0x07, 0x3E, 0x38, 0x42, 0xF5, 0xB4, 0xCA, 0xCE, 0x63, 0xC2,
        0x91, 0xBD,
    ];

    /// CC_DATA_REQ as captured from a CAM
    fn captured_data_req() -> Vec<u8> {
        let mut msg = vec![0x9F, 0x90, 0x03, 0x2A, 0x01, 0x01, 0x13, 0x00, 0x20];
        msg.extend_from_slice(&NONCE);
        msg.extend_from_slice(&[0x04, 0x0D, 0x11, 0x0F, 0x07]);
        msg
    }

    #[test]
    fn test_open_cnf_literal() {
        assert_eq!(build_cc_open_cnf(), [0x9F, 0x90, 0x02, 0x01, 0x01]);
        assert_eq!(build_cc_open_cnf(), build_cc_open_cnf());
    }

    #[test]
    fn test_parse_captured_data_req() {
        let req = parse_cc_data_req(&captured_data_req()).unwrap();
        assert_eq!(req.system_id_bitmask, 0x01);
        assert_eq!(req.send.len(), 1);
        assert_eq!(req.nonce(), Some(&NONCE[..]));
        assert_eq!(
            req.requested,
            vec![
                DATATYPE_DHPH,
                DATATYPE_NONCE_SIGNATURE_A,
                DATATYPE_HOST_DEVCERT,
                DATATYPE_HOST_BRANDCERT
            ]
        );
    }

    #[test]
    fn test_context_captures_nonce() {
        let mut ctx = HandshakeContext::new();
        ctx.handle_cc_data_req(&captured_data_req()).unwrap();
        assert_eq!(ctx.nonce(), Some(&NONCE));
        assert_eq!(ctx.requested_datatypes().len(), 4);
    }

    #[test]
    fn test_two_byte_length_form() {
        // Same request with a padding datatype that pushes the body past 127 bytes
        let req = CcDataReq {
            system_id_bitmask: 0x01,
            send: vec![
                DatatypeEntry::new(0x50, vec![0xAA; 100]),
                DatatypeEntry::new(DATATYPE_NONCE, NONCE.to_vec()),
            ],
            requested: vec![DATATYPE_DHPH],
        };
        let bytes = req.to_apdu().unwrap();
        assert_eq!(bytes[3], 0x81);

        let mut ctx = HandshakeContext::new();
        let parsed = ctx.handle_cc_data_req(&bytes).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(ctx.nonce(), Some(&NONCE));
    }

    #[test]
    fn test_three_byte_length_form() {
        let req = CcDataReq {
            system_id_bitmask: 0x01,
            send: vec![
                DatatypeEntry::new(DATATYPE_HOST_DEVCERT, vec![0x30; 600]),
                DatatypeEntry::new(DATATYPE_NONCE, NONCE.to_vec()),
            ],
            requested: vec![],
        };
        let bytes = req.to_apdu().unwrap();
        assert_eq!(bytes[3], 0x82);
        assert_eq!(parse_cc_data_req(&bytes).unwrap().nonce(), Some(&NONCE[..]));
    }

    #[test]
    fn test_invalid_length_form_leaves_context_untouched() {
        let mut ctx = HandshakeContext::new();
        ctx.handle_cc_data_req(&captured_data_req()).unwrap();

        let mut bad = captured_data_req();
        bad[3] = 0x83;
        bad[9] ^= 0xFF;
        assert_eq!(
            ctx.handle_cc_data_req(&bad),
            Err(ParseError::InvalidLength(0x83))
        );
        assert_eq!(ctx.nonce(), Some(&NONCE));
    }

    #[test]
    fn test_truncated_request_fails() {
        let msg = captured_data_req();
        let mut ctx = HandshakeContext::new();
        assert!(matches!(
            ctx.handle_cc_data_req(&msg[..20]),
            Err(ParseError::Incomplete { .. })
        ));
        assert!(ctx.nonce().is_none());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let req = CcDataReq {
            system_id_bitmask: 0x01,
            send: vec![DatatypeEntry::new(DATATYPE_NONCE, vec![0x11; 16])],
            requested: vec![],
        };
        let mut ctx = HandshakeContext::new();
        assert_eq!(
            ctx.handle_cc_data_req(&req.to_apdu().unwrap()),
            Err(ParseError::InvalidDatatypeLength {
                id: DATATYPE_NONCE,
                expected: NONCE_LEN,
                actual: 16
            })
        );
        assert!(ctx.requested_datatypes().is_empty());
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let mut msg = captured_data_req();
        msg[2] = 0x04;
        assert!(matches!(
            parse_cc_data_req(&msg),
            Err(ParseError::InvalidTag { .. })
        ));
    }

    #[test]
    fn test_data_cnf_envelope() {
        let mut ctx = HandshakeContext::new();
        ctx.handle_cc_data_req(&captured_data_req()).unwrap();
        assert_eq!(
            ctx.build_cc_data_cnf().unwrap(),
            vec![0x9F, 0x90, 0x04, 0x02, 0x01, 0x00]
        );

        let cnf = build_cc_data_cnf(0x01, &[DatatypeEntry::new(DATATYPE_DHPH, vec![1, 2])]).unwrap();
        let (apdu, used) = CcApdu::parse(&cnf).unwrap();
        assert_eq!(used, cnf.len());
        match CcMessage::try_from(&apdu).unwrap() {
            CcMessage::DataCnf(parsed) => {
                assert_eq!(parsed.send, vec![DatatypeEntry::new(DATATYPE_DHPH, vec![1, 2])]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_oversized_datatype_loops_rejected() {
        let entries = vec![DatatypeEntry::new(DATATYPE_DHPH, vec![0u8]); 256];
        assert_eq!(
            build_cc_data_cnf(0x01, &entries),
            Err(ProtocolError::Oversized(256))
        );
        assert!(build_cc_data_cnf(0x01, &entries[..255]).is_ok());

        let big = DatatypeEntry::new(DATATYPE_DHPH, vec![0u8; 0x1_0000]);
        assert_eq!(
            build_cc_data_cnf(0x01, &[big]),
            Err(ProtocolError::Oversized(0x1_0000))
        );

        let req = CcDataReq {
            system_id_bitmask: 0x01,
            send: Vec::new(),
            requested: vec![DATATYPE_DHPH; 300],
        };
        assert_eq!(req.to_apdu(), Err(ProtocolError::Oversized(300)));
    }

    #[test]
    fn test_length_encoding_forms() {
        assert_eq!(encode_length(0x2A).unwrap(), vec![0x2A]);
        assert_eq!(encode_length(0x80).unwrap(), vec![0x81, 0x80]);
        assert_eq!(encode_length(0x0258).unwrap(), vec![0x82, 0x02, 0x58]);
        assert_eq!(encode_length(0x1_0000), Err(ProtocolError::Oversized(0x1_0000)));
    }

    #[test]
    fn test_streaming_codec_splits_apdus() {
        let mut codec = CcCodec::new();
        let req = captured_data_req();

        codec.push_bytes(&[0x9F, 0x90, 0x01, 0x00]);
        codec.push_bytes(&req[..10]);
        let open = codec.next_message().unwrap();
        assert_eq!(open.tag, TAG_CC_OPEN_REQ);
        assert!(codec.next_message().is_none());

        codec.push_bytes(&req[10..]);
        let data = codec.next_message().unwrap();
        assert_eq!(data.tag, TAG_CC_DATA_REQ);
        assert!(codec.next_message().is_none());
    }

    #[test]
    fn test_handle_apdu_sequence() {
        let mut ctx = HandshakeContext::new();
        let open = CcApdu::new(TAG_CC_OPEN_REQ, vec![]);
        assert_eq!(
            ctx.handle_apdu(&open).unwrap(),
            Some(CC_OPEN_CNF.to_vec())
        );
        assert!(ctx.is_open());

        let (data, _) = CcApdu::parse(&captured_data_req()).unwrap();
        let reply = ctx.handle_apdu(&data).unwrap().unwrap();
        assert_eq!(&reply[..3], &[0x9F, 0x90, 0x04]);
        assert_eq!(ctx.nonce(), Some(&NONCE));

        let cnf = CcApdu::new(TAG_CC_OPEN_CNF, vec![0x01]);
        assert!(matches!(
            ctx.handle_apdu(&cnf),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }
}
