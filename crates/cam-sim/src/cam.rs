//! Virtual CAM simulation
//!
//! Applies CAPMT list-management semantics the way a CAM does, so tests can
//! check which programs end up being descrambled and whether the host ever
//! sent a sequence a real module would reject.

use std::collections::VecDeque;

use cam_protocol::ciplus::{
    CcDataCnf, DatatypeEntry, DATATYPE_DHPH, DATATYPE_HOST_BRANDCERT, DATATYPE_HOST_DEVCERT,
    DATATYPE_NONCE, DATATYPE_NONCE_SIGNATURE_A, NONCE_LEN, TAG_CC_OPEN_REQ,
};
use cam_protocol::{
    Caid, Capmt, CapmtCommand, CcApdu, CcDataReq, CcMessage, ListManagement, ProtocolError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// A CAPMT sequence that a real CAM would reject
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// MORE or LAST without a preceding FIRST
    #[error("{0} outside a FIRST..LAST batch")]
    OutsideBatch(ListManagement),

    /// A new list started while a batch was still open
    #[error("{0} interrupted an open batch")]
    BatchInterrupted(ListManagement),

    /// UPDATE for a program the CAM is not descrambling
    #[error("UPDATE for unknown program {0}")]
    UpdateUnknown(u16),

    /// More programs than the CAM can descramble
    #[error("{count} programs exceed capacity {max}")]
    OverCapacity {
        /// Programs after applying the CAPMT
        count: usize,
        /// CAM capacity
        max: usize,
    },

    /// The PMT has no program number
    #[error("PMT without program number")]
    MissingProgram,
}

/// Configuration for creating a virtual CAM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualCamConfig {
    /// Display name
    pub id: String,
    /// CAIDs the CAM reports
    pub caids: Vec<Caid>,
    /// Programs it can descramble at once
    pub max_programs: usize,
    /// CC system versions offered in CC_DATA_REQ
    pub system_id_bitmask: u8,
    /// Nonce sent in CC_DATA_REQ
    pub nonce: [u8; NONCE_LEN],
}

impl Default for VirtualCamConfig {
    fn default() -> Self {
        Self {
            id: "Virtual CAM".to_string(),
            caids: vec![0x0100],
            max_programs: 1,
            system_id_bitmask: 0x01,
            nonce: [0u8; NONCE_LEN],
        }
    }
}

/// A simulated CAM slot
#[derive(Debug)]
pub struct VirtualCam {
    /// Unique identifier for this CAM
    id: String,
    caids: Vec<Caid>,
    max_programs: usize,
    /// Program numbers being descrambled
    programs: Vec<u16>,
    /// Batch opened by FIRST and not yet closed by LAST
    pending: Option<Vec<u16>>,
    received: Vec<Capmt>,
    violations: Vec<Violation>,
    system_id_bitmask: u8,
    nonce: [u8; NONCE_LEN],
    cc_open: bool,
    last_data_cnf: Option<CcDataCnf>,
    /// CC APDUs waiting to be read by the host
    pending_output: VecDeque<Vec<u8>>,
}

impl VirtualCam {
    /// Create a CAM with default CC parameters
    pub fn new(id: impl Into<String>, caids: &[Caid], max_programs: usize) -> Self {
        Self::from_config(VirtualCamConfig {
            id: id.into(),
            caids: caids.to_vec(),
            max_programs,
            ..Default::default()
        })
    }

    /// Create a CAM from configuration
    pub fn from_config(config: VirtualCamConfig) -> Self {
        Self {
            id: config.id,
            caids: config.caids,
            max_programs: config.max_programs,
            programs: Vec::new(),
            pending: None,
            received: Vec::new(),
            violations: Vec::new(),
            system_id_bitmask: config.system_id_bitmask,
            nonce: config.nonce,
            cc_open: false,
            last_data_cnf: None,
            pending_output: VecDeque::new(),
        }
    }

    /// Get the CAM's identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// CAIDs the CAM reports on insertion
    pub fn caids(&self) -> &[Caid] {
        &self.caids
    }

    /// Program capacity
    pub fn max_programs(&self) -> usize {
        self.max_programs
    }

    /// Programs currently descrambled, in the order the host listed them
    pub fn programs(&self) -> &[u16] {
        &self.programs
    }

    /// Whether a FIRST was received without its LAST
    pub fn batch_open(&self) -> bool {
        self.pending.is_some()
    }

    /// Every CAPMT received so far
    pub fn received(&self) -> &[Capmt] {
        &self.received
    }

    /// List-management tags of every CAPMT received so far
    pub fn received_tags(&self) -> Vec<ListManagement> {
        self.received.iter().map(|c| c.list_management).collect()
    }

    /// Sequences a real CAM would have rejected
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Forget received CAPMTs and violations, keeping the program list
    pub fn clear_received(&mut self) {
        self.received.clear();
        self.violations.clear();
    }

    /// Apply a CAPMT; returns true if the program list changed
    pub fn process_capmt(&mut self, capmt: &Capmt) -> bool {
        self.received.push(capmt.clone());

        let Some(program) = capmt.pmt.program_number() else {
            self.violation(Violation::MissingProgram);
            return false;
        };
        let before = self.programs.clone();
        let lm = capmt.list_management;

        if self.pending.is_some() && !matches!(lm, ListManagement::More | ListManagement::Last) {
            self.violation(Violation::BatchInterrupted(lm));
            self.pending = None;
        }

        match lm {
            ListManagement::Only => self.programs = vec![program],
            ListManagement::First => self.pending = Some(vec![program]),
            ListManagement::More => match self.pending.as_mut() {
                Some(batch) => batch.push(program),
                None => self.violation(Violation::OutsideBatch(lm)),
            },
            ListManagement::Last => match self.pending.take() {
                Some(mut batch) => {
                    batch.push(program);
                    self.programs = batch;
                }
                None => self.violation(Violation::OutsideBatch(lm)),
            },
            ListManagement::Add if capmt.command == CapmtCommand::NotSelected => {
                if let Some(pos) = self.programs.iter().position(|&p| p == program) {
                    self.programs.remove(pos);
                } else {
                    debug!("{}: deselect of unknown program {}", self.id, program);
                }
            }
            ListManagement::Add => {
                if !self.programs.contains(&program) {
                    self.programs.push(program);
                }
            }
            ListManagement::Update => {
                if !self.programs.contains(&program) {
                    self.violation(Violation::UpdateUnknown(program));
                }
            }
        }

        let count = self
            .programs
            .len()
            .max(self.pending.as_ref().map_or(0, Vec::len));
        if count > self.max_programs {
            self.violation(Violation::OverCapacity {
                count,
                max: self.max_programs,
            });
        }

        self.programs != before
    }

    /// Decode and apply a CAPMT frame
    pub fn process_bytes(&mut self, data: &[u8]) -> Result<bool, ProtocolError> {
        let capmt = Capmt::decode(data)?;
        Ok(self.process_capmt(&capmt))
    }

    fn violation(&mut self, v: Violation) {
        warn!("{}: {}", self.id, v);
        self.violations.push(v);
    }

    // -------------------------------------------------------------------------
    // CI+ Content Control
    // -------------------------------------------------------------------------

    /// Whether the host confirmed the CC session
    pub fn cc_open(&self) -> bool {
        self.cc_open
    }

    /// Nonce this CAM sends
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Last CC_DATA_CNF received
    pub fn last_data_cnf(&self) -> Option<&CcDataCnf> {
        self.last_data_cnf.as_ref()
    }

    /// Queue CC_OPEN_REQ for the host
    pub fn request_cc_open(&mut self) -> Result<(), ProtocolError> {
        let req = CcApdu::new(TAG_CC_OPEN_REQ, Vec::new()).try_encode()?;
        self.pending_output.push_back(req);
        Ok(())
    }

    /// Queue a CC_DATA_REQ carrying the nonce and asking for the host credentials
    pub fn request_cc_data(&mut self) -> Result<(), ProtocolError> {
        let req = CcDataReq {
            system_id_bitmask: self.system_id_bitmask,
            send: vec![DatatypeEntry::new(DATATYPE_NONCE, self.nonce.to_vec())],
            requested: vec![
                DATATYPE_DHPH,
                DATATYPE_NONCE_SIGNATURE_A,
                DATATYPE_HOST_DEVCERT,
                DATATYPE_HOST_BRANDCERT,
            ],
        };
        self.pending_output.push_back(req.to_apdu()?);
        Ok(())
    }

    /// Handle a CC APDU written by the host
    pub fn process_cc(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let (apdu, _) = CcApdu::parse(data)?;
        match CcMessage::try_from(&apdu)? {
            CcMessage::OpenCnf { status } => {
                debug!("{}: CC_OPEN_CNF status {}", self.id, status);
                self.cc_open = status == 0x01;
                Ok(())
            }
            CcMessage::DataCnf(cnf) => {
                if !self.cc_open {
                    return Err(ProtocolError::UnexpectedMessage(
                        "CC_DATA_CNF before CC_OPEN_CNF".to_string(),
                    ));
                }
                self.last_data_cnf = Some(cnf);
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage(format!("{:?}", other))),
        }
    }

    /// Take the next queued CC APDU
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    /// Check if there's pending output
    pub fn has_output(&self) -> bool {
        !self.pending_output.is_empty()
    }
}
