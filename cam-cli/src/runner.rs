//! Drives a descrambler through a scenario against virtual CAMs

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use cam_mux::{
    AdapterId, CamKey, Descrambler, RecordingTransport, RegistrySnapshot, ServiceComponents,
    ServiceHandle,
};
use cam_protocol::pmt::build_pmt_section;
use cam_protocol::{CcApdu, HandshakeContext};
use cam_sim::{VirtualCam, VirtualCamConfig};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::scenario::{CamEntry, Scenario, Step};

/// Final state of one virtual CAM
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CamReport {
    /// Adapter and slot
    pub cam: CamKey,
    /// Programs the CAM ends up descrambling
    pub programs: Vec<u16>,
    /// Sequences the CAM would have rejected
    pub violations: Vec<String>,
    /// Nonce captured by the host during the CC handshake (hex)
    pub captured_nonce: Option<String>,
}

/// Result of a scenario run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Host-side registries
    pub registry: RegistrySnapshot,
    /// CAMs still inserted at the end
    pub cams: Vec<CamReport>,
    /// Every CAPMT sent, hex encoded, in order
    pub capmts: Vec<String>,
}

struct Slot {
    cam: VirtualCam,
    host: HandshakeContext,
}

/// Scenario runner
pub struct Runner {
    default_max_programs: usize,
    descrambler: Descrambler,
    recorder: RecordingTransport,
    slots: BTreeMap<(u32, u8), Slot>,
    capmts: Vec<String>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

impl Runner {
    /// Create a runner for `scenario`
    pub fn new(scenario: &Scenario) -> Self {
        let recorder = RecordingTransport::new();
        Self {
            default_max_programs: scenario.default_max_programs,
            descrambler: Descrambler::with_config(scenario.descrambler.clone(), recorder.clone()),
            recorder,
            slots: BTreeMap::new(),
            capmts: Vec::new(),
        }
    }

    /// Run every step and report the final state
    pub fn run(mut self, steps: &[Step]) -> Result<Report> {
        for (i, step) in steps.iter().enumerate() {
            self.apply(step)
                .with_context(|| format!("step {} ({:?}) failed", i + 1, step))?;
        }
        Ok(self.report())
    }

    /// Apply one step and replay the CAPMTs it caused
    pub fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Insert(entry) => self.insert(entry)?,
            Step::Remove { adapter, slot } => {
                self.slots.remove(&(*adapter, *slot));
                self.descrambler.unregister_cam(AdapterId(*adapter), *slot);
            }
            Step::Start { service } => self.descrambler.start_service(ServiceHandle(*service)),
            Step::Stop { service } => self.descrambler.stop_service(ServiceHandle(*service)),
            Step::Pmt {
                service,
                adapter,
                program,
                streams,
            } => {
                let layout: Vec<(u8, u16, &[u16])> = streams
                    .iter()
                    .map(|s| (s.stream_type, s.pid, s.caids.as_slice()))
                    .collect();
                let pmt = build_pmt_section(*program, &layout)?;
                let components = ServiceComponents {
                    adapter: adapter.map(AdapterId),
                    streams: streams.clone(),
                };
                self.descrambler
                    .on_pmt(ServiceHandle(*service), pmt, &components);
            }
        }

        self.replay();
        for event in self.descrambler.drain_events() {
            if event.is_failure() {
                warn!("{:?}", event);
            } else {
                debug!("{:?}", event);
            }
        }
        Ok(())
    }

    fn insert(&mut self, entry: &CamEntry) -> Result<()> {
        let max_programs = entry.max_programs.unwrap_or(self.default_max_programs);
        let mut cam = VirtualCam::from_config(VirtualCamConfig {
            id: CamKey::new(AdapterId(entry.adapter), entry.slot).to_string(),
            caids: entry.caids.clone(),
            max_programs,
            nonce: entry.nonce,
            ..Default::default()
        });
        let mut host = HandshakeContext::new();

        if entry.handshake {
            handshake(&mut cam, &mut host)?;
        }

        self.descrambler.register_cam(
            AdapterId(entry.adapter),
            entry.slot,
            cam.caids(),
            cam.max_programs(),
        );
        self.slots
            .insert((entry.adapter, entry.slot), Slot { cam, host });
        Ok(())
    }

    fn replay(&mut self) {
        for frame in self.recorder.take_frames() {
            let bytes = frame.bytes();
            info!("CAPMT -> {}: {}", frame.cam, hex(&bytes));
            self.capmts.push(hex(&bytes));

            let key = (frame.cam.adapter.0, frame.cam.slot);
            match self.slots.get_mut(&key) {
                Some(slot) => {
                    if let Err(e) = slot.cam.process_bytes(&bytes) {
                        warn!("{} rejected CAPMT: {}", frame.cam, e);
                    }
                }
                None => warn!("CAPMT for empty slot {}", frame.cam),
            }
        }
    }

    /// Final state
    pub fn report(&self) -> Report {
        let cams = self
            .slots
            .iter()
            .map(|(&(adapter, slot), s)| CamReport {
                cam: CamKey::new(AdapterId(adapter), slot),
                programs: s.cam.programs().to_vec(),
                violations: s.cam.violations().iter().map(ToString::to_string).collect(),
                captured_nonce: s.host.nonce().map(|n| hex(n)),
            })
            .collect();

        Report {
            registry: self.descrambler.snapshot(),
            cams,
            capmts: self.capmts.clone(),
        }
    }
}

/// Run the CC open and data exchange between a CAM and the host context
fn handshake(cam: &mut VirtualCam, host: &mut HandshakeContext) -> Result<()> {
    cam.request_cc_open()?;
    cam.request_cc_data()?;

    while let Some(bytes) = cam.take_output() {
        let (apdu, _) = CcApdu::parse(&bytes)?;
        if let Some(reply) = host.handle_apdu(&apdu)? {
            debug!("CC reply to {}: {}", cam.id(), hex(&reply));
            cam.process_cc(&reply)?;
        }
    }

    info!(
        "CC handshake with {} done, nonce {}",
        cam.id(),
        host.nonce().map(|n| hex(n)).unwrap_or_default()
    );
    Ok(())
}
