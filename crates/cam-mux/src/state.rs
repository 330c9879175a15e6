//! CAM slot and watched service state

use std::fmt;

use cam_protocol::{Caid, ParseError, PmtSection};
use serde::{Deserialize, Serialize};

/// Maximum number of CAIDs tracked per CAM slot
pub const MAX_CAIDS_PER_SLOT: usize = 16;

/// Identifies a DVB adapter (tuner card)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterId(pub u32);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter{}", self.0)
    }
}

/// A CAM slot on an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CamKey {
    /// Adapter the CA device belongs to
    pub adapter: AdapterId,
    /// Slot number on that CA device
    pub slot: u8,
}

impl CamKey {
    /// Create a key
    pub fn new(adapter: AdapterId, slot: u8) -> Self {
        Self { adapter, slot }
    }
}

impl fmt::Display for CamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/slot{}", self.adapter, self.slot)
    }
}

/// Opaque handle of a service supplied by the tuning layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle(pub u32);

impl ServiceHandle {
    /// Get the raw handle value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered CAM and the programs it is believed to be descrambling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CamSlot {
    /// Adapter and slot
    pub key: CamKey,
    /// CAIDs the CAM can decrypt (at most [`MAX_CAIDS_PER_SLOT`])
    pub caids: Vec<Caid>,
    /// Number of programs the CAM can descramble at once
    pub max_programs: usize,
    /// Programs sent to the CAM and not yet removed
    pub active_programs: usize,
    /// Next update for this slot must resend the whole program list
    pub needs_full_resend: bool,
}

impl CamSlot {
    /// Create a slot, keeping only the first [`MAX_CAIDS_PER_SLOT`] CAIDs
    pub fn new(key: CamKey, caids: &[Caid], max_programs: usize) -> Self {
        let keep = caids.len().min(MAX_CAIDS_PER_SLOT);
        Self {
            key,
            caids: caids[..keep].to_vec(),
            max_programs,
            active_programs: 0,
            needs_full_resend: false,
        }
    }

    /// Whether this CAM sits on `adapter` and can decrypt `caid`
    pub fn supports(&self, adapter: AdapterId, caid: Caid) -> bool {
        self.key.adapter == adapter && self.caids.contains(&caid)
    }

    /// Whether another program fits
    pub fn has_capacity(&self) -> bool {
        self.active_programs < self.max_programs
    }
}

/// A service being watched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedService {
    /// Handle from the tuning layer
    pub handle: ServiceHandle,
    /// Most recent PMT section
    pub last_pmt: Option<PmtSection>,
    /// CAM descrambling this service (cleared when the CAM goes away)
    pub assigned_slot: Option<CamKey>,
}

impl WatchedService {
    /// Create an entry with no PMT and no CAM
    pub fn new(handle: ServiceHandle) -> Self {
        Self {
            handle,
            last_pmt: None,
            assigned_slot: None,
        }
    }

    /// Whether this service is assigned to `key`
    pub fn is_on(&self, key: CamKey) -> bool {
        self.assigned_slot == Some(key)
    }
}

/// An elementary stream of a service and the CAIDs protecting it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementaryStream {
    /// Elementary PID
    pub pid: u16,
    /// MPEG stream type
    pub stream_type: u8,
    /// CAIDs from the CA descriptors of this stream
    pub caids: Vec<Caid>,
}

/// What the service object reports about itself when a PMT arrives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceComponents {
    /// Adapter of the tuner currently feeding the service
    pub adapter: Option<AdapterId>,
    /// Elementary streams in PMT order
    pub streams: Vec<ElementaryStream>,
}

impl ServiceComponents {
    /// Create components for a tuned service
    pub fn new(adapter: AdapterId, streams: Vec<ElementaryStream>) -> Self {
        Self {
            adapter: Some(adapter),
            streams,
        }
    }

    /// Build the stream list from the CA descriptors of a PMT section
    ///
    /// Program level CA descriptors are inherited by every stream.
    pub fn from_pmt(adapter: Option<AdapterId>, pmt: &PmtSection) -> Result<Self, ParseError> {
        let info = pmt.ca_descriptors()?;
        let streams = info
            .streams
            .iter()
            .map(|s| ElementaryStream {
                pid: s.pid,
                stream_type: s.stream_type,
                caids: info.stream_caids(s),
            })
            .collect();
        Ok(Self { adapter, streams })
    }

    /// Every CAID in stream order (may repeat across streams)
    pub fn caids(&self) -> impl Iterator<Item = Caid> + '_ {
        self.streams.iter().flat_map(|s| s.caids.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cam_protocol::pmt::build_pmt_section;

    #[test]
    fn test_caids_truncated_to_sixteen() {
        let caids: Vec<Caid> = (0..20).map(|i| 0x0100 + i).collect();
        let slot = CamSlot::new(CamKey::new(AdapterId(0), 0), &caids, 2);
        assert_eq!(slot.caids.len(), MAX_CAIDS_PER_SLOT);
        assert_eq!(slot.caids[15], 0x010F);
    }

    #[test]
    fn test_supports_requires_same_adapter() {
        let slot = CamSlot::new(CamKey::new(AdapterId(1), 0), &[0x0500], 1);
        assert!(slot.supports(AdapterId(1), 0x0500));
        assert!(!slot.supports(AdapterId(0), 0x0500));
        assert!(!slot.supports(AdapterId(1), 0x0100));
    }

    #[test]
    fn test_components_from_pmt() {
        let pmt = build_pmt_section(5, &[(0x02, 0x0200, &[0x0100]), (0x04, 0x0201, &[0x0500])])
            .unwrap();
        let comps = ServiceComponents::from_pmt(Some(AdapterId(0)), &pmt).unwrap();
        assert_eq!(comps.streams.len(), 2);
        assert_eq!(comps.caids().collect::<Vec<_>>(), vec![0x0100, 0x0500]);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CamKey::new(AdapterId(2), 1).to_string(), "adapter2/slot1");
        assert_eq!(ServiceHandle(7).to_string(), "#7");
    }
}
