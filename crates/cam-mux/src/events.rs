//! Event stream for the descrambling manager
//!
//! Lifecycle calls are notifications and return nothing, so every outcome
//! (CAPMT traffic, dropped programs, missing CAMs) is reported here instead.

use cam_protocol::{CapmtCommand, Caid, ListManagement};

use crate::state::{CamKey, ServiceHandle};

/// Everything observable that the descrambler does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CamEvent {
    // -------------------------------------------------------------------------
    // CAM lifecycle events
    // -------------------------------------------------------------------------
    /// A CAM was inserted
    CamRegistered {
        /// Adapter and slot
        cam: CamKey,
        /// CAIDs kept after truncation
        caids: Vec<Caid>,
        /// Program capacity
        max_programs: usize,
    },

    /// A CAM was removed
    CamUnregistered {
        /// Adapter and slot
        cam: CamKey,
        /// Registry entries removed (0 if the CAM was unknown)
        removed: usize,
        /// Services that lost their CAM
        orphaned: Vec<ServiceHandle>,
    },

    // -------------------------------------------------------------------------
    // Service lifecycle events
    // -------------------------------------------------------------------------
    /// A service started
    ServiceStarted {
        /// Service handle
        service: ServiceHandle,
    },

    /// A service stopped
    ServiceStopped {
        /// Service handle
        service: ServiceHandle,
        /// CAM the service was removed from, if any
        cam: Option<CamKey>,
    },

    /// A service was matched to a CAM
    CamAssigned {
        /// Service handle
        service: ServiceHandle,
        /// Matched slot
        cam: CamKey,
    },

    // -------------------------------------------------------------------------
    // CAPMT traffic
    // -------------------------------------------------------------------------
    /// A CAPMT was handed to the transport
    CapmtSent {
        /// Destination slot
        cam: CamKey,
        /// Service the PMT belongs to
        service: ServiceHandle,
        /// Batch position
        list_management: ListManagement,
        /// Command ID
        command: CapmtCommand,
        /// Encoded frame
        data: Vec<u8>,
    },

    // -------------------------------------------------------------------------
    // Non-fatal failures
    // -------------------------------------------------------------------------
    /// A service matched a CAM that is already full; no CAPMT was sent
    CapacityExceeded {
        /// Full slot
        cam: CamKey,
        /// Service left undescrambled
        service: ServiceHandle,
        /// Slot capacity
        max_programs: usize,
    },

    /// No registered CAM handles the service's CAIDs on its adapter
    NoCamAvailable {
        /// Service handle
        service: ServiceHandle,
    },

    /// A PMT arrived for a service that was never started
    ServiceNotFound {
        /// Service handle
        service: ServiceHandle,
    },

    /// The transport refused a CAPMT
    TransportFailed {
        /// Destination slot
        cam: CamKey,
        /// Service the PMT belongs to
        service: ServiceHandle,
        /// Error message
        message: String,
    },
}

impl CamEvent {
    /// Check if this is CAPMT traffic
    pub fn is_traffic(&self) -> bool {
        matches!(self, CamEvent::CapmtSent { .. })
    }

    /// Check if this reports a non-fatal failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CamEvent::CapacityExceeded { .. }
                | CamEvent::NoCamAvailable { .. }
                | CamEvent::ServiceNotFound { .. }
                | CamEvent::TransportFailed { .. }
        )
    }

    /// Get the service handle if this event concerns a specific service
    pub fn service(&self) -> Option<ServiceHandle> {
        match self {
            CamEvent::ServiceStarted { service }
            | CamEvent::ServiceStopped { service, .. }
            | CamEvent::CamAssigned { service, .. }
            | CamEvent::CapmtSent { service, .. }
            | CamEvent::CapacityExceeded { service, .. }
            | CamEvent::NoCamAvailable { service }
            | CamEvent::ServiceNotFound { service }
            | CamEvent::TransportFailed { service, .. } => Some(*service),
            CamEvent::CamRegistered { .. } | CamEvent::CamUnregistered { .. } => None,
        }
    }

    /// Get the CAM slot if this event concerns a specific slot
    pub fn cam(&self) -> Option<CamKey> {
        match self {
            CamEvent::CamRegistered { cam, .. }
            | CamEvent::CamUnregistered { cam, .. }
            | CamEvent::CamAssigned { cam, .. }
            | CamEvent::CapmtSent { cam, .. }
            | CamEvent::CapacityExceeded { cam, .. }
            | CamEvent::TransportFailed { cam, .. } => Some(*cam),
            CamEvent::ServiceStopped { cam, .. } => *cam,
            _ => None,
        }
    }
}
