//! Error types for the descrambling manager

use thiserror::Error;

use crate::state::{CamKey, ServiceHandle};

/// Errors that can occur in the descrambling manager
#[derive(Debug, Error)]
pub enum MuxError {
    /// Service was never started
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceHandle),

    /// No registered CAM on the tuner's adapter handles the service's CAIDs
    #[error("no CAM available for service {0}")]
    NoCamAvailable(ServiceHandle),

    /// Allocation failed while growing a registry
    #[error("out of memory growing the {0} registry")]
    ResourceExhausted(&'static str),

    /// CAPMT delivery failed
    #[error("transport error on {cam}: {source}")]
    Transport {
        /// Slot the CAPMT was addressed to
        cam: CamKey,
        /// Underlying failure
        #[source]
        source: TransportError,
    },
}

/// Errors reported by a CAPMT transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The receiving side has gone away
    #[error("transport closed")]
    Closed,

    /// The outbound queue is full
    #[error("transport queue full")]
    Full,

    /// The CAM device rejected the write
    #[error("device error: {0}")]
    Device(String),
}
