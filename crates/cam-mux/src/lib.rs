//! CAM Descrambling Manager
//!
//! This crate tracks the Conditional Access Modules inserted into DVB
//! adapters and the services being watched, decides which CAM descrambles
//! which service, and drives each CAM's program list with CAPMT messages.
//!
//! # Architecture
//!
//! - [`CamRegistry`] and [`ServiceRegistry`] hold the two ordered registries;
//!   services refer to CAMs by [`CamKey`] only
//! - [`Descrambler`] owns both and implements the list-management rules
//!   (ONLY, ADD, or a full FIRST..LAST resend)
//! - CAPMTs leave through a [`CapmtTransport`]
//! - Outcomes are reported as a [`CamEvent`] stream and as [`Stats`] counters
//!
//! Two front-ends share the same engine: [`SharedDescrambler`] for callers on
//! several threads, and [`run_cam_actor`] for async callers.
//!
//! # Example
//!
//! ```rust
//! use cam_mux::{AdapterId, Descrambler, RecordingTransport, ServiceComponents, ServiceHandle};
//! use cam_protocol::pmt::build_pmt_section;
//!
//! let recorder = RecordingTransport::new();
//! let mut descrambler = Descrambler::new(recorder.clone());
//! descrambler.register_cam(AdapterId(0), 0, &[0x0100], 2);
//!
//! let service = ServiceHandle(1);
//! let pmt = build_pmt_section(1, &[(0x02, 0x0100, &[0x0100])]).unwrap();
//! let components = ServiceComponents::from_pmt(Some(AdapterId(0)), &pmt).unwrap();
//! descrambler.start_service(service);
//! descrambler.on_pmt(service, pmt, &components);
//!
//! assert_eq!(recorder.frames().len(), 1);
//! ```

pub mod actor;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod shared;
pub mod state;
pub mod transport;

// Re-export actor types
pub use actor::{run_cam_actor, CamActorCommand};

// Re-export engine types
pub use engine::{
    batch_position, Descrambler, DescramblerConfig, RegistrySnapshot, ServiceSnapshot, Stats,
};
pub use error::{MuxError, TransportError};
pub use events::CamEvent;
pub use registry::{CamRegistry, ServiceRegistry};
pub use shared::SharedDescrambler;
pub use state::{
    AdapterId, CamKey, CamSlot, ElementaryStream, ServiceComponents, ServiceHandle,
    WatchedService, MAX_CAIDS_PER_SLOT,
};
pub use transport::{CapmtFrame, CapmtTransport, ChannelTransport, RecordingTransport};
