//! CAM Simulation Library
//!
//! This crate provides simulated CAM slots for exercising the descrambling
//! manager without CI hardware. It includes:
//!
//! - **VirtualCam**: applies CAPMT list management to a program list, flags
//!   sequences a real module would reject, and speaks the CAM side of the CI+
//!   CC handshake
//! - **run_virtual_cam_task**: async task reading CAPMT frames from a stream
//!
//! # Example
//!
//! ```rust
//! use cam_sim::VirtualCam;
//! use cam_protocol::{Capmt, CapmtCommand, ListManagement};
//! use cam_protocol::pmt::build_pmt_section;
//!
//! let mut cam = VirtualCam::new("Slot 0", &[0x0100], 2);
//! let pmt = build_pmt_section(1, &[(0x02, 0x0100, &[0x0100])]).unwrap();
//! cam.process_capmt(&Capmt::new(ListManagement::Only, CapmtCommand::OkDescrambling, pmt));
//!
//! assert_eq!(cam.programs(), &[1]);
//! assert!(cam.violations().is_empty());
//! ```

pub mod cam;
pub mod cam_task;

pub use cam::{VirtualCam, VirtualCamConfig, Violation};
pub use cam_task::{run_virtual_cam_task, VirtualCamCommand, VirtualCamStateEvent};
