//! CAPMT delivery to CAM slots
//!
//! The descrambler hands every CAPMT to a [`CapmtTransport`] while it holds
//! its registry lock, so implementations must not block for long. Two
//! implementations are provided:
//!
//! - [`ChannelTransport`] queues frames on a tokio channel for an I/O task
//! - [`RecordingTransport`] keeps frames in memory for simulation and tests

use std::sync::{Arc, Mutex, MutexGuard};

use cam_protocol::{Capmt, EncodeMessage};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::state::CamKey;

/// Something that can deliver a CAPMT to a CAM slot
pub trait CapmtTransport: Send {
    /// Deliver one CAPMT; failures are reported, never retried
    fn send_capmt(&mut self, cam: CamKey, capmt: &Capmt) -> Result<(), TransportError>;
}

/// A CAPMT addressed to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapmtFrame {
    /// Destination slot
    pub cam: CamKey,
    /// The message
    pub capmt: Capmt,
}

impl CapmtFrame {
    /// Wire bytes of the message
    pub fn bytes(&self) -> Vec<u8> {
        self.capmt.encode()
    }
}

/// Transport that forwards frames to an async I/O task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<CapmtFrame>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the I/O task reads from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CapmtFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Wrap an existing sender
    pub fn from_sender(tx: mpsc::Sender<CapmtFrame>) -> Self {
        Self { tx }
    }
}

impl CapmtTransport for ChannelTransport {
    fn send_capmt(&mut self, cam: CamKey, capmt: &Capmt) -> Result<(), TransportError> {
        let frame = CapmtFrame {
            cam,
            capmt: capmt.clone(),
        };
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[derive(Debug, Default)]
struct RecordingInner {
    frames: Vec<CapmtFrame>,
    failing: bool,
}

/// In-memory transport; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<RecordingInner>>,
}

impl RecordingTransport {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make subsequent sends fail with [`TransportError::Device`]
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Frames delivered so far
    pub fn frames(&self) -> Vec<CapmtFrame> {
        self.lock().frames.clone()
    }

    /// Remove and return the frames delivered so far
    pub fn take_frames(&self) -> Vec<CapmtFrame> {
        std::mem::take(&mut self.lock().frames)
    }
}

impl CapmtTransport for RecordingTransport {
    fn send_capmt(&mut self, cam: CamKey, capmt: &Capmt) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(TransportError::Device(format!("{} not responding", cam)));
        }
        inner.frames.push(CapmtFrame {
            cam,
            capmt: capmt.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AdapterId;
    use cam_protocol::pmt::build_pmt_section;
    use cam_protocol::{CapmtCommand, ListManagement};

    fn capmt() -> Capmt {
        Capmt::new(
            ListManagement::Only,
            CapmtCommand::OkDescrambling,
            build_pmt_section(1, &[(0x02, 0x0100, &[0x0100])]).unwrap(),
        )
    }

    #[test]
    fn test_recording_clones_share_log() {
        let recorder = RecordingTransport::new();
        let mut handle = recorder.clone();
        let cam = CamKey::new(AdapterId(0), 0);

        handle.send_capmt(cam, &capmt()).unwrap();
        assert_eq!(recorder.frames().len(), 1);

        recorder.set_failing(true);
        assert!(matches!(
            handle.send_capmt(cam, &capmt()),
            Err(TransportError::Device(_))
        ));
        assert_eq!(recorder.take_frames().len(), 1);
        assert!(recorder.frames().is_empty());
    }

    #[test]
    fn test_channel_transport_reports_full_and_closed() {
        let (mut transport, mut rx) = ChannelTransport::new(1);
        let cam = CamKey::new(AdapterId(0), 1);

        transport.send_capmt(cam, &capmt()).unwrap();
        assert_eq!(
            transport.send_capmt(cam, &capmt()),
            Err(TransportError::Full)
        );

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.cam, cam);
        assert_eq!(frame.bytes()[0], ListManagement::Only as u8);

        drop(rx);
        assert_eq!(
            transport.send_capmt(cam, &capmt()),
            Err(TransportError::Closed)
        );
    }
}
