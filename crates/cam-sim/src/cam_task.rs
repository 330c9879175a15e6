//! Virtual CAM actor task
//!
//! Owns a [`VirtualCam`] and reads CAPMT frames from an async byte stream,
//! the way a CA device node would receive them. Program list changes are
//! published on a broadcast channel.

use std::io;

use cam_protocol::{CapmtCodec, ProtocolCodec};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::VirtualCam;

/// Commands that can be sent to a virtual CAM task
#[derive(Debug, Clone)]
pub enum VirtualCamCommand {
    /// Shutdown the virtual CAM task
    Shutdown,
}

/// State event emitted when the descrambled program list changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualCamStateEvent {
    /// Programs being descrambled
    pub programs: Vec<u16>,
    /// Rejected sequences seen so far
    pub violations: usize,
}

/// Run the virtual CAM task until the stream closes or `Shutdown` arrives
///
/// Returns the CAM so its final state can be inspected.
pub async fn run_virtual_cam_task<S>(
    mut stream: S,
    mut cam: VirtualCam,
    mut cmd_rx: mpsc::Receiver<VirtualCamCommand>,
    state_tx: broadcast::Sender<VirtualCamStateEvent>,
) -> io::Result<VirtualCam>
where
    S: AsyncRead + Unpin,
{
    let mut codec = CapmtCodec::new();
    let mut buf = [0u8; 1024];

    info!("Starting virtual CAM task for {}", cam.id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    debug!("Virtual CAM stream closed for {}", cam.id());
                    break;
                }

                codec.push_bytes(&buf[..n]);
                while let Some(capmt) = codec.next_message() {
                    debug!(
                        "Virtual CAM {} received CAPMT ({})",
                        cam.id(),
                        capmt.list_management
                    );
                    if cam.process_capmt(&capmt) {
                        let _ = state_tx.send(VirtualCamStateEvent {
                            programs: cam.programs().to_vec(),
                            violations: cam.violations().len(),
                        });
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(VirtualCamCommand::Shutdown) | None => {
                        info!("Virtual CAM task {} shutting down", cam.id());
                        break;
                    }
                }
            }
        }
    }

    Ok(cam)
}
