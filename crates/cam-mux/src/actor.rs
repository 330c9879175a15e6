//! Descrambler Actor
//!
//! Async front-end for the descrambler: a single task owns the
//! [`Descrambler`] and processes lifecycle commands from a channel, so callers
//! never share a lock. Events produced by each command are forwarded on a
//! second channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use cam_mux::actor::{run_cam_actor, CamActorCommand};
//! use cam_mux::{Descrambler, RecordingTransport};
//! use tokio::sync::mpsc;
//!
//! let (cmd_tx, cmd_rx) = mpsc::channel(256);
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//!
//! let descrambler = Descrambler::new(RecordingTransport::new());
//! tokio::spawn(run_cam_actor(descrambler, cmd_rx, event_tx));
//! ```

use cam_protocol::{Caid, PmtSection};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::{Descrambler, RegistrySnapshot, Stats};
use crate::events::CamEvent;
use crate::state::{AdapterId, ServiceComponents, ServiceHandle};

/// Commands sent to the descrambler actor
#[derive(Debug)]
pub enum CamActorCommand {
    /// A CAM was inserted
    RegisterCam {
        /// Adapter of the CA device
        adapter: AdapterId,
        /// Slot on the CA device
        slot: u8,
        /// CAIDs reported by the CAM
        caids: Vec<Caid>,
        /// Program capacity
        max_programs: usize,
    },

    /// A CAM was removed
    UnregisterCam {
        /// Adapter of the CA device
        adapter: AdapterId,
        /// Slot on the CA device
        slot: u8,
    },

    /// Viewing of a service started
    StartService {
        /// Service handle
        service: ServiceHandle,
    },

    /// Viewing of a service stopped
    StopService {
        /// Service handle
        service: ServiceHandle,
    },

    /// A PMT section arrived
    PmtReceived {
        /// Service handle
        service: ServiceHandle,
        /// The section
        pmt: PmtSection,
        /// What the service reports about its tuner and streams
        components: ServiceComponents,
    },

    /// Query both registries
    QuerySnapshot {
        /// Channel to send back the snapshot
        response: oneshot::Sender<RegistrySnapshot>,
    },

    /// Query the counters
    QueryStats {
        /// Channel to send back the counters
        response: oneshot::Sender<Stats>,
    },

    /// Shutdown the actor
    Shutdown,
}

/// Run the descrambler actor until `Shutdown` or until every sender is dropped
///
/// Returns the descrambler so its final state can be inspected.
pub async fn run_cam_actor(
    mut descrambler: Descrambler,
    mut cmd_rx: mpsc::Receiver<CamActorCommand>,
    event_tx: mpsc::Sender<CamEvent>,
) -> Descrambler {
    info!("Descrambler actor started");

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            CamActorCommand::RegisterCam {
                adapter,
                slot,
                caids,
                max_programs,
            } => {
                descrambler.register_cam(adapter, slot, &caids, max_programs);
            }

            CamActorCommand::UnregisterCam { adapter, slot } => {
                descrambler.unregister_cam(adapter, slot);
            }

            CamActorCommand::StartService { service } => {
                descrambler.start_service(service);
            }

            CamActorCommand::StopService { service } => {
                descrambler.stop_service(service);
            }

            CamActorCommand::PmtReceived {
                service,
                pmt,
                components,
            } => {
                descrambler.on_pmt(service, pmt, &components);
            }

            CamActorCommand::QuerySnapshot { response } => {
                let _ = response.send(descrambler.snapshot());
            }

            CamActorCommand::QueryStats { response } => {
                let _ = response.send(descrambler.stats());
            }

            CamActorCommand::Shutdown => {
                info!("Descrambler actor shutting down");
                break;
            }
        }

        for event in descrambler.drain_events() {
            if event_tx.send(event).await.is_err() {
                debug!("event receiver dropped");
                break;
            }
        }
    }

    descrambler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CamKey, ElementaryStream};
    use crate::transport::RecordingTransport;
    use cam_protocol::pmt::build_pmt_section;
    use cam_protocol::ListManagement;

    fn components() -> ServiceComponents {
        ServiceComponents::new(
            AdapterId(0),
            vec![ElementaryStream {
                pid: 0x0100,
                stream_type: 0x02,
                caids: vec![0x0100],
            }],
        )
    }

    #[tokio::test]
    async fn test_register_and_descramble() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let recorder = RecordingTransport::new();

        let actor_handle = tokio::spawn(run_cam_actor(
            Descrambler::new(recorder.clone()),
            cmd_rx,
            event_tx,
        ));

        cmd_tx
            .send(CamActorCommand::RegisterCam {
                adapter: AdapterId(0),
                slot: 0,
                caids: vec![0x0100],
                max_programs: 2,
            })
            .await
            .unwrap();
        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, CamEvent::CamRegistered { max_programs: 2, .. }));

        cmd_tx
            .send(CamActorCommand::StartService {
                service: ServiceHandle(1),
            })
            .await
            .unwrap();
        cmd_tx
            .send(CamActorCommand::PmtReceived {
                service: ServiceHandle(1),
                pmt: build_pmt_section(1, &[(0x02, 0x0100, &[0x0100])]).unwrap(),
                components: components(),
            })
            .await
            .unwrap();

        let mut sent = None;
        while let Some(event) = event_rx.recv().await {
            if let CamEvent::CapmtSent {
                list_management, ..
            } = event
            {
                sent = Some(list_management);
                break;
            }
        }
        assert_eq!(sent, Some(ListManagement::Only));
        assert_eq!(recorder.frames().len(), 1);

        cmd_tx.send(CamActorCommand::Shutdown).await.unwrap();
        let descrambler = actor_handle.await.unwrap();
        assert_eq!(descrambler.stats().capmt_sent, 1);
    }

    #[tokio::test]
    async fn test_query_snapshot() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = mpsc::channel(16);

        let actor_handle = tokio::spawn(run_cam_actor(
            Descrambler::new(RecordingTransport::new()),
            cmd_rx,
            event_tx,
        ));

        cmd_tx
            .send(CamActorCommand::RegisterCam {
                adapter: AdapterId(1),
                slot: 2,
                caids: vec![0x0500],
                max_programs: 1,
            })
            .await
            .unwrap();

        let (resp_tx, resp_rx) = oneshot::channel();
        cmd_tx
            .send(CamActorCommand::QuerySnapshot { response: resp_tx })
            .await
            .unwrap();
        let snapshot = resp_rx.await.unwrap();
        assert_eq!(snapshot.cams[0].key, CamKey::new(AdapterId(1), 2));

        let (resp_tx, resp_rx) = oneshot::channel();
        cmd_tx
            .send(CamActorCommand::QueryStats { response: resp_tx })
            .await
            .unwrap();
        assert_eq!(resp_rx.await.unwrap(), Stats::default());

        drop(cmd_tx);
        let descrambler = actor_handle.await.unwrap();
        assert_eq!(descrambler.cams().len(), 1);
    }
}
