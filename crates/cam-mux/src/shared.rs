//! Thread-safe handle to a [`Descrambler`]
//!
//! Lifecycle callbacks arrive from several threads (CA device hotplug, tuner
//! start/stop, the PMT demuxer). Every call takes one lock for its whole
//! duration, transport I/O included.

use std::sync::{Arc, Mutex, MutexGuard};

use cam_protocol::{Caid, PmtSection};
use tracing::warn;

use crate::engine::{Descrambler, RegistrySnapshot, Stats};
use crate::events::CamEvent;
use crate::state::{AdapterId, ServiceComponents, ServiceHandle};

/// Cloneable handle; clones share the same descrambler
#[derive(Debug, Clone)]
pub struct SharedDescrambler {
    inner: Arc<Mutex<Descrambler>>,
}

impl SharedDescrambler {
    /// Wrap a descrambler
    pub fn new(descrambler: Descrambler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(descrambler)),
        }
    }

    /// Take the lock, recovering it if a previous holder panicked
    pub fn lock(&self) -> MutexGuard<'_, Descrambler> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("descrambler lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// See [`Descrambler::register_cam`]
    pub fn register_cam(&self, adapter: AdapterId, slot: u8, caids: &[Caid], max_programs: usize) {
        self.lock().register_cam(adapter, slot, caids, max_programs);
    }

    /// See [`Descrambler::unregister_cam`]
    pub fn unregister_cam(&self, adapter: AdapterId, slot: u8) {
        self.lock().unregister_cam(adapter, slot);
    }

    /// See [`Descrambler::start_service`]
    pub fn start_service(&self, service: ServiceHandle) {
        self.lock().start_service(service);
    }

    /// See [`Descrambler::stop_service`]
    pub fn stop_service(&self, service: ServiceHandle) {
        self.lock().stop_service(service);
    }

    /// See [`Descrambler::on_pmt`]
    pub fn on_pmt(&self, service: ServiceHandle, pmt: PmtSection, components: &ServiceComponents) {
        self.lock().on_pmt(service, pmt, components);
    }

    /// See [`Descrambler::snapshot`]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.lock().snapshot()
    }

    /// See [`Descrambler::stats`]
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// See [`Descrambler::drain_events`]
    pub fn drain_events(&self) -> Vec<CamEvent> {
        self.lock().drain_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CamKey, ElementaryStream};
    use crate::transport::RecordingTransport;
    use cam_protocol::pmt::build_pmt_section;
    use std::thread;

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

    #[test]
    fn test_concurrent_callbacks_keep_counters_consistent() {
        let recorder = RecordingTransport::new();
        let shared = SharedDescrambler::new(Descrambler::new(recorder.clone()));
        shared.register_cam(AdapterId(0), 0, &[0x0100], 4);

        let workers: Vec<_> = (1..=8u32)
            .map(|h| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let service = ServiceHandle(h);
                    shared.start_service(service);
                    shared.on_pmt(
                        service,
                        build_pmt_section(h as u16, &[(0x02, 0x0100, &[0x0100])]).unwrap(),
                        &components(),
                    );
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let snap = shared.snapshot();
        let slot = &snap.cams[0];
        assert_eq!(slot.key, CamKey::new(AdapterId(0), 0));
        assert_eq!(slot.active_programs, 4);
        // The fifth program is refused as an ADD; each later one forces a
        // resend that drops everything past the first four again
        assert_eq!(snap.stats.capacity_exceeded, 1 + 2 + 3 + 4);
        assert_eq!(snap.services.len(), 8);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let shared = SharedDescrambler::new(Descrambler::new(RecordingTransport::new()));
        let poisoner = shared.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison");
        })
        .join();

        shared.start_service(ServiceHandle(1));
        assert_eq!(shared.snapshot().services.len(), 1);
    }
}
