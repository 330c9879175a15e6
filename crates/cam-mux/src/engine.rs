//! Descrambling engine
//!
//! [`Descrambler`] owns the CAM registry and the service registry and is the
//! only thing that mutates either. When a PMT arrives it matches the service
//! to a CAM by CAID and decides which CAPMT messages to send:
//!
//! - the first program on a slot goes out as ONLY
//! - one more program on an up-to-date slot goes out as ADD
//! - anything else resends the whole slot as FIRST, MORE..., LAST
//!
//! CAMs reject batches that are not bracketed this way, and ADD is only valid
//! as an exact +1 step on top of what the CAM already holds.

use std::collections::VecDeque;
use std::fmt;

use cam_protocol::{Caid, Capmt, CapmtCommand, EncodeMessage, ListManagement, PmtSection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::MuxError;
use crate::events::CamEvent;
use crate::registry::{CamRegistry, ServiceRegistry};
use crate::state::{
    AdapterId, CamKey, CamSlot, ServiceComponents, ServiceHandle, WatchedService,
    MAX_CAIDS_PER_SLOT,
};
use crate::transport::CapmtTransport;

/// Descrambler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescramblerConfig {
    /// Log both registries at trace level after every mutation
    pub dump_after_mutation: bool,
    /// Events kept until drained; the oldest are dropped beyond this
    pub max_buffered_events: usize,
}

impl Default for DescramblerConfig {
    fn default() -> Self {
        Self {
            dump_after_mutation: true,
            max_buffered_events: 1024,
        }
    }
}

/// Counters for conditions that are otherwise only logged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// CAPMTs accepted by the transport
    pub capmt_sent: u64,
    /// Programs not sent because their CAM was full
    pub capacity_exceeded: u64,
    /// PMTs for which no CAM matched
    pub no_cam_available: u64,
    /// PMTs for services that were never started
    pub service_not_found: u64,
    /// CAPMTs the transport refused
    pub transport_failures: u64,
}

/// A watched service as shown in the diagnostic dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    /// Service handle
    pub service: ServiceHandle,
    /// Length of the stored PMT frame
    pub pmt_len: Option<usize>,
    /// Program number from the stored PMT
    pub program_number: Option<u16>,
    /// Assigned CAM
    pub assigned_slot: Option<CamKey>,
}

impl From<&WatchedService> for ServiceSnapshot {
    fn from(s: &WatchedService) -> Self {
        Self {
            service: s.handle,
            pmt_len: s.last_pmt.as_ref().map(PmtSection::len),
            program_number: s.last_pmt.as_ref().and_then(PmtSection::program_number),
            assigned_slot: s.assigned_slot,
        }
    }
}

/// Point-in-time copy of both registries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// CAM slots in registration order
    pub cams: Vec<CamSlot>,
    /// Services in start order
    pub services: Vec<ServiceSnapshot>,
    /// Counters
    pub stats: Stats,
}

/// List-management tag for position `index` in a resend of `total` programs
pub fn batch_position(index: usize, total: usize) -> ListManagement {
    if total == 1 {
        ListManagement::Only
    } else if index == 0 {
        ListManagement::First
    } else if index + 1 == total {
        ListManagement::Last
    } else {
        ListManagement::More
    }
}

/// The CAM/service manager
pub struct Descrambler {
    config: DescramblerConfig,
    cams: CamRegistry,
    services: ServiceRegistry,
    transport: Box<dyn CapmtTransport>,
    stats: Stats,
    event_buffer: VecDeque<CamEvent>,
}

impl fmt::Debug for Descrambler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descrambler")
            .field("config", &self.config)
            .field("cams", &self.cams)
            .field("services", &self.services)
            .field("transport", &"<transport>")
            .field("stats", &self.stats)
            .finish()
    }
}

impl Descrambler {
    /// Create a descrambler with default configuration
    pub fn new(transport: impl CapmtTransport + 'static) -> Self {
        Self::with_config(DescramblerConfig::default(), transport)
    }

    /// Create with custom configuration
    pub fn with_config(config: DescramblerConfig, transport: impl CapmtTransport + 'static) -> Self {
        Self {
            config,
            cams: CamRegistry::new(),
            services: ServiceRegistry::new(),
            transport: Box::new(transport),
            stats: Stats::default(),
            event_buffer: VecDeque::new(),
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &DescramblerConfig {
        &self.config
    }

    /// Registered CAMs
    pub fn cams(&self) -> &CamRegistry {
        &self.cams
    }

    /// Watched services
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Counters
    pub fn stats(&self) -> Stats {
        self.stats
    }

    // -------------------------------------------------------------------------
    // CAM lifecycle
    // -------------------------------------------------------------------------

    /// A CAM was inserted into `slot` of `adapter`
    pub fn register_cam(
        &mut self,
        adapter: AdapterId,
        slot: u8,
        caids: &[Caid],
        max_programs: usize,
    ) {
        let cam = CamKey::new(adapter, slot);
        info!(
            "Registering CAM {} ({} CAIDs, max {} programs)",
            cam,
            caids.len(),
            max_programs
        );
        if caids.len() > MAX_CAIDS_PER_SLOT {
            debug!(
                "CAM {} reports {} CAIDs, keeping the first {}",
                cam,
                caids.len(),
                MAX_CAIDS_PER_SLOT
            );
        }

        let entry = CamSlot::new(cam, caids, max_programs);
        let kept = entry.caids.clone();
        match self.cams.register(entry) {
            Ok(()) => self.push_event(CamEvent::CamRegistered {
                cam,
                caids: kept,
                max_programs,
            }),
            Err(e) => self.report(e),
        }
        self.after_mutation();
    }

    /// The CAM in `slot` of `adapter` went away
    pub fn unregister_cam(&mut self, adapter: AdapterId, slot: u8) {
        let cam = CamKey::new(adapter, slot);
        info!("Unregistering CAM {}", cam);

        let orphaned = self.services.clear_assignments(cam);
        let removed = self.cams.remove(cam);
        if !orphaned.is_empty() {
            debug!("{} services lost CAM {}", orphaned.len(), cam);
        }

        self.push_event(CamEvent::CamUnregistered {
            cam,
            removed,
            orphaned,
        });
        self.after_mutation();
    }

    // -------------------------------------------------------------------------
    // Service lifecycle
    // -------------------------------------------------------------------------

    /// Viewing of `service` started; starting twice is a no-op
    pub fn start_service(&mut self, service: ServiceHandle) {
        match self.services.start(service) {
            Ok(true) => {
                info!("Started service {}", service);
                self.push_event(CamEvent::ServiceStarted { service });
            }
            Ok(false) => {
                debug!("Service {} already started", service);
                return;
            }
            Err(e) => self.report(e),
        }
        self.after_mutation();
    }

    /// Viewing of `service` stopped
    ///
    /// If a CAM was descrambling it, the CAM is told to deselect the program
    /// and the slot is flagged for a full resend: dropping a program shifts the
    /// positions the CAM holds, so the next change cannot be a plain ADD.
    pub fn stop_service(&mut self, service: ServiceHandle) {
        let Some(entry) = self.services.remove(service) else {
            trace!("stop for unknown service {}", service);
            return;
        };
        info!("Stopped service {}", service);

        let cam = entry.assigned_slot;
        if let (Some(cam), Some(pmt)) = (entry.assigned_slot, entry.last_pmt) {
            let removal = Capmt::new(ListManagement::Add, CapmtCommand::NotSelected, pmt);
            if let Err(e) = self.deliver(service, cam, removal) {
                self.report(e);
            }
            self.cams.update(cam, |s| {
                s.active_programs = s.active_programs.saturating_sub(1);
                s.needs_full_resend = true;
            });
        }

        self.push_event(CamEvent::ServiceStopped { service, cam });
        self.after_mutation();
    }

    // -------------------------------------------------------------------------
    // PMT handling
    // -------------------------------------------------------------------------

    /// A PMT section arrived for `service`
    ///
    /// `components` is what the service object currently reports: the adapter
    /// of its tuner and the CAIDs of each elementary stream.
    pub fn on_pmt(&mut self, service: ServiceHandle, pmt: PmtSection, components: &ServiceComponents) {
        let Some(adapter) = components.adapter else {
            debug!("Service {} has no active input, ignoring PMT", service);
            return;
        };

        if let Err(e) = self.process_pmt(service, pmt, adapter, components) {
            self.report(e);
        }
        self.after_mutation();
    }

    fn process_pmt(
        &mut self,
        service: ServiceHandle,
        pmt: PmtSection,
        adapter: AdapterId,
        components: &ServiceComponents,
    ) -> Result<(), MuxError> {
        let entry = self
            .services
            .get_mut(service)
            .ok_or(MuxError::ServiceNotFound(service))?;
        let is_update = entry.last_pmt.replace(pmt).is_some();
        let assigned = entry.assigned_slot;

        if let (true, Some(cam)) = (is_update, assigned) {
            match self.cams.get(cam).map(|s| s.needs_full_resend) {
                Some(false) => {
                    debug!("PMT update for service {} on {}", service, cam);
                    return self.transmit(
                        service,
                        cam,
                        ListManagement::Update,
                        CapmtCommand::OkDescrambling,
                    );
                }
                Some(true) => {
                    debug!("Resend pending on {}, rebuilding its program list", cam);
                    return self.emit_for_slot(service, cam);
                }
                None => {}
            }
        }

        if let Some(entry) = self.services.get_mut(service) {
            entry.assigned_slot = None;
        }

        let cam = components
            .caids()
            .find_map(|caid| self.cams.find_by_caid(adapter, caid))
            .ok_or(MuxError::NoCamAvailable(service))?;

        if let Some(entry) = self.services.get_mut(service) {
            entry.assigned_slot = Some(cam);
        }
        debug!("Service {} assigned to CAM {}", service, cam);
        self.push_event(CamEvent::CamAssigned { service, cam });

        self.emit_for_slot(service, cam)
    }

    /// Decide between ONLY, ADD and a full resend for a slot that just gained `service`
    fn emit_for_slot(&mut self, service: ServiceHandle, cam: CamKey) -> Result<(), MuxError> {
        let n = self.services.count_assigned(cam);
        let Some(slot) = self.cams.get(cam) else {
            return Ok(());
        };
        let (active, max, resend, has_room) = (
            slot.active_programs,
            slot.max_programs,
            slot.needs_full_resend,
            slot.has_capacity(),
        );
        trace!("found {} programs assigned to {}", n, cam);

        if n == 1 {
            if max == 0 {
                self.capacity_exceeded(service, cam, max);
                return Ok(());
            }
            self.cams.update(cam, |s| {
                s.active_programs = 1;
                s.needs_full_resend = false;
            });
            self.transmit(
                service,
                cam,
                ListManagement::Only,
                CapmtCommand::OkDescrambling,
            )
        } else if active + 1 == n && !resend {
            if !has_room {
                self.capacity_exceeded(service, cam, max);
                return Ok(());
            }
            self.transmit(
                service,
                cam,
                ListManagement::Add,
                CapmtCommand::OkDescrambling,
            )?;
            self.cams.update(cam, |s| s.active_programs += 1);
            Ok(())
        } else {
            self.resend_all(cam, max)
        }
    }

    /// Send every program on `cam` as one FIRST..LAST batch, up to `max` programs
    fn resend_all(&mut self, cam: CamKey, max: usize) -> Result<(), MuxError> {
        let assigned: Vec<ServiceHandle> = self
            .services
            .assigned_to(cam)
            .filter(|s| s.last_pmt.is_some())
            .map(|s| s.handle)
            .collect();
        let total = assigned.len().min(max);
        let (batch, dropped) = assigned.split_at(total);

        let mut sent = 0;
        let mut failure = None;
        for (i, &service) in batch.iter().enumerate() {
            let position = batch_position(i, total);
            match self.transmit(service, cam, position, CapmtCommand::OkDescrambling) {
                Ok(()) => sent += 1,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
            trace!("CAPMT ({}) {} / {}", position, i + 1, assigned.len());
        }

        for &service in dropped {
            self.capacity_exceeded(service, cam, max);
        }

        let failed = failure.is_some();
        self.cams.update(cam, |s| {
            s.active_programs = sent;
            s.needs_full_resend = failed;
        });

        failure.map_or(Ok(()), Err)
    }

    /// Wrap the stored PMT of `service` and deliver it
    fn transmit(
        &mut self,
        service: ServiceHandle,
        cam: CamKey,
        list_management: ListManagement,
        command: CapmtCommand,
    ) -> Result<(), MuxError> {
        let Some(pmt) = self
            .services
            .get(service)
            .and_then(|s| s.last_pmt.clone())
        else {
            return Ok(());
        };
        self.deliver(service, cam, Capmt::new(list_management, command, pmt))
    }

    fn deliver(&mut self, service: ServiceHandle, cam: CamKey, capmt: Capmt) -> Result<(), MuxError> {
        match self.transport.send_capmt(cam, &capmt) {
            Ok(()) => {
                debug!(
                    "CAPMT sent to CAM {} ({}) for service {}",
                    cam, capmt.list_management, service
                );
                self.stats.capmt_sent += 1;
                self.push_event(CamEvent::CapmtSent {
                    cam,
                    service,
                    list_management: capmt.list_management,
                    command: capmt.command,
                    data: capmt.encode(),
                });
                Ok(())
            }
            Err(source) => {
                warn!("CAPMT to CAM {} failed: {}", cam, source);
                self.stats.transport_failures += 1;
                self.push_event(CamEvent::TransportFailed {
                    cam,
                    service,
                    message: source.to_string(),
                });
                // The CAM's view is now unknown; rebuild it on the next change
                self.cams.update(cam, |s| s.needs_full_resend = true);
                Err(MuxError::Transport { cam, source })
            }
        }
    }

    fn capacity_exceeded(&mut self, service: ServiceHandle, cam: CamKey, max_programs: usize) {
        warn!(
            "CAM {} is full ({} programs), service {} not sent",
            cam, max_programs, service
        );
        self.stats.capacity_exceeded += 1;
        self.push_event(CamEvent::CapacityExceeded {
            cam,
            service,
            max_programs,
        });
    }

    /// Log and record a non-fatal failure
    fn report(&mut self, err: MuxError) {
        match err {
            MuxError::ServiceNotFound(service) => {
                trace!("cannot find active service entry for {}", service);
                self.stats.service_not_found += 1;
                self.push_event(CamEvent::ServiceNotFound { service });
            }
            MuxError::NoCamAvailable(service) => {
                trace!("cannot find active CAM entry for {}", service);
                self.stats.no_cam_available += 1;
                self.push_event(CamEvent::NoCamAvailable { service });
            }
            MuxError::Transport { .. } => debug!("{}", err),
            MuxError::ResourceExhausted(_) => warn!("{}", err),
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    fn push_event(&mut self, event: CamEvent) {
        if self.config.max_buffered_events == 0 {
            return;
        }
        if self.event_buffer.len() >= self.config.max_buffered_events {
            self.event_buffer.pop_front();
        }
        self.event_buffer.push_back(event);
    }

    /// Drain pending events
    pub fn drain_events(&mut self) -> Vec<CamEvent> {
        self.event_buffer.drain(..).collect()
    }

    fn after_mutation(&self) {
        if self.config.dump_after_mutation {
            self.dump();
        }
    }

    /// Log both registries at trace level
    pub fn dump(&self) {
        trace!("active services:");
        for s in self.services.iter() {
            trace!(
                "service {} cam {:?} last_pmt_len {:?}",
                s.handle,
                s.assigned_slot.map(|k| k.to_string()),
                s.last_pmt.as_ref().map(PmtSection::len)
            );
        }
        trace!("active cams:");
        for c in self.cams.iter() {
            trace!(
                "cam {} num_caids {} active_prog {} max_prog {} resend {}",
                c.key,
                c.caids.len(),
                c.active_programs,
                c.max_programs,
                c.needs_full_resend
            );
        }
    }

    /// Copy both registries for inspection
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            cams: self.cams.iter().cloned().collect(),
            services: self.services.iter().map(ServiceSnapshot::from).collect(),
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ElementaryStream;
    use crate::transport::RecordingTransport;
    use cam_protocol::pmt::build_pmt_section;

    const CAID: Caid = 0x0100;

    fn setup() -> (Descrambler, RecordingTransport) {
        let recorder = RecordingTransport::new();
        (Descrambler::new(recorder.clone()), recorder)
    }

    fn components(caid: Caid) -> ServiceComponents {
        ServiceComponents::new(
            AdapterId(0),
            vec![ElementaryStream {
                pid: 0x0100,
                stream_type: 0x02,
                caids: vec![caid],
            }],
        )
    }

    fn pmt(program: u16) -> PmtSection {
        build_pmt_section(program, &[(0x02, 0x0100, &[CAID])]).unwrap()
    }

    fn tags(recorder: &RecordingTransport) -> Vec<ListManagement> {
        recorder
            .take_frames()
            .into_iter()
            .map(|f| f.capmt.list_management)
            .collect()
    }

    #[test]
    fn test_batch_position() {
        assert_eq!(batch_position(0, 1), ListManagement::Only);
        assert_eq!(batch_position(0, 3), ListManagement::First);
        assert_eq!(batch_position(1, 3), ListManagement::More);
        assert_eq!(batch_position(2, 3), ListManagement::Last);
        assert_eq!(batch_position(1, 2), ListManagement::Last);
    }

    #[test]
    fn test_first_pmt_sends_only() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));

        assert_eq!(tags(&rec), vec![ListManagement::Only]);
        let slot = d.cams().get(CamKey::new(AdapterId(0), 0)).unwrap();
        assert_eq!(slot.active_programs, 1);
        assert!(!slot.needs_full_resend);
    }

    #[test]
    fn test_pmt_update_sends_update_only() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));
        rec.take_frames();

        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));
        let frames = rec.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].capmt.list_management, ListManagement::Update);
        assert_eq!(frames[0].capmt.command, CapmtCommand::OkDescrambling);
    }

    #[test]
    fn test_pmt_for_unknown_service_is_reported() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 2);
        d.drain_events();

        d.on_pmt(ServiceHandle(9), pmt(9), &components(CAID));
        assert!(rec.frames().is_empty());
        assert_eq!(
            d.drain_events(),
            vec![CamEvent::ServiceNotFound {
                service: ServiceHandle(9)
            }]
        );
        assert_eq!(d.stats().service_not_found, 1);
    }

    #[test]
    fn test_no_matching_cam() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[0x0500], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));

        assert!(rec.frames().is_empty());
        assert_eq!(d.stats().no_cam_available, 1);
        assert_eq!(d.services().get(ServiceHandle(1)).unwrap().assigned_slot, None);
    }

    #[test]
    fn test_cam_on_other_adapter_not_matched() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(1), 0, &[CAID], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));
        assert!(rec.frames().is_empty());
        assert_eq!(d.stats().no_cam_available, 1);
    }

    #[test]
    fn test_missing_adapter_ignores_pmt() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &ServiceComponents::default());

        assert!(rec.frames().is_empty());
        assert!(d.services().get(ServiceHandle(1)).unwrap().last_pmt.is_none());
    }

    #[test]
    fn test_zero_capacity_cam_sends_nothing() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 0);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));

        assert!(rec.frames().is_empty());
        assert_eq!(d.stats().capacity_exceeded, 1);
        assert_eq!(d.cams().get(CamKey::new(AdapterId(0), 0)).unwrap().active_programs, 0);
    }

    #[test]
    fn test_transport_failure_forces_resend() {
        let (mut d, rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 4);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(1), &components(CAID));

        rec.set_failing(true);
        d.start_service(ServiceHandle(2));
        d.on_pmt(ServiceHandle(2), pmt(2), &components(CAID));
        let cam = CamKey::new(AdapterId(0), 0);
        assert!(d.cams().get(cam).unwrap().needs_full_resend);
        assert_eq!(d.stats().transport_failures, 1);

        rec.set_failing(false);
        rec.take_frames();
        d.start_service(ServiceHandle(3));
        d.on_pmt(ServiceHandle(3), pmt(3), &components(CAID));
        assert_eq!(
            tags(&rec),
            vec![ListManagement::First, ListManagement::More, ListManagement::Last]
        );
        assert_eq!(d.cams().get(cam).unwrap().active_programs, 3);
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let config = DescramblerConfig {
            max_buffered_events: 2,
            ..Default::default()
        };
        let mut d = Descrambler::with_config(config, RecordingTransport::new());
        for h in 1..=5 {
            d.start_service(ServiceHandle(h));
        }
        let events = d.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].service(), Some(ServiceHandle(5)));
    }

    #[test]
    fn test_snapshot_reflects_registries() {
        let (mut d, _rec) = setup();
        d.register_cam(AdapterId(0), 0, &[CAID], 2);
        d.start_service(ServiceHandle(1));
        d.on_pmt(ServiceHandle(1), pmt(0x42), &components(CAID));

        let snap = d.snapshot();
        assert_eq!(snap.cams.len(), 1);
        assert_eq!(snap.services[0].program_number, Some(0x42));
        assert_eq!(
            snap.services[0].assigned_slot,
            Some(CamKey::new(AdapterId(0), 0))
        );
        assert_eq!(snap.stats.capmt_sent, 1);
    }
}
