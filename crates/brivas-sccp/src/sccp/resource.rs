//! Local subsystems and the users attached to them
//!
//! Every registered SSN owns a bounded delivery queue drained by its own
//! task, so a slow user only holds up its own traffic.

use super::address::SccpAddress;
use super::status::{SignalingPointState, SubsystemState};
use crate::errors::{Result, ReturnCause, SccpError};
use crate::types::{PointCode, ProtocolClass, Sls};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local subsystem state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocalSubsystemState {
    InService,
    OutOfService,
}

/// N-UNITDATA indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIndication {
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub protocol_class: ProtocolClass,
    pub data: Bytes,
    /// Originating point code
    pub opc: PointCode,
    pub sls: Sls,
}

/// N-STATE / N-PCSTATE indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateIndication {
    Subsystem {
        point_code: PointCode,
        ssn: u8,
        state: SubsystemState,
    },
    PointCode {
        point_code: PointCode,
        state: SignalingPointState,
        congestion_level: u8,
    },
}

/// N-NOTICE indication: a message sent by this user came back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeIndication {
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub return_cause: ReturnCause,
    pub data: Bytes,
}

/// Upper layer user of a local subsystem (TCAP and the like)
#[async_trait]
pub trait SccpUser: Send + Sync {
    async fn on_data(&self, indication: DataIndication);

    async fn on_state(&self, _indication: StateIndication) {}

    async fn on_notice(&self, _indication: NoticeIndication) {}
}

/// Published on every local state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    LocalStateChanged { ssn: u8, state: LocalSubsystemState },
}

/// Data dequeued for a subsystem that went out of service
#[derive(Debug, Clone)]
pub struct RerouteRequest {
    pub ssn: u8,
    pub indication: DataIndication,
}

/// Local subsystem interested in the state of a remote entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concern {
    pub local_ssn: u8,
    pub remote_pc: PointCode,
    /// `None` means only the signalling point itself
    pub remote_ssn: Option<u8>,
}

/// Concerned subsystem relation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcernTable {
    pub concerns: Vec<Concern>,
}

impl ConcernTable {
    pub fn new(concerns: Vec<Concern>) -> Self {
        Self { concerns }
    }

    /// Local SSNs concerned with remote subsystem (`pc`, `ssn`)
    pub fn concerned_with_subsystem(&self, pc: PointCode, ssn: u8) -> Vec<u8> {
        self.collect(|c| c.remote_pc == pc && c.remote_ssn.map_or(true, |s| s == ssn))
    }

    /// Local SSNs concerned with anything at `pc`
    pub fn concerned_with_point(&self, pc: PointCode) -> Vec<u8> {
        self.collect(|c| c.remote_pc == pc)
    }

    /// Remote point codes to inform about `local_ssn`
    pub fn remote_points_for(&self, local_ssn: u8) -> Vec<PointCode> {
        let mut points: Vec<PointCode> = self
            .concerns
            .iter()
            .filter(|c| c.local_ssn == local_ssn)
            .map(|c| c.remote_pc)
            .collect();
        points.sort();
        points.dedup();
        points
    }

    fn collect(&self, predicate: impl Fn(&Concern) -> bool) -> Vec<u8> {
        let mut ssns: Vec<u8> = self
            .concerns
            .iter()
            .filter(|c| predicate(c))
            .map(|c| c.local_ssn)
            .collect();
        ssns.sort_unstable();
        ssns.dedup();
        ssns
    }
}

enum Delivery {
    Data(DataIndication),
    State(StateIndication),
    Notice(NoticeIndication),
}

struct LocalSubsystem {
    state: Arc<Mutex<LocalSubsystemState>>,
    tx: mpsc::Sender<Delivery>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of local subsystems
pub struct SubsystemResource {
    local_point_code: PointCode,
    subsystems: DashMap<u8, Arc<LocalSubsystem>>,
    concerns: ArcSwap<ConcernTable>,
    events: broadcast::Sender<ResourceEvent>,
    reroute: mpsc::Sender<RerouteRequest>,
    queue_capacity: usize,
    drain_timeout: Duration,
}

impl SubsystemResource {
    pub fn new(
        local_point_code: PointCode,
        queue_capacity: usize,
        drain_timeout: Duration,
        event_capacity: usize,
        reroute: mpsc::Sender<RerouteRequest>,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            local_point_code,
            subsystems: DashMap::new(),
            concerns: ArcSwap::from_pointee(ConcernTable::default()),
            events,
            reroute,
            queue_capacity: queue_capacity.max(1),
            drain_timeout,
        }
    }

    /// Local state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Attach `handler` to `ssn`. The subsystem starts in service.
    pub fn register_local_subsystem(&self, ssn: u8, handler: Arc<dyn SccpUser>) -> Result<()> {
        match self.subsystems.entry(ssn) {
            Entry::Occupied(_) => Err(SccpError::AlreadyRegistered(ssn)),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(self.queue_capacity);
                let state = Arc::new(Mutex::new(LocalSubsystemState::InService));
                let task = tokio::spawn(run_delivery(
                    ssn,
                    handler,
                    rx,
                    state.clone(),
                    self.reroute.clone(),
                ));
                vacant.insert(Arc::new(LocalSubsystem {
                    state,
                    tx,
                    task: Mutex::new(Some(task)),
                }));

                info!(ssn, "Local subsystem registered");
                self.publish(ssn, LocalSubsystemState::InService);
                Ok(())
            }
        }
    }

    /// Detach the user of `ssn`, waiting up to the drain timeout for
    /// queued indications to be delivered.
    pub async fn unregister_local_subsystem(&self, ssn: u8) -> Result<()> {
        let (_, subsystem) = self.subsystems.remove(&ssn).ok_or(SccpError::NotFound(ssn))?;
        self.publish(ssn, LocalSubsystemState::OutOfService);

        let task = subsystem.task.lock().take();
        // Closing the queue lets the delivery task finish once drained
        drop(subsystem);

        if let Some(mut task) = task {
            if tokio::time::timeout(self.drain_timeout, &mut task).await.is_err() {
                warn!(ssn, "Delivery queue not drained in time, aborting");
                task.abort();
            }
        }

        info!(ssn, "Local subsystem unregistered");
        Ok(())
    }

    /// Unregister every local subsystem
    pub async fn unregister_all(&self) {
        let ssns: Vec<u8> = self.subsystems.iter().map(|entry| *entry.key()).collect();
        for ssn in ssns {
            let _ = self.unregister_local_subsystem(ssn).await;
        }
    }

    pub fn set_subsystem_state(&self, ssn: u8, state: LocalSubsystemState) -> Result<()> {
        let subsystem = self.get(ssn).ok_or(SccpError::NotFound(ssn))?;
        let changed = {
            let mut current = subsystem.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            info!(ssn, ?state, "Local subsystem state changed");
            self.publish(ssn, state);
        }
        Ok(())
    }

    /// Registered and in service
    pub fn is_locally_available(&self, ssn: u8) -> bool {
        self.state(ssn) == Some(LocalSubsystemState::InService)
    }

    pub fn state(&self, ssn: u8) -> Option<LocalSubsystemState> {
        self.get(ssn).map(|subsystem| *subsystem.state.lock())
    }

    pub fn is_registered(&self, ssn: u8) -> bool {
        self.subsystems.contains_key(&ssn)
    }

    /// Registered SSNs and their state
    pub fn registered(&self) -> Vec<(u8, LocalSubsystemState)> {
        let mut list: Vec<(u8, LocalSubsystemState)> = self
            .subsystems
            .iter()
            .map(|entry| (*entry.key(), *entry.value().state.lock()))
            .collect();
        list.sort_unstable_by_key(|(ssn, _)| *ssn);
        list
    }

    /// Queue data for an in-service local subsystem
    pub fn deliver_data(&self, ssn: u8, indication: DataIndication) -> Result<()> {
        if !self.is_locally_available(ssn) {
            return Err(SccpError::SubsystemNotAvailable {
                point_code: self.local_point_code,
                ssn,
            });
        }
        self.enqueue(ssn, Delivery::Data(indication))
    }

    pub fn deliver_notice(&self, ssn: u8, indication: NoticeIndication) -> Result<()> {
        self.enqueue(ssn, Delivery::Notice(indication))
    }

    /// Hand a state indication to each of `ssns`; unreachable users are skipped
    pub fn notify_state(&self, ssns: &[u8], indication: &StateIndication) {
        for &ssn in ssns {
            if let Err(e) = self.enqueue(ssn, Delivery::State(indication.clone())) {
                debug!(ssn, error = %e, "State indication not delivered");
            }
        }
    }

    fn enqueue(&self, ssn: u8, delivery: Delivery) -> Result<()> {
        let subsystem = self.get(ssn).ok_or(SccpError::SubsystemNotAvailable {
            point_code: self.local_point_code,
            ssn,
        })?;
        subsystem.tx.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                metrics::counter!("sccp_delivery_congested").increment(1);
                SccpError::SubsystemCongested(ssn)
            }
            mpsc::error::TrySendError::Closed(_) => SccpError::SubsystemNotAvailable {
                point_code: self.local_point_code,
                ssn,
            },
        })
    }

    /// Concerned subsystem relation in use
    pub fn concerns(&self) -> Arc<ConcernTable> {
        self.concerns.load_full()
    }

    pub fn reload_concerns(&self, table: ConcernTable) {
        info!(count = table.concerns.len(), "Concerned subsystems reloaded");
        self.concerns.store(Arc::new(table));
    }

    fn get(&self, ssn: u8) -> Option<Arc<LocalSubsystem>> {
        self.subsystems.get(&ssn).map(|entry| entry.value().clone())
    }

    fn publish(&self, ssn: u8, state: LocalSubsystemState) {
        // No subscribers is not an error
        let _ = self.events.send(ResourceEvent::LocalStateChanged { ssn, state });
    }
}

async fn run_delivery(
    ssn: u8,
    handler: Arc<dyn SccpUser>,
    mut rx: mpsc::Receiver<Delivery>,
    state: Arc<Mutex<LocalSubsystemState>>,
    reroute: mpsc::Sender<RerouteRequest>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Data(indication) => {
                if *state.lock() == LocalSubsystemState::OutOfService {
                    debug!(ssn, "Subsystem out of service, rerouting");
                    if reroute.try_send(RerouteRequest { ssn, indication }).is_err() {
                        warn!(ssn, "Reroute queue unavailable, message dropped");
                    }
                    continue;
                }
                handler.on_data(indication).await;
            }
            Delivery::State(indication) => handler.on_state(indication).await,
            Delivery::Notice(indication) => handler.on_notice(indication).await,
        }
    }
    debug!(ssn, "Delivery task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    struct Recorder {
        data: mpsc::UnboundedSender<DataIndication>,
        states: mpsc::UnboundedSender<StateIndication>,
    }

    #[async_trait]
    impl SccpUser for Recorder {
        async fn on_data(&self, indication: DataIndication) {
            let _ = self.data.send(indication);
        }

        async fn on_state(&self, indication: StateIndication) {
            let _ = self.states.send(indication);
        }
    }

    /// Blocks in `on_data` until a permit is released
    struct Blocking {
        started: mpsc::UnboundedSender<()>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl SccpUser for Blocking {
        async fn on_data(&self, _indication: DataIndication) {
            let _ = self.started.send(());
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn resource(capacity: usize) -> (SubsystemResource, mpsc::Receiver<RerouteRequest>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SubsystemResource::new(PointCode(1001), capacity, Duration::from_secs(1), 16, tx),
            rx,
        )
    }

    fn recorder() -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<DataIndication>,
        mpsc::UnboundedReceiver<StateIndication>,
    ) {
        let (data, data_rx) = mpsc::unbounded_channel();
        let (states, states_rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { data, states }), data_rx, states_rx)
    }

    fn indication(payload: &'static [u8]) -> DataIndication {
        DataIndication {
            called_party: SccpAddress::from_ssn_pc(8, PointCode(1001)),
            calling_party: SccpAddress::from_ssn_pc(6, PointCode(2002)),
            protocol_class: ProtocolClass::CLASS_0,
            data: Bytes::from_static(payload),
            opc: PointCode(2002),
            sls: 0,
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (resource, _) = resource(8);
        let mut events = resource.subscribe();
        let (user, _, _) = recorder();

        resource.register_local_subsystem(8, user.clone()).unwrap();
        assert_eq!(
            resource.register_local_subsystem(8, user),
            Err(SccpError::AlreadyRegistered(8))
        );
        assert!(resource.is_locally_available(8));
        assert_eq!(
            events.recv().await.unwrap(),
            ResourceEvent::LocalStateChanged { ssn: 8, state: LocalSubsystemState::InService }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_and_unregister() {
        let (resource, _) = resource(8);
        let (user, mut data, _) = recorder();
        resource.register_local_subsystem(8, user).unwrap();

        resource.deliver_data(8, indication(b"one")).unwrap();
        resource.deliver_data(8, indication(b"two")).unwrap();
        resource.unregister_local_subsystem(8).await.unwrap();

        // Queued data is drained before unregister returns
        assert_eq!(data.try_recv().unwrap().data, Bytes::from_static(b"one"));
        assert_eq!(data.try_recv().unwrap().data, Bytes::from_static(b"two"));

        assert_eq!(resource.unregister_local_subsystem(8).await, Err(SccpError::NotFound(8)));
        assert!(matches!(
            resource.deliver_data(8, indication(b"three")),
            Err(SccpError::SubsystemNotAvailable { ssn: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_is_congestion() {
        let (resource, _) = resource(1);
        let (started, mut started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        resource
            .register_local_subsystem(8, Arc::new(Blocking { started, gate: gate.clone() }))
            .unwrap();

        resource.deliver_data(8, indication(b"a")).unwrap();
        started_rx.recv().await.unwrap();
        resource.deliver_data(8, indication(b"b")).unwrap();
        assert_eq!(
            resource.deliver_data(8, indication(b"c")),
            Err(SccpError::SubsystemCongested(8))
        );
        gate.add_permits(2);
    }

    #[tokio::test]
    async fn test_out_of_service_reroutes() {
        let (resource, mut reroute) = resource(8);
        let (started, mut started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        resource
            .register_local_subsystem(8, Arc::new(Blocking { started, gate: gate.clone() }))
            .unwrap();

        resource.deliver_data(8, indication(b"first")).unwrap();
        started_rx.recv().await.unwrap();
        resource.deliver_data(8, indication(b"queued")).unwrap();

        resource.set_subsystem_state(8, LocalSubsystemState::OutOfService).unwrap();
        assert!(!resource.is_locally_available(8));
        gate.add_permits(1);

        let request = reroute.recv().await.unwrap();
        assert_eq!(request.ssn, 8);
        assert_eq!(request.indication.data, Bytes::from_static(b"queued"));

        assert!(matches!(
            resource.deliver_data(8, indication(b"late")),
            Err(SccpError::SubsystemNotAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_notifications_reach_concerned() {
        let (resource, _) = resource(8);
        let (user, _, mut states) = recorder();
        resource.register_local_subsystem(8, user).unwrap();

        let state = StateIndication::Subsystem {
            point_code: PointCode(5),
            ssn: 6,
            state: SubsystemState::Prohibited,
        };
        resource.notify_state(&[8, 9], &state);
        assert_eq!(states.recv().await.unwrap(), state);
    }

    #[test]
    fn test_concern_lookup() {
        let table = ConcernTable::new(vec![
            Concern { local_ssn: 8, remote_pc: PointCode(5), remote_ssn: Some(6) },
            Concern { local_ssn: 147, remote_pc: PointCode(5), remote_ssn: None },
            Concern { local_ssn: 8, remote_pc: PointCode(7), remote_ssn: Some(6) },
        ]);
        assert_eq!(table.concerned_with_subsystem(PointCode(5), 6), vec![8, 147]);
        assert_eq!(table.concerned_with_subsystem(PointCode(5), 7), vec![147]);
        assert_eq!(table.concerned_with_point(PointCode(7)), vec![8]);
        assert_eq!(table.remote_points_for(8), vec![PointCode(5), PointCode(7)]);
        assert!(table.remote_points_for(6).is_empty());
    }
}
