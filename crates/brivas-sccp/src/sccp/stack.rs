//! SCCP stack: wiring and lifecycle
//!
//! The stack owns one of each component, the transport bindings with their
//! worker tasks, and the background tasks that connect the components'
//! event channels.

use super::address::SccpAddress;
use super::gtt::{Router, TranslationTable};
use super::management::{ManagementStateMachine, ScmgRequest};
use super::reassembly::{ReassemblyCache, ReassemblyEvent};
use super::resource::{ConcernTable, LocalSubsystemState, RerouteRequest, SccpUser, SubsystemResource};
use super::routing::{DiagnosticEvent, NodeAvailability, RoutingControl, RoutingOutcome, UnitdataRequest};
use super::status::{RemoteStatusTable, SignalingPointStatus, SubsystemStatus};
use crate::config::SccpConfig;
use crate::errors::{Result, SccpError};
use crate::timer::{TimerService, TokioTimerService};
use crate::transport::{Mtp3Transport, TransportBinding, TransportBindings, TransportEvent, TransportHandle};
use crate::types::{PointCode, ProtocolClass};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Receiving ends consumed by the background tasks on start
struct Channels {
    reassembly: mpsc::Receiver<ReassemblyEvent>,
    reroute: mpsc::Receiver<RerouteRequest>,
    scmg: mpsc::Receiver<ScmgRequest>,
}

/// SCCP stack
pub struct SccpStack {
    config: SccpConfig,
    router: Arc<Router>,
    resource: Arc<SubsystemResource>,
    reassembly: Arc<ReassemblyCache>,
    management: Arc<ManagementStateMachine>,
    routing: Arc<RoutingControl>,
    bindings: Arc<TransportBindings>,
    lifecycle: Mutex<Lifecycle>,
    channels: Mutex<Option<Channels>>,
    workers: Mutex<HashMap<u32, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_sls: AtomicU8,
}

impl SccpStack {
    /// Create a stack whose timers run on the current tokio runtime
    pub fn new(config: SccpConfig, table: TranslationTable) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|_| SccpError::Config("SCCP stack needs a tokio runtime".to_string()))?;
        Self::with_timer_service(config, table, Arc::new(TokioTimerService::new(handle)))
    }

    pub fn with_timer_service(
        config: SccpConfig,
        table: TranslationTable,
        timers: Arc<dyn TimerService>,
    ) -> Result<Self> {
        config.validate()?;
        table.validate()?;

        let capacity = config.event_channel_capacity;
        let (reassembly_tx, reassembly_rx) = mpsc::channel(capacity);
        let (reroute_tx, reroute_rx) = mpsc::channel(capacity);
        let (scmg_tx, scmg_rx) = mpsc::channel(capacity);

        let status = Arc::new(RemoteStatusTable::new());
        let resource = Arc::new(SubsystemResource::new(
            config.local_point_code,
            config.delivery.queue_capacity,
            config.drain_timeout(),
            capacity,
            reroute_tx,
        ));
        let router = Arc::new(Router::new(
            table,
            Arc::new(NodeAvailability::new(
                config.local_point_code,
                status.clone(),
                resource.clone(),
            )),
        ));
        let reassembly = ReassemblyCache::new(&config.reassembly, timers.clone(), reassembly_tx);
        let management = ManagementStateMachine::new(
            &config,
            status.clone(),
            resource.clone(),
            timers,
            scmg_tx,
        );
        let bindings = Arc::new(TransportBindings::new());
        let routing = Arc::new(RoutingControl::new(
            &config,
            router.clone(),
            status,
            resource.clone(),
            reassembly.clone(),
            management.clone(),
            bindings.clone(),
        ));

        Ok(Self {
            config,
            router,
            resource,
            reassembly,
            management,
            routing,
            bindings,
            lifecycle: Mutex::new(Lifecycle::Created),
            channels: Mutex::new(Some(Channels {
                reassembly: reassembly_rx,
                reroute: reroute_rx,
                scmg: scmg_rx,
            })),
            workers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            next_sls: AtomicU8::new(0),
        })
    }

    /// Start the background tasks. A stopped stack cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(SccpError::StackNotRunning),
            Lifecycle::Created => {}
        }
        let channels = self.channels.lock().take().ok_or(SccpError::StackNotRunning)?;

        let mut tasks = self.tasks.lock();
        tasks.push(self.management.spawn_event_loop(self.resource.subscribe()));
        tasks.push(self.routing.spawn_resource_events(self.resource.subscribe()));
        tasks.push(self.routing.spawn_reassembly_events(channels.reassembly));
        tasks.push(self.routing.spawn_reroute_loop(channels.reroute));
        tasks.push(self.routing.spawn_scmg_sender(channels.scmg));

        *lifecycle = Lifecycle::Running;
        info!(
            name = %self.config.name,
            local_pc = %self.config.local_point_code,
            "SCCP stack started"
        );
        Ok(())
    }

    /// Stop the stack: link workers first, then timers, then local users
    /// (each drained with a bounded wait).
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                *lifecycle = Lifecycle::Stopped;
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        self.bindings.clear();
        for (_, worker) in self.workers.lock().drain() {
            worker.abort();
        }

        self.reassembly.clear();
        self.management.stop();
        self.resource.unregister_all().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(name = %self.config.name, "SCCP stack stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SccpError::StackNotRunning)
        }
    }

    pub fn local_point_code(&self) -> PointCode {
        self.config.local_point_code
    }

    /// Attach an MTP3 transport. `point_codes` lists the destinations it
    /// serves; empty means any destination.
    pub fn bind_transport(
        &self,
        id: u32,
        transport: Arc<dyn Mtp3Transport>,
        point_codes: Vec<PointCode>,
    ) -> Result<TransportHandle> {
        self.ensure_running()?;
        if !self.bindings.insert(TransportBinding { id, transport, point_codes }) {
            return Err(SccpError::BindingExists(id));
        }

        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        let worker = tokio::spawn(run_binding(id, self.routing.clone(), rx));
        self.workers.lock().insert(id, worker);

        info!(binding = id, "Transport bound");
        Ok(TransportHandle::new(id, tx))
    }

    pub fn unbind_transport(&self, id: u32) -> Result<()> {
        self.bindings.remove(id).ok_or(SccpError::BindingNotFound(id))?;
        if let Some(worker) = self.workers.lock().remove(&id) {
            worker.abort();
        }
        info!(binding = id, "Transport unbound");
        Ok(())
    }

    pub fn register_local_subsystem(&self, ssn: u8, handler: Arc<dyn SccpUser>) -> Result<()> {
        self.ensure_running()?;
        self.resource.register_local_subsystem(ssn, handler)
    }

    pub async fn unregister_local_subsystem(&self, ssn: u8) -> Result<()> {
        self.resource.unregister_local_subsystem(ssn).await
    }

    pub fn set_subsystem_state(&self, ssn: u8, state: LocalSubsystemState) -> Result<()> {
        self.resource.set_subsystem_state(ssn, state)
    }

    /// Send class 0 user data
    pub async fn send(
        &self,
        data: Bytes,
        called_party: SccpAddress,
        calling_party: SccpAddress,
    ) -> Result<RoutingOutcome> {
        let sls = self.next_sls.fetch_add(1, Ordering::Relaxed);
        self.send_unitdata(UnitdataRequest {
            called_party,
            calling_party,
            protocol_class: ProtocolClass::CLASS_0,
            sls,
            data,
        })
        .await
    }

    /// N-UNITDATA request with explicit class and SLS
    #[instrument(skip(self, request))]
    pub async fn send_unitdata(&self, request: UnitdataRequest) -> Result<RoutingOutcome> {
        self.ensure_running()?;
        self.routing.route_outbound(request).await
    }

    pub fn reload_translation_table(&self, table: TranslationTable) -> Result<()> {
        self.router.reload(table)?;
        info!(rules = self.router.table().rules.len(), "Translation table reloaded");
        Ok(())
    }

    pub fn translation_table(&self) -> Arc<TranslationTable> {
        self.router.table()
    }

    pub fn reload_concerns(&self, table: ConcernTable) {
        self.resource.reload_concerns(table);
    }

    pub fn point_status(&self, pc: PointCode) -> Option<SignalingPointStatus> {
        self.management.point_status(pc)
    }

    pub fn subsystem_status(&self, pc: PointCode, ssn: u8) -> Option<SubsystemStatus> {
        self.management.subsystem_status(pc, ssn)
    }

    pub fn local_subsystems(&self) -> Vec<(u8, LocalSubsystemState)> {
        self.resource.registered()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.routing.subscribe_diagnostics()
    }

    /// Partial messages awaiting reassembly
    pub fn reassembly_in_progress(&self) -> usize {
        self.reassembly.len()
    }
}

/// One worker per binding keeps that link's traffic in order
async fn run_binding(id: u32, routing: Arc<RoutingControl>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Inbound { data, opc, sls } => {
                if let Err(e) = routing.route_inbound(data, opc, sls).await {
                    debug!(binding = id, %opc, error = %e, "Inbound message not routed");
                }
            }
            TransportEvent::LinkStatus { point_code, reachable } => {
                routing.link_status_changed(point_code, reachable);
            }
        }
    }
    debug!(binding = id, "Transport worker finished");
}
