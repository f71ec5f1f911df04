//! SCCP routing control (Q.714 2.3)
//!
//! Every message, inbound or locally originated, passes through here. The
//! routing decision combines the translation table, remote status and local
//! subsystem availability; undeliverable messages are returned to their
//! originator when the protocol class asks for it.

use super::address::SccpAddress;
use super::gtt::{DestinationAvailability, ResolvedDestination, Router};
use super::management::{ManagementStateMachine, ScmgMessage, ScmgRequest};
use super::messages::{SccpMessage, MAX_DATA_LENGTH};
use super::reassembly::{Admission, ReassemblyCache, ReassemblyEvent, ReassemblyKey};
use super::resource::{
    DataIndication, LocalSubsystemState, NoticeIndication, RerouteRequest, ResourceEvent,
    SubsystemResource,
};
use super::status::{RemoteStatusTable, SubsystemState};
use super::SCMG_SSN;
use crate::config::SccpConfig;
use crate::errors::{LinkUnavailable, Result, ReturnCause, SccpError};
use crate::transport::TransportBindings;
use crate::types::{PointCode, ProtocolClass, Segmentation, Sls};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Segments a single XUDT message may be split into
pub const MAX_SEGMENTS: usize = 16;

/// N-UNITDATA request from a local user
#[derive(Debug, Clone)]
pub struct UnitdataRequest {
    pub called_party: SccpAddress,
    pub calling_party: SccpAddress,
    pub protocol_class: ProtocolClass,
    pub sls: Sls,
    pub data: Bytes,
}

/// Where a message went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Handed to a local subsystem (or SCMG)
    Delivered,
    /// Sent towards `dpc`
    Forwarded { dpc: PointCode },
    /// Segment stored until the message is complete
    Pending,
}

/// Routing diagnostics, published for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    MalformedMessage { opc: PointCode, sls: Sls, reason: String },
    Undeliverable { opc: PointCode, cause: ReturnCause },
    ReturnedToSender { dpc: PointCode, cause: ReturnCause },
    LinkUnavailable { point_code: PointCode },
    ReassemblyTimeout { key: ReassemblyKey },
}

/// Availability of destinations as seen from this node
pub struct NodeAvailability {
    local_point_code: PointCode,
    status: Arc<RemoteStatusTable>,
    resource: Arc<SubsystemResource>,
}

impl NodeAvailability {
    pub fn new(
        local_point_code: PointCode,
        status: Arc<RemoteStatusTable>,
        resource: Arc<SubsystemResource>,
    ) -> Self {
        Self { local_point_code, status, resource }
    }
}

impl DestinationAvailability for NodeAvailability {
    fn is_prohibited(&self, pc: PointCode, ssn: Option<u8>) -> bool {
        if pc == self.local_point_code {
            return match ssn {
                Some(SCMG_SSN) | None => false,
                Some(ssn) => !self.resource.is_locally_available(ssn),
            };
        }
        self.status.is_point_prohibited(pc)
            || ssn.map_or(false, |ssn| {
                self.status.subsystem_state(pc, ssn) == SubsystemState::Prohibited
            })
    }
}

/// SCCP routing control
pub struct RoutingControl {
    local_point_code: PointCode,
    hop_counter: u8,
    max_segment_size: usize,
    max_message_length: usize,
    reassembly_timeout: Duration,
    router: Arc<Router>,
    status: Arc<RemoteStatusTable>,
    resource: Arc<SubsystemResource>,
    reassembly: Arc<ReassemblyCache>,
    management: Arc<ManagementStateMachine>,
    bindings: Arc<TransportBindings>,
    diagnostics: broadcast::Sender<DiagnosticEvent>,
    next_local_ref: AtomicU32,
}

impl RoutingControl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SccpConfig,
        router: Arc<Router>,
        status: Arc<RemoteStatusTable>,
        resource: Arc<SubsystemResource>,
        reassembly: Arc<ReassemblyCache>,
        management: Arc<ManagementStateMachine>,
        bindings: Arc<TransportBindings>,
    ) -> Self {
        let (diagnostics, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            local_point_code: config.local_point_code,
            hop_counter: config.hop_counter,
            max_segment_size: config.max_segment_size,
            max_message_length: config.reassembly.max_message_length,
            reassembly_timeout: config.reassembly_timeout(),
            router,
            status,
            resource,
            reassembly,
            management,
            bindings,
            diagnostics,
            next_local_ref: AtomicU32::new(1),
        }
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    /// Route a message originated by a local user
    #[instrument(skip(self, request), fields(sls = request.sls, len = request.data.len()))]
    pub async fn route_outbound(&self, request: UnitdataRequest) -> Result<RoutingOutcome> {
        request.called_party.validate()?;
        if request.data.len() > self.max_message_length {
            return Err(SccpError::SegmentationMismatch(format!(
                "user data of {} octets exceeds {}",
                request.data.len(),
                self.max_message_length
            )));
        }

        let called = &request.called_party;
        let mut excluded = Vec::new();
        loop {
            let dest = match self.router.resolve_excluding(called, request.sls, &excluded) {
                Ok(dest) => dest,
                Err(SccpError::AllRoutesProhibited) => return Err(SccpError::RouteProhibited),
                Err(e) => return Err(e),
            };

            if dest.point_code == self.local_point_code {
                let ssn = dest.ssn.ok_or_else(|| {
                    SccpError::InvalidAddress("local destination without SSN".to_string())
                })?;
                self.resource.deliver_data(
                    ssn,
                    DataIndication {
                        called_party: request.called_party.clone(),
                        calling_party: request.calling_party.clone(),
                        protocol_class: request.protocol_class,
                        data: request.data.clone(),
                        opc: self.local_point_code,
                        sls: request.sls,
                    },
                )?;
                metrics::counter!("sccp_messages_routed", "direction" => "local").increment(1);
                return Ok(RoutingOutcome::Delivered);
            }

            if let Some(ssn) = dest.ssn {
                if self.status.subsystem_state(dest.point_code, ssn) == SubsystemState::Prohibited {
                    return Err(SccpError::SubsystemNotAvailable { point_code: dest.point_code, ssn });
                }
            }
            if self.status.is_point_prohibited(dest.point_code) {
                return Err(SccpError::RouteProhibited);
            }

            let encoded = self.encode_outbound(&request, &dest)?;
            match self.transmit(dest.point_code, request.sls, &encoded).await {
                Ok(()) => {
                    metrics::counter!("sccp_messages_routed", "direction" => "outbound").increment(1);
                    debug!(dpc = %dest.point_code, segments = encoded.len(), "Message sent");
                    return Ok(RoutingOutcome::Forwarded { dpc: dest.point_code });
                }
                Err(link) => {
                    self.link_unavailable(link.point_code);
                    if !called.is_route_on_gt() {
                        return Err(SccpError::RouteProhibited);
                    }
                    excluded.push(link.point_code);
                }
            }
        }
    }

    /// Route a message received from the transport
    #[instrument(skip(self, raw))]
    pub async fn route_inbound(&self, raw: Bytes, opc: PointCode, sls: Sls) -> Result<RoutingOutcome> {
        let message = match SccpMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("sccp_messages_malformed").increment(1);
                warn!(%opc, error = %e, "Dropping malformed message");
                self.diagnose(DiagnosticEvent::MalformedMessage {
                    opc,
                    sls,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        metrics::counter!("sccp_messages_received").increment(1);
        self.dispatch(message, opc, sls).await
    }

    /// Route a decoded message that did not originate at a local user.
    /// Segments are reassembled before the called party is resolved.
    async fn dispatch(&self, message: SccpMessage, opc: PointCode, sls: Sls) -> Result<RoutingOutcome> {
        let Some(message) = self.reassemble(message, opc, sls).await? else {
            return Ok(RoutingOutcome::Pending);
        };

        let dest = match self.router.resolve(message.called_party(), sls) {
            Ok(dest) => dest,
            Err(e) => return Err(self.undeliverable(&message, opc, sls, e).await),
        };

        if dest.point_code != self.local_point_code {
            return self.forward(message, dest, opc, sls).await;
        }
        if message.is_service() {
            self.deliver_notice(&message)?;
            return Ok(RoutingOutcome::Delivered);
        }
        self.deliver_local(message, dest, opc, sls).await
    }

    /// Admit an XUDT segment; `None` until the last missing segment arrives
    async fn reassemble(
        &self,
        message: SccpMessage,
        opc: PointCode,
        sls: Sls,
    ) -> Result<Option<SccpMessage>> {
        let segmentation = match message.segmentation() {
            Some(segmentation) if !message.is_service() => *segmentation,
            _ => return Ok(Some(message)),
        };
        let key = ReassemblyKey {
            opc,
            sls,
            local_reference: segmentation.reference,
        };
        let deadline = Instant::now() + self.reassembly_timeout;
        match self
            .reassembly
            .admit_xudt_segment(key, &segmentation, message.data().clone(), deadline)
        {
            Ok(Admission::Pending) => Ok(None),
            Ok(Admission::Complete(data)) => Ok(Some(message.reassembled(data))),
            Err(e) => Err(self.undeliverable(&message, opc, sls, e).await),
        }
    }

    async fn deliver_local(
        &self,
        message: SccpMessage,
        dest: ResolvedDestination,
        opc: PointCode,
        sls: Sls,
    ) -> Result<RoutingOutcome> {
        let Some(ssn) = dest.ssn else {
            let e = SccpError::InvalidAddress("local destination without SSN".to_string());
            return Err(self.undeliverable(&message, opc, sls, e).await);
        };

        let data = message.data().clone();

        if ssn == SCMG_SSN {
            let scmg = ScmgMessage::decode(&data).map_err(|e| {
                warn!(%opc, error = %e, "Dropping malformed SCMG message");
                self.diagnose(DiagnosticEvent::MalformedMessage {
                    opc,
                    sls,
                    reason: e.to_string(),
                });
                e
            })?;
            self.management.handle_scmg(opc, &scmg);
            return Ok(RoutingOutcome::Delivered);
        }

        let indication = DataIndication {
            called_party: message.called_party().clone(),
            calling_party: message.calling_party().clone(),
            protocol_class: message.protocol_class().unwrap_or(ProtocolClass::CLASS_0),
            data,
            opc,
            sls,
        };
        match self.resource.deliver_data(ssn, indication) {
            Ok(()) => {
                metrics::counter!("sccp_messages_routed", "direction" => "inbound").increment(1);
                Ok(RoutingOutcome::Delivered)
            }
            Err(e) => Err(self.undeliverable(&message, opc, sls, e).await),
        }
    }

    /// Relay transit traffic
    async fn forward(
        &self,
        message: SccpMessage,
        dest: ResolvedDestination,
        opc: PointCode,
        sls: Sls,
    ) -> Result<RoutingOutcome> {
        let called = message.called_party().clone();
        let message = match message.clone().decrement_hop_counter() {
            Ok(message) => message,
            Err(e) => return Err(self.undeliverable(&message, opc, sls, e).await),
        };

        let mut dest = dest;
        let mut excluded = Vec::new();
        loop {
            let encoded = match self.encode_relay(&message, &dest.address) {
                Ok(encoded) => encoded,
                Err(e) => return Err(self.undeliverable(&message, opc, sls, e).await),
            };
            match self.transmit(dest.point_code, sls, &encoded).await {
                Ok(()) => {
                    metrics::counter!("sccp_messages_routed", "direction" => "transit").increment(1);
                    return Ok(RoutingOutcome::Forwarded { dpc: dest.point_code });
                }
                Err(link) => {
                    self.link_unavailable(link.point_code);
                    excluded.push(link.point_code);
                    let next = called
                        .is_route_on_gt()
                        .then(|| self.router.resolve_excluding(&called, sls, &excluded).ok())
                        .flatten();
                    match next {
                        Some(next) if next.point_code == self.local_point_code => {
                            if message.is_service() {
                                self.deliver_notice(&message)?;
                                return Ok(RoutingOutcome::Delivered);
                            }
                            return self.deliver_local(message, next, opc, sls).await;
                        }
                        Some(next) => dest = next,
                        None => {
                            return Err(self
                                .undeliverable(&message, opc, sls, SccpError::RouteProhibited)
                                .await)
                        }
                    }
                }
            }
        }
    }

    /// Record an undeliverable message and return it to its originator if
    /// its protocol class asks for that
    async fn undeliverable(
        &self,
        message: &SccpMessage,
        opc: PointCode,
        sls: Sls,
        error: SccpError,
    ) -> SccpError {
        let cause = error.return_cause();
        metrics::counter!("sccp_messages_undeliverable").increment(1);
        warn!(%opc, error = %error, ?cause, "Message undeliverable");
        self.diagnose(DiagnosticEvent::Undeliverable { opc, cause });

        if let Some(service) = message.service_response(cause, self.hop_counter) {
            self.return_to_sender(service, opc, sls).await;
        }
        error
    }

    async fn return_to_sender(&self, service: SccpMessage, opc: PointCode, sls: Sls) {
        let (dpc, address) = match self.router.resolve(service.called_party(), sls) {
            Ok(dest) => (dest.point_code, dest.address),
            Err(_) => (opc, service.called_party().clone()),
        };
        let cause = match &service {
            SccpMessage::Udts { return_cause, .. } | SccpMessage::Xudts { return_cause, .. } => {
                *return_cause
            }
            _ => ReturnCause::Unqualified,
        };

        if dpc == self.local_point_code {
            if let Err(e) = self.deliver_notice(&service) {
                debug!(error = %e, "Notice not delivered");
            }
            return;
        }

        let encoded = match service.with_called_party(address).encode() {
            Ok(encoded) => encoded.freeze(),
            Err(e) => {
                debug!(error = %e, "Service message not encodable");
                return;
            }
        };
        match self.transmit(dpc, sls, &[encoded]).await {
            Ok(()) => {
                metrics::counter!("sccp_messages_returned").increment(1);
                self.diagnose(DiagnosticEvent::ReturnedToSender { dpc, cause });
            }
            Err(link) => self.link_unavailable(link.point_code),
        }
    }

    /// N-NOTICE for a returned message; the called party of the service
    /// message is the original calling party
    fn deliver_notice(&self, message: &SccpMessage) -> Result<()> {
        let ssn = message.called_party().subsystem_number.ok_or_else(|| {
            SccpError::InvalidAddress("service message without called SSN".to_string())
        })?;
        let return_cause = match message {
            SccpMessage::Udts { return_cause, .. } | SccpMessage::Xudts { return_cause, .. } => {
                *return_cause
            }
            _ => ReturnCause::Unqualified,
        };
        self.resource.deliver_notice(
            ssn,
            NoticeIndication {
                called_party: message.calling_party().clone(),
                calling_party: message.called_party().clone(),
                return_cause,
                data: message.data().clone(),
            },
        )
    }

    /// Route data a local subsystem could no longer accept
    pub async fn reroute(&self, request: RerouteRequest) -> Result<RoutingOutcome> {
        let indication = request.indication;
        debug!(ssn = request.ssn, "Rerouting message of out-of-service subsystem");
        let message = if indication.data.len() > MAX_DATA_LENGTH {
            SccpMessage::Xudt {
                protocol_class: indication.protocol_class,
                hop_counter: self.hop_counter,
                called_party: indication.called_party,
                calling_party: indication.calling_party,
                data: indication.data,
                segmentation: None,
                importance: None,
            }
        } else {
            SccpMessage::Udt {
                protocol_class: indication.protocol_class,
                called_party: indication.called_party,
                calling_party: indication.calling_party,
                data: indication.data,
            }
        };
        self.dispatch(message, indication.opc, indication.sls).await
    }

    /// Send an SCMG message to the SCMG of `request.dpc`
    pub async fn send_scmg(&self, request: ScmgRequest) -> Result<()> {
        let message = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0,
            called_party: SccpAddress::from_ssn_pc(SCMG_SSN, request.dpc),
            calling_party: SccpAddress::from_ssn_pc(SCMG_SSN, self.local_point_code),
            data: request.message.encode(),
        };
        let encoded = message.encode()?.freeze();
        self.transmit(request.dpc, 0, &[encoded]).await.map_err(|link| {
            self.link_unavailable(link.point_code);
            SccpError::RouteProhibited
        })
    }

    /// MTP-PAUSE / MTP-RESUME from a transport binding
    pub fn link_status_changed(&self, point_code: PointCode, reachable: bool) {
        if reachable {
            self.management.signaling_point_allowed(point_code);
        } else {
            self.management.signaling_point_prohibited(point_code);
        }
    }

    /// Hand `messages` in order to the first binding that takes all of them
    async fn transmit(&self, dpc: PointCode, sls: Sls, messages: &[Bytes]) -> std::result::Result<(), LinkUnavailable> {
        'bindings: for binding in self.bindings.select(dpc, sls) {
            for message in messages {
                if let Err(e) = binding.transport.send_to_link(dpc, sls, message.clone()).await {
                    debug!(binding = binding.id, error = %e, "Binding refused message");
                    continue 'bindings;
                }
            }
            return Ok(());
        }
        Err(LinkUnavailable { point_code: dpc })
    }

    /// Encode relayed traffic, splitting a reassembled XUDT again when it no
    /// longer fits a single message
    fn encode_relay(&self, message: &SccpMessage, address: &SccpAddress) -> Result<Vec<Bytes>> {
        let message = message.clone().with_called_party(address.clone());
        match &message {
            SccpMessage::Xudt {
                protocol_class,
                hop_counter,
                called_party,
                calling_party,
                data,
                segmentation: None,
                importance,
            } if data.len() > MAX_DATA_LENGTH => {
                let reference = self.next_local_ref.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
                segment_user_data(data, self.max_segment_size, reference)?
                    .into_iter()
                    .map(|(segmentation, data)| {
                        SccpMessage::Xudt {
                            protocol_class: *protocol_class,
                            hop_counter: *hop_counter,
                            called_party: called_party.clone(),
                            calling_party: calling_party.clone(),
                            data,
                            segmentation: Some(segmentation),
                            importance: *importance,
                        }
                        .encode()
                        .map(BytesMut::freeze)
                    })
                    .collect()
            }
            _ => Ok(vec![message.encode()?.freeze()]),
        }
    }

    fn encode_outbound(&self, request: &UnitdataRequest, dest: &ResolvedDestination) -> Result<Vec<Bytes>> {
        if request.data.len() <= self.max_segment_size {
            let message = SccpMessage::Udt {
                protocol_class: request.protocol_class,
                called_party: dest.address.clone(),
                calling_party: request.calling_party.clone(),
                data: request.data.clone(),
            };
            return Ok(vec![message.encode()?.freeze()]);
        }

        let reference = self.next_local_ref.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let protocol_class = ProtocolClass {
            class: 1,
            return_on_error: request.protocol_class.return_on_error,
        };
        segment_user_data(&request.data, self.max_segment_size, reference)?
            .into_iter()
            .map(|(segmentation, data)| {
                SccpMessage::Xudt {
                    protocol_class,
                    hop_counter: self.hop_counter,
                    called_party: dest.address.clone(),
                    calling_party: request.calling_party.clone(),
                    data,
                    segmentation: Some(segmentation),
                    importance: None,
                }
                .encode()
                .map(BytesMut::freeze)
            })
            .collect()
    }

    fn link_unavailable(&self, point_code: PointCode) {
        metrics::counter!("sccp_link_unavailable").increment(1);
        warn!(%point_code, "No link accepted the message");
        self.diagnose(DiagnosticEvent::LinkUnavailable { point_code });
    }

    fn diagnose(&self, event: DiagnosticEvent) {
        let _ = self.diagnostics.send(event);
    }

    /// Forward reassembly timeouts to the diagnostics channel
    pub fn spawn_reassembly_events(self: &Arc<Self>, mut events: mpsc::Receiver<ReassemblyEvent>) -> JoinHandle<()> {
        let routing = self.clone();
        tokio::spawn(async move {
            while let Some(ReassemblyEvent::Timeout { key }) = events.recv().await {
                routing.diagnose(DiagnosticEvent::ReassemblyTimeout { key });
            }
        })
    }

    /// Reroute data dequeued for out-of-service subsystems
    pub fn spawn_reroute_loop(self: &Arc<Self>, mut requests: mpsc::Receiver<RerouteRequest>) -> JoinHandle<()> {
        let routing = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let Err(e) = routing.reroute(request).await {
                    debug!(error = %e, "Reroute failed");
                }
            }
        })
    }

    /// Send SCMG messages produced by management
    pub fn spawn_scmg_sender(self: &Arc<Self>, mut requests: mpsc::Receiver<ScmgRequest>) -> JoinHandle<()> {
        let routing = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let dpc = request.dpc;
                if let Err(e) = routing.send_scmg(request).await {
                    debug!(%dpc, error = %e, "SCMG message not sent");
                }
            }
        })
    }

    /// Track local subsystem availability
    pub fn spawn_resource_events(self: &Arc<Self>, mut events: broadcast::Receiver<ResourceEvent>) -> JoinHandle<()> {
        let resource = self.resource.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ResourceEvent::LocalStateChanged { ssn, state }) => {
                        info!(ssn, ?state, "Local routing availability changed");
                        let available = resource
                            .registered()
                            .iter()
                            .filter(|(_, state)| *state == LocalSubsystemState::InService)
                            .count();
                        metrics::gauge!("sccp_local_subsystems_available").set(available as f64);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Routing lagged behind local state changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Split user data into at most [`MAX_SEGMENTS`] XUDT segments.
///
/// Segments are at least `max_segment_size` long, except the last; the size
/// grows when the data would otherwise need more than 16 segments.
pub fn segment_user_data(
    data: &Bytes,
    max_segment_size: usize,
    reference: u32,
) -> Result<Vec<(Segmentation, Bytes)>> {
    let segment_size = max_segment_size.max(data.len().div_ceil(MAX_SEGMENTS)).max(1);
    if segment_size > MAX_DATA_LENGTH {
        return Err(SccpError::SegmentationMismatch(format!(
            "{} octets do not fit in {} segments",
            data.len(),
            MAX_SEGMENTS
        )));
    }

    let total = data.len().div_ceil(segment_size).max(1);
    Ok((0..total)
        .map(|i| {
            let start = i * segment_size;
            let end = (start + segment_size).min(data.len());
            (
                Segmentation {
                    first: i == 0,
                    class: 1,
                    remaining_segments: (total - 1 - i) as u8,
                    reference: reference & 0x00FF_FFFF,
                },
                data.slice(start..end),
            )
        })
        .collect())
}
