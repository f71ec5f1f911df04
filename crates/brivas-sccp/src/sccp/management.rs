//! SCCP management (Q.714 5)
//!
//! Tracks remote signalling point and subsystem availability from SCMG
//! traffic and MTP indications, runs the subsystem status test, and
//! announces local subsystem state to concerned remote nodes.

use super::resource::{LocalSubsystemState, ResourceEvent, StateIndication, SubsystemResource};
use super::status::{
    RemoteStatusTable, SignalingPointState, SignalingPointStatus, SubsystemState, SubsystemStatus,
};
use super::SCMG_SSN;
use crate::config::SccpConfig;
use crate::errors::{Result, SccpError};
use crate::timer::{TimerHandle, TimerService};
use crate::types::PointCode;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SCMG message types (Q.713 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScmgType {
    /// Subsystem allowed
    Ssa = 0x01,
    /// Subsystem prohibited
    Ssp = 0x02,
    /// Subsystem status test
    Sst = 0x03,
    /// Subsystem out-of-service request
    Sor = 0x04,
    /// Subsystem out-of-service grant
    Sog = 0x05,
    /// SCCP/subsystem congested
    Ssc = 0x06,
}

impl TryFrom<u8> for ScmgType {
    type Error = SccpError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Ssa),
            0x02 => Ok(Self::Ssp),
            0x03 => Ok(Self::Sst),
            0x04 => Ok(Self::Sor),
            0x05 => Ok(Self::Sog),
            0x06 => Ok(Self::Ssc),
            _ => Err(SccpError::InvalidMessage(format!("Unknown SCMG type: {:#04x}", v))),
        }
    }
}

/// SCMG message (Q.713 5.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmgMessage {
    pub message_type: ScmgType,
    pub affected_ssn: u8,
    pub affected_pc: PointCode,
    pub multiplicity: u8,
    /// SSC only
    pub congestion_level: Option<u8>,
}

impl ScmgMessage {
    pub fn new(message_type: ScmgType, affected_ssn: u8, affected_pc: PointCode) -> Self {
        Self {
            message_type,
            affected_ssn,
            affected_pc,
            multiplicity: 0,
            congestion_level: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.affected_ssn);
        buf.put_u16_le((self.affected_pc.value() & PointCode::ITU_MAX) as u16);
        buf.put_u8(self.multiplicity & 0x03);
        if self.message_type == ScmgType::Ssc {
            buf.put_u8(self.congestion_level.unwrap_or(0) & 0x0F);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(SccpError::InvalidMessage("SCMG message too short".to_string()));
        }
        let message_type = ScmgType::try_from(data[0])?;
        let congestion_level = if message_type == ScmgType::Ssc {
            let level = data.get(5).ok_or_else(|| {
                SccpError::InvalidMessage("SSC without congestion level".to_string())
            })?;
            Some(level & 0x0F)
        } else {
            None
        };
        Ok(Self {
            message_type,
            affected_ssn: data[1],
            affected_pc: PointCode(u16::from_le_bytes([data[2], data[3]]) as u32 & PointCode::ITU_MAX),
            multiplicity: data[4] & 0x03,
            congestion_level,
        })
    }
}

/// SCMG message to be sent to the SCMG of `dpc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmgRequest {
    pub dpc: PointCode,
    pub message: ScmgMessage,
}

/// SCCP management state machine
pub struct ManagementStateMachine {
    local_point_code: PointCode,
    status: Arc<RemoteStatusTable>,
    resource: Arc<SubsystemResource>,
    timers: Arc<dyn TimerService>,
    outbound: mpsc::Sender<ScmgRequest>,
    test_interval: Duration,
    test_interval_max: Duration,
    backoff_factor: f64,
    anti_flap_threshold: u32,
}

impl ManagementStateMachine {
    pub fn new(
        config: &SccpConfig,
        status: Arc<RemoteStatusTable>,
        resource: Arc<SubsystemResource>,
        timers: Arc<dyn TimerService>,
        outbound: mpsc::Sender<ScmgRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_point_code: config.local_point_code,
            status,
            resource,
            timers,
            outbound,
            test_interval: config.sst_interval(),
            test_interval_max: config.sst_interval_max().max(config.sst_interval()),
            backoff_factor: config.management.sst_backoff_factor,
            anti_flap_threshold: config.management.anti_flap_threshold,
        })
    }

    /// Handle an SCMG message received from `opc`
    pub fn handle_scmg(self: &Arc<Self>, opc: PointCode, message: &ScmgMessage) {
        metrics::counter!("sccp_scmg_received").increment(1);
        debug!(%opc, ?message, "SCMG received");

        match message.message_type {
            ScmgType::Ssa => self.subsystem_allowed(message.affected_pc, message.affected_ssn),
            ScmgType::Ssp => self.subsystem_prohibited(message.affected_pc, message.affected_ssn),
            ScmgType::Sst => self.answer_status_test(opc, message),
            ScmgType::Ssc => self.signaling_point_congested(
                message.affected_pc,
                message.congestion_level.unwrap_or(0),
            ),
            ScmgType::Sor | ScmgType::Sog => {
                debug!(%opc, "Coordinated state change not supported, ignored");
            }
        }
    }

    /// Remote subsystem became available
    pub fn subsystem_allowed(&self, pc: PointCode, ssn: u8) {
        let record = self.status.subsystem(pc, ssn);
        let mut record = record.lock();
        record.cancel_test();
        record.prohibited_by_point_code = false;
        record.test_interval = self.test_interval;
        // Clears the failure count even when no transition happens
        record.consecutive_test_failures = 0;
        record.test_outstanding = false;

        // Indications are queued under the record lock so concerned users
        // see transitions in the order they were applied
        if record.transition(SubsystemState::Allowed) {
            info!(%pc, ssn, "Remote subsystem allowed");
            self.notify_subsystem(pc, ssn, SubsystemState::Allowed);
        }
    }

    /// Remote subsystem declared unavailable by its node; starts the status
    /// test unless one is already running
    pub fn subsystem_prohibited(self: &Arc<Self>, pc: PointCode, ssn: u8) {
        let record = self.status.subsystem(pc, ssn);
        let mut record = record.lock();
        let changed = record.transition(SubsystemState::Prohibited);
        record.prohibited_by_point_code = false;

        if changed || record.test_timer.is_none() {
            record.cancel_test();
            record.generation += 1;
            record.test_interval = self.test_interval;
            record.test_outstanding = false;
            record.test_timer =
                Some(self.schedule_test(pc, ssn, record.generation, self.test_interval));
        }

        if changed {
            warn!(%pc, ssn, "Remote subsystem prohibited");
            self.notify_subsystem(pc, ssn, SubsystemState::Prohibited);
        }
    }

    /// MTP-PAUSE: the signalling point is inaccessible
    pub fn signaling_point_prohibited(&self, pc: PointCode) {
        {
            let point = self.status.point(pc);
            let mut point = point.lock();
            if !point.transition(SignalingPointState::Prohibited) {
                return;
            }
            warn!(%pc, "Signalling point prohibited");
            self.notify_point(pc, SignalingPointState::Prohibited, 0);
        }

        for record in self.status.subsystems_at(pc) {
            let mut record = record.lock();
            if record.transition(SubsystemState::Prohibited) {
                record.prohibited_by_point_code = true;
                record.cancel_test();
            }
        }
    }

    /// MTP-RESUME: the signalling point is accessible again
    pub fn signaling_point_allowed(&self, pc: PointCode) {
        {
            let point = self.status.point(pc);
            let mut point = point.lock();
            point.congestion_level = 0;
            if !point.transition(SignalingPointState::Allowed) {
                return;
            }
            info!(%pc, "Signalling point allowed");
            self.notify_point(pc, SignalingPointState::Allowed, 0);
        }

        for record in self.status.subsystems_at(pc) {
            let mut record = record.lock();
            if record.prohibited_by_point_code && record.transition(SubsystemState::Allowed) {
                record.prohibited_by_point_code = false;
                self.notify_subsystem(pc, record.ssn, SubsystemState::Allowed);
            }
        }
    }

    /// SSC or MTP-STATUS congestion for `pc`; level 0 clears it
    pub fn signaling_point_congested(&self, pc: PointCode, level: u8) {
        let point = self.status.point(pc);
        let mut point = point.lock();
        if point.state == SignalingPointState::Prohibited || point.congestion_level == level {
            return;
        }
        point.congestion_level = level;
        let state = if level == 0 {
            SignalingPointState::Allowed
        } else {
            SignalingPointState::Restricted
        };
        point.transition(state);
        info!(%pc, level, "Signalling point congestion changed");
        self.notify_point(pc, state, level);
    }

    fn answer_status_test(&self, opc: PointCode, message: &ScmgMessage) {
        if message.affected_pc != self.local_point_code {
            debug!(%opc, affected_pc = %message.affected_pc, "SST for another point code ignored");
            return;
        }
        let ssn = message.affected_ssn;
        if ssn != SCMG_SSN && !self.resource.is_locally_available(ssn) {
            debug!(%opc, ssn, "SST for unavailable subsystem, no reply");
            return;
        }
        let mut reply = message.clone();
        reply.message_type = ScmgType::Ssa;
        self.send(opc, reply);
    }

    fn schedule_test(self: &Arc<Self>, pc: PointCode, ssn: u8, generation: u64, delay: Duration) -> TimerHandle {
        let management: Weak<Self> = Arc::downgrade(self);
        self.timers.schedule(
            delay,
            Box::new(move || {
                if let Some(management) = management.upgrade() {
                    management.on_test_timer(pc, ssn, generation);
                }
            }),
        )
    }

    fn on_test_timer(self: &Arc<Self>, pc: PointCode, ssn: u8, generation: u64) {
        let record = self.status.subsystem(pc, ssn);
        let mut record = record.lock();
        if record.generation != generation || record.state != SubsystemState::Prohibited {
            return;
        }

        if !self.status.is_point_prohibited(pc) {
            if record.test_outstanding {
                record.consecutive_test_failures += 1;
            }
            if record.consecutive_test_failures >= self.anti_flap_threshold {
                record.test_interval = record
                    .test_interval
                    .mul_f64(self.backoff_factor)
                    .min(self.test_interval_max);
            }
            debug!(
                %pc,
                ssn,
                failures = record.consecutive_test_failures,
                "Sending subsystem status test"
            );
            metrics::counter!("sccp_sst_sent").increment(1);
            self.send(pc, ScmgMessage::new(ScmgType::Sst, ssn, pc));
            record.test_outstanding = true;
        }

        let interval = record.test_interval;
        record.test_timer = Some(self.schedule_test(pc, ssn, generation, interval));
    }

    /// Announce a local state change to every remote node concerned with `ssn`
    pub fn local_state_changed(&self, ssn: u8, state: LocalSubsystemState) {
        let message_type = match state {
            LocalSubsystemState::InService => ScmgType::Ssa,
            LocalSubsystemState::OutOfService => ScmgType::Ssp,
        };
        for dpc in self.resource.concerns().remote_points_for(ssn) {
            self.send(dpc, ScmgMessage::new(message_type, ssn, self.local_point_code));
        }
    }

    /// Consume local state changes until the channel closes
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: broadcast::Receiver<ResourceEvent>) -> JoinHandle<()> {
        let management = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ResourceEvent::LocalStateChanged { ssn, state }) => {
                        management.local_state_changed(ssn, state);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Management lagged behind local state changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Cancel every pending status test
    pub fn stop(&self) {
        for record in self.status.all_subsystems() {
            record.lock().cancel_test();
        }
    }

    pub fn point_status(&self, pc: PointCode) -> Option<SignalingPointStatus> {
        self.status
            .point_snapshot(pc)
            .map(|(state, congestion_level, last_change)| SignalingPointStatus {
                point_code: pc,
                state,
                congestion_level,
                last_change,
                concerned: self.resource.concerns().concerned_with_point(pc),
            })
    }

    pub fn subsystem_status(&self, pc: PointCode, ssn: u8) -> Option<SubsystemStatus> {
        self.status.subsystem_snapshot(pc, ssn)
    }

    fn notify_subsystem(&self, pc: PointCode, ssn: u8, state: SubsystemState) {
        let concerned = self.resource.concerns().concerned_with_subsystem(pc, ssn);
        self.resource.notify_state(
            &concerned,
            &StateIndication::Subsystem { point_code: pc, ssn, state },
        );
    }

    fn notify_point(&self, pc: PointCode, state: SignalingPointState, congestion_level: u8) {
        let concerned = self.resource.concerns().concerned_with_point(pc);
        self.resource.notify_state(
            &concerned,
            &StateIndication::PointCode { point_code: pc, state, congestion_level },
        );
    }

    fn send(&self, dpc: PointCode, message: ScmgMessage) {
        if let Err(e) = self.outbound.try_send(ScmgRequest { dpc, message }) {
            warn!(%dpc, error = %e, "SCMG message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::resource::{Concern, ConcernTable, DataIndication, SccpUser};
    use crate::timer::TokioTimerService;
    use async_trait::async_trait;
    use tokio::runtime::Handle;

    struct StateRecorder(mpsc::UnboundedSender<StateIndication>);

    #[async_trait]
    impl SccpUser for StateRecorder {
        async fn on_data(&self, _indication: DataIndication) {}

        async fn on_state(&self, indication: StateIndication) {
            let _ = self.0.send(indication);
        }
    }

    struct Fixture {
        management: Arc<ManagementStateMachine>,
        resource: Arc<SubsystemResource>,
        scmg: mpsc::Receiver<ScmgRequest>,
    }

    fn fixture() -> Fixture {
        let mut config = SccpConfig::default();
        config.local_point_code = PointCode(1001);
        config.management.sst_interval_ms = 100;
        config.management.sst_interval_max_ms = 1000;
        config.management.sst_backoff_factor = 2.0;

        let (reroute, _) = mpsc::channel(1);
        let resource = Arc::new(SubsystemResource::new(
            config.local_point_code,
            1024,
            Duration::from_secs(1),
            16,
            reroute,
        ));
        let (tx, scmg) = mpsc::channel(64);
        let management = ManagementStateMachine::new(
            &config,
            Arc::new(RemoteStatusTable::new()),
            resource.clone(),
            Arc::new(TokioTimerService::new(Handle::current())),
            tx,
        );
        Fixture { management, resource, scmg }
    }

    fn drain(rx: &mut mpsc::Receiver<ScmgRequest>) -> Vec<ScmgRequest> {
        let mut out = Vec::new();
        while let Ok(request) = rx.try_recv() {
            out.push(request);
        }
        out
    }

    #[test]
    fn test_scmg_codec() {
        let ssp = ScmgMessage::new(ScmgType::Ssp, 8, PointCode(0x1234));
        assert_eq!(&ssp.encode()[..], &[0x02, 0x08, 0x34, 0x12, 0x00]);
        assert_eq!(ScmgMessage::decode(&ssp.encode()).unwrap(), ssp);

        let mut ssc = ScmgMessage::new(ScmgType::Ssc, 1, PointCode(5));
        ssc.congestion_level = Some(3);
        assert_eq!(&ssc.encode()[..], &[0x06, 0x01, 0x05, 0x00, 0x00, 0x03]);
        assert_eq!(ScmgMessage::decode(&ssc.encode()).unwrap(), ssc);

        assert!(ScmgMessage::decode(&[0x06, 0x01, 0x05, 0x00, 0x00]).is_err());
        assert!(ScmgMessage::decode(&[0x09, 0x01, 0x05, 0x00, 0x00]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prohibited_subsystem_stays_prohibited_under_failed_tests() {
        let mut f = fixture();
        let (tx, mut states) = mpsc::unbounded_channel();
        f.resource.register_local_subsystem(8, Arc::new(StateRecorder(tx))).unwrap();
        f.resource.reload_concerns(ConcernTable::new(vec![Concern {
            local_ssn: 8,
            remote_pc: PointCode(5),
            remote_ssn: Some(6),
        }]));

        f.management.handle_scmg(PointCode(5), &ScmgMessage::new(ScmgType::Ssp, 6, PointCode(5)));
        assert_eq!(
            states.recv().await.unwrap(),
            StateIndication::Subsystem { point_code: PointCode(5), ssn: 6, state: SubsystemState::Prohibited }
        );

        // Tests at 100, 200 and 300ms; the third is still unanswered
        tokio::time::sleep(Duration::from_millis(350)).await;
        let tests = drain(&mut f.scmg);
        assert_eq!(tests.len(), 3);
        assert!(tests.iter().all(|r| r.dpc == PointCode(5) && r.message.message_type == ScmgType::Sst));

        let status = f.management.subsystem_status(PointCode(5), 6).unwrap();
        assert_eq!(status.state, SubsystemState::Prohibited);
        assert_eq!(status.consecutive_test_failures, 2);

        // Third failure counted at 400ms, interval backs off to 200ms
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(drain(&mut f.scmg).len(), 1);
        assert_eq!(f.management.subsystem_status(PointCode(5), 6).unwrap().consecutive_test_failures, 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut f.scmg).is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(drain(&mut f.scmg).len(), 1);

        f.management.handle_scmg(PointCode(5), &ScmgMessage::new(ScmgType::Ssa, 6, PointCode(5)));
        let status = f.management.subsystem_status(PointCode(5), 6).unwrap();
        assert_eq!(status.state, SubsystemState::Allowed);
        assert_eq!(status.consecutive_test_failures, 0);
        assert_eq!(
            states.recv().await.unwrap(),
            StateIndication::Subsystem { point_code: PointCode(5), ssn: 6, state: SubsystemState::Allowed }
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut f.scmg).is_empty());
    }

    #[tokio::test]
    async fn test_sst_answered_only_when_in_service() {
        let mut f = fixture();
        let (tx, _states) = mpsc::unbounded_channel();
        f.resource.register_local_subsystem(8, Arc::new(StateRecorder(tx))).unwrap();

        let sst = ScmgMessage::new(ScmgType::Sst, 8, PointCode(1001));
        f.management.handle_scmg(PointCode(5), &sst);
        let replies = drain(&mut f.scmg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].dpc, PointCode(5));
        assert_eq!(replies[0].message.message_type, ScmgType::Ssa);
        assert_eq!(replies[0].message.affected_ssn, 8);

        f.resource.set_subsystem_state(8, LocalSubsystemState::OutOfService).unwrap();
        f.management.handle_scmg(PointCode(5), &sst);
        assert!(drain(&mut f.scmg).is_empty());

        // Unknown SSN
        f.management.handle_scmg(PointCode(5), &ScmgMessage::new(ScmgType::Sst, 9, PointCode(1001)));
        assert!(drain(&mut f.scmg).is_empty());
    }

    #[tokio::test]
    async fn test_point_code_prohibited_and_allowed() {
        let f = fixture();
        let pc = PointCode(7);

        f.management.subsystem_allowed(pc, 6);
        f.management.subsystem_prohibited(pc, 8);
        f.management.signaling_point_prohibited(pc);
        assert_eq!(f.management.point_status(pc).unwrap().state, SignalingPointState::Prohibited);
        assert_eq!(f.management.subsystem_status(pc, 6).unwrap().state, SubsystemState::Prohibited);

        f.management.signaling_point_allowed(pc);
        assert_eq!(f.management.point_status(pc).unwrap().state, SignalingPointState::Allowed);
        // Prohibited by the point code only: re-allowed
        assert_eq!(f.management.subsystem_status(pc, 6).unwrap().state, SubsystemState::Allowed);
        // Prohibited by SSP: still prohibited
        assert_eq!(f.management.subsystem_status(pc, 8).unwrap().state, SubsystemState::Prohibited);
        f.management.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssp_while_point_prohibited_survives_resume() {
        let mut f = fixture();
        let pc = PointCode(7);

        f.management.subsystem_allowed(pc, 8);
        f.management.signaling_point_prohibited(pc);
        assert_eq!(f.management.subsystem_status(pc, 8).unwrap().state, SubsystemState::Prohibited);

        // The node itself now declares the subsystem prohibited
        f.management.handle_scmg(pc, &ScmgMessage::new(ScmgType::Ssp, 8, pc));
        f.management.signaling_point_allowed(pc);
        assert_eq!(f.management.point_status(pc).unwrap().state, SignalingPointState::Allowed);
        assert_eq!(f.management.subsystem_status(pc, 8).unwrap().state, SubsystemState::Prohibited);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let tests = drain(&mut f.scmg);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].dpc, pc);
        assert_eq!(tests[0].message.message_type, ScmgType::Sst);
        assert_eq!(tests[0].message.affected_ssn, 8);

        // A repeated SSP does not start a second test cycle
        f.management.handle_scmg(pc, &ScmgMessage::new(ScmgType::Ssp, 8, pc));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(drain(&mut f.scmg).len(), 1);
        f.management.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_indications_follow_transition_order() {
        let f = fixture();
        let (tx, mut states) = mpsc::unbounded_channel();
        f.resource.register_local_subsystem(8, Arc::new(StateRecorder(tx))).unwrap();
        f.resource.reload_concerns(ConcernTable::new(vec![Concern {
            local_ssn: 8,
            remote_pc: PointCode(5),
            remote_ssn: Some(6),
        }]));

        let links: Vec<_> = [ScmgType::Ssa, ScmgType::Ssp]
            .into_iter()
            .map(|message_type| {
                let management = f.management.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let message = ScmgMessage::new(message_type, 6, PointCode(5));
                        management.handle_scmg(PointCode(5), &message);
                    }
                })
            })
            .collect();
        for link in links {
            link.join().unwrap();
        }

        let final_state = f.management.subsystem_status(PointCode(5), 6).unwrap().state;
        let mut last = None;
        while let Ok(Some(indication)) =
            tokio::time::timeout(Duration::from_millis(200), states.recv()).await
        {
            last = Some(indication);
        }
        if let Some(last) = last {
            assert_eq!(
                last,
                StateIndication::Subsystem { point_code: PointCode(5), ssn: 6, state: final_state }
            );
        } else {
            assert_eq!(final_state, SubsystemState::Allowed);
        }
        f.management.stop();
    }

    #[tokio::test]
    async fn test_congestion_restricts_point() {
        let f = fixture();
        let mut ssc = ScmgMessage::new(ScmgType::Ssc, 1, PointCode(9));
        ssc.congestion_level = Some(4);
        f.management.handle_scmg(PointCode(9), &ssc);

        let status = f.management.point_status(PointCode(9)).unwrap();
        assert_eq!(status.state, SignalingPointState::Restricted);
        assert_eq!(status.congestion_level, 4);

        f.management.signaling_point_congested(PointCode(9), 0);
        assert_eq!(f.management.point_status(PointCode(9)).unwrap().state, SignalingPointState::Allowed);
    }

    #[tokio::test]
    async fn test_local_state_broadcast_to_concerned_points() {
        let mut f = fixture();
        f.resource.reload_concerns(ConcernTable::new(vec![
            Concern { local_ssn: 8, remote_pc: PointCode(5), remote_ssn: None },
            Concern { local_ssn: 8, remote_pc: PointCode(6), remote_ssn: Some(8) },
            Concern { local_ssn: 147, remote_pc: PointCode(7), remote_ssn: None },
        ]));
        let events = f.resource.subscribe();
        let task = f.management.spawn_event_loop(events);

        let (tx, _states) = mpsc::unbounded_channel();
        f.resource.register_local_subsystem(8, Arc::new(StateRecorder(tx))).unwrap();

        let mut dpcs = Vec::new();
        for _ in 0..2 {
            let request = f.scmg.recv().await.unwrap();
            assert_eq!(request.message.message_type, ScmgType::Ssa);
            assert_eq!(request.message.affected_pc, PointCode(1001));
            dpcs.push(request.dpc);
        }
        assert_eq!(dpcs, vec![PointCode(5), PointCode(6)]);

        f.resource.set_subsystem_state(8, LocalSubsystemState::OutOfService).unwrap();
        assert_eq!(f.scmg.recv().await.unwrap().message.message_type, ScmgType::Ssp);
        task.abort();
    }
}
