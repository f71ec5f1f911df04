//! Boundary towards the MTP3 transfer service
//!
//! The transport collaborator (M3UA over SCTP, or anything else that can move
//! MTP3 user part messages) implements [`Mtp3Transport`] for outbound traffic
//! and reports inbound traffic and reachability through a [`TransportHandle`]
//! obtained from the stack.

use crate::errors::{LinkUnavailable, Result, SccpError};
use crate::types::{PointCode, Sls};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half of the MTP3 collaborator
#[async_trait]
pub trait Mtp3Transport: Send + Sync {
    /// Hand an SCCP message to the link set towards `dpc`
    async fn send_to_link(
        &self,
        dpc: PointCode,
        sls: Sls,
        data: Bytes,
    ) -> std::result::Result<(), LinkUnavailable>;
}

/// Events raised by the transport collaborator
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// MTP-TRANSFER indication carrying an SCCP message
    Inbound { data: Bytes, opc: PointCode, sls: Sls },
    /// MTP-PAUSE (`reachable == false`) / MTP-RESUME (`reachable == true`)
    LinkStatus { point_code: PointCode, reachable: bool },
}

/// Handle given to a transport for reporting inbound events
///
/// Events are queued to the binding's worker, which processes them in
/// order. Awaiting a send applies backpressure to the transport when the
/// worker falls behind.
#[derive(Clone)]
pub struct TransportHandle {
    binding_id: u32,
    tx: mpsc::Sender<TransportEvent>,
}

impl TransportHandle {
    pub(crate) fn new(binding_id: u32, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { binding_id, tx }
    }

    pub fn binding_id(&self) -> u32 {
        self.binding_id
    }

    pub async fn on_inbound_message(&self, data: Bytes, opc: PointCode, sls: Sls) -> Result<()> {
        self.tx
            .send(TransportEvent::Inbound { data, opc, sls })
            .await
            .map_err(|_| SccpError::StackNotRunning)
    }

    pub async fn on_link_status_changed(&self, point_code: PointCode, reachable: bool) -> Result<()> {
        self.tx
            .send(TransportEvent::LinkStatus { point_code, reachable })
            .await
            .map_err(|_| SccpError::StackNotRunning)
    }
}

/// An active transport bound to the stack
pub struct TransportBinding {
    pub id: u32,
    pub transport: Arc<dyn Mtp3Transport>,
    /// Destinations served by this binding; empty means any destination
    pub point_codes: Vec<PointCode>,
}

impl TransportBinding {
    pub fn serves(&self, dpc: PointCode) -> bool {
        self.point_codes.is_empty() || self.point_codes.contains(&dpc)
    }
}

/// Table of active transport bindings
#[derive(Default)]
pub struct TransportBindings {
    bindings: RwLock<BTreeMap<u32, Arc<TransportBinding>>>,
}

impl TransportBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a binding, returning `false` if the id is taken
    pub fn insert(&self, binding: TransportBinding) -> bool {
        let mut bindings = self.bindings.write();
        if bindings.contains_key(&binding.id) {
            return false;
        }
        bindings.insert(binding.id, Arc::new(binding));
        true
    }

    pub fn remove(&self, id: u32) -> Option<Arc<TransportBinding>> {
        self.bindings.write().remove(&id)
    }

    pub fn clear(&self) {
        self.bindings.write().clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bindings serving `dpc` in try order.
    ///
    /// Dedicated bindings are preferred over catch-all ones. Within that set
    /// the first choice is `sls mod n`, the rest follow in ring order.
    pub fn select(&self, dpc: PointCode, sls: Sls) -> Vec<Arc<TransportBinding>> {
        let bindings = self.bindings.read();
        let mut candidates: Vec<Arc<TransportBinding>> = bindings
            .values()
            .filter(|b| !b.point_codes.is_empty() && b.serves(dpc))
            .cloned()
            .collect();
        if candidates.is_empty() {
            candidates = bindings
                .values()
                .filter(|b| b.point_codes.is_empty())
                .cloned()
                .collect();
        }
        if candidates.is_empty() {
            return candidates;
        }

        let start = sls as usize % candidates.len();
        candidates.rotate_left(start);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    #[async_trait]
    impl Mtp3Transport for NullTransport {
        async fn send_to_link(
            &self,
            _dpc: PointCode,
            _sls: Sls,
            _data: Bytes,
        ) -> std::result::Result<(), LinkUnavailable> {
            Ok(())
        }
    }

    fn binding(id: u32, pcs: &[u32]) -> TransportBinding {
        TransportBinding {
            id,
            transport: Arc::new(NullTransport),
            point_codes: pcs.iter().copied().map(PointCode).collect(),
        }
    }

    #[test]
    fn test_select_prefers_dedicated_bindings() {
        let table = TransportBindings::new();
        assert!(table.insert(binding(1, &[])));
        assert!(table.insert(binding(2, &[5])));
        assert!(table.insert(binding(3, &[5, 6])));
        assert!(!table.insert(binding(3, &[])));

        let ids: Vec<u32> = table.select(PointCode(5), 0).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 3]);
        let ids: Vec<u32> = table.select(PointCode(5), 1).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![3, 2]);

        let ids: Vec<u32> = table.select(PointCode(9), 7).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_select_without_route() {
        let table = TransportBindings::new();
        table.insert(binding(2, &[5]));
        assert!(table.select(PointCode(6), 0).is_empty());
        assert!(table.remove(2).is_some());
        assert!(table.is_empty());
    }
}
