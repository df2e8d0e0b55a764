//! Ingestion gateway core: broker-agnostic message handling and
//! subscription bookkeeping. The MQTT event loop lives in `mqtt`.

use crate::config::{BrokerSettings, Settings};
use crate::error::PipelineError;
use crate::gaps::{Gap, GapTracker};
use crate::measurement::WireLayout;
use crate::quantity::Quantity;
use crate::store::{InsertOutcome, MeasurementStoreLike};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
    ParseFailed,
    StoreFailed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub parse_failures: u64,
    pub store_failures: u64,
}

pub trait BrokerLike {
    fn subscribe(&mut self, topic: &str) -> Result<(), PipelineError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), PipelineError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<i32>,
    pub removed: Vec<i32>,
}

pub struct IngestionGateway<S: MeasurementStoreLike> {
    store: S,
    layout: WireLayout,
    quantities: Vec<Quantity>,
    broker: BrokerSettings,
    gaps: GapTracker,
    state: ConnectionState,
    subscriptions: BTreeMap<i32, String>,
    stats: IngestStats,
}

impl<S: MeasurementStoreLike> IngestionGateway<S> {
    pub fn new(store: S, settings: &Settings) -> Self {
        Self {
            store,
            layout: WireLayout::new(settings.wire.gps_error_index, &settings.quantities),
            quantities: settings.quantities.clone(),
            broker: settings.broker.clone(),
            gaps: GapTracker::default(),
            state: ConnectionState::Disconnected,
            subscriptions: BTreeMap::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn subscribed_nodes(&self) -> Vec<i32> {
        self.subscriptions.keys().copied().collect()
    }

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("broker connection lost");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Subscribe to every node in the registry. The broker session may have
    /// been lost, so previous subscriptions are not trusted.
    pub fn on_connected(&mut self, broker: &mut dyn BrokerLike) -> Result<usize, PipelineError> {
        let nodes = self.store.node_ids()?;
        self.subscriptions.clear();
        for node in nodes {
            let topic = self.broker.topic_for(node);
            match broker.subscribe(&topic) {
                Ok(()) => {
                    self.subscriptions.insert(node, topic);
                }
                Err(e) => error!(node = node, error = %e, "subscribe failed"),
            }
        }
        self.state = ConnectionState::Subscribed;
        info!(nodes = self.subscriptions.len(), "subscribed to node topics");
        Ok(self.subscriptions.len())
    }

    /// Diff the registry against current subscriptions.
    pub fn reconcile(&mut self, broker: &mut dyn BrokerLike) -> Result<ReconcileReport, PipelineError> {
        let wanted: BTreeSet<i32> = self.store.node_ids()?.into_iter().collect();
        let mut report = ReconcileReport::default();

        let stale: Vec<i32> = self.subscriptions.keys().filter(|n| !wanted.contains(n)).copied().collect();
        for node in stale {
            if let Some(topic) = self.subscriptions.get(&node).cloned() {
                match broker.unsubscribe(&topic) {
                    Ok(()) => {
                        self.subscriptions.remove(&node);
                        report.removed.push(node);
                    }
                    Err(e) => error!(node = node, error = %e, "unsubscribe failed"),
                }
            }
        }
        for node in wanted {
            if self.subscriptions.contains_key(&node) {
                continue;
            }
            let topic = self.broker.topic_for(node);
            match broker.subscribe(&topic) {
                Ok(()) => {
                    self.subscriptions.insert(node, topic);
                    report.added.push(node);
                }
                Err(e) => error!(node = node, error = %e, "subscribe failed"),
            }
        }
        if !report.added.is_empty() || !report.removed.is_empty() {
            info!(added = ?report.added, removed = ?report.removed, "subscriptions reconciled");
        }
        Ok(report)
    }

    /// Handle one inbound record. Never fails: every problem is logged and
    /// the record dropped.
    pub fn handle_message(&mut self, payload: &[u8]) -> IngestOutcome {
        if self.state == ConnectionState::Subscribed {
            self.state = ConnectionState::Receiving;
        }
        let measurement = match self.layout.parse(payload) {
            Ok(m) => m,
            Err(e) => {
                self.stats.parse_failures += 1;
                warn!(error = %e, payload = %String::from_utf8_lossy(payload), "dropping malformed record");
                return IngestOutcome::ParseFailed;
            }
        };

        let opened = self.gaps.observe(measurement.node_id, measurement.sequence);
        if opened > 0 {
            debug!(
                node = measurement.node_id,
                sequence = measurement.sequence,
                missing = opened,
                pending = self.gaps.pending_count(),
                "sequence gap"
            );
        }

        match self.store.insert_measurement(&measurement, &self.quantities) {
            Ok(InsertOutcome::Inserted) => {
                self.stats.accepted += 1;
                IngestOutcome::Accepted
            }
            Ok(InsertOutcome::Duplicate) => {
                self.stats.duplicates += 1;
                info!(node = measurement.node_id, sequence = measurement.sequence, "record already stored");
                IngestOutcome::Duplicate
            }
            Err(e) => {
                self.stats.store_failures += 1;
                error!(node = measurement.node_id, sequence = measurement.sequence, error = %e, "insert failed, record dropped");
                // The record is lost here; queue it for re-request like any other gap.
                self.gaps.register_gap(measurement.node_id, measurement.sequence..measurement.sequence.saturating_add(1));
                IngestOutcome::StoreFailed
            }
        }
    }

    pub fn consume_pending_gaps(&mut self) -> Vec<Gap> {
        self.gaps.consume_pending_gaps()
    }

    /// Drain pending gaps and log one re-request line per node.
    pub fn report_gaps(&mut self) -> Vec<Gap> {
        let gaps = self.consume_pending_gaps();
        for gap in &gaps {
            warn!(node = gap.node_id, missing = ?gap.missing, "re-request missing sequences");
        }
        gaps
    }
}
