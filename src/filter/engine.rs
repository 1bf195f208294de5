use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::dns::query::extract_query_name;
use crate::models::Device;
use crate::stats::channel::StatsSender;
use crate::sync::snapshot::{PolicySnapshot, SnapshotSlot};

/// Why a flow was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    DeviceBlocked,
    TimeLimitExceeded,
    QuietHours,
    DestinationBlocked,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DeviceBlocked => "device blocked",
            BlockReason::TimeLimitExceeded => "time limit exceeded",
            BlockReason::QuietHours => "quiet hours",
            BlockReason::DestinationBlocked => "destination blocked",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Blocked(BlockReason),
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => f.write_str("allowed"),
            Decision::Blocked(reason) => write!(f, "blocked ({})", reason),
        }
    }
}

/// Where a flow is going; either part may be unknown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTarget {
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
}

impl FlowTarget {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ip: None,
        }
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self {
            host: None,
            ip: Some(ip),
        }
    }
}

/// A decision together with the blocked domain that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub matched_rule: Option<Arc<str>>,
}

impl Evaluation {
    fn allowed() -> Self {
        Self {
            decision: Decision::Allowed,
            matched_rule: None,
        }
    }

    fn blocked(reason: BlockReason) -> Self {
        Self {
            decision: Decision::Blocked(reason),
            matched_rule: None,
        }
    }
}

/// Result of running a raw DNS payload through the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDecision {
    /// Extracted question name, `None` when the payload was malformed
    pub name: Option<String>,
    pub device_id: Option<Uuid>,
    pub decision: Decision,
    pub matched_rule: Option<Arc<str>>,
    pub snapshot_version: u64,
}

/// Evaluate one flow against `snapshot`.
///
/// Checks run in a fixed order and the first hit wins: protection switch,
/// blocked device, exhausted time budget, quiet hours, then the
/// destination itself.
pub fn evaluate(
    snapshot: &PolicySnapshot,
    target: &FlowTarget,
    device: Option<&Device>,
    now: NaiveDateTime,
) -> Evaluation {
    if !snapshot.protection_enabled {
        return Evaluation::allowed();
    }

    if let Some(device) = device {
        if device.is_blocked {
            return Evaluation::blocked(BlockReason::DeviceBlocked);
        }
        if snapshot.time_budget.has_exceeded(device) {
            return Evaluation::blocked(BlockReason::TimeLimitExceeded);
        }
    }

    let global_quiet = snapshot.quiet_hours.as_ref().is_some_and(|q| q.is_active(now));
    let limit_quiet = snapshot
        .time_budget
        .time_limit_for(device)
        .and_then(|limit| limit.quiet_hours.as_ref())
        .is_some_and(|q| q.is_active(now));
    if global_quiet || limit_quiet {
        return Evaluation::blocked(BlockReason::QuietHours);
    }

    if let Some(host) = target.host.as_deref() {
        if let Some(rule) = snapshot.matcher.matching_rule(host) {
            return Evaluation {
                decision: Decision::Blocked(BlockReason::DestinationBlocked),
                matched_rule: Some(rule),
            };
        }
        // IP literals in place of a host name
        if let Ok(ip) = host.trim().parse::<IpAddr>() {
            if snapshot.blocked_ips.contains(&ip) {
                return Evaluation::blocked(BlockReason::DestinationBlocked);
            }
        }
    }

    if let Some(ip) = target.ip {
        if snapshot.blocked_ips.contains(&ip) {
            return Evaluation::blocked(BlockReason::DestinationBlocked);
        }
    }

    Evaluation::allowed()
}

/// Decides flows against whatever snapshot is live at the time.
///
/// The engine does no I/O. Blocked outcomes are reported through the
/// optional statistics sender, which never waits.
pub struct PolicyEngine {
    slot: Arc<SnapshotSlot>,
    stats: Option<StatsSender>,
}

impl PolicyEngine {
    pub fn new(slot: Arc<SnapshotSlot>) -> Self {
        Self { slot, stats: None }
    }

    pub fn with_stats(mut self, stats: StatsSender) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.slot.current()
    }

    /// Decide using the local wall clock
    pub fn decide(&self, target: &FlowTarget, device: Option<&Device>) -> Decision {
        self.decide_at(target, device, Local::now().naive_local())
    }

    pub fn decide_at(&self, target: &FlowTarget, device: Option<&Device>, now: NaiveDateTime) -> Decision {
        let snapshot = self.slot.current();
        let evaluation = evaluate(&snapshot, target, device, now);
        self.report(&evaluation, device.map(|d| d.id));
        evaluation.decision
    }

    /// Decide a raw DNS query from `source`, looking the device up by address
    pub fn decide_packet(&self, packet: &[u8], source: Option<IpAddr>) -> PacketDecision {
        self.decide_packet_at(packet, source, Local::now().naive_local())
    }

    pub fn decide_packet_at(&self, packet: &[u8], source: Option<IpAddr>, now: NaiveDateTime) -> PacketDecision {
        let snapshot = self.slot.current();
        let device = source.and_then(|ip| snapshot.device_by_ip(&ip));
        let name = extract_query_name(packet);

        let target = FlowTarget {
            host: name.clone(),
            ip: None,
        };
        let evaluation = evaluate(&snapshot, &target, device, now);
        let device_id = device.map(|d| d.id);
        self.report(&evaluation, device_id);

        trace!(
            "DNS {:?} from {:?}: {} (v{})",
            name, source, evaluation.decision, snapshot.version
        );

        PacketDecision {
            name,
            device_id,
            decision: evaluation.decision,
            matched_rule: evaluation.matched_rule,
            snapshot_version: snapshot.version,
        }
    }

    /// Decide a non-DNS flow to `destination` from `source`
    pub fn decide_flow(&self, destination: IpAddr, source: Option<IpAddr>) -> Decision {
        let snapshot = self.slot.current();
        let device = source.and_then(|ip| snapshot.device_by_ip(&ip));
        let evaluation = evaluate(&snapshot, &FlowTarget::ip(destination), device, Local::now().naive_local());
        self.report(&evaluation, device.map(|d| d.id));
        evaluation.decision
    }

    fn report(&self, evaluation: &Evaluation, device_id: Option<Uuid>) {
        if !evaluation.decision.is_blocked() {
            return;
        }
        if let Some(stats) = &self.stats {
            stats.blocked(evaluation.matched_rule.as_deref(), device_id);
        }
    }
}
