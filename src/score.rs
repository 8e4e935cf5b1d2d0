//! Peer scoring engine.
//!
//! Maintains per-peer, per-topic behavioral counters and computes a scalar
//! score on demand. The score gates every admission decision the router
//! makes: mesh grafting, gossip emission, publish targets and the graylist.
//!
//! Score components per topic: time in mesh (P1), first message deliveries
//! (P2), mesh message delivery deficit (P3), sticky mesh failure penalty
//! (P3b) and invalid message deliveries (P4). Whole-peer components:
//! application-specific score (P5), IP colocation (P6) and the behavioural
//! penalty (P7). Counters decay multiplicatively every decay interval and
//! snap to zero below `decay_to_zero`.
//!
//! Scores of disconnected peers are retained and keep decaying; the entry
//! is only deleted once the score has decayed to (near) zero or the
//! retention ceiling elapses, so a peer cannot shed a negative score by
//! reconnecting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::ConfigError;
use crate::peer::PeerId;
use crate::rpc::MessageId;

/// How long delivery records are kept for duplicate/invalid attribution.
const DELIVERY_RECORD_TTL: Duration = Duration::from_secs(120);

/// Per-topic score parameters.
#[derive(Clone, Debug)]
pub struct TopicScoreParams {
    /// Weight of this topic in the overall peer score.
    pub topic_weight: f64,

    /// P1: weight for time in mesh. Must be positive or 0 to disable.
    pub time_in_mesh_weight: f64,
    /// P1: the score value is time-in-mesh divided by this quantum.
    pub time_in_mesh_quantum: Duration,
    /// P1: cap on the quantized time-in-mesh value.
    pub time_in_mesh_cap: f64,

    /// P2: weight for first message deliveries. Positive or 0.
    pub first_message_deliveries_weight: f64,
    /// P2: multiplicative decay per decay interval, in (0, 1).
    pub first_message_deliveries_decay: f64,
    /// P2: counter cap.
    pub first_message_deliveries_cap: f64,

    /// P3: weight for the mesh delivery deficit. Negative or 0.
    pub mesh_message_deliveries_weight: f64,
    /// P3: multiplicative decay per decay interval.
    pub mesh_message_deliveries_decay: f64,
    /// P3: counter cap.
    pub mesh_message_deliveries_cap: f64,
    /// P3: deliveries below this threshold incur a squared-deficit penalty.
    pub mesh_message_deliveries_threshold: f64,
    /// P3: duplicate deliveries later than this after validation don't count.
    pub mesh_message_deliveries_window: Duration,
    /// P3: grace period in the mesh before the deficit penalty activates.
    pub mesh_message_deliveries_activation: Duration,

    /// P3b: weight for the sticky mesh failure penalty. Negative or 0.
    pub mesh_failure_penalty_weight: f64,
    /// P3b: multiplicative decay per decay interval.
    pub mesh_failure_penalty_decay: f64,

    /// P4: weight for invalid message deliveries (squared). Negative or 0.
    pub invalid_message_deliveries_weight: f64,
    /// P4: multiplicative decay per decay interval.
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 0.5,

            time_in_mesh_weight: 1.0,
            time_in_mesh_quantum: Duration::from_secs(1),
            time_in_mesh_cap: 3600.0,

            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: 0.5,
            first_message_deliveries_cap: 2000.0,

            mesh_message_deliveries_weight: -1.0,
            mesh_message_deliveries_decay: 0.5,
            mesh_message_deliveries_cap: 100.0,
            mesh_message_deliveries_threshold: 20.0,
            mesh_message_deliveries_window: Duration::from_millis(10),
            mesh_message_deliveries_activation: Duration::from_secs(5),

            mesh_failure_penalty_weight: -1.0,
            mesh_failure_penalty_decay: 0.5,

            invalid_message_deliveries_weight: -1.0,
            invalid_message_deliveries_decay: 0.3,
        }
    }
}

fn valid_decay(decay: f64) -> bool {
    decay > 0.0 && decay < 1.0
}

impl TopicScoreParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.topic_weight.is_finite() || self.topic_weight < 0.0 {
            return Err(ConfigError::new("topic weight must be >= 0"));
        }
        if self.time_in_mesh_quantum.is_zero() {
            return Err(ConfigError::new("time in mesh quantum must be non-zero"));
        }
        if self.time_in_mesh_weight < 0.0 {
            return Err(ConfigError::new(
                "time in mesh weight must be positive (or 0 to disable)",
            ));
        }
        if self.time_in_mesh_weight != 0.0 && self.time_in_mesh_cap <= 0.0 {
            return Err(ConfigError::new("time in mesh cap must be positive"));
        }
        if self.first_message_deliveries_weight < 0.0 {
            return Err(ConfigError::new(
                "first message deliveries weight must be positive (or 0 to disable)",
            ));
        }
        if self.first_message_deliveries_weight != 0.0 {
            if !valid_decay(self.first_message_deliveries_decay) {
                return Err(ConfigError::new(
                    "first message deliveries decay must be between 0 and 1",
                ));
            }
            if self.first_message_deliveries_cap <= 0.0 {
                return Err(ConfigError::new(
                    "first message deliveries cap must be positive",
                ));
            }
        }
        if self.mesh_message_deliveries_weight > 0.0 {
            return Err(ConfigError::new(
                "mesh message deliveries weight must be negative (or 0 to disable)",
            ));
        }
        if self.mesh_message_deliveries_weight != 0.0 {
            if !valid_decay(self.mesh_message_deliveries_decay) {
                return Err(ConfigError::new(
                    "mesh message deliveries decay must be between 0 and 1",
                ));
            }
            if self.mesh_message_deliveries_cap <= 0.0 {
                return Err(ConfigError::new(
                    "mesh message deliveries cap must be positive",
                ));
            }
            if self.mesh_message_deliveries_threshold <= 0.0 {
                return Err(ConfigError::new(
                    "mesh message deliveries threshold must be positive",
                ));
            }
            if self.mesh_message_deliveries_activation < Duration::from_secs(1) {
                return Err(ConfigError::new(
                    "mesh message deliveries activation must be at least 1s",
                ));
            }
        }
        if self.mesh_failure_penalty_weight > 0.0 {
            return Err(ConfigError::new(
                "mesh failure penalty weight must be negative (or 0 to disable)",
            ));
        }
        if self.mesh_failure_penalty_weight != 0.0 && !valid_decay(self.mesh_failure_penalty_decay)
        {
            return Err(ConfigError::new(
                "mesh failure penalty decay must be between 0 and 1",
            ));
        }
        if self.invalid_message_deliveries_weight > 0.0 {
            return Err(ConfigError::new(
                "invalid message deliveries weight must be negative (or 0 to disable)",
            ));
        }
        if !valid_decay(self.invalid_message_deliveries_decay) {
            return Err(ConfigError::new(
                "invalid message deliveries decay must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Whole-node score parameters.
#[derive(Clone, Debug)]
pub struct PeerScoreParams {
    /// Per-topic parameters. Only topics listed here are scored.
    pub topics: HashMap<String, TopicScoreParams>,
    /// Cap on the positive contribution of all topics combined. 0 disables.
    pub topic_score_cap: f64,

    /// P5: weight applied to the externally supplied application score.
    pub app_specific_weight: f64,

    /// P6: weight for the IP colocation factor. Must be negative or 0.
    pub ip_colocation_factor_weight: f64,
    /// P6: peers per address beyond this threshold incur the penalty.
    pub ip_colocation_factor_threshold: usize,
    /// P6: addresses exempt from colocation scoring.
    pub ip_colocation_factor_whitelist: HashSet<String>,

    /// P7: weight for the behavioural penalty (squared excess). Negative or 0.
    pub behaviour_penalty_weight: f64,
    /// P7: counter value below which no penalty applies.
    pub behaviour_penalty_threshold: f64,
    /// P7: multiplicative decay per decay interval.
    pub behaviour_penalty_decay: f64,

    /// Interval between counter decay applications.
    pub decay_interval: Duration,
    /// Counters below this magnitude snap to zero.
    pub decay_to_zero: f64,
    /// How long a disconnected peer's counters are retained.
    pub retain_score: Duration,
}

impl Default for PeerScoreParams {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            topic_score_cap: 10.0,
            app_specific_weight: 10.0,
            ip_colocation_factor_weight: -5.0,
            ip_colocation_factor_threshold: 10,
            ip_colocation_factor_whitelist: HashSet::new(),
            behaviour_penalty_weight: -10.0,
            behaviour_penalty_threshold: 0.0,
            behaviour_penalty_decay: 0.2,
            decay_interval: Duration::from_secs(1),
            decay_to_zero: 0.01,
            retain_score: Duration::from_secs(3600),
        }
    }
}

impl PeerScoreParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for params in self.topics.values() {
            params.validate()?;
        }
        if !self.topic_score_cap.is_finite() || self.topic_score_cap < 0.0 {
            return Err(ConfigError::new(
                "topic score cap must be positive (or 0 for no cap)",
            ));
        }
        if self.ip_colocation_factor_weight > 0.0 {
            return Err(ConfigError::new(
                "ip colocation factor weight must be negative (or 0 to disable)",
            ));
        }
        if self.ip_colocation_factor_weight != 0.0 && self.ip_colocation_factor_threshold < 1 {
            return Err(ConfigError::new(
                "ip colocation factor threshold must be at least 1",
            ));
        }
        if self.behaviour_penalty_weight > 0.0 {
            return Err(ConfigError::new(
                "behaviour penalty weight must be negative (or 0 to disable)",
            ));
        }
        if self.behaviour_penalty_weight != 0.0 && !valid_decay(self.behaviour_penalty_decay) {
            return Err(ConfigError::new(
                "behaviour penalty decay must be between 0 and 1",
            ));
        }
        if self.decay_interval < Duration::from_millis(100) {
            return Err(ConfigError::new("decay interval must be at least 100ms"));
        }
        if !valid_decay(self.decay_to_zero) {
            return Err(ConfigError::new("decay to zero must be between 0 and 1"));
        }
        Ok(())
    }
}

/// Score thresholds driving router admission decisions.
#[derive(Clone, Copy, Debug)]
pub struct ScoreThresholds {
    /// Below this, no gossip is emitted to or accepted from the peer.
    pub gossip_threshold: f64,
    /// Below this, published messages are not sent to the peer.
    pub publish_threshold: f64,
    /// Below this, all frames from the peer are ignored.
    pub graylist_threshold: f64,
    /// Peer-exchange records in PRUNE are only trusted above this.
    pub accept_px_threshold: f64,
    /// Median mesh score below this triggers opportunistic grafting.
    pub opportunistic_graft_threshold: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            gossip_threshold: -10.0,
            publish_threshold: -50.0,
            graylist_threshold: -100.0,
            accept_px_threshold: 10.0,
            opportunistic_graft_threshold: 20.0,
        }
    }
}

impl ScoreThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gossip_threshold > 0.0 {
            return Err(ConfigError::new("gossip threshold must be <= 0"));
        }
        if self.publish_threshold > self.gossip_threshold {
            return Err(ConfigError::new(
                "publish threshold must be <= gossip threshold",
            ));
        }
        if self.graylist_threshold > self.publish_threshold {
            return Err(ConfigError::new(
                "graylist threshold must be <= publish threshold",
            ));
        }
        if self.accept_px_threshold < 0.0 {
            return Err(ConfigError::new("accept px threshold must be >= 0"));
        }
        if self.opportunistic_graft_threshold < 0.0 {
            return Err(ConfigError::new(
                "opportunistic graft threshold must be >= 0",
            ));
        }
        Ok(())
    }
}

/// Per-peer, per-topic counters.
#[derive(Clone, Debug)]
struct TopicStats {
    in_mesh: bool,
    graft_time: Instant,
    /// Accumulated time in mesh, refreshed lazily at decay time.
    mesh_time: Duration,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_message_deliveries_active: bool,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl TopicStats {
    fn new(now: Instant) -> Self {
        Self {
            in_mesh: false,
            graft_time: now,
            mesh_time: Duration::ZERO,
            first_message_deliveries: 0.0,
            mesh_message_deliveries: 0.0,
            mesh_message_deliveries_active: false,
            mesh_failure_penalty: 0.0,
            invalid_message_deliveries: 0.0,
        }
    }
}

/// Per-peer score state.
#[derive(Clone, Debug)]
struct PeerStats {
    connected: bool,
    /// While disconnected: when the retained entry may be deleted.
    expire: Option<Instant>,
    topics: HashMap<String, TopicStats>,
    known_ips: HashSet<String>,
    behaviour_penalty: f64,
    app_score: f64,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            connected: true,
            expire: None,
            topics: HashMap::new(),
            known_ips: HashSet::new(),
            behaviour_penalty: 0.0,
            app_score: 0.0,
        }
    }
}

/// Validator verdict categories relevant to scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Message failed validation; the sender and every peer that forwarded
    /// it during validation are penalized.
    Invalid,
    /// Validator chose to ignore the message; the id is marked seen but
    /// nobody is penalized.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryStatus {
    /// Validation outcome not yet known.
    Unknown,
    Valid,
    Invalid,
    Ignored,
}

struct DeliveryRecord {
    status: DeliveryStatus,
    first_seen: Instant,
    validated: Option<Instant>,
    /// Peers that forwarded the message while its status was unknown.
    peers: HashSet<PeerId>,
}

/// Recent message delivery traces, used to attribute duplicate and invalid
/// deliveries to every peer involved, exactly once each.
struct DeliveryRecords {
    records: HashMap<MessageId, DeliveryRecord>,
    queue: VecDeque<(MessageId, Instant)>,
}

impl DeliveryRecords {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn ensure(&mut self, id: MessageId, now: Instant) -> &mut DeliveryRecord {
        match self.records.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.queue.push_back((id, now));
                entry.insert(DeliveryRecord {
                    status: DeliveryStatus::Unknown,
                    first_seen: now,
                    validated: None,
                    peers: HashSet::new(),
                })
            }
        }
    }

    fn gc(&mut self, now: Instant) {
        while let Some((id, first_seen)) = self.queue.front().copied() {
            if now.duration_since(first_seen) <= DELIVERY_RECORD_TTL {
                break;
            }
            self.queue.pop_front();
            self.records.remove(&id);
        }
    }
}

/// The scoring engine. Owned by the router's core loop; all interaction goes
/// through the event methods below plus [`PeerScore::score`].
pub struct PeerScore {
    params: PeerScoreParams,
    peer_stats: HashMap<PeerId, PeerStats>,
    /// Address => peers observed at that address, for P6.
    peer_ips: HashMap<String, HashSet<PeerId>>,
    deliveries: DeliveryRecords,
    last_refresh: Instant,
}

impl PeerScore {
    /// Rejects malformed parameters rather than running with undefined
    /// numeric behavior.
    pub fn new(params: PeerScoreParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            params,
            peer_stats: HashMap::new(),
            peer_ips: HashMap::new(),
            deliveries: DeliveryRecords::new(),
            last_refresh: Instant::now(),
        })
    }

    pub fn params(&self) -> &PeerScoreParams {
        &self.params
    }

    /// Compute the score for a peer. Always computed on demand from the
    /// current counters, never cached.
    pub fn score(&self, peer: &PeerId, now: Instant) -> f64 {
        let Some(stats) = self.peer_stats.get(peer) else {
            return 0.0;
        };

        let mut topic_contribution = 0.0;
        for (topic, tstats) in &stats.topics {
            let Some(tp) = self.params.topics.get(topic) else {
                continue;
            };
            let mut topic_score = 0.0;

            // P1: time in mesh, quantized and capped.
            if tstats.in_mesh {
                let mesh_time = now.duration_since(tstats.graft_time);
                let p1 = (mesh_time.as_secs_f64() / tp.time_in_mesh_quantum.as_secs_f64())
                    .min(tp.time_in_mesh_cap);
                topic_score += p1 * tp.time_in_mesh_weight;
            }

            // P2: first message deliveries (counter already capped).
            topic_score += tstats.first_message_deliveries * tp.first_message_deliveries_weight;

            // P3: squared deficit once the activation window has matured.
            if tstats.mesh_message_deliveries_active
                && tstats.mesh_message_deliveries < tp.mesh_message_deliveries_threshold
            {
                let deficit =
                    tp.mesh_message_deliveries_threshold - tstats.mesh_message_deliveries;
                topic_score += deficit * deficit * tp.mesh_message_deliveries_weight;
            }

            // P3b: sticky failure penalty.
            topic_score += tstats.mesh_failure_penalty * tp.mesh_failure_penalty_weight;

            // P4: squared invalid deliveries.
            topic_score += tstats.invalid_message_deliveries
                * tstats.invalid_message_deliveries
                * tp.invalid_message_deliveries_weight;

            topic_contribution += topic_score * tp.topic_weight;
        }

        let mut score = topic_contribution;
        if self.params.topic_score_cap > 0.0 && score > self.params.topic_score_cap {
            score = self.params.topic_score_cap;
        }

        // P5: application-specific score.
        score += stats.app_score * self.params.app_specific_weight;

        // P6: IP colocation, counted per distinct shared address.
        for ip in &stats.known_ips {
            if self.params.ip_colocation_factor_whitelist.contains(ip) {
                continue;
            }
            let peers_at_ip = self.peer_ips.get(ip).map_or(0, HashSet::len);
            if peers_at_ip > self.params.ip_colocation_factor_threshold {
                let surplus = (peers_at_ip - self.params.ip_colocation_factor_threshold) as f64;
                score += surplus * surplus * self.params.ip_colocation_factor_weight;
            }
        }

        // P7: squared excess over the behaviour penalty threshold.
        if stats.behaviour_penalty > self.params.behaviour_penalty_threshold {
            let excess = stats.behaviour_penalty - self.params.behaviour_penalty_threshold;
            score += excess * excess * self.params.behaviour_penalty_weight;
        }

        score
    }

    /// A peer connected. Reconnecting within the retention window resumes
    /// the retained counters instead of starting fresh.
    pub fn add_peer(&mut self, peer: PeerId) {
        let stats = self.peer_stats.entry(peer).or_insert_with(PeerStats::new);
        stats.connected = true;
        stats.expire = None;
    }

    /// A peer disconnected. Positive scores are discarded immediately;
    /// non-positive scores are retained for `retain_score` so the penalty
    /// cannot be reset by reconnecting.
    pub fn remove_peer(&mut self, peer: &PeerId, now: Instant) {
        let score = self.score(peer, now);
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };

        if score > 0.0 {
            let ips = std::mem::take(&mut stats.known_ips);
            self.peer_stats.remove(peer);
            for ip in ips {
                remove_peer_ip(&mut self.peer_ips, &ip, peer);
            }
            return;
        }

        // Retained entry: reset positive counters and apply the sticky mesh
        // failure penalty for topics with an active delivery deficit.
        for (topic, tstats) in stats.topics.iter_mut() {
            tstats.first_message_deliveries = 0.0;
            if let Some(tp) = self.params.topics.get(topic) {
                if tstats.in_mesh
                    && tstats.mesh_message_deliveries_active
                    && tstats.mesh_message_deliveries < tp.mesh_message_deliveries_threshold
                {
                    let deficit =
                        tp.mesh_message_deliveries_threshold - tstats.mesh_message_deliveries;
                    tstats.mesh_failure_penalty += deficit * deficit;
                }
            }
            tstats.in_mesh = false;
            tstats.mesh_message_deliveries_active = false;
        }
        stats.connected = false;
        stats.expire = Some(now + self.params.retain_score);
    }

    /// Record an observed address for a peer.
    pub fn add_ip(&mut self, peer: &PeerId, ip: String) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.known_ips.insert(ip.clone());
        }
        self.peer_ips.entry(ip).or_default().insert(*peer);
    }

    pub fn remove_ip(&mut self, peer: &PeerId, ip: &str) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.known_ips.remove(ip);
        }
        remove_peer_ip(&mut self.peer_ips, ip, peer);
    }

    /// The peer entered our mesh for the topic.
    pub fn graft(&mut self, peer: &PeerId, topic: &str, now: Instant) {
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        if let Some(tstats) = scored_topic_stats(&self.params, stats, topic, now) {
            tstats.in_mesh = true;
            tstats.graft_time = now;
            tstats.mesh_time = Duration::ZERO;
            tstats.mesh_message_deliveries_active = false;
        }
    }

    /// The peer left our mesh for the topic. An unmet delivery threshold at
    /// departure becomes a sticky failure penalty.
    pub fn prune(&mut self, peer: &PeerId, topic: &str) {
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        let Some(tp) = self.params.topics.get(topic) else {
            return;
        };
        if let Some(tstats) = stats.topics.get_mut(topic) {
            if tstats.mesh_message_deliveries_active
                && tstats.mesh_message_deliveries < tp.mesh_message_deliveries_threshold
            {
                let deficit =
                    tp.mesh_message_deliveries_threshold - tstats.mesh_message_deliveries;
                tstats.mesh_failure_penalty += deficit * deficit;
            }
            tstats.mesh_message_deliveries_active = false;
            tstats.in_mesh = false;
        }
    }

    /// A message entered validation; start tracing deliveries for it.
    pub fn validate_message(&mut self, id: MessageId, now: Instant) {
        self.deliveries.ensure(id, now);
    }

    /// The validator accepted the message first delivered by `from`. Peers
    /// that forwarded it while validation was pending get duplicate credit.
    pub fn deliver_message(&mut self, from: &PeerId, id: MessageId, topic: &str, now: Instant) {
        self.mark_first_message_delivery(from, topic, now);

        let record = self.deliveries.ensure(id, now);
        if record.status != DeliveryStatus::Unknown {
            trace!(
                status = ?record.status,
                "unexpected delivery for message with settled status"
            );
            return;
        }
        record.status = DeliveryStatus::Valid;
        record.validated = Some(now);

        let peers: Vec<PeerId> = record.peers.iter().copied().collect();
        for peer in peers {
            // A peer cannot double-count by also being the first deliverer.
            if peer != *from {
                self.mark_duplicate_message_delivery(&peer, topic, None, now);
            }
        }
    }

    /// A duplicate of a known message arrived from `from`.
    pub fn duplicate_message(&mut self, from: &PeerId, id: MessageId, topic: &str, now: Instant) {
        let record = self.deliveries.ensure(id, now);
        if record.peers.contains(from) {
            // Already counted this duplicate.
            return;
        }

        match record.status {
            DeliveryStatus::Unknown => {
                // Still validating; remember the peer and settle later.
                record.peers.insert(*from);
            }
            DeliveryStatus::Valid => {
                record.peers.insert(*from);
                let validated = record.validated;
                self.mark_duplicate_message_delivery(from, topic, validated, now);
            }
            DeliveryStatus::Invalid => {
                self.mark_invalid_message_delivery(from, topic, now);
            }
            DeliveryStatus::Ignored => {}
        }
    }

    /// The validator rejected or ignored the message first delivered by
    /// `from`.
    pub fn reject_message(
        &mut self,
        from: &PeerId,
        id: MessageId,
        topic: &str,
        reason: RejectReason,
        now: Instant,
    ) {
        let record = self.deliveries.ensure(id, now);
        if record.status != DeliveryStatus::Unknown {
            trace!(
                status = ?record.status,
                "unexpected rejection for message with settled status"
            );
            return;
        }

        if reason == RejectReason::Ignored {
            record.status = DeliveryStatus::Ignored;
            record.peers.clear();
            return;
        }

        record.status = DeliveryStatus::Invalid;
        let peers: Vec<PeerId> = record.peers.drain().collect();
        self.mark_invalid_message_delivery(from, topic, now);
        for peer in peers {
            if peer != *from {
                self.mark_invalid_message_delivery(&peer, topic, now);
            }
        }
    }

    /// Penalize a message that never got a delivery record (oversized,
    /// malformed topic, self-origin spoof).
    pub fn reject_invalid_message(&mut self, from: &PeerId, topic: &str, now: Instant) {
        self.mark_invalid_message_delivery(from, topic, now);
    }

    /// P7 behavioural penalty (backoff violations, broken promises,
    /// protocol violations).
    pub fn add_penalty(&mut self, peer: &PeerId, count: f64) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.behaviour_penalty += count;
        }
    }

    /// Set the externally supplied application-specific score (P5).
    pub fn set_app_score(&mut self, peer: &PeerId, value: f64) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.app_score = value;
        }
    }

    /// Whether a decay pass is due.
    pub fn refresh_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_refresh) >= self.params.decay_interval
    }

    /// Decay all counters, refresh lazy time-in-mesh, purge disconnected
    /// peers whose retention elapsed or whose score decayed away, and old
    /// delivery records.
    pub fn refresh_scores(&mut self, now: Instant) {
        self.last_refresh = now;
        let decay_to_zero = self.params.decay_to_zero;

        let mut expired: Vec<PeerId> = Vec::new();
        let mut disconnected: Vec<PeerId> = Vec::new();
        for (peer, stats) in self.peer_stats.iter_mut() {
            if !stats.connected {
                if stats.expire.is_some_and(|expire| now > expire) {
                    expired.push(*peer);
                    continue;
                }
                // Retained entries keep decaying below; once the score has
                // decayed to nothing there is no point holding the entry.
                disconnected.push(*peer);
            }

            for (topic, tstats) in stats.topics.iter_mut() {
                let Some(tp) = self.params.topics.get(topic) else {
                    continue;
                };

                tstats.first_message_deliveries *= tp.first_message_deliveries_decay;
                if tstats.first_message_deliveries < decay_to_zero {
                    tstats.first_message_deliveries = 0.0;
                }
                tstats.mesh_message_deliveries *= tp.mesh_message_deliveries_decay;
                if tstats.mesh_message_deliveries < decay_to_zero {
                    tstats.mesh_message_deliveries = 0.0;
                }
                tstats.mesh_failure_penalty *= tp.mesh_failure_penalty_decay;
                if tstats.mesh_failure_penalty < decay_to_zero {
                    tstats.mesh_failure_penalty = 0.0;
                }
                tstats.invalid_message_deliveries *= tp.invalid_message_deliveries_decay;
                if tstats.invalid_message_deliveries < decay_to_zero {
                    tstats.invalid_message_deliveries = 0.0;
                }

                if tstats.in_mesh {
                    tstats.mesh_time = now.duration_since(tstats.graft_time);
                    if tstats.mesh_time > tp.mesh_message_deliveries_activation {
                        tstats.mesh_message_deliveries_active = true;
                    }
                }
            }

            stats.behaviour_penalty *= self.params.behaviour_penalty_decay;
            if stats.behaviour_penalty < decay_to_zero {
                stats.behaviour_penalty = 0.0;
            }
        }

        for peer in disconnected {
            if self.score(&peer, now).abs() < decay_to_zero {
                expired.push(peer);
            }
        }

        for peer in expired {
            if let Some(stats) = self.peer_stats.remove(&peer) {
                for ip in &stats.known_ips {
                    remove_peer_ip(&mut self.peer_ips, ip, &peer);
                }
            }
            trace!(peer = %peer, "score retention elapsed, entry deleted");
        }

        self.deliveries.gc(now);
    }

    pub fn peer_count(&self) -> usize {
        self.peer_stats.len()
    }

    fn mark_first_message_delivery(&mut self, from: &PeerId, topic: &str, now: Instant) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        let Some(tp) = self.params.topics.get(topic) else {
            return;
        };
        if let Some(tstats) = scored_topic_stats(&self.params, stats, topic, now) {
            tstats.first_message_deliveries =
                (tstats.first_message_deliveries + 1.0).min(tp.first_message_deliveries_cap);
            if tstats.in_mesh {
                tstats.mesh_message_deliveries =
                    (tstats.mesh_message_deliveries + 1.0).min(tp.mesh_message_deliveries_cap);
            }
        }
    }

    /// Mesh delivery credit for a duplicate. `validated` is absent when the
    /// duplicate arrived while validation was still pending, which always
    /// falls inside the delivery window.
    fn mark_duplicate_message_delivery(
        &mut self,
        from: &PeerId,
        topic: &str,
        validated: Option<Instant>,
        now: Instant,
    ) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        let Some(tp) = self.params.topics.get(topic) else {
            return;
        };
        if let Some(tstats) = scored_topic_stats(&self.params, stats, topic, now) {
            if !tstats.in_mesh {
                return;
            }
            if let Some(validated) = validated {
                let delay = now.duration_since(validated);
                if delay > tp.mesh_message_deliveries_window {
                    // Late delivery; a hostile peer replaying a message we
                    // just forwarded to it earns nothing.
                    return;
                }
            }
            tstats.mesh_message_deliveries =
                (tstats.mesh_message_deliveries + 1.0).min(tp.mesh_message_deliveries_cap);
        }
    }

    fn mark_invalid_message_delivery(&mut self, from: &PeerId, topic: &str, now: Instant) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        if let Some(tstats) = scored_topic_stats(&self.params, stats, topic, now) {
            tstats.invalid_message_deliveries += 1.0;
        }
    }
}

fn remove_peer_ip(peer_ips: &mut HashMap<String, HashSet<PeerId>>, ip: &str, peer: &PeerId) {
    if let Some(peers) = peer_ips.get_mut(ip) {
        peers.remove(peer);
        if peers.is_empty() {
            peer_ips.remove(ip);
        }
    }
}

/// Topic stats for scored topics only; created on first use.
fn scored_topic_stats<'a>(
    params: &PeerScoreParams,
    stats: &'a mut PeerStats,
    topic: &str,
    now: Instant,
) -> Option<&'a mut TopicStats> {
    if !params.topics.contains_key(topic) {
        return None;
    }
    Some(
        stats
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicStats::new(now)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "test-topic";

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn params_with_topic() -> PeerScoreParams {
        let mut params = PeerScoreParams::default();
        params.topics.insert(TOPIC.to_string(), TopicScoreParams::default());
        params
    }

    fn engine() -> PeerScore {
        PeerScore::new(params_with_topic()).expect("default params are valid")
    }

    #[test]
    fn unknown_peer_scores_zero() {
        let score = engine();
        assert_eq!(score.score(&peer(1), Instant::now()), 0.0);
    }

    #[test]
    fn inactive_peer_scores_zero() {
        let mut score = engine();
        let now = Instant::now();
        score.add_peer(peer(1));
        assert_eq!(score.score(&peer(1), now), 0.0);
    }

    #[test]
    fn positive_events_produce_non_decreasing_score() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.graft(&p, TOPIC, now);

        let mut last = score.score(&p, now);
        for i in 1..=10u64 {
            let t = now + Duration::from_secs(i);
            score.deliver_message(&p, [i as u8; 32], TOPIC, t);
            let s = score.score(&p, t);
            assert!(s >= last, "score decreased from {} to {}", last, s);
            last = s;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn invalid_burst_crosses_graylist_within_one_decay_interval() {
        let mut score = engine();
        let thresholds = ScoreThresholds::default();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);

        for i in 0..50u64 {
            let id = {
                let mut id = [0u8; 32];
                id[..8].copy_from_slice(&i.to_le_bytes());
                id
            };
            score.validate_message(id, now);
            score.reject_message(&p, id, TOPIC, RejectReason::Invalid, now);
        }

        // 50 invalid deliveries, squared, weight -1, topic weight 0.5.
        let s = score.score(&p, now);
        assert!(
            s < thresholds.graylist_threshold,
            "score {} not below graylist {}",
            s,
            thresholds.graylist_threshold
        );
    }

    #[test]
    fn first_delivery_counter_is_capped() {
        let mut params = params_with_topic();
        params
            .topics
            .get_mut(TOPIC)
            .unwrap()
            .first_message_deliveries_cap = 3.0;
        let mut score = PeerScore::new(params).unwrap();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);

        for i in 0..10u8 {
            score.deliver_message(&p, [i; 32], TOPIC, now);
        }
        // cap 3 * weight 1 * topic weight 0.5
        assert!((score.score(&p, now) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn topic_contribution_respects_global_cap() {
        let mut params = params_with_topic();
        params.topic_score_cap = 4.0;
        let mut score = PeerScore::new(params).unwrap();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);

        for i in 0..100u8 {
            score.deliver_message(&p, [i; 32], TOPIC, now);
        }
        assert!((score.score(&p, now) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn decay_reduces_counters_and_snaps_to_zero() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.deliver_message(&p, [1; 32], TOPIC, now);

        let before = score.score(&p, now);
        assert!(before > 0.0);

        let mut t = now;
        for _ in 0..12 {
            t += Duration::from_secs(1);
            score.refresh_scores(t);
        }
        // 0.5^12 < decay_to_zero, so the counter snapped to zero.
        assert_eq!(score.score(&p, t), 0.0);
    }

    #[test]
    fn duplicate_during_validation_gets_retroactive_mesh_credit() {
        let mut params = params_with_topic();
        let tp = params.topics.get_mut(TOPIC).unwrap();
        // Isolate P3: no positive components, active penalty from the start
        // is avoided by checking the raw counter via score deltas.
        tp.mesh_message_deliveries_threshold = 5.0;
        let mut score = PeerScore::new(params).unwrap();

        let now = Instant::now();
        let first = peer(1);
        let echoer = peer(2);
        score.add_peer(first);
        score.add_peer(echoer);
        score.graft(&first, TOPIC, now);
        score.graft(&echoer, TOPIC, now);

        let id = [9; 32];
        score.validate_message(id, now);
        // Echoer forwards the message while validation is pending.
        score.duplicate_message(&echoer, id, TOPIC, now);
        // Validation settles; echoer gets mesh delivery credit.
        score.deliver_message(&first, id, TOPIC, now + Duration::from_millis(1));

        // Activate P3 and verify the echoer's deficit is one smaller than a
        // silent peer's would be.
        let silent = peer(3);
        score.add_peer(silent);
        score.graft(&silent, TOPIC, now);

        let later = now + Duration::from_secs(6);
        score.refresh_scores(later);
        // Deficits: echoer has some deliveries decayed, silent has none.
        assert!(score.score(&echoer, later) > score.score(&silent, later));
    }

    #[test]
    fn late_duplicate_outside_window_earns_nothing() {
        let mut score = engine();
        let now = Instant::now();
        let first = peer(1);
        let late = peer(2);
        score.add_peer(first);
        score.add_peer(late);
        score.graft(&late, TOPIC, now);

        // Mature the P3 activation window so delivery credit is observable
        // through the deficit penalty.
        let active_at = now + Duration::from_secs(6);
        score.refresh_scores(active_at);

        let id = [4; 32];
        score.validate_message(id, active_at);
        score.deliver_message(&first, id, TOPIC, active_at);

        // Well past the 10ms delivery window: deficit unchanged.
        let t = active_at + Duration::from_secs(1);
        let baseline = score.score(&late, t);
        score.duplicate_message(&late, id, TOPIC, t);
        assert_eq!(score.score(&late, t), baseline);

        // Control: a duplicate inside the window shrinks the deficit.
        let id2 = [5; 32];
        score.validate_message(id2, t);
        score.deliver_message(&first, id2, TOPIC, t);
        score.duplicate_message(&late, id2, TOPIC, t + Duration::from_millis(5));
        assert!(score.score(&late, t + Duration::from_millis(5)) > baseline);
    }

    #[test]
    fn invalid_message_penalizes_pending_forwarders_too() {
        let mut score = engine();
        let now = Instant::now();
        let a = peer(1);
        let b = peer(2);
        score.add_peer(a);
        score.add_peer(b);

        let id = [5; 32];
        score.validate_message(id, now);
        score.duplicate_message(&b, id, TOPIC, now);
        score.reject_message(&a, id, TOPIC, RejectReason::Invalid, now);

        assert!(score.score(&a, now) < 0.0);
        assert!(score.score(&b, now) < 0.0);
    }

    #[test]
    fn ignored_message_penalizes_nobody() {
        let mut score = engine();
        let now = Instant::now();
        let a = peer(1);
        let b = peer(2);
        score.add_peer(a);
        score.add_peer(b);

        let id = [6; 32];
        score.validate_message(id, now);
        score.duplicate_message(&b, id, TOPIC, now);
        score.reject_message(&a, id, TOPIC, RejectReason::Ignored, now);

        assert_eq!(score.score(&a, now), 0.0);
        assert_eq!(score.score(&b, now), 0.0);

        // Late duplicates of an ignored message also earn nothing either way.
        score.duplicate_message(&a, id, TOPIC, now);
        assert_eq!(score.score(&a, now), 0.0);
    }

    #[test]
    fn behaviour_penalty_squared_and_decayed() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.add_penalty(&p, 2.0);

        // excess 2, squared 4, weight -10
        assert!((score.score(&p, now) + 40.0).abs() < 1e-9);

        let t = now + Duration::from_secs(1);
        score.refresh_scores(t);
        // decayed by 0.2: counter 0.4, squared 0.16, weight -10
        assert!((score.score(&p, t) + 1.6).abs() < 1e-6);
    }

    #[test]
    fn negative_score_retained_across_reconnect() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.validate_message([7; 32], now);
        score.reject_message(&p, [7; 32], TOPIC, RejectReason::Invalid, now);
        let penalized = score.score(&p, now);
        assert!(penalized < 0.0);

        score.remove_peer(&p, now);
        score.add_peer(p);
        assert!(score.score(&p, now) < 0.0, "reconnect must not reset score");
    }

    #[test]
    fn positive_score_dropped_on_disconnect() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.deliver_message(&p, [8; 32], TOPIC, now);
        assert!(score.score(&p, now) > 0.0);

        score.remove_peer(&p, now);
        assert_eq!(score.peer_count(), 0);
    }

    #[test]
    fn retained_entry_expires_after_retention() {
        let mut params = params_with_topic();
        params.retain_score = Duration::from_secs(10);
        let mut score = PeerScore::new(params).unwrap();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.validate_message([7; 32], now);
        score.reject_message(&p, [7; 32], TOPIC, RejectReason::Invalid, now);
        score.remove_peer(&p, now);
        assert_eq!(score.peer_count(), 1);

        score.refresh_scores(now + Duration::from_secs(11));
        assert_eq!(score.peer_count(), 0);
        assert_eq!(score.score(&p, now + Duration::from_secs(11)), 0.0);
    }

    #[test]
    fn retained_scores_decay_until_entry_deleted() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.validate_message([7; 32], now);
        score.reject_message(&p, [7; 32], TOPIC, RejectReason::Invalid, now);
        score.remove_peer(&p, now);
        let before = score.score(&p, now);
        assert!(before < 0.0);

        // One decay interval: still penalized, but less.
        let t1 = now + Duration::from_secs(1);
        score.refresh_scores(t1);
        let after = score.score(&p, t1);
        assert!(after < 0.0);
        assert!(after > before);
        assert_eq!(score.peer_count(), 1);

        // Once the score has decayed to (near) zero the entry is dropped
        // without waiting for the full retention window.
        let mut t = t1;
        for _ in 0..8 {
            t += Duration::from_secs(1);
            score.refresh_scores(t);
        }
        assert_eq!(score.peer_count(), 0);
    }

    #[test]
    fn ip_colocation_penalty_beyond_threshold() {
        let mut params = params_with_topic();
        params.ip_colocation_factor_threshold = 1;
        let mut score = PeerScore::new(params).unwrap();
        let now = Instant::now();

        for seed in 1..=3u8 {
            score.add_peer(peer(seed));
            score.add_ip(&peer(seed), "192.0.2.7".to_string());
        }

        // 3 peers on one address, threshold 1: surplus 2, squared 4, weight -5.
        assert!((score.score(&peer(1), now) + 20.0).abs() < 1e-9);

        score.remove_ip(&peer(3), "192.0.2.7");
        // surplus 1, squared 1, weight -5 (peer 3 no longer shares).
        assert!((score.score(&peer(1), now) + 5.0).abs() < 1e-9);
        assert_eq!(score.score(&peer(3), now), 0.0);
    }

    #[test]
    fn whitelisted_ip_exempt_from_colocation() {
        let mut params = params_with_topic();
        params.ip_colocation_factor_threshold = 1;
        params
            .ip_colocation_factor_whitelist
            .insert("192.0.2.7".to_string());
        let mut score = PeerScore::new(params).unwrap();
        let now = Instant::now();

        for seed in 1..=3u8 {
            score.add_peer(peer(seed));
            score.add_ip(&peer(seed), "192.0.2.7".to_string());
        }
        assert_eq!(score.score(&peer(1), now), 0.0);
    }

    #[test]
    fn app_score_weighted_in() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.set_app_score(&p, -3.0);
        assert!((score.score(&p, now) + 30.0).abs() < 1e-9);
    }

    #[test]
    fn mesh_failure_penalty_sticks_after_prune() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.graft(&p, TOPIC, now);

        // Mature the activation window with no deliveries.
        let later = now + Duration::from_secs(6);
        score.refresh_scores(later);
        let active_penalty = score.score(&p, later);
        assert!(active_penalty < 0.0);

        score.prune(&p, TOPIC);
        // Deficit 20 squared = 400, as both P3-at-exit and sticky P3b, but
        // P3 stops applying once out of mesh; only P3b remains.
        let after = score.score(&p, later);
        assert!(after < 0.0);
    }

    #[test]
    fn params_validation_rejects_bad_values() {
        let mut params = PeerScoreParams::default();
        params.behaviour_penalty_weight = 1.0;
        assert!(PeerScore::new(params).is_err());

        let mut params = PeerScoreParams::default();
        params.decay_to_zero = 1.5;
        assert!(PeerScore::new(params).is_err());

        let mut params = PeerScoreParams::default();
        params
            .topics
            .insert("t".into(), TopicScoreParams {
                invalid_message_deliveries_weight: 5.0,
                ..Default::default()
            });
        assert!(PeerScore::new(params).is_err());

        let mut params = PeerScoreParams::default();
        params
            .topics
            .insert("t".into(), TopicScoreParams {
                first_message_deliveries_decay: 1.0,
                ..Default::default()
            });
        assert!(PeerScore::new(params).is_err());
    }

    #[test]
    fn thresholds_validation_enforces_ordering() {
        assert!(ScoreThresholds::default().validate().is_ok());

        let t = ScoreThresholds {
            gossip_threshold: 1.0,
            ..Default::default()
        };
        assert!(t.validate().is_err());

        let t = ScoreThresholds {
            publish_threshold: -5.0,
            gossip_threshold: -10.0,
            ..Default::default()
        };
        assert!(t.validate().is_err());

        let t = ScoreThresholds {
            graylist_threshold: -20.0,
            publish_threshold: -50.0,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn unscored_topics_accumulate_nothing() {
        let mut score = engine();
        let now = Instant::now();
        let p = peer(1);
        score.add_peer(p);
        score.deliver_message(&p, [1; 32], "not-configured", now);
        assert_eq!(score.score(&p, now), 0.0);
    }
}
