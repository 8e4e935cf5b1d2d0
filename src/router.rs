//! Mesh/gossip controller.
//!
//! The router maintains, per subscribed topic, a bounded mesh of peers that
//! receive full messages, gossips message-availability hints (IHAVE/IWANT)
//! to the wider peer set, and runs the peer scoring engine that gates every
//! admission decision.
//!
//! ## Structure
//!
//! - [`MeshRouter`]: public handle, cheap to clone, communicates over an
//!   mpsc command channel.
//! - `RouterActor`: owns all mutable state (mesh sets, score tables, caches)
//!   and processes commands and inbound frames sequentially, interleaved
//!   with a heartbeat timer. No state is mutated outside this single task.
//!
//! ## Heartbeat order
//!
//! Within one tick: score decay runs before mesh maintenance, so graft and
//! prune decisions always see current-tick scores; gossip is emitted after
//! the mesh has settled; cache eviction runs last.
//!
//! ## Failure isolation
//!
//! Every per-peer error is local to that peer: a frame that fails to decode
//! costs its sender a behaviour penalty and is dropped, a slow peer has its
//! outbound queue trimmed, and nothing a single peer does can abort the
//! heartbeat or another peer's processing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::cache::MessageCache;
use crate::config::{is_valid_topic, ConfigError, MeshConfig, MessageIdMode};
use crate::peer::{Direction, PeerId};
use crate::protocols::{FrameTransport, MessageValidator, Verdict};
use crate::rpc::{
    self, ControlIDontWant, ControlIHave, ControlPrune, MessageId, RpcRecord, SubOpt, WireMessage,
};
use crate::score::{PeerScore, PeerScoreParams, RejectReason, ScoreThresholds};

/// Bound on queued outbound frames per peer; oldest are dropped beyond this.
const MAX_OUTBOUND_PER_PEER: usize = 64;

/// Byte budget for messages served in response to one IWANT batch.
const MAX_IWANT_RESPONSE_BYTES: usize = 256 * 1024;

/// Maximum full messages retained for answering IWANT.
const MAX_STORED_MESSAGES: usize = 10_000;

/// IDONTWANT entries tracked per peer.
const MAX_IDONTWANT_PER_PEER: usize = 1000;

/// Peers tracked in the IDONTWANT table.
const MAX_IDONTWANT_PEERS: usize = 10_000;

/// TTL for IDONTWANT suppression entries.
const IDONTWANT_TTL: Duration = Duration::from_secs(30);

/// Entries in the per-(peer, message) IWANT retransmission counter.
const MAX_IWANT_COUNT_ENTRIES: usize = 10_000;

/// Heartbeat windows of message ids advertised in IHAVE gossip.
const GOSSIP_WINDOWS: u32 = 3;

/// Capacity of each per-topic delivery channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the command/event channel feeding the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// A message as presented to the validation boundary.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub source: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
}

/// A validated message delivered to a local subscriber.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: String,
    pub source: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    pub received_at: Instant,
}

/// Synchronous publish failures for invalid local arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishRejection {
    /// Topic name is empty, too long, or contains invalid characters.
    InvalidTopic,
    /// Payload exceeds `MeshConfig::max_message_size`.
    MessageTooLarge,
    /// A message with this id is already in the seen window.
    Duplicate,
}

impl std::fmt::Display for PublishRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTopic => write!(f, "topic name is invalid"),
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::Duplicate => write!(f, "message id already seen within the validity window"),
        }
    }
}

impl std::error::Error for PublishRejection {}

/// Derive the message id from a wire message.
pub fn compute_message_id(mode: MessageIdMode, message: &WireMessage) -> MessageId {
    match mode {
        MessageIdMode::SourceSeqno => {
            let mut input = Vec::with_capacity(32 + 8 + message.data.len());
            input.extend_from_slice(message.source.as_bytes());
            input.extend_from_slice(&message.seqno.to_le_bytes());
            input.extend_from_slice(&message.data);
            *blake3::hash(&input).as_bytes()
        }
        MessageIdMode::ContentAddressed => {
            let topic = message.topic.as_bytes();
            let mut input = Vec::with_capacity(4 + topic.len() + message.data.len());
            input.extend_from_slice(&(topic.len() as u32).to_le_bytes());
            input.extend_from_slice(topic);
            input.extend_from_slice(&message.data);
            *blake3::hash(&input).as_bytes()
        }
    }
}

// ============================================================================
// Commands sent from handle to actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<mpsc::Receiver<Delivery>>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, oneshot::Sender<anyhow::Result<MessageId>>),
    InboundFrame(PeerId, Vec<u8>),
    PeerConnected(PeerId, Direction, Option<String>),
    PeerDisconnected(PeerId),
    SetAppScore(PeerId, f64),
    GetScore(PeerId, oneshot::Sender<f64>),
    GetMeshPeers(String, oneshot::Sender<Vec<PeerId>>),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    Quit,
}

// ============================================================================
// Router handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running router actor.
#[derive(Clone)]
pub struct MeshRouter {
    cmd_tx: mpsc::Sender<Command>,
}

impl MeshRouter {
    /// Validate configuration and spawn the router actor.
    ///
    /// Configuration errors are fatal here; the router never starts with
    /// parameters that would produce undefined scoring or mesh behavior.
    pub fn spawn<T: FrameTransport + 'static>(
        transport: Arc<T>,
        validator: Arc<dyn MessageValidator>,
        local: PeerId,
        config: MeshConfig,
        score_params: PeerScoreParams,
        thresholds: ScoreThresholds,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        thresholds.validate()?;
        let score = PeerScore::new(score_params)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = RouterActor {
            transport,
            validator,
            local,
            thresholds,
            score,
            peers: HashMap::new(),
            topics: HashMap::new(),
            subscriptions: HashSet::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            seen: MessageCache::new(config.seen_ttl),
            store: MessageStore::new(config.seen_ttl, MAX_STORED_MESSAGES),
            recent: HashMap::new(),
            backoff: HashMap::new(),
            promises: GossipPromises::default(),
            idontwant: LruCache::new(
                NonZeroUsize::new(MAX_IDONTWANT_PEERS).expect("constant is non-zero"),
            ),
            iwant_counts: LruCache::new(
                NonZeroUsize::new(MAX_IWANT_COUNT_ENTRIES).expect("constant is non-zero"),
            ),
            ihave_counts: HashMap::new(),
            iasked: HashMap::new(),
            deliveries: HashMap::new(),
            seqno: 0,
            heartbeat_ticks: 0,
            config,
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self { cmd_tx })
    }

    /// Subscribe to a topic. Returns the delivery stream for the topic.
    ///
    /// Subscribing again to the same topic replaces the previous stream.
    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))?
    }

    /// Unsubscribe from a topic. Sends PRUNE to all mesh members immediately
    /// without waiting for acknowledgement.
    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))?
    }

    /// Publish a message. Fails synchronously only for invalid local
    /// arguments; lack of peers is not an error.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))?
    }

    /// Feed one decoded-frame-worth of bytes received from a peer.
    pub async fn inbound_frame(&self, from: PeerId, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::InboundFrame(from, bytes)).await;
    }

    /// Notify the router that a peer connected. `ip` feeds colocation
    /// scoring when known.
    pub async fn peer_connected(&self, peer: PeerId, direction: Direction, ip: Option<String>) {
        let _ = self
            .cmd_tx
            .send(Command::PeerConnected(peer, direction, ip))
            .await;
    }

    /// Notify the router that a peer disconnected.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    /// Supply the application-specific score component for a peer.
    pub async fn set_app_score(&self, peer: PeerId, score: f64) {
        let _ = self.cmd_tx.send(Command::SetAppScore(peer, score)).await;
    }

    /// Current score of a peer.
    pub async fn score(&self, peer: PeerId) -> f64 {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetScore(peer, tx)).await.is_err() {
            return 0.0;
        }
        rx.await.unwrap_or(0.0)
    }

    /// Current mesh members for a topic.
    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetMeshPeers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Topics currently subscribed.
    pub async fn subscriptions(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetSubscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the actor. Meshes are left without explicit prune; remote peers
    /// detect the disconnect independently.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Supporting state
// ============================================================================

struct PeerState {
    direction: Direction,
    /// Topics this peer announced subscriptions for.
    topics: HashSet<String>,
    /// Frames that failed to send, retried at heartbeat. Bounded.
    outbound: VecDeque<RpcRecord>,
}

impl PeerState {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            topics: HashSet::new(),
            outbound: VecDeque::new(),
        }
    }
}

/// Full messages kept around to answer IWANT requests.
struct MessageStore {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<MessageId, (WireMessage, Instant)>,
    order: VecDeque<(MessageId, Instant)>,
}

impl MessageStore {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn put(&mut self, id: MessageId, message: WireMessage, now: Instant) {
        if self.entries.contains_key(&id) {
            return;
        }
        while self.entries.len() >= self.max_entries {
            let Some((oldest, _)) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.entries.insert(id, (message, now));
        self.order.push_back((id, now));
    }

    fn get(&self, id: &MessageId, now: Instant) -> Option<&WireMessage> {
        self.entries.get(id).and_then(|(message, stored)| {
            (now.duration_since(*stored) <= self.ttl).then_some(message)
        })
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((id, stored)) = self.order.front().copied() {
            if now.duration_since(stored) <= self.ttl {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&id);
        }
    }
}

/// Outstanding IWANT requests: which peer promised which id, and by when.
///
/// A peer that has an unexpired promise for an id is not asked again for
/// that id. Promises that expire without delivery become behaviour
/// penalties.
#[derive(Default)]
struct GossipPromises {
    promises: HashMap<MessageId, HashMap<PeerId, Instant>>,
}

impl GossipPromises {
    /// Whether this peer already has an unexpired promise for the id.
    fn peer_promised(&self, id: &MessageId, peer: &PeerId, now: Instant) -> bool {
        self.promises
            .get(id)
            .and_then(|peers| peers.get(peer))
            .is_some_and(|deadline| now < *deadline)
    }

    fn track(&mut self, id: MessageId, peer: PeerId, deadline: Instant) {
        self.promises.entry(id).or_default().insert(peer, deadline);
    }

    /// The message arrived (by any path); all promises for it are settled.
    fn message_delivered(&mut self, id: &MessageId) {
        self.promises.remove(id);
    }

    /// Collect and clear expired promises, counting breaks per peer.
    fn broken_promises(&mut self, now: Instant) -> HashMap<PeerId, usize> {
        let mut broken: HashMap<PeerId, usize> = HashMap::new();
        self.promises.retain(|_, peers| {
            peers.retain(|peer, deadline| {
                if now >= *deadline {
                    *broken.entry(*peer).or_default() += 1;
                    false
                } else {
                    true
                }
            });
            !peers.is_empty()
        });
        broken
    }
}

/// Message ids a peer asked us not to forward to it.
#[derive(Default)]
struct IDontWantTracker {
    entries: VecDeque<(MessageId, Instant)>,
}

impl IDontWantTracker {
    fn add(&mut self, id: MessageId, now: Instant) {
        if self.entries.iter().any(|(known, _)| *known == id) {
            return;
        }
        while self.entries.len() >= MAX_IDONTWANT_PER_PEER {
            self.entries.pop_front();
        }
        self.entries.push_back((id, now));
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|(known, _)| known == id)
    }

    fn expire_old(&mut self, now: Instant) {
        while let Some((_, added)) = self.entries.front() {
            if now.duration_since(*added) > IDONTWANT_TTL {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Re-graft embargo after a PRUNE, with the prune time kept for flood
/// detection.
#[derive(Clone, Copy)]
struct BackoffEntry {
    until: Instant,
    pruned_at: Instant,
}

/// Mesh over-subscription selection: keep the top `d_score` by score, fill
/// up to `d` preferring enough outbound peers to satisfy `d_out`, prune the
/// rest. Input must be sorted by descending score.
fn select_mesh_to_keep(
    sorted: Vec<(PeerId, f64, bool)>,
    d: usize,
    d_score: usize,
    d_out: usize,
) -> (Vec<PeerId>, Vec<PeerId>) {
    if sorted.len() <= d {
        let keep = sorted.into_iter().map(|(p, _, _)| p).collect();
        return (keep, Vec::new());
    }

    let mut head: Vec<(PeerId, f64, bool)> = Vec::with_capacity(d);
    let mut rest: Vec<(PeerId, f64, bool)> = Vec::new();
    for (i, entry) in sorted.into_iter().enumerate() {
        if i < d_score {
            head.push(entry);
        } else {
            rest.push(entry);
        }
    }
    rest.shuffle(&mut rand::thread_rng());

    // Fill up to d, bubbling outbound peers forward if the selection would
    // otherwise drop below the outbound floor.
    let mut keep: Vec<(PeerId, f64, bool)> = head;
    keep.extend(rest.drain(..std::cmp::min(rest.len(), d - keep.len().min(d))));

    let outbound_kept = keep.iter().filter(|(_, _, out)| *out).count();
    if outbound_kept < d_out {
        let mut needed = d_out - outbound_kept;
        let mut i = 0;
        while needed > 0 && i < rest.len() {
            if rest[i].2 {
                // Swap an outbound candidate in for the lowest-priority
                // non-outbound keeper.
                if let Some(pos) = keep.iter().rposition(|(_, _, out)| !out) {
                    let evicted = keep.remove(pos);
                    keep.push(rest.remove(i));
                    rest.push(evicted);
                    needed -= 1;
                    continue;
                } else {
                    break;
                }
            }
            i += 1;
        }
    }

    let keep_ids = keep.into_iter().map(|(p, _, _)| p).collect();
    let prune_ids = rest.into_iter().map(|(p, _, _)| p).collect();
    (keep_ids, prune_ids)
}

// ============================================================================
// Router actor (owns state)
// ============================================================================

struct RouterActor<T: FrameTransport> {
    transport: Arc<T>,
    validator: Arc<dyn MessageValidator>,
    local: PeerId,
    config: MeshConfig,
    thresholds: ScoreThresholds,
    score: PeerScore,
    peers: HashMap<PeerId, PeerState>,
    /// Peer universe per topic: everyone who announced a subscription.
    topics: HashMap<String, HashSet<PeerId>>,
    subscriptions: HashSet<String>,
    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, HashSet<PeerId>>,
    fanout_last_pub: HashMap<String, Instant>,
    seen: MessageCache,
    store: MessageStore,
    /// Recently seen ids per topic, feeding IHAVE gossip. Newest at the back.
    recent: HashMap<String, VecDeque<(MessageId, Instant)>>,
    backoff: HashMap<String, HashMap<PeerId, BackoffEntry>>,
    promises: GossipPromises,
    idontwant: LruCache<PeerId, IDontWantTracker>,
    /// IWANT retransmission counter per (peer, message).
    iwant_counts: LruCache<(PeerId, MessageId), usize>,
    /// IHAVE control entries seen per peer this heartbeat.
    ihave_counts: HashMap<PeerId, usize>,
    /// Message ids requested per peer this heartbeat.
    iasked: HashMap<PeerId, usize>,
    deliveries: HashMap<String, mpsc::Sender<Delivery>>,
    seqno: u64,
    heartbeat_ticks: u64,
}

impl<T: FrameTransport + 'static> RouterActor<T> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick fires immediately; skip it so subscribe/connect
        // commands arriving at startup are processed first.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(&topic).await);
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe_cmd(&topic).await);
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, data).await);
                        }
                        Some(Command::InboundFrame(from, bytes)) => {
                            self.handle_frame(from, bytes).await;
                        }
                        Some(Command::PeerConnected(peer, direction, ip)) => {
                            self.handle_peer_connected(peer, direction, ip).await;
                        }
                        Some(Command::PeerDisconnected(peer)) => {
                            self.handle_peer_disconnected(peer);
                        }
                        Some(Command::SetAppScore(peer, value)) => {
                            self.score.set_app_score(&peer, value);
                        }
                        Some(Command::GetScore(peer, reply)) => {
                            let _ = reply.send(self.score.score(&peer, Instant::now()));
                        }
                        Some(Command::GetMeshPeers(topic, reply)) => {
                            let peers = self
                                .mesh
                                .get(&topic)
                                .map(|m| m.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.subscriptions.iter().cloned().collect());
                        }
                        Some(Command::Quit) => {
                            debug!("router actor quitting");
                            break;
                        }
                        None => {
                            debug!("router handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat(Instant::now()).await;
                }
            }
        }
    }

    // ========================================================================
    // Local commands
    // ========================================================================

    async fn handle_subscribe_cmd(
        &mut self,
        topic: &str,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        if !is_valid_topic(topic) {
            anyhow::bail!("topic name is invalid");
        }

        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        self.deliveries.insert(topic.to_string(), tx);

        if self.subscriptions.insert(topic.to_string()) {
            self.announce_subscription(topic, true).await;
            self.join(topic).await;
            debug!(topic = %topic, "subscribed to topic");
        }
        Ok(rx)
    }

    /// Form the initial mesh for a newly subscribed topic: fanout peers
    /// carry over, then the highest-eligible subscribed peers fill up to D.
    async fn join(&mut self, topic: &str) {
        let now = Instant::now();
        let mut members: Vec<PeerId> = Vec::new();

        if let Some(fanout_peers) = self.fanout.remove(topic) {
            self.fanout_last_pub.remove(topic);
            for peer in fanout_peers {
                if members.len() >= self.config.mesh_n {
                    break;
                }
                if self.score.score(&peer, now) >= 0.0 && !self.in_backoff(topic, &peer, now) {
                    members.push(peer);
                }
            }
        }

        if members.len() < self.config.mesh_n {
            let mut candidates = self.graft_candidates(topic, &members, now);
            candidates.truncate(self.config.mesh_n - members.len());
            members.extend(candidates);
        }

        let mesh = self.mesh.entry(topic.to_string()).or_default();
        for peer in &members {
            mesh.insert(*peer);
        }
        for peer in members {
            self.score.graft(&peer, topic, now);
            let record = RpcRecord::default().with_graft(topic);
            self.send_record(&peer, record).await;
            trace!(peer = %peer, topic = %topic, "grafted on join");
        }
    }

    async fn handle_unsubscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        if !self.subscriptions.remove(topic) {
            return Ok(());
        }
        self.deliveries.remove(topic);
        self.recent.remove(topic);

        // Leave the mesh synchronously: PRUNE everyone, wait for nobody.
        let members: Vec<PeerId> = self
            .mesh
            .remove(topic)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();
        let now = Instant::now();
        for peer in members {
            self.score.prune(&peer, topic);
            self.record_backoff(topic, peer, self.config.prune_backoff, now);
            let prune = self.make_prune(topic, &peer, true, now);
            let record = RpcRecord::default().with_prune(prune);
            self.send_record(&peer, record).await;
        }

        self.announce_subscription(topic, false).await;
        debug!(topic = %topic, "unsubscribed from topic");
        Ok(())
    }

    async fn handle_publish_cmd(
        &mut self,
        topic: &str,
        data: Vec<u8>,
    ) -> anyhow::Result<MessageId> {
        if !is_valid_topic(topic) {
            return Err(PublishRejection::InvalidTopic.into());
        }
        if data.len() > self.config.max_message_size {
            return Err(PublishRejection::MessageTooLarge.into());
        }

        let now = Instant::now();
        self.seqno = self.seqno.wrapping_add(1);
        let message = WireMessage {
            topic: topic.to_string(),
            source: self.local,
            seqno: self.seqno,
            data,
        };
        let msg_id = compute_message_id(self.config.message_id, &message);

        if !self.seen.put(msg_id, now) {
            return Err(PublishRejection::Duplicate.into());
        }
        self.store.put(msg_id, message.clone(), now);
        self.push_recent(topic, msg_id, now);

        let targets = self.publish_targets(topic, now);
        let count = targets.len();
        for peer in targets {
            self.seen.record_peer(&msg_id, peer, now);
            let record = RpcRecord::default().with_message(message.clone());
            self.send_record(&peer, record).await;
        }

        debug!(
            topic = %topic,
            msg_id = %hex::encode(&msg_id[..8]),
            peers = count,
            "published message"
        );
        Ok(msg_id)
    }

    /// Recipients for a locally published message.
    fn publish_targets(&mut self, topic: &str, now: Instant) -> Vec<PeerId> {
        let mut targets: HashSet<PeerId> = HashSet::new();

        if self.subscriptions.contains(topic) {
            if self.config.flood_publish {
                // Flood publishing: every subscribed peer above the publish
                // threshold, mesh or not.
                if let Some(peers) = self.topics.get(topic) {
                    for peer in peers {
                        if self.score.score(peer, now) >= self.thresholds.publish_threshold {
                            targets.insert(*peer);
                        }
                    }
                }
            } else if let Some(mesh) = self.mesh.get(topic) {
                targets.extend(mesh.iter().copied());
            }
            if targets.is_empty() {
                // Degenerate mesh; fall back to eligible subscribed peers.
                targets.extend(self.eligible_topic_peers(
                    topic,
                    self.config.mesh_n,
                    self.thresholds.publish_threshold,
                    now,
                ));
            }
        } else {
            // Publishing without subscribing goes through the fanout.
            self.fanout_last_pub.insert(topic.to_string(), now);
            if !self.fanout.contains_key(topic) {
                let initial: HashSet<PeerId> = self
                    .eligible_topic_peers(
                        topic,
                        self.config.mesh_n,
                        self.thresholds.publish_threshold,
                        now,
                    )
                    .into_iter()
                    .collect();
                self.fanout.insert(topic.to_string(), initial);
            }
            if let Some(fanout) = self.fanout.get(topic) {
                targets.extend(fanout.iter().copied());
            }
        }

        targets.remove(&self.local);
        targets.into_iter().collect()
    }

    /// Up to `count` shuffled subscribed peers above `threshold`.
    fn eligible_topic_peers(
        &self,
        topic: &str,
        count: usize,
        threshold: f64,
        now: Instant,
    ) -> Vec<PeerId> {
        let Some(peers) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut eligible: Vec<PeerId> = peers
            .iter()
            .filter(|p| self.score.score(p, now) >= threshold)
            .copied()
            .collect();
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(count);
        eligible
    }

    async fn announce_subscription(&mut self, topic: &str, subscribe: bool) {
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            let record = RpcRecord::default().with_subscription(topic, subscribe);
            self.send_record(&peer, record).await;
        }
    }

    // ========================================================================
    // Peer lifecycle
    // ========================================================================

    async fn handle_peer_connected(
        &mut self,
        peer: PeerId,
        direction: Direction,
        ip: Option<String>,
    ) {
        if peer == self.local {
            return;
        }
        self.score.add_peer(peer);
        if let Some(ip) = ip {
            self.score.add_ip(&peer, ip);
        }
        let state = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerState::new(direction));
        state.direction = direction;

        // Tell the new peer what we subscribe to.
        let mut record = RpcRecord::default();
        for topic in &self.subscriptions {
            record = record.with_subscription(topic, true);
        }
        if !record.is_empty() {
            self.send_record(&peer, record).await;
        }
        trace!(peer = %peer, "peer connected");
    }

    fn handle_peer_disconnected(&mut self, peer: PeerId) {
        let now = Instant::now();
        if let Some(state) = self.peers.remove(&peer) {
            for topic in state.topics {
                if let Some(peers) = self.topics.get_mut(&topic) {
                    peers.remove(&peer);
                }
            }
        }
        let mesh_topics: Vec<String> = self
            .mesh
            .iter_mut()
            .filter_map(|(topic, members)| members.remove(&peer).then(|| topic.clone()))
            .collect();
        for topic in mesh_topics {
            self.score.prune(&peer, &topic);
        }
        for members in self.fanout.values_mut() {
            members.remove(&peer);
        }
        self.idontwant.pop(&peer);
        self.ihave_counts.remove(&peer);
        self.iasked.remove(&peer);
        // Retention semantics live in the score engine: a non-positive
        // score survives the disconnect.
        self.score.remove_peer(&peer, now);
        trace!(peer = %peer, "peer disconnected");
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    async fn handle_frame(&mut self, from: PeerId, bytes: Vec<u8>) {
        let now = Instant::now();

        // First sight of a peer may be a frame rather than a connect event.
        if !self.peers.contains_key(&from) {
            self.score.add_peer(from);
            self.peers.insert(from, PeerState::new(Direction::Inbound));
        }

        let record = match rpc::decode(&bytes, &self.config.rpc_limits) {
            Ok(record) => record,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping frame, protocol violation");
                self.score.add_penalty(&from, 1.0);
                return;
            }
        };

        if self.score.score(&from, now) < self.thresholds.graylist_threshold {
            trace!(peer = %from, "ignoring frame from graylisted peer");
            return;
        }

        for sub in record.subscriptions {
            self.handle_subscription(&from, sub);
        }
        for message in record.messages {
            // Each message is processed in its own failure boundary; one
            // bad message does not stop the rest of the frame.
            self.handle_inbound_message(&from, message, now).await;
        }
        if let Some(control) = record.control {
            self.handle_graft(&from, control.graft, now).await;
            for prune in control.prune {
                self.handle_prune(&from, prune, now);
            }
            self.handle_ihave(&from, control.ihave, now).await;
            self.handle_iwant(&from, control.iwant, now).await;
            for idontwant in control.idontwant {
                self.handle_idontwant(&from, idontwant, now);
            }
        }
    }

    fn handle_subscription(&mut self, from: &PeerId, sub: SubOpt) {
        if !is_valid_topic(&sub.topic) {
            self.score.add_penalty(from, 1.0);
            return;
        }
        if sub.subscribe {
            self.topics
                .entry(sub.topic.clone())
                .or_default()
                .insert(*from);
            if let Some(state) = self.peers.get_mut(from) {
                state.topics.insert(sub.topic);
            }
        } else {
            if let Some(peers) = self.topics.get_mut(&sub.topic) {
                peers.remove(from);
            }
            if let Some(members) = self.mesh.get_mut(&sub.topic) {
                if members.remove(from) {
                    self.score.prune(from, &sub.topic);
                }
            }
            if let Some(members) = self.fanout.get_mut(&sub.topic) {
                members.remove(from);
            }
            if let Some(state) = self.peers.get_mut(from) {
                state.topics.remove(&sub.topic);
            }
        }
    }

    async fn handle_inbound_message(&mut self, from: &PeerId, message: WireMessage, now: Instant) {
        let topic = message.topic.clone();
        if !is_valid_topic(&topic) {
            self.score.add_penalty(from, 1.0);
            return;
        }
        if !self.subscriptions.contains(&topic) {
            trace!(peer = %from, topic = %topic, "message for topic we are not subscribed to");
            return;
        }
        if message.data.len() > self.config.max_message_size {
            debug!(peer = %from, "rejecting oversized message");
            self.score.reject_invalid_message(from, &topic, now);
            return;
        }
        if message.source == self.local {
            // Our own publish reflected back; already counted as seen.
            return;
        }

        let msg_id = compute_message_id(self.config.message_id, &message);

        if !self.seen.put(msg_id, now) {
            self.score.duplicate_message(from, msg_id, &topic, now);
            self.seen.record_peer(&msg_id, *from, now);
            trace!(
                peer = %from,
                msg_id = %hex::encode(&msg_id[..8]),
                "duplicate message"
            );
            return;
        }
        self.seen.record_peer(&msg_id, *from, now);
        self.promises.message_delivered(&msg_id);
        self.score.validate_message(msg_id, now);

        // Large payload: tell mesh peers not to send us another copy while
        // validation and forwarding are in flight.
        if message.data.len() >= self.config.idontwant_min_data_size {
            self.send_idontwant(&topic, msg_id, from).await;
        }

        let to_validate = Message {
            topic: topic.clone(),
            source: message.source,
            seqno: message.seqno,
            data: message.data.clone(),
            msg_id,
        };
        let verdict = self.validator.validate(&to_validate).await;

        match verdict {
            Verdict::Accept => {
                self.score.deliver_message(from, msg_id, &topic, now);
                self.store.put(msg_id, message.clone(), now);
                self.push_recent(&topic, msg_id, now);
                self.deliver_local(&topic, &message, msg_id, now);
                self.forward(&topic, message, msg_id, from, now).await;
            }
            Verdict::Reject => {
                debug!(
                    peer = %from,
                    msg_id = %hex::encode(&msg_id[..8]),
                    "message rejected by validator"
                );
                self.score
                    .reject_message(from, msg_id, &topic, RejectReason::Invalid, now);
            }
            Verdict::Ignore => {
                self.score
                    .reject_message(from, msg_id, &topic, RejectReason::Ignored, now);
            }
        }
    }

    fn deliver_local(&mut self, topic: &str, message: &WireMessage, msg_id: MessageId, now: Instant) {
        let Some(tx) = self.deliveries.get(topic) else {
            return;
        };
        let delivery = Delivery {
            topic: topic.to_string(),
            source: message.source,
            seqno: message.seqno,
            data: message.data.clone(),
            msg_id,
            received_at: now,
        };
        // A slow subscriber loses messages rather than stalling the loop.
        if let Err(e) = tx.try_send(delivery) {
            warn!(topic = %topic, error = %e, "subscriber channel full, dropping delivery");
        }
    }

    /// Forward a validated message to mesh members, skipping the sender,
    /// the source, peers that already have it, and peers that asked not to
    /// receive it.
    async fn forward(
        &mut self,
        topic: &str,
        message: WireMessage,
        msg_id: MessageId,
        from: &PeerId,
        now: Instant,
    ) {
        let Some(mesh) = self.mesh.get(topic) else {
            return;
        };
        let targets: Vec<PeerId> = mesh
            .iter()
            .filter(|p| **p != *from && **p != message.source)
            .filter(|p| !self.seen.peer_known(&msg_id, p, now))
            .filter(|p| {
                self.idontwant
                    .peek(*p)
                    .map_or(true, |tracker| !tracker.contains(&msg_id))
            })
            .copied()
            .collect();

        for peer in targets {
            self.seen.record_peer(&msg_id, peer, now);
            let record = RpcRecord::default().with_message(message.clone());
            self.send_record(&peer, record).await;
        }
    }

    async fn send_idontwant(&mut self, topic: &str, msg_id: MessageId, except: &PeerId) {
        let Some(mesh) = self.mesh.get(topic) else {
            return;
        };
        let targets: Vec<PeerId> = mesh.iter().filter(|p| **p != *except).copied().collect();
        for peer in targets {
            let record = RpcRecord::default().with_idontwant(vec![msg_id]);
            self.send_record(&peer, record).await;
        }
    }

    // ========================================================================
    // Control messages
    // ========================================================================

    async fn handle_graft(&mut self, from: &PeerId, grafts: Vec<rpc::ControlGraft>, now: Instant) {
        let mut prune_responses: Vec<ControlPrune> = Vec::new();

        for graft in grafts {
            let topic = graft.topic;
            if !is_valid_topic(&topic) {
                self.score.add_penalty(from, 1.0);
                continue;
            }

            if !self.subscriptions.contains(&topic) {
                // Not subscribed; refuse without penalty.
                prune_responses.push(self.make_prune(&topic, from, false, now));
                continue;
            }

            // A GRAFT is an implicit topic subscription.
            self.topics.entry(topic.clone()).or_default().insert(*from);
            if let Some(state) = self.peers.get_mut(from) {
                state.topics.insert(topic.clone());
            }

            if let Some(entry) = self.backoff.get(&topic).and_then(|m| m.get(from)).copied() {
                if now < entry.until {
                    // Unsolicited GRAFT while backed off: penalize, and
                    // penalize again when it qualifies as flooding.
                    self.score.add_penalty(from, 1.0);
                    if now < entry.pruned_at + self.config.graft_flood_threshold {
                        self.score.add_penalty(from, 1.0);
                    }
                    self.record_backoff(&topic, *from, self.config.prune_backoff, now);
                    prune_responses.push(self.make_prune(&topic, from, false, now));
                    debug!(peer = %from, topic = %topic, "graft while backed off, penalized");
                    continue;
                }
            }

            if self.score.score(from, now) < 0.0 {
                self.record_backoff(&topic, *from, self.config.prune_backoff, now);
                prune_responses.push(self.make_prune(&topic, from, false, now));
                continue;
            }

            let mesh = self.mesh.entry(topic.clone()).or_default();
            if mesh.contains(from) {
                continue;
            }
            if mesh.len() >= self.config.mesh_n_high {
                // Full mesh: polite refusal with peer exchange.
                self.record_backoff(&topic, *from, self.config.prune_backoff, now);
                prune_responses.push(self.make_prune(&topic, from, true, now));
                continue;
            }

            mesh.insert(*from);
            self.score.graft(from, &topic, now);
            trace!(peer = %from, topic = %topic, "peer grafted into mesh");
        }

        if !prune_responses.is_empty() {
            let mut record = RpcRecord::default();
            for prune in prune_responses {
                record = record.with_prune(prune);
            }
            self.send_record(from, record).await;
        }
    }

    fn handle_prune(&mut self, from: &PeerId, prune: ControlPrune, now: Instant) {
        let topic = prune.topic;
        if let Some(members) = self.mesh.get_mut(&topic) {
            if members.remove(from) {
                self.score.prune(from, &topic);
                trace!(peer = %from, topic = %topic, "pruned from mesh by peer");
            }
        }

        let duration = prune
            .backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.prune_backoff);
        self.record_backoff(&topic, *from, duration, now);

        if !prune.peers.is_empty() {
            // Dialing exchanged peers belongs to the connection-management
            // layer; only surface them when the pruning peer is reputable.
            if self.score.score(from, now) >= self.thresholds.accept_px_threshold {
                debug!(
                    peer = %from,
                    topic = %topic,
                    exchanged = prune.peers.len(),
                    "peer exchange received with prune"
                );
            }
        }
    }

    async fn handle_ihave(&mut self, from: &PeerId, ihaves: Vec<ControlIHave>, now: Instant) {
        if ihaves.is_empty() {
            return;
        }
        if self.score.score(from, now) < self.thresholds.gossip_threshold {
            trace!(peer = %from, "ignoring IHAVE from peer below gossip threshold");
            return;
        }

        let mut to_request: Vec<MessageId> = Vec::new();
        for ihave in ihaves {
            let count = self.ihave_counts.entry(*from).or_insert(0);
            *count += 1;
            if *count > self.config.max_ihave_messages {
                trace!(peer = %from, "too many IHAVE messages this heartbeat, ignoring");
                break;
            }
            if !self.subscriptions.contains(&ihave.topic) {
                continue;
            }

            let asked = self.iasked.entry(*from).or_insert(0);
            for id in ihave.msg_ids {
                if *asked >= self.config.max_ihave_length {
                    break;
                }
                if self.seen.has(&id, now) {
                    continue;
                }
                if self.promises.peer_promised(&id, from, now) {
                    // Already asked this peer for this id; no repeat within
                    // the followup window.
                    continue;
                }
                *asked += 1;
                to_request.push(id);
            }
        }

        if to_request.is_empty() {
            return;
        }
        let deadline = now + self.config.iwant_followup;
        for id in &to_request {
            self.promises.track(*id, *from, deadline);
        }
        debug!(
            peer = %from,
            wanted = to_request.len(),
            "requesting advertised messages via IWANT"
        );
        let record = RpcRecord::default().with_iwant(to_request);
        self.send_record(from, record).await;
    }

    async fn handle_iwant(&mut self, from: &PeerId, iwants: Vec<rpc::ControlIWant>, now: Instant) {
        let mut to_send: Vec<WireMessage> = Vec::new();
        let mut bytes = 0usize;

        'outer: for iwant in iwants {
            for id in iwant.msg_ids {
                let count = self.iwant_counts.get_or_insert_mut((*from, id), || 0);
                *count += 1;
                if *count > self.config.gossip_retransmission {
                    trace!(
                        peer = %from,
                        msg_id = %hex::encode(&id[..8]),
                        "IWANT retransmission limit reached"
                    );
                    continue;
                }
                if let Some(message) = self.store.get(&id, now) {
                    if bytes.saturating_add(message.data.len()) > MAX_IWANT_RESPONSE_BYTES {
                        break 'outer;
                    }
                    bytes = bytes.saturating_add(message.data.len());
                    to_send.push(message.clone());
                }
            }
        }

        if to_send.is_empty() {
            return;
        }
        let ids: Vec<MessageId> = to_send
            .iter()
            .map(|m| compute_message_id(self.config.message_id, m))
            .collect();
        let mut record = RpcRecord::default();
        for message in to_send {
            record = record.with_message(message);
        }
        for id in ids {
            self.seen.record_peer(&id, *from, now);
        }
        self.send_record(from, record).await;
    }

    fn handle_idontwant(&mut self, from: &PeerId, idontwant: ControlIDontWant, now: Instant) {
        let tracker = self.idontwant.get_or_insert_mut(*from, IDontWantTracker::default);
        for id in idontwant.msg_ids.into_iter().take(MAX_IDONTWANT_PER_PEER) {
            tracker.add(id, now);
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    async fn heartbeat(&mut self, now: Instant) {
        self.heartbeat_ticks = self.heartbeat_ticks.wrapping_add(1);

        // Decay before any graft/prune decision so admission always sees
        // current-tick scores.
        if self.score.refresh_due(now) {
            self.score.refresh_scores(now);
        }

        for (peer, broken) in self.promises.broken_promises(now) {
            debug!(peer = %peer, broken = broken, "penalizing broken gossip promises");
            self.score.add_penalty(&peer, broken as f64);
        }

        self.ihave_counts.clear();
        self.iasked.clear();

        if self.heartbeat_ticks % self.config.backoff_cleanup_ticks == 0 {
            self.cleanup_backoff(now);
        }

        let (tograft, toprune) = self.maintain_meshes(now);
        self.maintain_fanout(now);
        self.emit_gossip(now).await;
        self.send_graft_prune(tograft, toprune, now).await;
        self.flush_outbound().await;

        self.seen.evict_expired(now);
        self.store.evict_expired(now);
        self.trim_recent(now);
        self.cleanup_idontwant(now);
    }

    /// Per-topic mesh maintenance. Returns coalesced GRAFT and PRUNE
    /// assignments to be sent after all topics are processed.
    fn maintain_meshes(
        &mut self,
        now: Instant,
    ) -> (HashMap<PeerId, Vec<String>>, HashMap<PeerId, Vec<(String, bool)>>) {
        let mut tograft: HashMap<PeerId, Vec<String>> = HashMap::new();
        let mut toprune: HashMap<PeerId, Vec<(String, bool)>> = HashMap::new();

        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in topics {
            // Drop mesh members whose score went negative. No peer exchange
            // for them.
            let members: Vec<PeerId> = self
                .mesh
                .get(&topic)
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default();
            for peer in &members {
                if self.score.score(peer, now) < 0.0 {
                    self.remove_from_mesh(&topic, peer, now);
                    toprune.entry(*peer).or_default().push((topic.clone(), false));
                    debug!(peer = %peer, topic = %topic, "pruning negative-score mesh member");
                }
            }

            let mesh_len = self.mesh.get(&topic).map_or(0, HashSet::len);

            // Under-populated: graft up to D from eligible candidates.
            if mesh_len < self.config.mesh_n_low {
                let current: Vec<PeerId> = self
                    .mesh
                    .get(&topic)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                let needed = self.config.mesh_n - mesh_len;
                let mut candidates = self.graft_candidates(&topic, &current, now);
                candidates.truncate(needed);
                for peer in candidates {
                    self.add_to_mesh(&topic, peer, now);
                    tograft.entry(peer).or_default().push(topic.clone());
                }
            }

            // Over-populated: keep the best by score plus random fill,
            // retaining the outbound floor; prune the rest.
            let mesh_len = self.mesh.get(&topic).map_or(0, HashSet::len);
            if mesh_len > self.config.mesh_n_high {
                let mut scored: Vec<(PeerId, f64, bool)> = self
                    .mesh
                    .get(&topic)
                    .map(|m| {
                        m.iter()
                            .map(|p| (*p, self.score.score(p, now), self.is_outbound(p)))
                            .collect()
                    })
                    .unwrap_or_default();
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                });
                let (_, prune_ids) = select_mesh_to_keep(
                    scored,
                    self.config.mesh_n,
                    self.config.mesh_d_score,
                    self.config.mesh_outbound_min,
                );
                for peer in prune_ids {
                    self.remove_from_mesh(&topic, &peer, now);
                    toprune.entry(peer).or_default().push((topic.clone(), true));
                }
            }

            // Outbound floor: graft outbound candidates when short.
            let mesh_len = self.mesh.get(&topic).map_or(0, HashSet::len);
            if mesh_len >= self.config.mesh_n_low {
                let outbound = self
                    .mesh
                    .get(&topic)
                    .map_or(0, |m| m.iter().filter(|p| self.is_outbound(p)).count());
                if outbound < self.config.mesh_outbound_min {
                    let current: Vec<PeerId> = self
                        .mesh
                        .get(&topic)
                        .map(|m| m.iter().copied().collect())
                        .unwrap_or_default();
                    let needed = self.config.mesh_outbound_min - outbound;
                    let candidates: Vec<PeerId> = self
                        .graft_candidates(&topic, &current, now)
                        .into_iter()
                        .filter(|p| self.is_outbound(p))
                        .take(needed)
                        .collect();
                    for peer in candidates {
                        self.add_to_mesh(&topic, peer, now);
                        tograft.entry(peer).or_default().push(topic.clone());
                    }
                }
            }

            // Opportunistic grafting: an underperforming mesh slowly pulls
            // in better-scoring peers instead of staying stuck.
            if self.heartbeat_ticks % self.config.opportunistic_graft_ticks == 0 {
                self.opportunistic_graft(&topic, &mut tograft, now);
            }
        }

        (tograft, toprune)
    }

    fn opportunistic_graft(
        &mut self,
        topic: &str,
        tograft: &mut HashMap<PeerId, Vec<String>>,
        now: Instant,
    ) {
        let members: Vec<PeerId> = self
            .mesh
            .get(topic)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        if members.len() <= 1 {
            return;
        }

        let mut scores: Vec<f64> = members.iter().map(|p| self.score.score(p, now)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = scores[scores.len() / 2];
        if median >= self.thresholds.opportunistic_graft_threshold {
            return;
        }

        let candidates: Vec<PeerId> = self
            .graft_candidates(topic, &members, now)
            .into_iter()
            .filter(|p| self.score.score(p, now) > median)
            .take(self.config.opportunistic_graft_peers)
            .collect();
        for peer in candidates {
            self.add_to_mesh(topic, peer, now);
            tograft.entry(peer).or_default().push(topic.to_string());
            debug!(peer = %peer, topic = %topic, median = median, "opportunistic graft");
        }
    }

    /// Shuffled, eligible graft candidates for a topic: subscribed,
    /// connected, not already members, not backed off, score not negative.
    /// Unscored peers sit at exactly zero and are therefore eligible, which
    /// keeps a score-starved mesh from collapsing in on itself.
    fn graft_candidates(&self, topic: &str, exclude: &[PeerId], now: Instant) -> Vec<PeerId> {
        let Some(peers) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut candidates: Vec<PeerId> = peers
            .iter()
            .filter(|p| **p != self.local)
            .filter(|p| !exclude.contains(p))
            .filter(|p| self.peers.contains_key(*p))
            .filter(|p| !self.in_backoff(topic, p, now))
            .filter(|p| self.score.score(p, now) >= 0.0)
            .copied()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    fn add_to_mesh(&mut self, topic: &str, peer: PeerId, now: Instant) {
        self.mesh.entry(topic.to_string()).or_default().insert(peer);
        self.score.graft(&peer, topic, now);
    }

    fn remove_from_mesh(&mut self, topic: &str, peer: &PeerId, now: Instant) {
        if let Some(members) = self.mesh.get_mut(topic) {
            members.remove(peer);
        }
        self.score.prune(peer, topic);
        self.record_backoff(topic, *peer, self.config.prune_backoff, now);
    }

    /// Expire idle fanout topics; for live ones, drop peers that left the
    /// topic or fell below the publish threshold and top back up to D.
    fn maintain_fanout(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .fanout_last_pub
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.config.fanout_ttl)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in expired {
            self.fanout.remove(&topic);
            self.fanout_last_pub.remove(&topic);
            trace!(topic = %topic, "fanout expired");
        }

        let topics: Vec<String> = self.fanout.keys().cloned().collect();
        for topic in topics {
            let keep: HashSet<PeerId> = self
                .fanout
                .get(&topic)
                .map(|members| {
                    members
                        .iter()
                        .filter(|p| {
                            self.topics.get(&topic).is_some_and(|t| t.contains(*p))
                                && self.score.score(p, now) >= self.thresholds.publish_threshold
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default();

            let mut members = keep;
            if members.len() < self.config.mesh_n {
                let exclude: Vec<PeerId> = members.iter().copied().collect();
                let more = self.eligible_topic_peers(
                    &topic,
                    self.config.mesh_n,
                    self.thresholds.publish_threshold,
                    now,
                );
                for peer in more {
                    if members.len() >= self.config.mesh_n {
                        break;
                    }
                    if !exclude.contains(&peer) {
                        members.insert(peer);
                    }
                }
            }
            self.fanout.insert(topic, members);
        }
    }

    /// Emit IHAVE for recent message ids to a bounded random subset of
    /// non-mesh subscribed peers per topic.
    async fn emit_gossip(&mut self, now: Instant) {
        let topics: Vec<String> = self
            .mesh
            .keys()
            .chain(self.fanout.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for topic in topics {
            let ids: Vec<MessageId> = self
                .recent
                .get(&topic)
                .map(|window| {
                    window
                        .iter()
                        .rev() // most recent first
                        .take(self.config.max_ihave_length)
                        .map(|(id, _)| *id)
                        .collect()
                })
                .unwrap_or_default();
            if ids.is_empty() {
                continue;
            }

            let members = self.mesh.get(&topic);
            let fanout_members = self.fanout.get(&topic);
            let Some(peers) = self.topics.get(&topic) else {
                continue;
            };
            // Gossip universe: subscribed peers minus mesh/fanout members.
            let mut eligible: Vec<PeerId> = peers
                .iter()
                .filter(|p| **p != self.local)
                .filter(|p| !members.is_some_and(|m| m.contains(*p)))
                .filter(|p| !fanout_members.is_some_and(|m| m.contains(*p)))
                .filter(|p| self.peers.contains_key(*p))
                .filter(|p| self.score.score(p, now) >= self.thresholds.gossip_threshold)
                .copied()
                .collect();
            eligible.shuffle(&mut rand::thread_rng());

            let factor_count =
                (self.config.gossip_factor * eligible.len() as f64).floor() as usize;
            let target_count = factor_count.max(self.config.gossip_lazy);
            eligible.truncate(target_count);

            for peer in eligible {
                let record = RpcRecord::default().with_ihave(&topic, ids.clone());
                self.send_record(&peer, record).await;
            }
        }
    }

    async fn send_graft_prune(
        &mut self,
        tograft: HashMap<PeerId, Vec<String>>,
        mut toprune: HashMap<PeerId, Vec<(String, bool)>>,
        now: Instant,
    ) {
        for (peer, topics) in tograft {
            let mut record = RpcRecord::default();
            for topic in topics {
                record = record.with_graft(&topic);
            }
            // Piggyback prunes for the same peer on one frame.
            if let Some(prunes) = toprune.remove(&peer) {
                for (topic, px) in prunes {
                    let prune = self.make_prune(&topic, &peer, px, now);
                    record = record.with_prune(prune);
                }
            }
            self.send_record(&peer, record).await;
        }

        for (peer, prunes) in toprune {
            let mut record = RpcRecord::default();
            for (topic, px) in prunes {
                let prune = self.make_prune(&topic, &peer, px, now);
                record = record.with_prune(prune);
            }
            self.send_record(&peer, record).await;
        }
    }

    /// Build a PRUNE for a peer, optionally carrying peer exchange ids of
    /// reputable mesh members.
    fn make_prune(&self, topic: &str, for_peer: &PeerId, px: bool, now: Instant) -> ControlPrune {
        let peers = if px {
            self.mesh
                .get(topic)
                .map(|members| {
                    members
                        .iter()
                        .filter(|p| **p != *for_peer)
                        .filter(|p| self.score.score(p, now) >= 0.0)
                        .take(self.config.prune_peers)
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        ControlPrune {
            topic: topic.to_string(),
            peers,
            backoff_secs: Some(self.config.prune_backoff.as_secs()),
        }
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn is_outbound(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|state| state.direction.is_outbound())
    }

    fn in_backoff(&self, topic: &str, peer: &PeerId, now: Instant) -> bool {
        self.backoff
            .get(topic)
            .and_then(|m| m.get(peer))
            .is_some_and(|entry| now < entry.until)
    }

    fn record_backoff(&mut self, topic: &str, peer: PeerId, duration: Duration, now: Instant) {
        let entry = BackoffEntry {
            until: now + duration,
            pruned_at: now,
        };
        self.backoff
            .entry(topic.to_string())
            .or_default()
            .insert(peer, entry);
    }

    fn cleanup_backoff(&mut self, now: Instant) {
        self.backoff.retain(|_, peers| {
            peers.retain(|_, entry| now < entry.until);
            !peers.is_empty()
        });
    }

    fn push_recent(&mut self, topic: &str, msg_id: MessageId, now: Instant) {
        let window = self.recent.entry(topic.to_string()).or_default();
        window.push_back((msg_id, now));
        while window.len() > self.config.max_ihave_length {
            window.pop_front();
        }
    }

    fn trim_recent(&mut self, now: Instant) {
        let window_ttl = self.config.heartbeat_interval * GOSSIP_WINDOWS;
        for window in self.recent.values_mut() {
            while let Some((_, added)) = window.front() {
                if now.duration_since(*added) > window_ttl {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        self.recent.retain(|_, window| !window.is_empty());
    }

    fn cleanup_idontwant(&mut self, now: Instant) {
        let peers: Vec<PeerId> = self.idontwant.iter().map(|(p, _)| *p).collect();
        let mut empty: Vec<PeerId> = Vec::new();
        for peer in peers {
            if let Some(tracker) = self.idontwant.get_mut(&peer) {
                tracker.expire_old(now);
                if tracker.is_empty() {
                    empty.push(peer);
                }
            }
        }
        for peer in empty {
            self.idontwant.pop(&peer);
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send a record now, or queue it for the next heartbeat flush if the
    /// transport refuses. The per-peer queue is bounded; a persistently slow
    /// peer loses its oldest frames rather than stalling anyone else.
    async fn send_record(&mut self, peer: &PeerId, record: RpcRecord) {
        if record.is_empty() {
            return;
        }
        let frame = rpc::encode(&record);
        match self.transport.send_frame(peer, frame).await {
            Ok(()) => {}
            Err(e) => {
                trace!(peer = %peer, error = %e, "send failed, queueing frame");
                let mut dropped = false;
                if let Some(state) = self.peers.get_mut(peer) {
                    if state.outbound.len() >= MAX_OUTBOUND_PER_PEER {
                        state.outbound.pop_front();
                        dropped = true;
                    }
                    state.outbound.push_back(record);
                }
                if dropped {
                    warn!(peer = %peer, "outbound queue full, dropping oldest frame");
                    // A peer that cannot drain its queue is a repeated
                    // resource drain; let the score reflect it.
                    self.score.add_penalty(peer, 1.0);
                }
            }
        }
    }

    async fn flush_outbound(&mut self) {
        let peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| !state.outbound.is_empty())
            .map(|(peer, _)| *peer)
            .collect();

        for peer in peers {
            loop {
                let Some(record) = self
                    .peers
                    .get_mut(&peer)
                    .and_then(|state| state.outbound.pop_front())
                else {
                    break;
                };
                let frame = rpc::encode(&record);
                if let Err(e) = self.transport.send_frame(&peer, frame).await {
                    trace!(peer = %peer, error = %e, "flush failed, requeueing");
                    if let Some(state) = self.peers.get_mut(&peer) {
                        state.outbound.push_front(record);
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    #[test]
    fn message_id_source_seqno_is_deterministic() {
        let message = WireMessage {
            topic: "t".into(),
            source: peer(1),
            seqno: 42,
            data: vec![1, 2, 3],
        };
        let a = compute_message_id(MessageIdMode::SourceSeqno, &message);
        let b = compute_message_id(MessageIdMode::SourceSeqno, &message);
        assert_eq!(a, b);

        let other = WireMessage {
            seqno: 43,
            ..message.clone()
        };
        assert_ne!(a, compute_message_id(MessageIdMode::SourceSeqno, &other));
    }

    #[test]
    fn message_id_content_addressed_ignores_source() {
        let message = WireMessage {
            topic: "t".into(),
            source: peer(1),
            seqno: 1,
            data: vec![9, 9],
        };
        let other = WireMessage {
            source: peer(2),
            seqno: 77,
            ..message.clone()
        };
        assert_eq!(
            compute_message_id(MessageIdMode::ContentAddressed, &message),
            compute_message_id(MessageIdMode::ContentAddressed, &other),
        );
    }

    #[test]
    fn publish_rejection_display() {
        let variants = [
            (PublishRejection::InvalidTopic, "topic name is invalid"),
            (
                PublishRejection::MessageTooLarge,
                "message size exceeds maximum allowed",
            ),
            (
                PublishRejection::Duplicate,
                "message id already seen within the validity window",
            ),
        ];
        for (v, expected) in variants {
            assert_eq!(format!("{}", v), expected);
            let err: anyhow::Error = v.into();
            assert!(err.to_string().contains(expected));
        }
    }

    #[test]
    fn promises_dedup_within_window() {
        let mut promises = GossipPromises::default();
        let now = Instant::now();
        let deadline = now + Duration::from_secs(3);

        assert!(!promises.peer_promised(&[1; 32], &peer(1), now));
        promises.track([1; 32], peer(1), deadline);
        assert!(promises.peer_promised(&[1; 32], &peer(1), now));
        // Other peers are unaffected.
        assert!(!promises.peer_promised(&[1; 32], &peer(2), now));
        // Window elapses; the peer may be asked again.
        assert!(!promises.peer_promised(&[1; 32], &peer(1), deadline));
    }

    #[test]
    fn promises_cleared_on_delivery() {
        let mut promises = GossipPromises::default();
        let now = Instant::now();
        promises.track([1; 32], peer(1), now + Duration::from_secs(3));
        promises.message_delivered(&[1; 32]);
        assert!(promises.broken_promises(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn broken_promises_counted_per_peer() {
        let mut promises = GossipPromises::default();
        let now = Instant::now();
        promises.track([1; 32], peer(1), now + Duration::from_secs(3));
        promises.track([2; 32], peer(1), now + Duration::from_secs(3));
        promises.track([3; 32], peer(2), now + Duration::from_secs(30));

        let broken = promises.broken_promises(now + Duration::from_secs(5));
        assert_eq!(broken.get(&peer(1)), Some(&2));
        assert_eq!(broken.get(&peer(2)), None);

        // Broken promises are cleared, not double counted.
        assert!(promises.broken_promises(now + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn idontwant_tracker_bounds_and_expiry() {
        let mut tracker = IDontWantTracker::default();
        let now = Instant::now();
        tracker.add([1; 32], now);
        tracker.add([1; 32], now);
        assert!(tracker.contains(&[1; 32]));
        assert_eq!(tracker.entries.len(), 1);

        tracker.expire_old(now + IDONTWANT_TTL + Duration::from_secs(1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn message_store_expires_and_bounds() {
        let mut store = MessageStore::new(Duration::from_secs(10), 2);
        let now = Instant::now();
        let msg = |seed: u8| WireMessage {
            topic: "t".into(),
            source: peer(seed),
            seqno: seed as u64,
            data: vec![seed],
        };

        store.put([1; 32], msg(1), now);
        store.put([2; 32], msg(2), now);
        store.put([3; 32], msg(3), now);
        // Oldest evicted by the count bound.
        assert!(store.get(&[1; 32], now).is_none());
        assert!(store.get(&[2; 32], now).is_some());

        // TTL expiry, lazy then eager.
        let later = now + Duration::from_secs(11);
        assert!(store.get(&[2; 32], later).is_none());
        store.evict_expired(later);
        assert!(store.entries.is_empty());
    }

    #[test]
    fn mesh_selection_keeps_top_scores() {
        let sorted = vec![
            (peer(1), 10.0, false),
            (peer(2), 8.0, false),
            (peer(3), 6.0, false),
            (peer(4), 4.0, false),
            (peer(5), 2.0, false),
            (peer(6), 1.0, false),
            (peer(7), 0.5, false),
            (peer(8), 0.1, false),
        ];
        let (keep, prune) = select_mesh_to_keep(sorted, 6, 4, 0);
        assert_eq!(keep.len(), 6);
        assert_eq!(prune.len(), 2);
        // Top d_score by score always survive.
        for p in [peer(1), peer(2), peer(3), peer(4)] {
            assert!(keep.contains(&p), "{:?} should be kept", p);
        }
    }

    #[test]
    fn mesh_selection_respects_outbound_floor() {
        // Only the two lowest-scoring peers are outbound.
        let sorted = vec![
            (peer(1), 10.0, false),
            (peer(2), 9.0, false),
            (peer(3), 8.0, false),
            (peer(4), 7.0, false),
            (peer(5), 6.0, false),
            (peer(6), 5.0, false),
            (peer(7), 1.0, true),
            (peer(8), 0.5, true),
        ];
        let (keep, _) = select_mesh_to_keep(sorted, 6, 4, 2);
        let outbound_kept = keep
            .iter()
            .filter(|p| **p == peer(7) || **p == peer(8))
            .count();
        assert_eq!(outbound_kept, 2, "outbound floor must be retained");
        assert_eq!(keep.len(), 6);
    }

    #[test]
    fn mesh_selection_no_prune_when_at_degree() {
        let sorted = vec![(peer(1), 1.0, false), (peer(2), 0.5, true)];
        let (keep, prune) = select_mesh_to_keep(sorted, 6, 4, 2);
        assert_eq!(keep.len(), 2);
        assert!(prune.is_empty());
    }
}
