//! Router configuration.
//!
//! All mesh degrees, timing parameters and gossip bounds live here. Values
//! are policy tunables, not protocol constants: two nodes with different
//! settings still interoperate as long as they speak the same wire records.
//!
//! Configuration is validated once at construction. A router is never
//! started with inconsistent degrees or non-finite limits; misconfiguration
//! here would silently invalidate every admission decision downstream.

use std::time::Duration;

use crate::rpc::RpcLimits;

/// D - target mesh degree per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - graft more peers below this mesh size.
pub const DEFAULT_MESH_N_LOW: usize = 4;

/// D_hi - prune excess peers above this mesh size.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_score - mesh members retained by score when pruning over-subscription.
pub const DEFAULT_MESH_D_SCORE: usize = 4;

/// D_out - minimum outbound-initiated mesh members per topic.
pub const DEFAULT_MESH_OUTBOUND_MIN: usize = 2;

/// D_lazy - minimum number of non-mesh peers gossiped to per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

/// Fraction of non-mesh peers gossiped to when larger than D_lazy.
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;

/// Interval between heartbeat rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Idle period after which a fanout set is discarded.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Backoff imposed on pruned peers before they may re-graft.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Heartbeat ticks between sweeps of expired backoff entries.
pub const DEFAULT_BACKOFF_CLEANUP_TICKS: u64 = 15;

/// A GRAFT this soon after a PRUNE is treated as flooding and penalized twice.
pub const DEFAULT_GRAFT_FLOOD_THRESHOLD: Duration = Duration::from_secs(10);

/// Heartbeat ticks between opportunistic grafting attempts.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_TICKS: u64 = 60;

/// Peers grafted per opportunistic grafting attempt.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

/// Maximum message ids advertised in one IHAVE, and the cap on ids requested
/// from a single peer within one heartbeat.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;

/// Maximum IHAVE control entries accepted from a peer per heartbeat.
pub const DEFAULT_MAX_IHAVE_MESSAGES: usize = 10;

/// Time allowed for a peer to follow up an IHAVE advertisement with the
/// message after we sent IWANT. Missing the window is a broken promise.
pub const DEFAULT_IWANT_FOLLOWUP: Duration = Duration::from_secs(3);

/// Times a single peer may request the same message id via IWANT.
pub const DEFAULT_GOSSIP_RETRANSMISSION: usize = 3;

/// Sliding window during which a message id is considered already seen.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Maximum accepted message payload (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Payload size at or above which IDONTWANT is sent to mesh peers on receipt.
pub const DEFAULT_IDONTWANT_MIN_DATA_SIZE: usize = 1024;

/// Maximum peers carried in the peer-exchange section of one PRUNE.
pub const DEFAULT_PRUNE_PEERS: usize = 16;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// How message ids are derived from a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageIdMode {
    /// Hash of source identity, sequence number and payload. The default;
    /// distinct publishes of identical payloads get distinct ids.
    SourceSeqno,
    /// Hash of topic and payload only. Identical payloads collapse to one id,
    /// which some applications use for network-wide dedup.
    ContentAddressed,
}

/// Mesh and gossip configuration.
///
/// Construct via `MeshConfig::default()` and adjust fields, then pass to the
/// router, which calls [`MeshConfig::validate`] before starting.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// D - target mesh degree per topic.
    pub mesh_n: usize,
    /// D_lo - lower bound before grafting more peers.
    pub mesh_n_low: usize,
    /// D_hi - upper bound before pruning excess peers.
    pub mesh_n_high: usize,
    /// D_score - members kept by score when pruning over-subscription.
    pub mesh_d_score: usize,
    /// D_out - minimum outbound-initiated mesh members.
    pub mesh_outbound_min: usize,
    /// D_lazy - minimum gossip targets per topic per heartbeat.
    pub gossip_lazy: usize,
    /// Fraction of eligible non-mesh peers gossiped to, if above D_lazy.
    pub gossip_factor: f64,
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// Idle period after which fanout state for a topic is dropped.
    pub fanout_ttl: Duration,
    /// Backoff imposed on pruned peers (sent inside PRUNE).
    pub prune_backoff: Duration,
    /// Heartbeat ticks between expired-backoff sweeps.
    pub backoff_cleanup_ticks: u64,
    /// GRAFT sooner than this after a PRUNE is penalized as flooding.
    pub graft_flood_threshold: Duration,
    /// Heartbeat ticks between opportunistic grafting attempts.
    pub opportunistic_graft_ticks: u64,
    /// Peers grafted per opportunistic attempt.
    pub opportunistic_graft_peers: usize,
    /// Maximum ids per IHAVE and maximum ids requested per peer per heartbeat.
    pub max_ihave_length: usize,
    /// Maximum IHAVE control entries per peer per heartbeat.
    pub max_ihave_messages: usize,
    /// Window for a peer to deliver a message it advertised.
    pub iwant_followup: Duration,
    /// Times one peer may re-request the same id via IWANT.
    pub gossip_retransmission: usize,
    /// Seen-cache validity window.
    pub seen_ttl: Duration,
    /// Maximum message payload size.
    pub max_message_size: usize,
    /// Message id derivation mode.
    pub message_id: MessageIdMode,
    /// Publish to all topic peers above the publish threshold, not just mesh.
    pub flood_publish: bool,
    /// Payload size triggering IDONTWANT emission to mesh peers.
    pub idontwant_min_data_size: usize,
    /// Peers included in PRUNE peer exchange.
    pub prune_peers: usize,
    /// Decode-time ceilings for inbound RPC records.
    pub rpc_limits: RpcLimits,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            mesh_d_score: DEFAULT_MESH_D_SCORE,
            mesh_outbound_min: DEFAULT_MESH_OUTBOUND_MIN,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            backoff_cleanup_ticks: DEFAULT_BACKOFF_CLEANUP_TICKS,
            graft_flood_threshold: DEFAULT_GRAFT_FLOOD_THRESHOLD,
            opportunistic_graft_ticks: DEFAULT_OPPORTUNISTIC_GRAFT_TICKS,
            opportunistic_graft_peers: DEFAULT_OPPORTUNISTIC_GRAFT_PEERS,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_ihave_messages: DEFAULT_MAX_IHAVE_MESSAGES,
            iwant_followup: DEFAULT_IWANT_FOLLOWUP,
            gossip_retransmission: DEFAULT_GOSSIP_RETRANSMISSION,
            seen_ttl: DEFAULT_SEEN_TTL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_id: MessageIdMode::SourceSeqno,
            flood_publish: true,
            idontwant_min_data_size: DEFAULT_IDONTWANT_MIN_DATA_SIZE,
            prune_peers: DEFAULT_PRUNE_PEERS,
            rpc_limits: RpcLimits::default(),
        }
    }
}

impl MeshConfig {
    /// Reject inconsistent configuration before any state is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_n == 0 {
            return Err(ConfigError::new("mesh_n must be non-zero"));
        }
        if self.mesh_n_low > self.mesh_n {
            return Err(ConfigError::new("mesh_n_low must not exceed mesh_n"));
        }
        if self.mesh_n > self.mesh_n_high {
            return Err(ConfigError::new("mesh_n must not exceed mesh_n_high"));
        }
        if self.mesh_outbound_min > self.mesh_n_low {
            return Err(ConfigError::new(
                "mesh_outbound_min must not exceed mesh_n_low",
            ));
        }
        if self.mesh_outbound_min > self.mesh_n / 2 {
            return Err(ConfigError::new(
                "mesh_outbound_min must not exceed mesh_n / 2",
            ));
        }
        if self.mesh_d_score > self.mesh_n {
            return Err(ConfigError::new("mesh_d_score must not exceed mesh_n"));
        }
        if self.backoff_cleanup_ticks == 0 || self.opportunistic_graft_ticks == 0 {
            return Err(ConfigError::new("tick divisors must be non-zero"));
        }
        if !self.gossip_factor.is_finite() || !(0.0..=1.0).contains(&self.gossip_factor) {
            return Err(ConfigError::new("gossip_factor must be within [0, 1]"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::new("heartbeat_interval must be non-zero"));
        }
        if self.seen_ttl < self.heartbeat_interval {
            return Err(ConfigError::new(
                "seen_ttl must be at least one heartbeat interval",
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::new("max_message_size must be non-zero"));
        }
        if self.max_ihave_length == 0 || self.max_ihave_messages == 0 {
            return Err(ConfigError::new("IHAVE bounds must be non-zero"));
        }
        self.rpc_limits.validate()?;
        Ok(())
    }
}

/// Fatal configuration error; the router refuses to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    reason: &'static str,
}

impl ConfigError {
    pub(crate) fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.mesh_n_low <= config.mesh_n);
        assert!(config.mesh_n <= config.mesh_n_high);
        assert!(config.mesh_outbound_min <= config.mesh_n_low);
        assert!(config.mesh_outbound_min <= config.mesh_n / 2);
        assert!(config.gossip_lazy > 0);
        assert!(config.heartbeat_interval >= Duration::from_millis(100));
        assert!(config.seen_ttl >= Duration::from_secs(10));
    }

    #[test]
    fn degree_ordering_is_enforced() {
        let config = MeshConfig {
            mesh_n_low: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MeshConfig {
            mesh_n: 20,
            mesh_n_high: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn outbound_floor_bounded_by_degree() {
        let config = MeshConfig {
            mesh_outbound_min: 4,
            ..Default::default()
        };
        // 4 > mesh_n / 2 == 3
        assert!(config.validate().is_err());
    }

    #[test]
    fn gossip_factor_range_checked() {
        let config = MeshConfig {
            gossip_factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MeshConfig {
            gossip_factor: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn topic_name_validation() {
        assert!(is_valid_topic("blocks"));
        assert!(is_valid_topic("chain/blocks v1"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
        assert!(!is_valid_topic("bad\u{7f}topic"));
    }
}
