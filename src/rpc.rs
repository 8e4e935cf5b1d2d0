//! Wire records and the bounded codec.
//!
//! One `RpcRecord` corresponds to one already-delimited frame; length
//! prefixing and stream framing belong to the transport layer. Records are
//! serialized with bincode under a hard byte limit, and decoded records are
//! checked against per-field count ceilings before they reach the router.
//! A frame violating any ceiling is rejected wholesale; nothing from it is
//! processed.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::peer::PeerId;

/// 32-byte message identifier.
pub type MessageId = [u8; 32];

/// Maximum bytes accepted for a single encoded frame.
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024 + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_BYTES)
        .with_fixint_encoding()
}

/// A subscription change announced to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpt {
    pub subscribe: bool,
    pub topic: String,
}

/// A full message pushed to mesh or fanout peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub topic: String,
    pub source: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
}

/// GRAFT - sender wants us in its mesh for the topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

/// PRUNE - sender removed us from its mesh for the topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    /// Peer exchange: alternative peers the pruned side may connect to.
    pub peers: Vec<PeerId>,
    /// Seconds the pruned side must wait before re-grafting. Absent means
    /// the receiver applies its own default backoff.
    pub backoff_secs: Option<u64>,
}

/// IHAVE - gossip hint listing recently seen message ids for a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub msg_ids: Vec<MessageId>,
}

/// IWANT - request for full messages by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub msg_ids: Vec<MessageId>,
}

/// IDONTWANT - ask the receiver not to forward these ids to us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIDontWant {
    pub msg_ids: Vec<MessageId>,
}

/// Control section of a frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBlock {
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub idontwant: Vec<ControlIDontWant>,
}

impl ControlBlock {
    pub fn is_empty(&self) -> bool {
        self.graft.is_empty()
            && self.prune.is_empty()
            && self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.idontwant.is_empty()
    }
}

/// One decoded frame: subscription changes, full messages, control messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRecord {
    pub subscriptions: Vec<SubOpt>,
    pub messages: Vec<WireMessage>,
    pub control: Option<ControlBlock>,
}

impl RpcRecord {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.messages.is_empty()
            && self.control.as_ref().map_or(true, ControlBlock::is_empty)
    }

    fn control_mut(&mut self) -> &mut ControlBlock {
        self.control.get_or_insert_with(ControlBlock::default)
    }

    pub fn with_subscription(mut self, topic: &str, subscribe: bool) -> Self {
        self.subscriptions.push(SubOpt {
            subscribe,
            topic: topic.to_string(),
        });
        self
    }

    pub fn with_message(mut self, message: WireMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_graft(mut self, topic: &str) -> Self {
        self.control_mut().graft.push(ControlGraft {
            topic: topic.to_string(),
        });
        self
    }

    pub fn with_prune(mut self, prune: ControlPrune) -> Self {
        self.control_mut().prune.push(prune);
        self
    }

    pub fn with_ihave(mut self, topic: &str, msg_ids: Vec<MessageId>) -> Self {
        self.control_mut().ihave.push(ControlIHave {
            topic: topic.to_string(),
            msg_ids,
        });
        self
    }

    pub fn with_iwant(mut self, msg_ids: Vec<MessageId>) -> Self {
        self.control_mut().iwant.push(ControlIWant { msg_ids });
        self
    }

    pub fn with_idontwant(mut self, msg_ids: Vec<MessageId>) -> Self {
        self.control_mut().idontwant.push(ControlIDontWant { msg_ids });
        self
    }
}

/// Count ceilings applied to a decoded frame before it is processed.
///
/// Defaults are finite. Unbounded limits are only appropriate for fully
/// trusted test setups; see [`RpcLimits::unbounded`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcLimits {
    pub max_subscriptions: usize,
    pub max_messages: usize,
    /// Total ids across all IHAVE entries in one frame.
    pub max_ihave_ids: usize,
    /// Total ids across all IWANT entries in one frame.
    pub max_iwant_ids: usize,
    /// Total ids across all IDONTWANT entries in one frame.
    pub max_idontwant_ids: usize,
    /// Entries per control list (graft, prune, ihave, iwant, idontwant).
    pub max_control_entries: usize,
    /// Peer-exchange ids per PRUNE entry.
    pub max_peer_exchange: usize,
}

impl Default for RpcLimits {
    fn default() -> Self {
        Self {
            max_subscriptions: 100,
            max_messages: 64,
            max_ihave_ids: 5000,
            max_iwant_ids: 5000,
            max_idontwant_ids: 1000,
            max_control_entries: 64,
            max_peer_exchange: 64,
        }
    }
}

impl RpcLimits {
    /// No ceilings. Only for trusted in-process test wiring.
    pub fn unbounded() -> Self {
        Self {
            max_subscriptions: usize::MAX,
            max_messages: usize::MAX,
            max_ihave_ids: usize::MAX,
            max_iwant_ids: usize::MAX,
            max_idontwant_ids: usize::MAX,
            max_control_entries: usize::MAX,
            max_peer_exchange: usize::MAX,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_subscriptions == 0 || self.max_messages == 0 || self.max_control_entries == 0 {
            return Err(ConfigError::new("rpc limits must be non-zero"));
        }
        Ok(())
    }
}

/// Frame rejection. The whole frame is dropped; the caller records a
/// protocol violation against the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte stream did not parse as a record.
    Malformed(String),
    /// A list in the record exceeded its configured ceiling.
    LimitExceeded {
        field: &'static str,
        count: usize,
        limit: usize,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(reason) => write!(f, "malformed rpc frame: {}", reason),
            DecodeError::LimitExceeded { field, count, limit } => {
                write!(f, "rpc field {} has {} entries, limit {}", field, count, limit)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a record into one frame.
pub fn encode(record: &RpcRecord) -> Vec<u8> {
    // No byte limit on the encode side; locally built records are already
    // bounded by the router's own payload and count checks.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(record)
        .unwrap_or_default()
}

/// Decode one frame, enforcing count ceilings before the record is handed on.
pub fn decode(bytes: &[u8], limits: &RpcLimits) -> Result<RpcRecord, DecodeError> {
    let record: RpcRecord = bincode_options()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    check_limits(&record, limits)?;
    Ok(record)
}

fn check_limits(record: &RpcRecord, limits: &RpcLimits) -> Result<(), DecodeError> {
    check("subscriptions", record.subscriptions.len(), limits.max_subscriptions)?;
    check("messages", record.messages.len(), limits.max_messages)?;

    if let Some(control) = &record.control {
        check("graft", control.graft.len(), limits.max_control_entries)?;
        check("prune", control.prune.len(), limits.max_control_entries)?;
        check("ihave", control.ihave.len(), limits.max_control_entries)?;
        check("iwant", control.iwant.len(), limits.max_control_entries)?;
        check("idontwant", control.idontwant.len(), limits.max_control_entries)?;

        let ihave_ids: usize = control.ihave.iter().map(|c| c.msg_ids.len()).sum();
        check("ihave ids", ihave_ids, limits.max_ihave_ids)?;

        let iwant_ids: usize = control.iwant.iter().map(|c| c.msg_ids.len()).sum();
        check("iwant ids", iwant_ids, limits.max_iwant_ids)?;

        let idontwant_ids: usize = control.idontwant.iter().map(|c| c.msg_ids.len()).sum();
        check("idontwant ids", idontwant_ids, limits.max_idontwant_ids)?;

        for prune in &control.prune {
            check("peer exchange", prune.peers.len(), limits.max_peer_exchange)?;
        }
    }
    Ok(())
}

fn check(field: &'static str, count: usize, limit: usize) -> Result<(), DecodeError> {
    if count > limit {
        return Err(DecodeError::LimitExceeded { field, count, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn full_record() -> RpcRecord {
        RpcRecord::default()
            .with_subscription("blocks", true)
            .with_subscription("txs", false)
            .with_message(WireMessage {
                topic: "blocks".into(),
                source: peer(1),
                seqno: 42,
                data: vec![1, 2, 3],
            })
            .with_graft("blocks")
            .with_prune(ControlPrune {
                topic: "txs".into(),
                peers: vec![peer(2), peer(3)],
                backoff_secs: Some(60),
            })
            .with_ihave("blocks", vec![[0xAB; 32], [0xCD; 32]])
            .with_iwant(vec![[0xEF; 32]])
            .with_idontwant(vec![[0x11; 32]])
    }

    #[test]
    fn round_trip_within_limits() {
        let record = full_record();
        let bytes = encode(&record);
        let decoded = decode(&bytes, &RpcLimits::default()).expect("decode should succeed");
        assert_eq!(decoded, record);
    }

    #[test]
    fn malformed_bytes_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(matches!(
            decode(&garbage, &RpcLimits::default()),
            Err(DecodeError::Malformed(_))
        ));

        let bytes = encode(&full_record());
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode(truncated, &RpcLimits::default()).is_err());
    }

    #[test]
    fn subscription_ceiling_enforced() {
        let mut record = RpcRecord::default();
        for i in 0..5 {
            record = record.with_subscription(&format!("topic-{}", i), true);
        }
        let bytes = encode(&record);

        let limits = RpcLimits {
            max_subscriptions: 4,
            ..Default::default()
        };
        match decode(&bytes, &limits) {
            Err(DecodeError::LimitExceeded { field, count, limit }) => {
                assert_eq!(field, "subscriptions");
                assert_eq!(count, 5);
                assert_eq!(limit, 4);
            }
            other => panic!("expected limit error, got {:?}", other),
        }
    }

    #[test]
    fn ihave_id_ceiling_counts_across_entries() {
        let record = RpcRecord::default()
            .with_ihave("a", vec![[1; 32]; 3])
            .with_ihave("b", vec![[2; 32]; 3]);
        let bytes = encode(&record);

        let limits = RpcLimits {
            max_ihave_ids: 5,
            ..Default::default()
        };
        assert!(matches!(
            decode(&bytes, &limits),
            Err(DecodeError::LimitExceeded { field: "ihave ids", .. })
        ));

        let limits = RpcLimits {
            max_ihave_ids: 6,
            ..Default::default()
        };
        assert!(decode(&bytes, &limits).is_ok());
    }

    #[test]
    fn peer_exchange_ceiling_enforced() {
        let record = RpcRecord::default().with_prune(ControlPrune {
            topic: "t".into(),
            peers: (0..10u8).map(peer).collect(),
            backoff_secs: None,
        });
        let bytes = encode(&record);

        let limits = RpcLimits {
            max_peer_exchange: 8,
            ..Default::default()
        };
        assert!(matches!(
            decode(&bytes, &limits),
            Err(DecodeError::LimitExceeded { field: "peer exchange", .. })
        ));
    }

    #[test]
    fn empty_record_is_empty() {
        assert!(RpcRecord::default().is_empty());
        assert!(!RpcRecord::default().with_graft("t").is_empty());
        assert!(!RpcRecord::default().with_subscription("t", true).is_empty());
    }

    #[test]
    fn oversized_frame_rejected_by_byte_limit() {
        let record = RpcRecord::default().with_message(WireMessage {
            topic: "big".into(),
            source: peer(1),
            seqno: 1,
            data: vec![0u8; 2 * 1024 * 1024],
        });
        let bytes = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&record)
            .unwrap();
        assert!(decode(&bytes, &RpcLimits::unbounded()).is_err());
    }

    #[test]
    fn unbounded_limits_accept_large_counts() {
        let record = RpcRecord::default().with_iwant(vec![[7; 32]; 500]);
        let bytes = encode(&record);
        assert!(decode(&bytes, &RpcLimits::unbounded()).is_ok());
    }
}
