//! # Meshcast - Topic-Based Publish/Subscribe Overlay
//!
//! Meshcast is the gossip core of a peer-to-peer pub/sub network. Each node
//! maintains, per topic, a bounded mesh of peers that receive full messages,
//! while gossiping compact availability hints (IHAVE/IWANT) to a wider peer
//! set, and scores every peer's behavior to gate mesh admission and push
//! back against abuse.
//!
//! ## Architecture
//!
//! The crate uses the **Actor Pattern** for safe concurrent state:
//! - [`MeshRouter`] is a public handle, cheap to clone, communicating with
//!   the actor over async channels
//! - The actor owns all mutable state (mesh sets, score tables, caches) and
//!   processes inbound frames and the heartbeat timer sequentially
//!
//! Transport, peer identity and message validation are external
//! collaborators behind traits; the core consumes delimited RPC frames and
//! connect/disconnect events, and produces frames to send.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `router` | Mesh/gossip control loop: heartbeat, GRAFT/PRUNE, forwarding |
//! | `score` | Peer scoring engine: behavioral counters, decay, thresholds |
//! | `cache` | Message-seen cache with sliding validity window |
//! | `rpc` | Wire records and bounded codec with decode-time limits |
//! | `config` | Mesh degrees, timing and gossip tunables |
//! | `peer` | Opaque peer identifiers and connection direction |
//! | `protocols` | Boundary traits for transport and validation |
//!
//! ## Quick Start
//!
//! ```ignore
//! let router = MeshRouter::spawn(
//!     transport,
//!     Arc::new(AcceptAll),
//!     local_id,
//!     MeshConfig::default(),
//!     score_params,
//!     ScoreThresholds::default(),
//! )?;
//!
//! router.peer_connected(peer, Direction::Outbound, None).await;
//! let mut deliveries = router.subscribe("my-topic").await?;
//! router.publish("my-topic", b"hello".to_vec()).await?;
//! while let Some(msg) = deliveries.recv().await {
//!     println!("got {:?}", msg.data);
//! }
//! ```

mod cache;
mod config;
mod peer;
mod protocols;
mod router;
mod rpc;
mod score;

pub use cache::MessageCache;
pub use config::{ConfigError, MeshConfig, MessageIdMode, is_valid_topic};
pub use peer::{Direction, PeerId};
pub use protocols::{AcceptAll, FrameTransport, MessageValidator, Verdict};
pub use router::{compute_message_id, Delivery, Message, MeshRouter, PublishRejection};
pub use rpc::{
    decode, encode, ControlBlock, ControlGraft, ControlIDontWant, ControlIHave, ControlIWant,
    ControlPrune, DecodeError, MessageId, RpcLimits, RpcRecord, SubOpt, WireMessage,
};
pub use score::{
    PeerScore, PeerScoreParams, RejectReason, ScoreThresholds, TopicScoreParams,
};
