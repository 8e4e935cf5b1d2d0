//! Boundary trait definitions.
//!
//! The router is generic over everything it does not own: moving bytes to a
//! peer and judging message contents. Traits live here, separate from any
//! implementation, so the router depends only on the contracts.
//!
//! | Boundary | Trait | Purpose |
//! |----------|-------|---------|
//! | Transport | [`FrameTransport`] | Deliver one encoded frame to a peer |
//! | Validation | [`MessageValidator`] | Application verdict on message contents |

use anyhow::Result;
use async_trait::async_trait;

use crate::peer::PeerId;
use crate::router::Message;

/// Outbound half of the transport boundary.
///
/// The transport owns streams, framing and encryption; the router hands it
/// one already-encoded frame at a time. Inbound frames travel the other way
/// through [`crate::router::MeshRouter::inbound_frame`]. A send failure is
/// local to that peer; the router queues and retries at the next heartbeat.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Send one delimited frame to a connected peer.
    async fn send_frame(&self, to: &PeerId, frame: Vec<u8>) -> Result<()>;
}

/// Application verdict on a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver locally, forward to the mesh, reward the deliverer.
    Accept,
    /// Do not forward; penalize the deliverer and any peer that forwarded
    /// the message while validation was pending.
    Reject,
    /// Do not forward and do not score anyone; the id is still marked seen
    /// so the message is not reprocessed.
    Ignore,
}

/// Topic-agnostic validation boundary supplied by the application.
#[async_trait]
pub trait MessageValidator: Send + Sync {
    async fn validate(&self, message: &Message) -> Verdict;
}

/// Validator that accepts everything. Used when the application performs no
/// content validation.
pub struct AcceptAll;

#[async_trait]
impl MessageValidator for AcceptAll {
    async fn validate(&self, _message: &Message) -> Verdict {
        Verdict::Accept
    }
}
