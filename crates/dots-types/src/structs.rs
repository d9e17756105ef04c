//! Core record structs: the dot itself and its enriched view.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::DotId;

// ---------------------------------------------------------------------------
// Dot
// ---------------------------------------------------------------------------

/// A single hierarchical record.
///
/// Dots are immutable value objects once produced. Providers hand them out
/// and consumers take them in by value; nothing holds a reference into
/// another dot's memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dot {
    /// Identifier of this dot. `0` is the base root dot.
    pub id: DotId,
    /// Identifier of the parent dot. `0` is the base root dot.
    pub parent_id: DotId,
    /// Dot's name.
    pub name: String,
    /// Dot's value.
    pub value: String,
}

impl Dot {
    /// Build a dot from raw parts.
    pub fn new(
        id: u64,
        parent_id: u64,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: DotId(id),
            parent_id: DotId(parent_id),
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether this dot is the base root.
    pub const fn is_root(&self) -> bool {
        self.id.is_root()
    }
}

// ---------------------------------------------------------------------------
// Enriched view
// ---------------------------------------------------------------------------

/// Hierarchy metadata derived for a dot before it is forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotMeta {
    /// Parent's name. Empty for the root and for top-level dots whose
    /// parent is the root.
    pub parent_name: String,
    /// Depth of the dot from the root. The root has depth 0.
    pub depth: u64,
    /// Number of direct children.
    pub children: u64,
    /// Routing key: the `/`-joined names on the path from the root.
    pub route: String,
}

/// An out-of-band processing request addressed to an enriched dot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDot {
    /// The dot the request is addressed to.
    pub target: DotId,
    /// Route the request arrived on.
    pub route: String,
    /// Request payload.
    pub body: serde_json::Value,
}

/// A dot decorated with hierarchy metadata and an inbound request channel.
///
/// Scoped to a single processing request and discarded afterwards.
#[derive(Debug, Clone)]
pub struct MetaDot {
    /// The underlying record.
    pub dot: Dot,
    /// Derived hierarchy metadata.
    pub meta: DotMeta,
    requests: mpsc::Sender<RequestDot>,
}

/// Returned when the receiving side of a [`MetaDot`] channel has gone away.
#[derive(Debug, thiserror::Error)]
#[error("request channel for dot {0} is closed")]
pub struct RequestChannelClosed(pub DotId);

impl MetaDot {
    /// Decorate a dot with metadata and the channel its requests go to.
    pub const fn new(dot: Dot, meta: DotMeta, requests: mpsc::Sender<RequestDot>) -> Self {
        Self {
            dot,
            meta,
            requests,
        }
    }

    /// Forward a processing request to this dot's request channel.
    ///
    /// Waits while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`RequestChannelClosed`] if the receiver has been dropped.
    pub async fn process(&self, request: RequestDot) -> Result<(), RequestChannelClosed> {
        self.requests
            .send(request)
            .await
            .map_err(|_closed| RequestChannelClosed(self.dot.id))
    }
}
