//! Address block entity.
//!
//! An address block is one node of the buddy tree: a subnet, its allocation
//! status, and parent/child links. All blocks except the administratively
//! created roots are produced by splits and destroyed by coalescing.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addr::{Family, IpSubnet};
use crate::store::NodeId;

/// Allocation status of an address block.
///
/// Leaves are Free, Full, or HeldDown; inner nodes are Partial or Full
/// (Free only transiently while a split is in progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Free,
    Full,
    Partial,
    HeldDown,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStatus::Free => write!(f, "free"),
            PoolStatus::Full => write!(f, "full"),
            PoolStatus::Partial => write!(f, "partial"),
            PoolStatus::HeldDown => write!(f, "held-down"),
        }
    }
}

/// Allocation bounds configured on a tree root. Meaningless on non-root
/// blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    /// Prefix length used when an allocation request does not name one.
    pub prefix_length_default: Option<u8>,
    /// Coarsest prefix length a request may ask for.
    pub prefix_length_minimum: Option<u8>,
    /// Finest prefix length a request may ask for.
    pub prefix_length_maximum: Option<u8>,
    /// Grace period freed subnets spend in hold-down before reuse.
    /// Falls back to one day when unset.
    #[serde(default, with = "humantime_serde::option")]
    pub hold_down_period: Option<Duration>,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            prefix_length_default: None,
            prefix_length_minimum: Some(24),
            prefix_length_maximum: Some(28),
            hold_down_period: None,
        }
    }
}

/// One node of the buddy tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressBlock {
    /// Stable arena identifier of this block.
    pub id: NodeId,
    /// The address range this block covers.
    pub subnet: IpSubnet,
    /// Allocation status; persisted, not recomputed on demand.
    pub status: PoolStatus,
    /// Owning block; None only at a tree root.
    pub parent: Option<NodeId>,
    /// Ordered (lower, upper) halves, or None for a leaf.
    pub children: Option<(NodeId, NodeId)>,
    /// Root of the tree this block belongs to; equals `id` at the root.
    pub top_level: NodeId,
    /// When the block entered hold-down; None otherwise.
    pub held_from: Option<DateTime<Utc>>,
    /// Allocation bounds; set on roots only.
    pub config: Option<RootConfig>,
    /// Free-text label, used on roots.
    pub description: Option<String>,
}

impl AddressBlock {
    /// Create a new tree root covering `subnet`.
    pub fn new_root(
        id: NodeId,
        subnet: IpSubnet,
        config: RootConfig,
        description: Option<String>,
    ) -> Self {
        AddressBlock {
            id,
            subnet,
            status: PoolStatus::Free,
            parent: None,
            children: None,
            top_level: id,
            held_from: None,
            config: Some(config),
            description,
        }
    }

    /// Create a child block covering `subnet`, inheriting the parent's
    /// tree root.
    pub fn new_child(id: NodeId, subnet: IpSubnet, parent: &AddressBlock) -> Self {
        AddressBlock {
            id,
            subnet,
            status: PoolStatus::Free,
            parent: Some(parent.id),
            children: None,
            top_level: parent.top_level,
            held_from: None,
            config: None,
            description: None,
        }
    }

    /// Returns true if this block has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Returns true if this block is a tree root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns true if this block is currently held down.
    pub fn is_held_down(&self) -> bool {
        self.status == PoolStatus::HeldDown
    }

    /// Address family of this block.
    pub fn family(&self) -> Family {
        self.subnet.family()
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "{} [{}]", description, self.subnet)
        } else {
            write!(f, "{}", self.subnet)
        }
    }
}
