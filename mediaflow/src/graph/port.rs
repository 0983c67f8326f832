//! Identifiers, ports and links.

use crate::caps::{Capability, CapabilitySet};
use crate::core::{PadDirection, PadPresence};
use std::fmt;

/// Index of a stage within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(pub(crate) usize);

impl StageId {
    /// Position of the stage in insertion order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Index of a port within its graph. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub(crate) usize);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// A typed connection point on a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Port id.
    pub id: PortId,
    /// Owning stage.
    pub stage: StageId,
    /// Name, unique within the stage.
    pub name: String,
    /// Input or output.
    pub direction: PadDirection,
    /// Created with the stage, or announced at runtime.
    pub presence: PadPresence,
    /// What the port can carry before negotiation.
    pub caps: CapabilitySet,
    /// Caps fixed by negotiation.
    pub current: Option<Capability>,
    /// Linked peer.
    pub peer: Option<PortId>,
}

impl Port {
    /// Returns true if the port has a peer.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.peer.is_some()
    }
}

/// A realized 1:1 connection between an output port and an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    /// Output port.
    pub producer: PortId,
    /// Input port.
    pub consumer: PortId,
}
