use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use slotmap::new_key_type;

use crate::codegen::value::ValueKind;

pub const MAX_NODE_PORTS: usize = 32;

new_key_type! { pub struct SurfaceKey; }
new_key_type! { pub struct NodeKey; }

/// A port of a node, named the way the node declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub node: NodeKey,
    pub port: Arc<str>,
}

impl PortRef {
    pub fn new(node: NodeKey, port: &str) -> Self {
        Self {
            node,
            port: Arc::from(port),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.node, self.port)
    }
}

/// Identity of a connection group: its smallest member port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub PortRef);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortDirection {
    /// Read by the node.
    Input,
    /// Written by the node.
    Output,
    /// Written from outside the surface (IO nodes).
    External,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: Arc<str>,
    pub kind: ValueKind,
    pub direction: PortDirection,
}

impl PortDescriptor {
    pub fn new(name: &str, kind: ValueKind, direction: PortDirection) -> Self {
        Self {
            name: Arc::from(name),
            kind,
            direction,
        }
    }

    pub fn input(name: &str) -> Self {
        Self::new(name, ValueKind::Num, PortDirection::Input)
    }

    pub fn output(name: &str) -> Self {
        Self::new(name, ValueKind::Num, PortDirection::Output)
    }
}

pub type PortList = ArrayVec<PortDescriptor, MAX_NODE_PORTS>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Clean,
    Dirty,
    Compiling,
}
