//! Graph Links
//!
//! Directed edges between behaviors and resources come in two kinds:
//!
//! - `Reactive`: an update to the resource activates the demanding behavior.
//! - `Order`: the edge participates in topological ordering but never
//!   activates anything.
//!
//! Two representations exist. The public `DemandLink` and `ResourceRef` are
//! what callers pass to builders and dynamic-link setters; they carry the
//! identity of the graph their resource was created in, so a link built
//! against one graph is rejected when handed to another. Internally the
//! engine stores `DemandEdge` and `SubsequentEdge`, which are plain id pairs
//! hashed by endpoint and kind. Edges whose endpoint has been removed are
//! pruned lazily the next time a traversal touches them.

use std::sync::{Arc, Weak};

use crate::graph::behavior::BehaviorId;
use crate::graph::resource::ResourceId;
use crate::graph::runtime::GraphShared;

/// The two kinds of demand edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Updates to the resource activate the demanding behavior.
    Reactive,
    /// Establishes ordering only; updates never activate the behavior.
    Order,
}

/// A demand declared by a behavior on a resource.
///
/// Obtained from a resource handle via `link()` (reactive) or `order()`
/// (order-only).
#[derive(Clone)]
pub struct DemandLink {
    pub(crate) graph: Weak<GraphShared>,
    pub(crate) resource: ResourceId,
    pub(crate) kind: LinkKind,
}

impl DemandLink {
    /// The resource this link points at.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Whether the link is reactive or order-only.
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<GraphShared>) -> bool {
        std::ptr::eq(self.graph.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn edge(&self) -> DemandEdge {
        DemandEdge {
            resource: self.resource,
            kind: self.kind,
        }
    }
}

/// An untyped reference to a resource, used when declaring supplies.
///
/// Obtained from a resource handle via `resource()`.
#[derive(Clone)]
pub struct ResourceRef {
    pub(crate) graph: Weak<GraphShared>,
    pub(crate) id: ResourceId,
}

impl ResourceRef {
    /// The referenced resource.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// A reactive demand on the referenced resource.
    pub fn link(&self) -> DemandLink {
        DemandLink {
            graph: self.graph.clone(),
            resource: self.id,
            kind: LinkKind::Reactive,
        }
    }

    /// An order-only demand on the referenced resource.
    pub fn order(&self) -> DemandLink {
        DemandLink {
            graph: self.graph.clone(),
            resource: self.id,
            kind: LinkKind::Order,
        }
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<GraphShared>) -> bool {
        std::ptr::eq(self.graph.as_ptr(), Arc::as_ptr(shared))
    }
}

/// Internal demand edge: behavior -> resource, keyed by endpoint and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DemandEdge {
    pub(crate) resource: ResourceId,
    pub(crate) kind: LinkKind,
}

/// Internal subsequent edge: resource -> behavior, keyed by endpoint and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubsequentEdge {
    pub(crate) behavior: BehaviorId,
    pub(crate) kind: LinkKind,
}
