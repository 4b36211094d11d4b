//! Node lifecycle hooks.
//!
//! A computed can be tied to an external resource (typically a node in some
//! host tree) so that it is disposed when that resource goes away. The host
//! provides the watcher; the engine only needs the three operations below.

use std::rc::Rc;

/// Opaque handle for an external node, as understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

/// Callback run when a watched node is released.
pub type DisposeCallback = Rc<dyn Fn()>;

/// Host-side watcher of external node lifetimes.
pub trait NodeLifecycle {
    /// Run `callback` when `node` is released.
    fn add_dispose_callback(&self, node: NodeHandle, callback: DisposeCallback);

    /// Forget a callback previously added for `node`. Callbacks are matched
    /// by pointer identity.
    fn remove_dispose_callback(&self, node: NodeHandle, callback: &DisposeCallback);

    /// True while `node` is still part of the live host tree.
    fn is_attached(&self, node: NodeHandle) -> bool;
}
