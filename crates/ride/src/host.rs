//! The host adapter surface.
//!
//! The runtime never draws. A [`Host`] owns the concrete presentation tree
//! (GPU scene, canvas, DOM, a test recorder) and exposes the minimal node
//! operations the core needs: create, attach, detach, destroy, plus a
//! present signal. Hosts usually expose richer domain operations (texture
//! upload, text layout, event subscription); components reach those by
//! downcasting the host, the core stays unaware of them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::component::ComponentId;

/// Opaque handle to a host-side node. The runtime stores and passes these
/// around; only the owning host knows what is inside.
#[derive(Clone)]
pub struct HostNode(Arc<dyn Any + Send + Sync>);

impl HostNode {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for HostNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostNode(..)")
    }
}

/// The adapter contract consumed by the core.
pub trait Host: Any + Send + Sync {
    /// Handle for the root container node.
    fn root_node(&self) -> HostNode;

    /// Create a node for a component. The core stores the handle on the
    /// component and attaches it at most once per lifetime.
    fn create_node(&self, component: ComponentId) -> HostNode;

    /// Attach a node beneath a parent node. Failures are reported under the
    /// `attach` phase and the component retried on a later dirty-mark.
    fn attach_node(&self, parent: &HostNode, child: &HostNode) -> anyhow::Result<()>;

    /// Remove a node from its parent. Only called during destroy.
    fn detach_node(&self, parent: &HostNode, child: &HostNode);

    /// Release host-side resources tied to the node.
    fn destroy_node(&self, node: &HostNode);

    /// Present. Called at most once per host per flush, after the batch.
    fn request_render(&self);

    /// Invoked on `unmount` after the root has been destroyed.
    fn teardown(&self) {}
}

impl dyn Host {
    /// Downcast to a concrete host to reach its domain-specific operations.
    pub fn downcast_ref<T: Host>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}
