//! The shared runtime handle.
//!
//! One [`Runtime`] exists per mounted app. It owns the component arena, the
//! scheduler, the host slot (filled asynchronously once the host factory
//! resolves), the readiness gate, and the error router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use slotmap::SlotMap;
use tokio::sync::watch;

use crate::component::{ComponentId, ComponentSlot, Locality};
use crate::error::{ErrorReport, RideError};
use crate::host::Host;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Cheap clonable handle to the runtime internals.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    pub(crate) components: Mutex<SlotMap<ComponentId, ComponentSlot>>,
    pub(crate) scheduler: Scheduler,
    host: Mutex<Option<Arc<dyn Host>>>,
    ready: watch::Sender<ReadyState>,
    root: Mutex<Option<ComponentId>>,
    created: AtomicU64,
}

/// Scheduling-relevant facts about a live component.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Brief {
    pub(crate) depth: u32,
    pub(crate) locality: Locality,
}

impl Runtime {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);
        let inner = Arc::new(RuntimeInner {
            components: Mutex::new(SlotMap::with_key()),
            scheduler,
            host: Mutex::new(None),
            ready,
            root: Mutex::new(None),
            created: AtomicU64::new(0),
        });
        inner.scheduler.bind(Arc::downgrade(&inner));
        Self { inner }
    }

    pub(crate) fn from_weak(weak: &Weak<RuntimeInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn lock_components(&self) -> MutexGuard<'_, SlotMap<ComponentId, ComponentSlot>> {
        self.inner.components.lock()
    }

    pub(crate) fn next_created(&self) -> u64 {
        self.inner.created.fetch_add(1, Ordering::Relaxed)
    }

    pub fn root(&self) -> Option<ComponentId> {
        *self.inner.root.lock()
    }

    pub(crate) fn set_root(&self, id: ComponentId) {
        *self.inner.root.lock() = Some(id);
    }

    /// The host adapter, once the factory has resolved.
    pub fn host(&self) -> Option<Arc<dyn Host>> {
        self.inner.host.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow() == ReadyState::Ready
    }

    /// Resolves once the host is installed; errs if the host factory failed
    /// (or the runtime went away), so callers never wait forever.
    pub async fn when_ready(&self) -> Result<(), RideError> {
        let mut rx = self.inner.ready.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(message) => {
                    return Err(RideError::HostInitFailed(message.clone()))
                }
                ReadyState::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| RideError::RuntimeShutDown)?;
        }
    }

    /// Install the host, flip readiness, and dirty everything that was
    /// mounted or queued against before the host existed, so exactly one
    /// flush runs the buffered work.
    pub(crate) fn install_host(&self, host: Arc<dyn Host>) {
        *self.inner.host.lock() = Some(host);
        self.inner.ready.send_replace(ReadyState::Ready);

        let pending: Vec<ComponentId> = {
            let components = self.lock_components();
            components
                .iter()
                .filter(|(_, slot)| !slot.st.destroyed && !slot.st.initialized)
                .map(|(id, _)| id)
                .collect()
        };
        for id in pending {
            self.inner.scheduler.mark_dirty(id);
        }
    }

    pub(crate) fn fail_ready(&self, message: String) {
        self.inner.ready.send_replace(ReadyState::Failed(message));
    }

    pub(crate) fn brief(&self, id: ComponentId) -> Option<Brief> {
        let components = self.lock_components();
        components
            .get(id)
            .filter(|slot| !slot.st.destroyed)
            .map(|slot| Brief {
                depth: slot.st.depth,
                locality: slot.st.locality,
            })
    }

    /// Whether `id` is `ancestor` or lives in its subtree.
    pub(crate) fn is_descendant(&self, id: ComponentId, ancestor: ComponentId) -> bool {
        let components = self.lock_components();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = components.get(current).and_then(|slot| slot.st.parent);
        }
        false
    }

    /// Route a captured handler failure. Preference order: the root class
    /// handler, the root instance handler, the erroring component's class
    /// and instance handlers (covers early boot, before a root exists or
    /// while it is busy), then the log sink. Never panics, never rethrows.
    pub fn report_error(&self, report: ErrorReport) {
        let root = self.root();
        let mut targets: Vec<ComponentId> = Vec::new();
        if let Some(root_id) = root {
            targets.push(root_id);
        }
        if let Some(component_id) = report.component {
            if Some(component_id) != root {
                targets.push(component_id);
            }
        }

        for id in targets {
            let (hook, body) = {
                let components = self.lock_components();
                match components.get(id) {
                    Some(slot) => (slot.error_hook, slot.body.clone()),
                    None => continue,
                }
            };
            if hook(&report) {
                return;
            }
            // The instance handler needs the body; skip it if the component
            // is mid-dispatch rather than block inside the error path.
            let lock_result = body.try_lock();
            if let Ok(guard) = lock_result {
                if guard.on_error(&report) {
                    return;
                }
            }
        }

        tracing::error!(
            phase = %report.phase,
            component = ?report.component,
            op = ?report.op,
            error = %report.error,
            "unhandled runtime error"
        );
    }
}
