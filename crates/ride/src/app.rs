//! The mount/unmount facade.
//!
//! [`mount`] wires a Runtime and Scheduler together, constructs the root
//! component synchronously, and kicks off the host factory in the
//! background. Until the factory resolves, updates stage and ops buffer;
//! the first post-ready flush runs them. Embedders drive frames from their
//! display callback:
//!
//! ```ignore
//! let app = ride::mount(Gallery::default(), props)?;
//! loop {
//!     app.next_frame().await;
//!     app.tick().await?;
//! }
//! ```
//!
//! Tests and tools use [`flush_until_idle`] for determinism instead.

use crate::component::{mount_component, Component, Handle, Props};
use crate::error::{ErrorReport, Phase, RideError};
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// A mounted application: the root component plus its runtime.
pub struct RideApp {
    root: Handle,
}

impl RideApp {
    pub fn root(&self) -> &Handle {
        &self.root
    }

    pub fn runtime(&self) -> &Runtime {
        self.root.runtime()
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.runtime().scheduler()
    }

    /// Resolves once the host factory has; errs if it failed.
    pub async fn when_ready(&self) -> Result<(), RideError> {
        self.runtime().when_ready().await
    }

    /// Resolves when a frame has been armed by a dirty-mark.
    pub async fn next_frame(&self) {
        self.scheduler().next_frame().await
    }

    /// Run one animation frame.
    pub async fn tick(&self) -> Result<(), RideError> {
        self.scheduler().flush().await
    }
}

/// Construct the runtime (frame budget from the app class), mount the root
/// component, and start the host factory. Returns immediately; the root is
/// usable right away, readiness follows asynchronously.
///
/// Must be called within a tokio runtime: the host factory runs on a
/// spawned task.
pub fn mount<A: Component>(app: A, props: Props) -> Result<RideApp, RideError> {
    let scheduler = Scheduler::new(A::progressive().budget());
    let runtime = Runtime::new(scheduler);
    let root = mount_component(&runtime, None, app, props.clone())?;
    runtime.set_root(root.id());

    let host_future = A::create_host(&props);
    let handle = runtime.clone();
    tokio::spawn(async move {
        match host_future.await {
            Ok(host) => handle.install_host(host),
            Err(error) => {
                handle.fail_ready(error.to_string());
                handle.report_error(ErrorReport::new(error, Phase::HostInit));
            }
        }
    });

    Ok(RideApp { root })
}

/// Destroy the app's component tree, then tear the host down.
pub async fn unmount(app: &RideApp) -> Result<(), RideError> {
    app.root.destroy().await?;
    if let Some(host) = app.runtime().host() {
        host.teardown();
    }
    Ok(())
}

/// Options for [`flush_until_idle`].
#[derive(Debug, Clone, Copy)]
pub struct IdleOpts {
    /// Flush-iteration bound before giving up with
    /// [`RideError::IdleExhausted`].
    pub max: usize,
}

impl Default for IdleOpts {
    fn default() -> Self {
        Self { max: 100 }
    }
}

/// Await readiness, then flush frames until the scheduler quiesces.
pub async fn flush_until_idle(app: &RideApp, opts: IdleOpts) -> Result<(), RideError> {
    app.when_ready().await?;
    app.scheduler().when_idle(opts.max).await
}
