//! Component lifecycle: staged props, transactional diffs, effect dispatch,
//! per-key cleanups, and parent/child composition.
//!
//! Components live in a slotmap arena owned by the [`Runtime`]; the tree is
//! expressed as parent ids and child id lists, so ownership stays acyclic
//! and destroy is always parent-driven. The user's component is a boxed
//! trait object behind an async mutex — hook dispatch serializes on it,
//! which is the single-threaded cooperative model made explicit.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::behavior::{behavior_matches, Behavior};
use crate::error::{ErrorReport, Phase, RideError};
use crate::host::{Host, HostNode};
use crate::op::{CommandBuffer, Op, PushOp, SquashFn, INIT_OP};
use crate::runtime::Runtime;
use crate::scheduler::FrameClock;
use crate::util;

new_key_type! {
    /// Arena key identifying a mounted component.
    pub struct ComponentId;
}

/// Committed, staged, and patch prop maps are all shallow string-keyed JSON
/// objects, merged top-level-key by top-level-key.
pub type Props = serde_json::Map<String, Value>;

/// Result of a diff hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffOutcome {
    /// Commit the staged props.
    #[default]
    Commit,
    /// Keep the staged props pending; later updates keep accumulating.
    Defer,
}

/// Scheduler policy for a component's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locality {
    /// Wave rendering: all dirty components of a depth finish before the
    /// next depth starts.
    #[default]
    Depth,
    /// Per-item completion: descendants dirtied while this component is
    /// processed drain in the same frame, before any sibling.
    Subtree,
}

/// Per-class scheduling configuration, read once at mount.
#[derive(Debug, Clone, Copy)]
pub struct Progressive {
    /// Frame budget in milliseconds; only meaningful on the root class.
    /// Non-finite or non-positive means unbudgeted.
    pub budget_ms: f64,
    /// Component priority; 0 is highest, larger runs later.
    pub priority: i32,
    pub locality: Locality,
}

impl Default for Progressive {
    fn default() -> Self {
        Self {
            budget_ms: 0.0,
            priority: 0,
            locality: Locality::Depth,
        }
    }
}

impl Progressive {
    pub fn budget(&self) -> Option<std::time::Duration> {
        (self.budget_ms.is_finite() && self.budget_ms > 0.0)
            .then(|| std::time::Duration::from_secs_f64(self.budget_ms / 1000.0))
    }
}

/// Deferred teardown work registered by an effect (per op key) or an init
/// hook (for the component's lifetime). Invoked once, awaited, before the
/// next effect for the key or on destroy.
pub struct Cleanup {
    run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>,
}

impl Cleanup {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(async move {
                    f();
                    Ok(())
                })
            }),
        }
    }

    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            run: Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f()) }),
        }
    }

    pub(crate) async fn invoke(self) -> anyhow::Result<()> {
        (self.run)().await
    }
}

/// Static error hook captured from the component class at mount.
pub(crate) type ErrorHook = fn(&ErrorReport) -> bool;

/// A node in the orchestration tree. Implementations hold their own state;
/// the runtime owns props, the command buffer, and the host node handle.
#[async_trait]
pub trait Component: Any + Send {
    /// Scheduling configuration for this class.
    fn progressive() -> Progressive
    where
        Self: Sized,
    {
        Progressive::default()
    }

    /// Behaviors merged base-before-derived; see [`crate::behavior::compose`].
    fn behaviors() -> Vec<Arc<dyn Behavior>>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Host factory, used when this class is mounted as the root app.
    fn create_host(_props: &Props) -> BoxFuture<'static, anyhow::Result<Arc<dyn Host>>>
    where
        Self: Sized,
    {
        Box::pin(async { Err(anyhow::anyhow!("component class does not provide a host")) })
    }

    /// Class-level error handler; preferred over the instance handler.
    fn handle_error(_report: &ErrorReport) -> bool
    where
        Self: Sized,
    {
        false
    }

    /// Instance-level error handler; `true` marks the report handled.
    fn on_error(&self, _report: &ErrorReport) -> bool {
        false
    }

    /// Runs once when the init op drains, after behavior inits. Cleanups
    /// registered here run last on destroy.
    async fn init(&mut self, _cx: &mut InitCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Computes the ops needed to move from `prev` to `next` props. May
    /// queue ops through `cx` and defer the commit.
    async fn diff(
        &mut self,
        _prev: &Props,
        _next: &Props,
        _cx: &mut DiffCtx,
    ) -> anyhow::Result<DiffOutcome> {
        Ok(DiffOutcome::Commit)
    }

    /// Handles one drained op, after any matching behavior effects.
    async fn effect(&mut self, _op: &Op, _cx: &mut EffectCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the host node for this component. Called lazily on first
    /// flush, at most once per lifetime.
    fn create_node(&mut self, host: &dyn Host, id: ComponentId) -> anyhow::Result<HostNode> {
        Ok(host.create_node(id))
    }

    /// Attach point for a particular child; override to slot children under
    /// a different host node.
    fn get_child_parent(&self, _child: ComponentId, own: &HostNode) -> HostNode {
        own.clone()
    }
}

impl dyn Component {
    /// Downcast to the concrete component type, e.g. from a behavior hook.
    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }

    pub fn downcast_mut<T: Component>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut()
    }
}

pub(crate) struct ComponentSlot {
    pub(crate) body: Arc<tokio::sync::Mutex<Box<dyn Component>>>,
    pub(crate) behaviors: Arc<Vec<Arc<dyn Behavior>>>,
    pub(crate) error_hook: ErrorHook,
    pub(crate) st: ComponentState,
}

pub(crate) struct ComponentState {
    pub(crate) props: Props,
    pub(crate) staged: Option<Props>,
    pub(crate) prev_props: Props,
    pub(crate) parent: Option<ComponentId>,
    pub(crate) children: SmallVec<[ComponentId; 4]>,
    pub(crate) depth: u32,
    pub(crate) priority: i32,
    pub(crate) created_at: u64,
    pub(crate) locality: Locality,
    pub(crate) cmds: CommandBuffer,
    pub(crate) node: Option<HostNode>,
    pub(crate) attach_parent: Option<HostNode>,
    pub(crate) cleanups: BTreeMap<String, Vec<Cleanup>>,
    pub(crate) lifetime_cleanups: Vec<Cleanup>,
    pub(crate) init_cleanups: Vec<Cleanup>,
    pub(crate) initialized: bool,
    pub(crate) pre_ready_diff_ran: bool,
    pub(crate) init_done: bool,
    pub(crate) destroyed: bool,
    pub(crate) diff_ticket: u64,
}

/// Maps an op kind and payload to a coalescing key.
pub type CoalesceFn = Arc<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Options for [`Handle::queue`] / ctx `queue`.
#[derive(Clone, Default)]
pub struct QueueOpts {
    /// Explicit coalescing key; defaults to the op kind.
    pub key: Option<String>,
    /// Relative priority, added to the component's own priority.
    pub priority: i32,
    /// Derives the coalescing key from kind and payload; wins over `key`.
    pub coalesce_by: Option<CoalesceFn>,
    /// Folds the payload into a live op with the same key.
    pub squash_with: Option<SquashFn>,
}

impl QueueOpts {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn coalesce_by(
        mut self,
        f: impl Fn(&str, &Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.coalesce_by = Some(Arc::new(f));
        self
    }

    pub fn squash_with(
        mut self,
        f: impl Fn(&Value, &Value, &Op, &Op) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.squash_with = Some(Arc::new(f));
        self
    }
}

fn resolve_key(kind: &str, payload: &Value, opts: &QueueOpts) -> String {
    if let Some(coalesce) = &opts.coalesce_by {
        return coalesce(kind, payload);
    }
    opts.key.clone().unwrap_or_else(|| kind.to_string())
}

/// Context handed to lifecycle hooks. One shape serves every phase; what a
/// registration means depends on where it happens: cleanups added from an
/// init hook live until destroy, cleanups added from an effect join the op
/// key's combined cleanup, and `defer()` only has meaning inside a diff.
pub struct Cx {
    runtime: Runtime,
    id: ComponentId,
    cleanups: Vec<Cleanup>,
    deferred: bool,
}

/// Context for init hooks; cleanups registered here are lifetime cleanups.
pub type InitCtx = Cx;
/// Context for diff hooks; `defer()` keeps the staged props uncommitted.
pub type DiffCtx = Cx;
/// Context for effect hooks; cleanups registered here run LIFO before the
/// next effect for the same op key.
pub type EffectCtx = Cx;

impl Cx {
    pub(crate) fn new(runtime: Runtime, id: ComponentId) -> Self {
        Self {
            runtime,
            id,
            cleanups: Vec::new(),
            deferred: false,
        }
    }

    pub fn component(&self) -> ComponentId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn handle(&self) -> Handle {
        Handle {
            id: self.id,
            runtime: self.runtime.clone(),
        }
    }

    /// The host adapter, once ready.
    pub fn host(&self) -> Option<Arc<dyn Host>> {
        self.runtime.host()
    }

    /// This component's host node, once attached.
    pub fn node(&self) -> Option<HostNode> {
        let components = self.runtime.lock_components();
        components.get(self.id).and_then(|slot| slot.st.node.clone())
    }

    /// Enqueue an op on this component's buffer.
    pub fn queue(&self, kind: &str, payload: Value, opts: QueueOpts) -> Result<(), RideError> {
        queue_op(&self.runtime, self.id, kind, payload, opts)
    }

    /// Mount a child under this component. The child is constructed
    /// synchronously; its init op and initial diff run on upcoming frames.
    pub fn mount<C: Component>(&self, component: C, props: Props) -> Result<Handle, RideError> {
        mount_component(&self.runtime, Some(self.id), component, props)
    }

    /// Destroy a child mounted under this component.
    pub async fn unmount(&self, child: &Handle) -> Result<(), RideError> {
        unmount_child(&self.runtime, self.id, child.id).await
    }

    /// Forward an error through the runtime's handler chain.
    pub fn report(&self, error: anyhow::Error, phase: Phase) {
        self.runtime
            .report_error(ErrorReport::new(error, phase).with_component(self.id));
    }

    /// Register a cleanup: lifetime when called from init, per-key when
    /// called from an effect.
    pub fn add_cleanup(&mut self, f: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Cleanup::new(f));
    }

    pub fn add_async_cleanup<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanups.push(Cleanup::new_async(f));
    }

    /// Force DEFER regardless of the diff hook's return value.
    pub fn defer(&mut self) {
        self.deferred = true;
    }

    pub(crate) fn deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn into_cleanups(self) -> Vec<Cleanup> {
        self.cleanups
    }
}

/// Cheap clonable reference to a mounted component.
#[derive(Clone)]
pub struct Handle {
    pub(crate) id: ComponentId,
    pub(crate) runtime: Runtime,
}

impl Handle {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Stage a shallow patch and run the diff. Committed props change only
    /// if the diff (still the newest one at resolution) commits.
    pub async fn update(&self, patch: Props) -> Result<(), RideError> {
        update_component(&self.runtime, self.id, patch).await
    }

    /// Enqueue an op; dirties the component once the runtime is ready.
    pub fn queue(&self, kind: &str, payload: Value, opts: QueueOpts) -> Result<(), RideError> {
        queue_op(&self.runtime, self.id, kind, payload, opts)
    }

    /// Mount a child under this component.
    pub fn mount<C: Component>(&self, component: C, props: Props) -> Result<Handle, RideError> {
        mount_component(&self.runtime, Some(self.id), component, props)
    }

    /// Destroy a child of this component.
    pub async fn unmount(&self, child: &Handle) -> Result<(), RideError> {
        unmount_child(&self.runtime, self.id, child.id).await
    }

    /// Destroy this component and its subtree. Idempotent.
    pub async fn destroy(&self) -> Result<(), RideError> {
        destroy_component(self.runtime.clone(), self.id).await;
        Ok(())
    }

    fn read<T>(&self, gone: T, f: impl FnOnce(&ComponentState) -> T) -> T {
        let components = self.runtime.lock_components();
        components.get(self.id).map_or(gone, |slot| f(&slot.st))
    }

    pub fn props(&self) -> Props {
        self.read(Props::new(), |st| st.props.clone())
    }

    pub fn prev_props(&self) -> Props {
        self.read(Props::new(), |st| st.prev_props.clone())
    }

    pub fn staged_props(&self) -> Option<Props> {
        self.read(None, |st| st.staged.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.read(true, |st| st.destroyed)
    }

    pub fn is_initialized(&self) -> bool {
        self.read(false, |st| st.initialized)
    }

    /// Whether the init op has drained and the init hooks have run.
    pub fn is_init_done(&self) -> bool {
        self.read(false, |st| st.init_done)
    }

    pub fn pending_ops(&self) -> usize {
        self.read(0, |st| st.cmds.len())
    }
}

/// Construct a component slot, enqueue its init op, and stage the initial
/// props. Purely synchronous; all hook work happens on later frames.
pub(crate) fn mount_component<C: Component>(
    runtime: &Runtime,
    parent: Option<ComponentId>,
    component: C,
    props: Props,
) -> Result<Handle, RideError> {
    let progressive = C::progressive();
    let behaviors = Arc::new(C::behaviors());
    let created_at = runtime.next_created();

    let id = {
        let mut components = runtime.lock_components();
        let depth = match parent {
            Some(parent_id) => {
                let parent_slot = components.get(parent_id).ok_or(RideError::Destroyed)?;
                if parent_slot.st.destroyed {
                    return Err(RideError::Destroyed);
                }
                parent_slot.st.depth + 1
            }
            None => 0,
        };

        let mut cmds = CommandBuffer::new();
        cmds.push(
            PushOp::new(INIT_OP, Value::Null).priority(progressive.priority - 1),
        )?;

        let st = ComponentState {
            props: Props::new(),
            staged: Some(props),
            prev_props: Props::new(),
            parent,
            children: SmallVec::new(),
            depth,
            priority: progressive.priority,
            created_at,
            locality: progressive.locality,
            cmds,
            node: None,
            attach_parent: None,
            cleanups: BTreeMap::new(),
            lifetime_cleanups: Vec::new(),
            init_cleanups: Vec::new(),
            initialized: false,
            pre_ready_diff_ran: false,
            init_done: false,
            destroyed: false,
            diff_ticket: 0,
        };

        let id = components.insert(ComponentSlot {
            body: Arc::new(tokio::sync::Mutex::new(Box::new(component))),
            behaviors,
            error_hook: C::handle_error,
            st,
        });
        if let Some(parent_id) = parent {
            if let Some(parent_slot) = components.get_mut(parent_id) {
                parent_slot.st.children.push(id);
            }
        }
        id
    };

    if runtime.is_ready() {
        runtime.scheduler().mark_dirty(id);
    }

    Ok(Handle {
        id,
        runtime: runtime.clone(),
    })
}

pub(crate) fn queue_op(
    runtime: &Runtime,
    id: ComponentId,
    kind: &str,
    payload: Value,
    opts: QueueOpts,
) -> Result<(), RideError> {
    {
        let mut components = runtime.lock_components();
        let slot = components.get_mut(id).ok_or(RideError::Destroyed)?;
        if slot.st.destroyed {
            return Err(RideError::Destroyed);
        }
        let key = resolve_key(kind, &payload, &opts);
        let priority = slot.st.priority + opts.priority;
        slot.st.cmds.push(PushOp {
            kind: kind.to_string(),
            key,
            payload,
            priority,
            squash: opts.squash_with,
        })?;
    }
    if runtime.is_ready() {
        runtime.scheduler().mark_dirty(id);
    }
    Ok(())
}

/// Stage a patch and run the diff cycle. Before readiness only the
/// component's own diff runs (behaviors are skipped) and nothing commits;
/// the first post-ready flush commits the accumulated staged props without
/// re-diffing.
pub(crate) async fn update_component(
    runtime: &Runtime,
    id: ComponentId,
    patch: Props,
) -> Result<(), RideError> {
    let ready = runtime.is_ready();
    let (body, behaviors, ticket, prev, next) = {
        let mut components = runtime.lock_components();
        let slot = components.get_mut(id).ok_or(RideError::Destroyed)?;
        if slot.st.destroyed {
            return Err(RideError::Destroyed);
        }
        let mut staged = slot
            .st
            .staged
            .take()
            .unwrap_or_else(|| slot.st.props.clone());
        util::merge_into(&mut staged, patch);
        slot.st.staged = Some(staged.clone());
        slot.st.cmds.bump_generation();
        slot.st.diff_ticket += 1;
        (
            slot.body.clone(),
            slot.behaviors.clone(),
            slot.st.diff_ticket,
            slot.st.props.clone(),
            staged,
        )
    };

    let outcome = run_diff_chain(
        runtime,
        id,
        &body,
        &behaviors,
        &prev,
        &next,
        !ready,
        Phase::Diff,
    )
    .await;

    let mark = {
        let mut components = runtime.lock_components();
        let Some(slot) = components.get_mut(id) else {
            return Ok(());
        };
        if slot.st.destroyed || slot.st.diff_ticket != ticket {
            // A newer diff owns the staged props; this one resolves as DEFER.
            return Ok(());
        }
        if !ready {
            slot.st.pre_ready_diff_ran = true;
            return Ok(());
        }
        if outcome == DiffOutcome::Commit {
            commit_staged(&mut slot.st);
            true
        } else {
            false
        }
    };
    if mark {
        runtime.scheduler().mark_dirty(id);
    }
    Ok(())
}

fn commit_staged(st: &mut ComponentState) {
    if let Some(staged) = st.staged.take() {
        st.prev_props = std::mem::replace(&mut st.props, staged);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_diff_chain(
    runtime: &Runtime,
    id: ComponentId,
    body: &Arc<tokio::sync::Mutex<Box<dyn Component>>>,
    behaviors: &[Arc<dyn Behavior>],
    prev: &Props,
    next: &Props,
    skip_behaviors: bool,
    phase: Phase,
) -> DiffOutcome {
    let mut guard = body.lock().await;
    let mut outcome = DiffOutcome::Commit;

    if !skip_behaviors {
        for behavior in behaviors {
            let mut cx = DiffCtx::new(runtime.clone(), id);
            match behavior.diff(&mut **guard, prev, next, &mut cx).await {
                Ok(DiffOutcome::Defer) => outcome = DiffOutcome::Defer,
                Ok(DiffOutcome::Commit) => {}
                Err(error) => {
                    runtime.report_error(ErrorReport::new(error, phase).with_component(id));
                    outcome = DiffOutcome::Defer;
                }
            }
            if cx.deferred() {
                outcome = DiffOutcome::Defer;
            }
        }
    }

    let mut cx = DiffCtx::new(runtime.clone(), id);
    match guard.diff(prev, next, &mut cx).await {
        Ok(DiffOutcome::Defer) => outcome = DiffOutcome::Defer,
        Ok(DiffOutcome::Commit) => {}
        Err(error) => {
            runtime.report_error(ErrorReport::new(error, phase).with_component(id));
            outcome = DiffOutcome::Defer;
        }
    }
    if cx.deferred() {
        outcome = DiffOutcome::Defer;
    }
    outcome
}

/// Dispatch one drained op: init hooks for the init op, otherwise the
/// prior-cleanup → behavior effects → own effect chain. Errors are reported
/// and never break the chain.
pub(crate) async fn dispatch_op(runtime: &Runtime, id: ComponentId, op: Op) {
    let Some((body, behaviors)) = ({
        let components = runtime.lock_components();
        components
            .get(id)
            .filter(|slot| !slot.st.destroyed)
            .map(|slot| (slot.body.clone(), slot.behaviors.clone()))
    }) else {
        return;
    };

    let mut guard = body.lock().await;

    if op.kind == INIT_OP {
        for behavior in behaviors.iter() {
            let mut cx = InitCtx::new(runtime.clone(), id);
            if let Err(error) = behavior.init(&mut **guard, &mut cx).await {
                runtime.report_error(
                    ErrorReport::new(error, Phase::Init)
                        .with_component(id)
                        .with_op(&op),
                );
            }
            let cleanups = cx.into_cleanups();
            if !cleanups.is_empty() {
                let mut components = runtime.lock_components();
                if let Some(slot) = components.get_mut(id) {
                    slot.st.lifetime_cleanups.extend(cleanups);
                }
            }
        }

        let mut cx = InitCtx::new(runtime.clone(), id);
        if let Err(error) = guard.init(&mut cx).await {
            runtime.report_error(
                ErrorReport::new(error, Phase::Init)
                    .with_component(id)
                    .with_op(&op),
            );
        }
        let cleanups = cx.into_cleanups();
        let mut components = runtime.lock_components();
        if let Some(slot) = components.get_mut(id) {
            slot.st.init_cleanups.extend(cleanups);
            slot.st.init_done = true;
        }
        return;
    }

    // The cleanup registered by the previous effect for this key must finish
    // before the replacing effect starts.
    let prior = {
        let mut components = runtime.lock_components();
        components
            .get_mut(id)
            .and_then(|slot| slot.st.cleanups.remove(&op.key))
    };
    if let Some(chain) = prior {
        run_cleanup_chain(runtime, Some(id), chain).await;
    }

    let mut collected: Vec<Cleanup> = Vec::new();
    for behavior in behaviors.iter() {
        if !behavior_matches(behavior.as_ref(), &op) {
            continue;
        }
        let mut cx = EffectCtx::new(runtime.clone(), id);
        if let Err(error) = behavior.effect(&mut **guard, &op, &mut cx).await {
            runtime.report_error(
                ErrorReport::new(error, Phase::Effect)
                    .with_component(id)
                    .with_op(&op),
            );
        }
        collected.extend(cx.into_cleanups());
    }

    let mut cx = EffectCtx::new(runtime.clone(), id);
    if let Err(error) = guard.effect(&op, &mut cx).await {
        runtime.report_error(
            ErrorReport::new(error, Phase::Effect)
                .with_component(id)
                .with_op(&op),
        );
    }
    collected.extend(cx.into_cleanups());
    drop(guard);

    if !collected.is_empty() {
        let orphaned = {
            let mut components = runtime.lock_components();
            match components.get_mut(id) {
                Some(slot) if !slot.st.destroyed => {
                    slot.st.cleanups.insert(op.key.clone(), collected);
                    None
                }
                _ => Some(collected),
            }
        };
        // Destroyed while the effect ran: its cleanups run right away.
        if let Some(chain) = orphaned {
            run_cleanup_chain(runtime, Some(id), chain).await;
        }
    }
}

/// Run a combined cleanup chain in LIFO order, awaiting each entry.
pub(crate) async fn run_cleanup_chain(
    runtime: &Runtime,
    id: Option<ComponentId>,
    chain: Vec<Cleanup>,
) {
    for cleanup in chain.into_iter().rev() {
        if let Err(error) = cleanup.invoke().await {
            let mut report = ErrorReport::new(error, Phase::Cleanup);
            if let Some(id) = id {
                report = report.with_component(id);
            }
            runtime.report_error(report);
        }
    }
}

pub(crate) struct DrainResult {
    pub(crate) fully: bool,
    pub(crate) ran: usize,
}

/// Drain this component's buffer through effect dispatch. The snapshot is
/// taken up front; ops queued by the effects land in the live buffer and
/// wait for the next visit.
pub(crate) async fn drain_component(
    runtime: &Runtime,
    id: ComponentId,
    frame: &FrameClock,
    allow_yield: bool,
) -> DrainResult {
    let snapshot = {
        let mut components = runtime.lock_components();
        match components.get_mut(id) {
            Some(slot) if !slot.st.destroyed => slot.st.cmds.take_snapshot(),
            _ => return DrainResult { fully: true, ran: 0 },
        }
    };

    let mut ran = 0;
    let mut rest = snapshot.into_iter();
    while let Some(op) = rest.next() {
        if allow_yield && frame.should_yield() {
            let remaining: Vec<Op> = std::iter::once(op).chain(rest).collect();
            let mut components = runtime.lock_components();
            if let Some(slot) = components.get_mut(id) {
                if !slot.st.destroyed {
                    slot.st.cmds.requeue(remaining);
                }
            }
            return DrainResult { fully: false, ran };
        }
        tracing::trace!(component = ?id, kind = %op.kind, key = %op.key, "dispatch op");
        dispatch_op(runtime, id, op).await;
        frame.note_op();
        ran += 1;
    }
    DrainResult { fully: true, ran }
}

/// Lazily create and attach this component's host node. Attaching the
/// parent first is forced here so out-of-order dirtying cannot observe a
/// detached ancestor.
pub(crate) fn attach_component<'a>(
    runtime: &'a Runtime,
    id: ComponentId,
) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async move {
        let (attached, parent) = {
            let components = runtime.lock_components();
            let slot = components
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("component is gone"))?;
            if slot.st.destroyed {
                anyhow::bail!("component is destroyed");
            }
            (slot.st.node.is_some(), slot.st.parent)
        };
        if attached {
            return Ok(());
        }
        let host = runtime
            .host()
            .ok_or_else(|| anyhow::anyhow!("host is not ready"))?;

        let attach_parent = match parent {
            None => host.root_node(),
            Some(parent_id) => {
                attach_component(runtime, parent_id).await?;
                let (parent_body, parent_node) = {
                    let components = runtime.lock_components();
                    let parent_slot = components
                        .get(parent_id)
                        .ok_or_else(|| anyhow::anyhow!("parent is gone"))?;
                    let node = parent_slot
                        .st
                        .node
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("parent has no node"))?;
                    (parent_slot.body.clone(), node)
                };
                let parent_guard = parent_body.lock().await;
                parent_guard.get_child_parent(id, &parent_node)
            }
        };

        let body = {
            let components = runtime.lock_components();
            components
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("component is gone"))?
                .body
                .clone()
        };
        let node = {
            let mut guard = body.lock().await;
            guard.create_node(host.as_ref(), id)?
        };
        if let Err(error) = host.attach_node(&attach_parent, &node) {
            host.destroy_node(&node);
            return Err(error);
        }

        let mut components = runtime.lock_components();
        if let Some(slot) = components.get_mut(id) {
            slot.st.node = Some(node);
            slot.st.attach_parent = Some(attach_parent);
        }
        Ok(())
    })
}

/// The first-flush commit: either swap in the props staged by a pre-ready
/// diff, or run the diff chain once and commit unless it deferred.
pub(crate) async fn initial_commit(runtime: &Runtime, id: ComponentId) {
    enum Path {
        Done,
        Swap,
        Diff {
            body: Arc<tokio::sync::Mutex<Box<dyn Component>>>,
            behaviors: Arc<Vec<Arc<dyn Behavior>>>,
            prev: Props,
            next: Props,
            ticket: u64,
        },
    }

    let path = {
        let mut components = runtime.lock_components();
        let Some(slot) = components.get_mut(id) else {
            return;
        };
        if slot.st.destroyed || slot.st.initialized {
            Path::Done
        } else if slot.st.pre_ready_diff_ran {
            Path::Swap
        } else if let Some(staged) = slot.st.staged.clone() {
            slot.st.diff_ticket += 1;
            Path::Diff {
                body: slot.body.clone(),
                behaviors: slot.behaviors.clone(),
                prev: slot.st.props.clone(),
                next: staged,
                ticket: slot.st.diff_ticket,
            }
        } else {
            // An explicit update already committed; nothing left to stage.
            slot.st.initialized = true;
            Path::Done
        }
    };

    match path {
        Path::Done => {}
        Path::Swap => {
            let mut components = runtime.lock_components();
            if let Some(slot) = components.get_mut(id) {
                commit_staged(&mut slot.st);
                slot.st.initialized = true;
            }
        }
        Path::Diff {
            body,
            behaviors,
            prev,
            next,
            ticket,
        } => {
            let outcome = run_diff_chain(
                runtime,
                id,
                &body,
                &behaviors,
                &prev,
                &next,
                false,
                Phase::InitialDiff,
            )
            .await;
            let mut components = runtime.lock_components();
            if let Some(slot) = components.get_mut(id) {
                if slot.st.destroyed {
                    return;
                }
                if slot.st.diff_ticket == ticket && outcome == DiffOutcome::Commit {
                    commit_staged(&mut slot.st);
                }
                slot.st.initialized = true;
            }
        }
    }
}

async fn unmount_child(
    runtime: &Runtime,
    parent: ComponentId,
    child: ComponentId,
) -> Result<(), RideError> {
    let is_child = {
        let components = runtime.lock_components();
        components
            .get(child)
            .is_some_and(|slot| slot.st.parent == Some(parent))
    };
    if !is_child {
        return Err(RideError::Destroyed);
    }
    destroy_component(runtime.clone(), child).await;
    Ok(())
}

/// Tear a component down: drop pending ops, destroy children depth-first,
/// run per-key cleanups, then lifetime cleanups LIFO, then the init
/// cleanups, then detach and release the host node.
pub(crate) fn destroy_component(runtime: Runtime, id: ComponentId) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let children = {
            let mut components = runtime.lock_components();
            let Some(slot) = components.get_mut(id) else {
                return;
            };
            if slot.st.destroyed {
                return;
            }
            slot.st.destroyed = true;
            slot.st.cmds.clear();
            slot.st.children.clone()
        };

        for child in children {
            destroy_component(runtime.clone(), child).await;
        }

        let keyed = {
            let mut components = runtime.lock_components();
            components
                .get_mut(id)
                .map(|slot| std::mem::take(&mut slot.st.cleanups))
                .unwrap_or_default()
        };
        for (_key, chain) in keyed {
            run_cleanup_chain(&runtime, Some(id), chain).await;
        }

        let (lifetime, legacy) = {
            let mut components = runtime.lock_components();
            components
                .get_mut(id)
                .map(|slot| {
                    (
                        std::mem::take(&mut slot.st.lifetime_cleanups),
                        std::mem::take(&mut slot.st.init_cleanups),
                    )
                })
                .unwrap_or_default()
        };
        run_cleanup_chain(&runtime, Some(id), lifetime).await;
        run_cleanup_chain(&runtime, Some(id), legacy).await;

        let (node, attach_parent) = {
            let mut components = runtime.lock_components();
            components
                .get_mut(id)
                .map(|slot| (slot.st.node.take(), slot.st.attach_parent.take()))
                .unwrap_or_default()
        };
        if let Some(node) = node {
            if let Some(host) = runtime.host() {
                if let Some(parent_node) = attach_parent {
                    host.detach_node(&parent_node, &node);
                }
                host.destroy_node(&node);
            }
        }

        let mut components = runtime.lock_components();
        if let Some(slot) = components.remove(id) {
            if let Some(parent_id) = slot.st.parent {
                if let Some(parent_slot) = components.get_mut(parent_id) {
                    parent_slot.st.children.retain(|child| *child != id);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progressive_budget_normalization() {
        let mut progressive = Progressive::default();
        assert_eq!(progressive.budget(), None);
        progressive.budget_ms = -4.0;
        assert_eq!(progressive.budget(), None);
        progressive.budget_ms = f64::NAN;
        assert_eq!(progressive.budget(), None);
        progressive.budget_ms = 8.0;
        assert_eq!(
            progressive.budget(),
            Some(std::time::Duration::from_millis(8))
        );
    }

    #[test]
    fn test_resolve_key_precedence() {
        let payload = json!({"id": 7});
        let by_kind = QueueOpts::default();
        assert_eq!(resolve_key("tick", &payload, &by_kind), "tick");

        let by_key = QueueOpts::default().key("explicit");
        assert_eq!(resolve_key("tick", &payload, &by_key), "explicit");

        let by_coalesce = QueueOpts::default()
            .key("explicit")
            .coalesce_by(|kind, payload| format!("{kind}:{}", payload["id"]));
        assert_eq!(resolve_key("tick", &payload, &by_coalesce), "tick:7");
    }

    #[test]
    fn test_cleanup_chain_runs_lifo() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain: Vec<Cleanup> = (0..3)
            .map(|i| {
                let order = order.clone();
                Cleanup::new(move || order.lock().unwrap().push(i))
            })
            .collect();
        futures::executor::block_on(async {
            for cleanup in chain.into_iter().rev() {
                cleanup.invoke().await.unwrap();
            }
        });
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
