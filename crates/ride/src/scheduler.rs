//! The frame-budgeted cooperative dispatcher.
//!
//! Dirty components are snapshotted per flush, ordered by
//! `(depth, priority, created_at)`, and processed within an optional
//! wall-clock budget. Two locality modes control how a frame is split:
//! depth mode finishes whole depth groups and only yields at depth
//! transitions (wave rendering), subtree mode drains a component and every
//! descendant it dirties before touching a sibling (per-item completion),
//! yielding per op. Subtree roots nest: a subtree component encountered
//! inside an ancestor's pass opens its own inner pass, so its descendants
//! finish before its siblings in the enclosing queue. Interrupted passes
//! persist their remainders innermost-first and resume in that order at the
//! head of the next flush, so item order survives any budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::component::{
    attach_component, drain_component, initial_commit, ComponentId, Locality,
};
use crate::error::{ErrorReport, Phase, RideError};
use crate::runtime::{Brief, Runtime, RuntimeInner};

/// Wall-clock view of the current flush. Monotonic: once the budget is
/// blown the frame stays yielded. Never trips before at least one op ran,
/// so every frame makes progress under arbitrarily small budgets.
pub(crate) struct FrameClock {
    start: Instant,
    budget: Option<Duration>,
    yielded: AtomicBool,
    ops: AtomicU64,
}

impl FrameClock {
    fn new(budget: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            budget: budget.filter(|b| !b.is_zero()),
            yielded: AtomicBool::new(false),
            ops: AtomicU64::new(0),
        }
    }

    pub(crate) fn note_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn should_yield(&self) -> bool {
        if self.yielded.load(Ordering::Relaxed) {
            return true;
        }
        let Some(budget) = self.budget else {
            return false;
        };
        if self.ops.load(Ordering::Relaxed) == 0 {
            return false;
        }
        if self.start.elapsed() >= budget {
            self.yielded.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// A subtree pass currently on the stack; dirties of its descendants are
/// captured into `local` unless an inner pass claims them first.
struct ActivePass {
    root: ComponentId,
    local: Vec<ComponentId>,
}

/// A budget-interrupted subtree pass, resumed on the next flush.
struct SubtreePass {
    root: ComponentId,
    queue: Vec<ComponentId>,
}

#[derive(Default)]
struct SchedState {
    dirty: Vec<ComponentId>,
    scheduled: bool,
    flushing: bool,
    /// Active subtree passes, innermost last.
    passes: Vec<ActivePass>,
    /// Interrupted passes awaiting resume, innermost first.
    resume: Vec<SubtreePass>,
    frame_count: u64,
}

/// Counters from the most recent flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushStats {
    pub frame: u64,
    pub components: usize,
    pub ops: u64,
    pub yielded: bool,
}

/// Frame-budgeted dispatcher over the runtime's dirty components.
pub struct Scheduler {
    budget: Option<Duration>,
    state: Mutex<SchedState>,
    gate: tokio::sync::Mutex<()>,
    frames: Notify,
    runtime: std::sync::OnceLock<Weak<RuntimeInner>>,
    last_stats: Mutex<FlushStats>,
}

fn push_unique(queue: &mut Vec<ComponentId>, id: ComponentId) {
    if !queue.contains(&id) {
        queue.push(id);
    }
}

impl Scheduler {
    pub(crate) fn new(budget: Option<Duration>) -> Self {
        Self {
            budget,
            state: Mutex::new(SchedState::default()),
            gate: tokio::sync::Mutex::new(()),
            frames: Notify::new(),
            runtime: std::sync::OnceLock::new(),
            last_stats: Mutex::new(FlushStats::default()),
        }
    }

    pub(crate) fn bind(&self, runtime: Weak<RuntimeInner>) {
        let _ = self.runtime.set(runtime);
    }

    fn runtime(&self) -> Option<Runtime> {
        Runtime::from_weak(self.runtime.get()?)
    }

    /// Put a component on the dispatch queue. Outside a flush this arms the
    /// next frame; during a flush, descendants of an active subtree root are
    /// captured into the innermost enclosing pass instead.
    pub fn mark_dirty(&self, id: ComponentId) {
        let roots: Vec<ComponentId> = {
            let st = self.state.lock();
            if st.flushing {
                st.passes.iter().map(|pass| pass.root).collect()
            } else {
                Vec::new()
            }
        };
        let target = if roots.is_empty() {
            None
        } else {
            self.runtime().and_then(|rt| {
                roots
                    .iter()
                    .rposition(|&root| rt.is_descendant(id, root))
                    .map(|level| (level, roots[level]))
            })
        };

        let mut st = self.state.lock();
        if st.flushing {
            if let Some((level, root)) = target {
                if let Some(pass) = st.passes.get_mut(level) {
                    if pass.root == root {
                        push_unique(&mut pass.local, id);
                        return;
                    }
                }
            }
            push_unique(&mut st.dirty, id);
            return;
        }
        push_unique(&mut st.dirty, id);
        if !st.scheduled {
            st.scheduled = true;
            self.frames.notify_one();
        }
    }

    /// True while a frame is armed but not yet flushed.
    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    pub fn frame_count(&self) -> u64 {
        self.state.lock().frame_count
    }

    pub fn last_stats(&self) -> FlushStats {
        *self.last_stats.lock()
    }

    /// Resolves when a frame is armed. Embedders drive the loop with
    /// `next_frame().await` + `flush().await` from their display callback.
    pub async fn next_frame(&self) {
        self.frames.notified().await;
    }

    /// Run one frame over the currently dirty components. Two concurrent
    /// calls serialize; the second runs after the first completes.
    pub async fn flush(&self) -> Result<(), RideError> {
        let Some(runtime) = self.runtime() else {
            return Err(RideError::RuntimeShutDown);
        };
        let _gate = self.gate.lock().await;

        let (mut batch, resumes) = {
            let mut st = self.state.lock();
            st.scheduled = false;
            st.flushing = true;
            (std::mem::take(&mut st.dirty), std::mem::take(&mut st.resume))
        };

        // Readiness gate: nothing runs until the host exists.
        if !runtime.is_ready() {
            let mut st = self.state.lock();
            for id in batch {
                push_unique(&mut st.dirty, id);
            }
            st.resume = resumes;
            st.flushing = false;
            st.scheduled = true;
            self.frames.notify_one();
            return Ok(());
        }

        self.sort_batch(&runtime, &mut batch);
        let frame = FrameClock::new(self.budget);
        let mut stats = FlushStats::default();
        tracing::debug!(batch = batch.len(), resumed = resumes.len(), "flush start");

        let mut aborted = false;
        let mut resumes: VecDeque<SubtreePass> = resumes.into();
        while let Some(pass) = resumes.pop_front() {
            if !self
                .subtree_pass(&runtime, pass.root, pass.queue, &frame, &mut stats)
                .await
            {
                // Interrupted again; its remainders are already persisted,
                // the passes not yet reached queue up behind them.
                let mut st = self.state.lock();
                st.resume.extend(resumes.drain(..));
                aborted = true;
                break;
            }
        }

        if aborted {
            let mut st = self.state.lock();
            for id in batch {
                push_unique(&mut st.dirty, id);
            }
        } else {
            let mut prev_depth: Option<u32> = None;
            let mut idx = 0;
            while idx < batch.len() {
                let id = batch[idx];
                let Some(brief) = runtime.brief(id) else {
                    idx += 1;
                    continue;
                };
                // Components at one depth complete as a group; the budget is
                // only consulted when moving to a new depth.
                if prev_depth.is_some_and(|depth| depth != brief.depth) && frame.should_yield() {
                    stats.yielded = true;
                    let mut st = self.state.lock();
                    for rest in &batch[idx..] {
                        push_unique(&mut st.dirty, *rest);
                    }
                    break;
                }
                let completed = self.process(&runtime, id, brief, &frame, &mut stats).await;
                if !completed {
                    stats.yielded = true;
                    let mut st = self.state.lock();
                    for rest in &batch[idx + 1..] {
                        push_unique(&mut st.dirty, *rest);
                    }
                    break;
                }
                prev_depth = Some(brief.depth);
                idx += 1;
            }
        }

        // Render barrier: each touched host presents once per flush.
        if stats.components > 0 {
            if let Some(host) = runtime.host() {
                host.request_render();
            }
        }

        {
            let mut st = self.state.lock();
            st.flushing = false;
            st.frame_count += 1;
            stats.frame = st.frame_count;
            if !st.dirty.is_empty() || !st.resume.is_empty() {
                st.scheduled = true;
                self.frames.notify_one();
            }
        }
        tracing::debug!(
            frame = stats.frame,
            components = stats.components,
            ops = stats.ops,
            yielded = stats.yielded,
            "flush complete"
        );
        *self.last_stats.lock() = stats;
        Ok(())
    }

    /// Flush until the system quiesces: no armed frame, no dirty set, no
    /// suspended subtree pass. Bails after `max` iterations to surface stuck
    /// feedback loops instead of hanging.
    pub async fn when_idle(&self, max: usize) -> Result<(), RideError> {
        for _ in 0..max {
            let pending = {
                let st = self.state.lock();
                st.scheduled || st.flushing || !st.dirty.is_empty() || !st.resume.is_empty()
            };
            if !pending {
                return Ok(());
            }
            self.flush().await?;
        }
        Err(RideError::IdleExhausted { max })
    }

    fn sort_batch(&self, runtime: &Runtime, batch: &mut Vec<ComponentId>) {
        let components = runtime.lock_components();
        batch.retain(|id| components.contains_key(*id));
        batch.sort_by_key(|id| {
            let st = &components[*id].st;
            (st.depth, st.priority, st.created_at)
        });
    }

    async fn process(
        &self,
        runtime: &Runtime,
        id: ComponentId,
        brief: Brief,
        frame: &FrameClock,
        stats: &mut FlushStats,
    ) -> bool {
        if brief.locality == Locality::Subtree {
            return self.subtree_pass(runtime, id, vec![id], frame, stats).await;
        }
        self.step(runtime, id, frame, false, stats).await;
        true
    }

    /// Attach, drain, and initial-commit one component. Returns false when
    /// the drain yielded (only possible with `allow_yield`).
    async fn step(
        &self,
        runtime: &Runtime,
        id: ComponentId,
        frame: &FrameClock,
        allow_yield: bool,
        stats: &mut FlushStats,
    ) -> bool {
        if let Err(error) = attach_component(runtime, id).await {
            // Skipped for this frame; a later dirty-mark retries.
            runtime.report_error(ErrorReport::new(error, Phase::Attach).with_component(id));
            return true;
        }
        stats.components += 1;
        let drained = drain_component(runtime, id, frame, allow_yield).await;
        stats.ops += drained.ran as u64;
        initial_commit(runtime, id).await;
        drained.fully
    }

    /// Process `root` and every descendant dirtied while doing so, within
    /// the frame budget. A descendant that itself declares subtree locality
    /// opens a nested pass of its own. On interruption each pass on the
    /// stack persists its remaining queue (innermost first) and the whole
    /// frame ends.
    fn subtree_pass<'a>(
        &'a self,
        runtime: &'a Runtime,
        root: ComponentId,
        initial: Vec<ComponentId>,
        frame: &'a FrameClock,
        stats: &'a mut FlushStats,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let level = {
                let mut st = self.state.lock();
                st.passes.push(ActivePass {
                    root,
                    local: Vec::new(),
                });
                st.passes.len() - 1
            };

            let mut queue = initial;
            loop {
                self.sort_batch(runtime, &mut queue);
                let mut idx = 0;
                while idx < queue.len() {
                    if frame.should_yield() {
                        stats.yielded = true;
                        self.suspend_pass(root, &queue[idx..]);
                        return false;
                    }
                    let id = queue[idx];
                    idx += 1;
                    let Some(brief) = runtime.brief(id) else {
                        continue;
                    };
                    if brief.locality == Locality::Subtree && id != root {
                        // Nested subtree root: its own pass claims its
                        // descendants until it completes.
                        if !self.subtree_pass(runtime, id, vec![id], frame, stats).await {
                            self.suspend_pass(root, &queue[idx..]);
                            return false;
                        }
                        continue;
                    }
                    let fully = self.step(runtime, id, frame, true, stats).await;
                    if !fully {
                        // Remaining ops were requeued on its buffer; revisit
                        // within this pass.
                        let mut st = self.state.lock();
                        if let Some(pass) = st.passes.get_mut(level) {
                            push_unique(&mut pass.local, id);
                        }
                    }
                }

                let next = {
                    let mut st = self.state.lock();
                    st.passes
                        .get_mut(level)
                        .map(|pass| std::mem::take(&mut pass.local))
                        .unwrap_or_default()
                };
                if next.is_empty() {
                    break;
                }
                queue = next;
            }

            self.state.lock().passes.pop();
            true
        })
    }

    /// Pop this pass off the stack and persist its unprocessed queue plus
    /// captured locals for the next flush. Unwinding pushes innermost
    /// remainders first, which is the order resume must replay them in.
    fn suspend_pass(&self, root: ComponentId, unprocessed: &[ComponentId]) {
        let mut st = self.state.lock();
        let local = st.passes.pop().map(|pass| pass.local).unwrap_or_default();
        let mut rest: Vec<ComponentId> = unprocessed.to_vec();
        for id in local {
            push_unique(&mut rest, id);
        }
        if !rest.is_empty() {
            st.resume.push(SubtreePass { root, queue: rest });
        }
    }
}
