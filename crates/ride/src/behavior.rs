//! Composable lifecycle behaviors.
//!
//! A [`Behavior`] contributes init/diff/effect hooks to every component of a
//! class without subclassing: the component declares its behavior list and
//! the runtime runs the hooks around the component's own, in declaration
//! order. Effect hooks can be narrowed to specific op kinds or an arbitrary
//! predicate. Hooks receive the owning component as `&mut dyn Component` and
//! downcast to the concrete type when they need its state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::component::{Component, DiffCtx, DiffOutcome, EffectCtx, InitCtx, Props};
use crate::op::Op;

/// A trait-object lifecycle extension. Every hook is optional.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// Restrict `effect` to these op kinds. `None` matches every kind.
    fn op_kinds(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Further narrow which ops reach `effect`.
    fn matches(&self, _op: &Op) -> bool {
        true
    }

    /// Runs once when the component's init op drains, before the component's
    /// own init. Cleanups registered here live until destroy.
    async fn init(&self, _target: &mut dyn Component, _cx: &mut InitCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Contributes to the prop diff. Returning [`DiffOutcome::Defer`] (or
    /// calling `cx.defer()`) keeps the staged props uncommitted.
    async fn diff(
        &self,
        _target: &mut dyn Component,
        _prev: &Props,
        _next: &Props,
        _cx: &mut DiffCtx,
    ) -> anyhow::Result<DiffOutcome> {
        Ok(DiffOutcome::Commit)
    }

    /// Runs for each matching op before the component's own effect. Cleanups
    /// registered here join the op key's combined cleanup.
    async fn effect(
        &self,
        _target: &mut dyn Component,
        _op: &Op,
        _cx: &mut EffectCtx,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Concatenate an inherited behavior list with a component's own, preserving
/// base-before-derived order:
///
/// ```ignore
/// fn behaviors() -> Vec<Arc<dyn Behavior>> {
///     behavior::compose(Base::behaviors(), [Arc::new(Draggable) as _])
/// }
/// ```
pub fn compose(
    base: Vec<Arc<dyn Behavior>>,
    derived: impl IntoIterator<Item = Arc<dyn Behavior>>,
) -> Vec<Arc<dyn Behavior>> {
    let mut merged = base;
    merged.extend(derived);
    merged
}

pub(crate) fn behavior_matches(behavior: &dyn Behavior, op: &Op) -> bool {
    if let Some(kinds) = behavior.op_kinds() {
        if !kinds.contains(&op.kind.as_str()) {
            return false;
        }
    }
    behavior.matches(op)
}
