//! Ops and the per-component command buffer.
//!
//! An [`Op`] is a typed, keyed, prioritized unit of work a component enqueues
//! instead of rendering directly. The [`CommandBuffer`] keeps at most one op
//! per coalescing key: a repeated push replaces (or squashes) the payload
//! while keeping the original insertion sequence, so a burst of updates for
//! the same key collapses to a single dispatch without losing its place in
//! line. Draining snapshots the buffer, sorts by `(priority, sequence)`, and
//! hands ops to an effect callback until done or told to yield.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::RideError;

/// Reserved op kind enqueued at construction; drains before any other op of
/// the same component and triggers the init hooks.
pub const INIT_OP: &str = "@ride/init";

/// Named priority levels. Lower values execute earlier.
pub mod priority {
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const MEDIUM: i32 = 50;
    pub const LOW: i32 = 80;
    pub const LOWEST: i32 = 100;
}

/// Folds the payload of an in-flight op with a newly pushed one for the same
/// key. Arguments: previous payload, incoming payload, previous op, incoming
/// op. Returns the payload the surviving op keeps.
pub type SquashFn = Arc<dyn Fn(&Value, &Value, &Op, &Op) -> Value + Send + Sync>;

/// A unit of work queued by a component.
#[derive(Clone)]
pub struct Op {
    /// Semantic tag, e.g. `"SET_PROPS"`. Opaque to the runtime.
    pub kind: String,
    /// Coalescing identity. Defaults to `kind` when not given at queue time.
    pub key: String,
    /// User data carried to the effect. Opaque to the runtime.
    pub payload: Value,
    /// Effective sort key; lower executes earlier.
    pub priority: i32,
    /// Monotonic insertion counter; stable tie-breaker. A coalesced op keeps
    /// the sequence of the first push for its key.
    pub sequence: u64,
    /// Buffer generation at push time. Informational.
    pub generation: u64,
    pub(crate) squash: Option<SquashFn>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("generation", &self.generation)
            .field("squash", &self.squash.is_some())
            .finish()
    }
}

/// Arguments to [`CommandBuffer::push`].
pub struct PushOp {
    pub kind: String,
    pub key: String,
    pub payload: Value,
    pub priority: i32,
    pub squash: Option<SquashFn>,
}

impl PushOp {
    /// Op with `key == kind`, priority 0, no squash.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let kind = kind.into();
        Self {
            key: kind.clone(),
            kind,
            payload,
            priority: 0,
            squash: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn squash_with(mut self, squash: SquashFn) -> Self {
        self.squash = Some(squash);
        self
    }
}

/// Ordered, key-coalesced op queue. One buffer per component, destroyed with
/// it.
#[derive(Default)]
pub struct CommandBuffer {
    ops: Vec<Op>,
    index: HashMap<String, usize>,
    sequence: u64,
    generation: u64,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Enqueue an op, coalescing against any live op with the same key.
    ///
    /// A fresh key appends with a new sequence. A repeated key keeps the
    /// existing op's sequence and replaces its payload — through the incoming
    /// op's squash function when one is given — and adopts the incoming
    /// priority.
    pub fn push(&mut self, push: PushOp) -> Result<(), RideError> {
        if push.kind.is_empty() {
            return Err(RideError::EmptyOpKind);
        }
        if push.key.is_empty() {
            return Err(RideError::EmptyOpKey);
        }
        let op = Op {
            kind: push.kind,
            key: push.key,
            payload: push.payload,
            priority: push.priority,
            sequence: 0,
            generation: self.generation,
            squash: push.squash,
        };
        self.coalesce_or_insert(op, true);
        Ok(())
    }

    fn coalesce_or_insert(&mut self, mut op: Op, assign_sequence: bool) {
        if let Some(&pos) = self.index.get(&op.key) {
            let merged = match &op.squash {
                Some(squash) => squash(&self.ops[pos].payload, &op.payload, &self.ops[pos], &op),
                None => op.payload.clone(),
            };
            let existing = &mut self.ops[pos];
            existing.payload = merged;
            existing.priority = op.priority;
            existing.generation = op.generation;
            existing.squash = op.squash;
        } else {
            if assign_sequence {
                op.sequence = self.sequence;
                self.sequence += 1;
            }
            let pos = self.ops.len();
            self.index.insert(op.key.clone(), pos);
            self.ops.push(op);
        }
    }

    /// Remove and return every live op, sorted by `(priority, sequence)`.
    /// Ops pushed after this call accumulate in the (now empty) live buffer.
    pub(crate) fn take_snapshot(&mut self) -> Vec<Op> {
        let mut snapshot = std::mem::take(&mut self.ops);
        self.index.clear();
        snapshot.sort_by_key(|op| (op.priority, op.sequence));
        snapshot
    }

    /// Put the undrained remainder of a snapshot back, re-pushing each op so
    /// key coalescing against anything queued meanwhile still holds. Ops with
    /// fresh keys keep their original sequence.
    pub(crate) fn requeue(&mut self, rest: Vec<Op>) {
        for op in rest {
            self.coalesce_or_insert(op, false);
        }
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.index.clear();
    }

    /// Drain the buffer through `effect`, one op at a time in
    /// `(priority, sequence)` order over a snapshot taken up front.
    ///
    /// When `should_yield` reports true between ops, the remaining snapshot
    /// is requeued and `false` is returned; the caller retries next frame.
    /// Returns `true` when the snapshot was exhausted.
    pub async fn drain<F, Fut>(&mut self, mut effect: F, mut should_yield: impl FnMut() -> bool) -> bool
    where
        F: FnMut(Op) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut rest = self.take_snapshot().into_iter();
        while let Some(op) = rest.next() {
            if should_yield() {
                self.requeue(std::iter::once(op).chain(rest).collect());
                return false;
            }
            effect(op).await;
        }
        true
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("ops", &self.ops)
            .field("sequence", &self.sequence)
            .field("generation", &self.generation)
            .finish()
    }
}
