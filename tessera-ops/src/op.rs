//! The schedulable unit of rendering work.
//!
//! ## Usage
//!
//! Implement [`Op`] for each kind of draw. Ops of the same concrete type share
//! a [`ClassId`]; only ops with equal class ids are ever asked to combine.

use std::{
    any::TypeId,
    sync::atomic::{AtomicU32, Ordering},
};

use downcast_rs::{Downcast, impl_downcast};

use crate::{
    caps::Caps, error::PrepareError, flush_state::FlushState, rect::Rect, resource::ProxyId,
};

/// Stable identity of an op's concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(TypeId);

impl ClassId {
    /// Returns the class id of op type `T`.
    #[must_use]
    pub fn of<T: Op>() -> Self {
        Self(TypeId::of::<T>())
    }
}

/// Unique identity of a recorded op, used for diagnostics and for keying the
/// draws an op records during prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl OpId {
    pub(crate) fn next() -> Self {
        static NEXT_OP_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome of asking one op to absorb another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineResult {
    /// The ops must stay separate and cannot share a chain.
    CannotCombine,
    /// The receiver absorbed the other op; the other op will be destroyed and
    /// the receiver's bounds become the union of both.
    Merged,
    /// The ops stay separate but may execute back-to-back in one chain.
    ///
    /// Chaining must be transitive: if any two ops of two chains can merge or
    /// chain, the chains as a whole may be chained.
    MayChain,
}

/// A unit of rendering work with bounds, a combine predicate and the two
/// flush-time entry points.
///
/// Only the head of a chain is prepared and executed; it receives the rest of
/// its chain as [`ChainOps`] and is responsible for their work too, which lets
/// chained ops share one pipeline bind.
///
/// # Example
///
/// ```
/// use tessera_ops::{Caps, ChainOps, CombineResult, FlushState, Op, Rect};
///
/// struct ClearRect {
///     rect: Rect,
/// }
///
/// impl Op for ClearRect {
///     fn name(&self) -> &'static str {
///         "ClearRect"
///     }
///
///     fn bounds(&self) -> Rect {
///         self.rect
///     }
///
///     fn combine_if_possible(&mut self, other: &mut dyn Op, _caps: &Caps) -> CombineResult {
///         match other.downcast_ref::<ClearRect>() {
///             Some(other) if other.rect == self.rect => CombineResult::Merged,
///             _ => CombineResult::CannotCombine,
///         }
///     }
///
///     fn execute(&mut self, _state: &mut FlushState<'_>, _chained: ChainOps<'_>, _bounds: Rect) {}
/// }
/// ```
pub trait Op: Downcast + Send {
    /// Human-readable op name for logs and dumps.
    fn name(&self) -> &'static str;

    /// Device-space bounds of everything the op may touch.
    ///
    /// Read once when the op is recorded; bounds grown by merges are tracked
    /// by the scheduler.
    fn bounds(&self) -> Rect;

    /// The op's class. Ops of different classes never combine.
    fn class_id(&self) -> ClassId {
        ClassId(self.as_any().type_id())
    }

    /// Tries to absorb `other`, which always has the same [`ClassId`].
    ///
    /// On [`CombineResult::Merged`] `other` is destroyed afterwards, so any
    /// state it owns that the merged draw needs must be moved out of it.
    fn combine_if_possible(&mut self, other: &mut dyn Op, caps: &Caps) -> CombineResult {
        let _ = (other, caps);
        CombineResult::CannotCombine
    }

    /// Visits every surface the op samples.
    fn visit_proxies(&self, visitor: &mut dyn FnMut(ProxyId)) {
        let _ = visitor;
    }

    /// CPU-side preparation: allocate and fill buffers, record draws and
    /// register uploads for this op and the rest of its chain.
    ///
    /// An error skips the chain's execution without affecting other chains.
    ///
    /// # Errors
    ///
    /// Returns [`PrepareError`] if resources for the chain could not be made
    /// ready.
    fn prepare(
        &mut self,
        state: &mut FlushState<'_>,
        chained: ChainOps<'_>,
    ) -> Result<(), PrepareError> {
        let _ = (state, chained);
        Ok(())
    }

    /// GPU-side submission of the chain's draws into the active render pass.
    fn execute(&mut self, state: &mut FlushState<'_>, chained: ChainOps<'_>, chain_bounds: Rect);

    /// Extra detail for dumps.
    fn dump_info(&self) -> String {
        String::new()
    }
}

impl_downcast!(Op);

/// The members of a chain that follow its head, in execution order.
pub struct ChainOps<'a> {
    ops: &'a mut [Box<dyn Op>],
}

impl<'a> ChainOps<'a> {
    pub(crate) fn new(ops: &'a mut [Box<dyn Op>]) -> Self {
        Self { ops }
    }

    /// Number of chained ops after the head.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the head executes alone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterates the chained ops.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Op> {
        self.ops.iter().map(|op| op.as_ref())
    }

    /// Iterates the chained ops mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut dyn Op> {
        self.ops.iter_mut().map(|op| op.as_mut())
    }

    /// Iterates the chained ops as the head's concrete type.
    ///
    /// Chains only hold ops of one class, so every op downcasts.
    pub fn downcast_iter<T: Op>(&self) -> impl Iterator<Item = &T> {
        self.ops.iter().filter_map(|op| op.downcast_ref::<T>())
    }

    /// Mutable variant of [`ChainOps::downcast_iter`].
    pub fn downcast_iter_mut<T: Op>(&mut self) -> impl Iterator<Item = &mut T> {
        self.ops.iter_mut().filter_map(|op| op.downcast_mut::<T>())
    }
}
