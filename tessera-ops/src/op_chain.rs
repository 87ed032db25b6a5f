//! Chains of ops that execute back-to-back, and the arena that owns the ops.
//!
//! An [`OpChain`] is a doubly linked run of ops stored in an [`OpArena`].
//! Links are generation-checked [`OpKey`]s, so splicing a run from one chain
//! into another is O(1) and a stale handle can never alias a new op.

use std::iter;

use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use tracing::trace;

use crate::{
    caps::Caps,
    draw_state::{AppliedClip, DstProxyView, ProcessorAnalysis},
    error::ChainInvariantError,
    op::{ChainOps, ClassId, CombineResult, Op, OpId},
    ops_task::RecordStats,
    rect::{Rect, can_reorder},
    resource::ProxyId,
};

new_key_type! {
    /// Handle to an op stored in an [`OpArena`].
    pub struct OpKey;
}

#[derive(Debug)]
struct OpNode {
    id: OpId,
    class_id: ClassId,
    name: &'static str,
    bounds: Rect,
    prev: Option<OpKey>,
    next: Option<OpKey>,
}

/// Owns every op recorded into a task, plus the links between them.
///
/// Op payloads live in a secondary map so that one op can be borrowed
/// mutably while another is temporarily taken out to be combined with it.
#[derive(Default)]
pub struct OpArena {
    nodes: SlotMap<OpKey, OpNode>,
    ops: SecondaryMap<OpKey, Box<dyn Op>>,
}

impl OpArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live ops.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no ops are live.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stores `op` unlinked, recording its bounds as they are now.
    pub fn insert(&mut self, op: Box<dyn Op>) -> OpKey {
        let node = OpNode {
            id: OpId::next(),
            class_id: op.class_id(),
            name: op.name(),
            bounds: op.bounds(),
            prev: None,
            next: None,
        };
        let key = self.nodes.insert(node);
        self.ops.insert(key, op);
        key
    }

    /// Destroys an op. It must already be unlinked.
    pub fn free(&mut self, key: OpKey) {
        debug_assert!(
            self.nodes
                .get(key)
                .is_none_or(|node| node.prev.is_none() && node.next.is_none()),
            "freeing a linked op"
        );
        self.nodes.remove(key);
        self.ops.remove(key);
    }

    /// Bounds of the op, grown by every merge it absorbed.
    pub fn bounds(&self, key: OpKey) -> Rect {
        self.nodes.get(key).map_or(Rect::EMPTY, |node| node.bounds)
    }

    /// Unique id of the op.
    pub fn id(&self, key: OpKey) -> Option<OpId> {
        self.nodes.get(key).map(|node| node.id)
    }

    /// Class of the op.
    pub fn class_id(&self, key: OpKey) -> Option<ClassId> {
        self.nodes.get(key).map(|node| node.class_id)
    }

    /// Name of the op.
    pub fn name(&self, key: OpKey) -> &'static str {
        self.nodes.get(key).map_or("<freed>", |node| node.name)
    }

    /// Borrows the op.
    pub fn op(&self, key: OpKey) -> Option<&dyn Op> {
        self.ops.get(key).map(|op| op.as_ref())
    }

    fn prev(&self, key: OpKey) -> Option<OpKey> {
        self.nodes.get(key).and_then(|node| node.prev)
    }

    fn next(&self, key: OpKey) -> Option<OpKey> {
        self.nodes.get(key).and_then(|node| node.next)
    }

    fn set_prev(&mut self, key: OpKey, prev: Option<OpKey>) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, key: OpKey, next: Option<OpKey>) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.next = next;
        }
    }

    /// Asks op `a` to absorb op `b`.
    ///
    /// Ops of different classes are never asked. On a merge, `a`'s bounds
    /// become the union of both; `b` is left in place for the caller to free.
    fn combine(&mut self, a: OpKey, b: OpKey, caps: &Caps) -> CombineResult {
        if a == b || self.class_id(a) != self.class_id(b) {
            return CombineResult::CannotCombine;
        }
        let Some(mut other) = self.ops.remove(b) else {
            return CombineResult::CannotCombine;
        };
        let result = match self.ops.get_mut(a) {
            Some(op) => op.combine_if_possible(other.as_mut(), caps),
            None => CombineResult::CannotCombine,
        };
        self.ops.insert(b, other);
        if result == CombineResult::Merged {
            let b_bounds = self.bounds(b);
            if let Some(node) = self.nodes.get_mut(a) {
                node.bounds = node.bounds.join_possibly_empty(&b_bounds);
            }
        }
        trace!(
            "{} {:?} + {:?}: {:?}",
            self.name(a),
            self.id(a),
            self.id(b),
            result
        );
        result
    }

    /// Moves every op of `list` out of `other` into this arena, preserving
    /// order and ids.
    pub(crate) fn adopt(&mut self, other: &mut OpArena, mut list: OpList) -> OpList {
        let mut adopted = OpList::default();
        while let Some(key) = list.pop_head(other) {
            let (Some(mut node), Some(op)) = (other.nodes.remove(key), other.ops.remove(key))
            else {
                continue;
            };
            node.prev = None;
            node.next = None;
            let new_key = self.nodes.insert(node);
            self.ops.insert(new_key, op);
            adopted.push_tail(self, new_key);
        }
        adopted
    }

    /// Checks out the ops of `list` and hands the head plus its followers to
    /// `f`. Returns `None` for an empty list.
    pub(crate) fn with_chain_ops<R>(
        &mut self,
        list: &OpList,
        f: impl FnOnce(&mut dyn Op, ChainOps<'_>) -> R,
    ) -> Option<R> {
        let linked: SmallVec<[OpKey; 4]> = list.iter(self).collect();
        let (keys, mut ops): (SmallVec<[OpKey; 4]>, SmallVec<[Box<dyn Op>; 4]>) = linked
            .into_iter()
            .filter_map(|key| self.ops.remove(key).map(|op| (key, op)))
            .unzip();
        let result = ops
            .split_first_mut()
            .map(|(head, rest)| f(head.as_mut(), ChainOps::new(rest)));
        for (key, op) in keys.into_iter().zip(ops) {
            self.ops.insert(key, op);
        }
        result
    }
}

/// A doubly linked list of ops in an [`OpArena`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OpList {
    head: Option<OpKey>,
    tail: Option<OpKey>,
}

impl OpList {
    /// A list holding only `key`.
    pub fn single(key: OpKey) -> Self {
        Self {
            head: Some(key),
            tail: Some(key),
        }
    }

    /// First op.
    pub fn head(&self) -> Option<OpKey> {
        self.head
    }

    /// Last op.
    pub fn tail(&self) -> Option<OpKey> {
        self.tail
    }

    /// Returns true if the list holds no ops.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterates the ops head to tail.
    pub fn iter<'a>(&self, arena: &'a OpArena) -> impl Iterator<Item = OpKey> + use<'a> {
        iter::successors(self.head, |key| arena.next(*key))
    }

    fn pop_head(&mut self, arena: &mut OpArena) -> Option<OpKey> {
        let head = self.head?;
        let next = arena.next(head);
        match next {
            Some(next) => arena.set_prev(next, None),
            None => self.tail = None,
        }
        arena.set_next(head, None);
        self.head = next;
        Some(head)
    }

    fn remove_op(&mut self, arena: &mut OpArena, key: OpKey) -> OpKey {
        let Some(prev) = arena.prev(key) else {
            debug_assert_eq!(self.head, Some(key));
            self.pop_head(arena);
            return key;
        };
        let next = arena.next(key);
        arena.set_next(prev, next);
        match next {
            Some(next) => arena.set_prev(next, Some(prev)),
            None => {
                debug_assert_eq!(self.tail, Some(key));
                self.tail = Some(prev);
            }
        }
        arena.set_prev(key, None);
        arena.set_next(key, None);
        key
    }

    fn push_head(&mut self, arena: &mut OpArena, key: OpKey) {
        debug_assert!(arena.prev(key).is_none() && arena.next(key).is_none());
        match self.head {
            Some(head) => {
                arena.set_next(key, Some(head));
                arena.set_prev(head, Some(key));
                self.head = Some(key);
            }
            None => {
                self.head = Some(key);
                self.tail = Some(key);
            }
        }
    }

    fn push_tail(&mut self, arena: &mut OpArena, key: OpKey) {
        debug_assert!(arena.prev(key).is_none() && arena.next(key).is_none());
        match self.tail {
            Some(tail) => {
                arena.set_next(tail, Some(key));
                arena.set_prev(key, Some(tail));
                self.tail = Some(key);
            }
            None => {
                self.head = Some(key);
                self.tail = Some(key);
            }
        }
    }

    fn free_all(&mut self, arena: &mut OpArena) {
        while let Some(key) = self.pop_head(arena) {
            arena.free(key);
        }
    }

    /// Checks that links are mutually consistent and the walk from the head
    /// ends exactly at the tail.
    pub fn validate(&self, arena: &OpArena) -> Result<(), ChainInvariantError> {
        let Some(head) = self.head else {
            return match self.tail {
                None => Ok(()),
                Some(tail) => Err(ChainInvariantError::TailMismatch {
                    expected: arena.id(tail),
                    found: None,
                }),
            };
        };
        let head_id = arena.id(head).unwrap_or(OpId(0));
        if arena.prev(head).is_some() {
            return Err(ChainInvariantError::Cycle { head: head_id });
        }
        let mut current = head;
        let mut steps = 0;
        while let Some(next) = arena.next(current) {
            if arena.prev(next) != Some(current) {
                return Err(ChainInvariantError::BrokenLink {
                    op: arena.id(next).unwrap_or(OpId(0)),
                });
            }
            steps += 1;
            if steps > arena.len() {
                return Err(ChainInvariantError::Cycle { head: head_id });
            }
            current = next;
        }
        if Some(current) != self.tail {
            return Err(ChainInvariantError::TailMismatch {
                expected: self.tail.and_then(|tail| arena.id(tail)),
                found: arena.id(current),
            });
        }
        Ok(())
    }
}

/// Borrowed state shared by every combine during one recording step.
pub(crate) struct CombineContext<'a> {
    pub(crate) arena: &'a mut OpArena,
    pub(crate) caps: &'a Caps,
    pub(crate) max_merge_distance: usize,
    pub(crate) stats: &'a mut RecordStats,
}

/// Ops that have been merged or proven safe to execute back-to-back, with
/// the metadata every op of the chain shares.
#[derive(Debug)]
pub struct OpChain {
    list: OpList,
    bounds: Rect,
    processor_analysis: ProcessorAnalysis,
    applied_clip: Option<AppliedClip>,
    dst_proxy_view: DstProxyView,
    skip_execute: bool,
}

impl OpChain {
    /// Starts a chain holding the single op `key`.
    pub(crate) fn new(
        arena: &OpArena,
        key: OpKey,
        processor_analysis: ProcessorAnalysis,
        applied_clip: Option<AppliedClip>,
        dst_proxy_view: Option<&DstProxyView>,
    ) -> Self {
        let dst_proxy_view = match dst_proxy_view {
            Some(view) if processor_analysis.requires_dst_texture => *view,
            _ => DstProxyView::default(),
        };
        Self {
            list: OpList::single(key),
            bounds: arena.bounds(key),
            processor_analysis,
            applied_clip,
            dst_proxy_view,
            skip_execute: false,
        }
    }

    /// The chain's ops.
    pub fn list(&self) -> &OpList {
        &self.list
    }

    /// Union of every member's bounds.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Shared processor analysis.
    pub fn processor_analysis(&self) -> ProcessorAnalysis {
        self.processor_analysis
    }

    /// Shared clip, if the chain's draws are clipped.
    pub fn applied_clip(&self) -> Option<&AppliedClip> {
        self.applied_clip.as_ref()
    }

    /// Shared destination copy.
    pub fn dst_proxy_view(&self) -> &DstProxyView {
        &self.dst_proxy_view
    }

    /// Returns true if the chain has ops and has not been marked to skip.
    pub fn should_execute(&self) -> bool {
        !self.list.is_empty() && !self.skip_execute
    }

    /// Returns true if the chain was marked to skip execution.
    pub fn skip_execute(&self) -> bool {
        self.skip_execute
    }

    /// Suppresses the chain's execution.
    pub fn set_skip_execute(&mut self) {
        self.skip_execute = true;
    }

    /// Returns true if the chain holds no ops.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Visits every surface the chain's ops, destination copy and clip read.
    pub fn visit_proxies(&self, arena: &OpArena, visitor: &mut dyn FnMut(ProxyId)) {
        for key in self.list.iter(arena) {
            if let Some(op) = arena.op(key) {
                op.visit_proxies(visitor);
            }
        }
        if let Some(proxy) = self.dst_proxy_view.proxy {
            visitor(proxy);
        }
        if let Some(clip) = &self.applied_clip {
            clip.visit_proxies(visitor);
        }
    }

    /// Frees every op in the chain.
    pub(crate) fn delete_ops(&mut self, arena: &mut OpArena) {
        self.list.free_all(arena);
    }

    pub(crate) fn adopt_into(&mut self, arena: &mut OpArena, from: &mut OpArena) {
        let list = std::mem::take(&mut self.list);
        self.list = arena.adopt(from, list);
    }

    /// Whether an incoming list with the given metadata may join this chain
    /// at all.
    fn is_compatible(
        &self,
        arena: &OpArena,
        incoming_head: OpKey,
        processor_analysis: ProcessorAnalysis,
        dst_proxy_view: &DstProxyView,
        applied_clip: Option<&AppliedClip>,
        bounds: &Rect,
    ) -> bool {
        let Some(head) = self.list.head else {
            return false;
        };
        if arena.class_id(head) != arena.class_id(incoming_head) {
            return false;
        }
        if self.applied_clip.as_ref() != applied_clip {
            return false;
        }
        let ours = self.processor_analysis;
        if ours.requires_non_overlapping_draws != processor_analysis.requires_non_overlapping_draws
            || (ours.requires_non_overlapping_draws && self.bounds.touches_or_overlaps(bounds))
        {
            return false;
        }
        if ours.requires_dst_texture != processor_analysis.requires_dst_texture
            || (ours.requires_dst_texture && self.dst_proxy_view != *dst_proxy_view)
        {
            return false;
        }
        true
    }

    /// Grafts `list` onto the end of this chain, merging ops where possible.
    ///
    /// On failure this chain and `list` are unchanged. On success `list` is
    /// empty and this chain's bounds include `bounds`.
    pub(crate) fn try_concat(
        &mut self,
        list: &mut OpList,
        processor_analysis: ProcessorAnalysis,
        dst_proxy_view: &DstProxyView,
        applied_clip: Option<&AppliedClip>,
        bounds: Rect,
        ctx: &mut CombineContext<'_>,
    ) -> bool {
        let Some(incoming_head) = list.head else {
            return false;
        };
        if !self.is_compatible(
            ctx.arena,
            incoming_head,
            processor_analysis,
            dst_proxy_view,
            applied_clip,
            &bounds,
        ) {
            return false;
        }

        let mut first = true;
        while let (Some(tail), Some(head)) = (self.list.tail, list.head) {
            match ctx.arena.combine(tail, head, ctx.caps) {
                CombineResult::CannotCombine => {
                    // Chaining is transitive, so only the first attempt can fail.
                    debug_assert!(first, "op chaining is not transitive");
                    if !first {
                        self.bounds = self.bounds.join_possibly_empty(&bounds);
                    }
                    return false;
                }
                CombineResult::MayChain => {
                    let chain_a = std::mem::take(&mut self.list);
                    let chain_b = std::mem::take(list);
                    self.list = do_concat(chain_a, chain_b, ctx);
                }
                CombineResult::Merged => {
                    ctx.stats.ops_merged += 1;
                    if let Some(merged) = list.pop_head(ctx.arena) {
                        ctx.arena.free(merged);
                    }
                }
            }
            first = false;
        }
        self.bounds = self.bounds.join_possibly_empty(&bounds);
        true
    }

    /// Tries to add the unlinked op `key` to this chain.
    ///
    /// Returns the op back if it could not be added.
    pub(crate) fn append_op(
        &mut self,
        key: OpKey,
        processor_analysis: ProcessorAnalysis,
        dst_proxy_view: Option<&DstProxyView>,
        applied_clip: Option<&AppliedClip>,
        ctx: &mut CombineContext<'_>,
    ) -> Option<OpKey> {
        let no_dst = DstProxyView::default();
        let dst_proxy_view = match dst_proxy_view {
            Some(view) if processor_analysis.requires_dst_texture => view,
            _ => &no_dst,
        };
        let bounds = ctx.arena.bounds(key);
        let mut list = OpList::single(key);
        if self.try_concat(
            &mut list,
            processor_analysis,
            dst_proxy_view,
            applied_clip,
            bounds,
            ctx,
        ) {
            return None;
        }
        list.head
    }

    /// Moves all of `that` (which precedes this chain) in front of this
    /// chain's ops.
    ///
    /// On success this chain holds both runs and `that` is empty.
    pub(crate) fn prepend_chain(
        &mut self,
        that: &mut OpChain,
        ctx: &mut CombineContext<'_>,
    ) -> bool {
        if self.list.is_empty() || that.list.is_empty() {
            return false;
        }
        if !that.try_concat(
            &mut self.list,
            self.processor_analysis,
            &self.dst_proxy_view,
            self.applied_clip.as_ref(),
            self.bounds,
            ctx,
        ) {
            return false;
        }
        self.list = std::mem::take(&mut that.list);
        self.bounds = that.bounds;
        that.dst_proxy_view = DstProxyView::default();
        if let Some(clip) = that.applied_clip.as_mut() {
            clip.detach_coverage_fragment_processor();
        }
        true
    }

    /// Checks list linkage, bounds containment and shared metadata.
    pub fn validate(&self, arena: &OpArena, index: usize) -> Result<(), ChainInvariantError> {
        self.list.validate(arena)?;
        let Some(head) = self.list.head else {
            return Err(ChainInvariantError::EmptyChain(index));
        };
        let head_class = arena.class_id(head);
        for key in self.list.iter(arena) {
            let op = arena.id(key).unwrap_or(OpId(0));
            if !self.bounds.contains_allow_empty(&arena.bounds(key)) {
                return Err(ChainInvariantError::BoundsNotConservative { op });
            }
            if arena.class_id(key) != head_class {
                return Err(ChainInvariantError::MixedClasses { op });
            }
        }
        if self.processor_analysis.requires_dst_texture != self.dst_proxy_view.proxy.is_some() {
            return Err(ChainInvariantError::DstProxyMismatch(index));
        }
        Ok(())
    }
}

/// Concatenates `chain_b` onto `chain_a`, merging ops across the seam where
/// painter's order allows.
///
/// Each head of `b` is either merged backward into an op of `a`, merged with
/// an op of `a` that then moves forward to become `b`'s head, or moved to the
/// tail of `a`. Scanning starts at `a`'s original tail so ops already moved
/// over from `b` are not retried.
fn do_concat(mut chain_a: OpList, mut chain_b: OpList, ctx: &mut CombineContext<'_>) -> OpList {
    let mut orig_a_tail = chain_a.tail;
    let mut skip_bounds = Rect::LARGEST_INVERTED;
    while let Some(b_head) = chain_b.head {
        let mut merge_checks = 0;
        let mut merged = false;
        let no_skip = orig_a_tail == chain_a.tail;
        let b_bounds = ctx.arena.bounds(b_head);
        let mut can_backward_merge = no_skip || can_reorder(&b_bounds, &skip_bounds);
        let mut forward_merge_bounds = skip_bounds;
        let mut cursor = orig_a_tail;
        while let Some(a) = cursor {
            let a_bounds = ctx.arena.bounds(a);
            let can_forward_merge =
                Some(a) == chain_a.tail || can_reorder(&a_bounds, &forward_merge_bounds);
            if can_forward_merge || can_backward_merge {
                merged = ctx.arena.combine(a, b_head, ctx.caps) == CombineResult::Merged;
            }
            if merged {
                ctx.stats.ops_merged += 1;
                if can_backward_merge {
                    if let Some(freed) = chain_b.pop_head(ctx.arena) {
                        ctx.arena.free(freed);
                    }
                } else {
                    // `a` absorbed b's head but may not move past the ops it
                    // was merged across, so it takes b's head's place instead.
                    if Some(a) == orig_a_tail {
                        orig_a_tail = ctx.arena.prev(a);
                    }
                    let detached = chain_a.remove_op(ctx.arena, a);
                    if let Some(freed) = chain_b.pop_head(ctx.arena) {
                        ctx.arena.free(freed);
                    }
                    chain_b.push_head(ctx.arena, detached);
                    if chain_a.is_empty() {
                        return chain_b;
                    }
                }
                break;
            }
            merge_checks += 1;
            if merge_checks >= ctx.max_merge_distance {
                break;
            }
            forward_merge_bounds = forward_merge_bounds.join_non_empty_arg(&a_bounds);
            can_backward_merge = can_backward_merge && can_reorder(&b_bounds, &a_bounds);
            cursor = ctx.arena.prev(a);
        }
        if !merged && let Some(moved) = chain_b.pop_head(ctx.arena) {
            chain_a.push_tail(ctx.arena, moved);
            ctx.stats.ops_chained += 1;
            skip_bounds = skip_bounds.join_non_empty_arg(&ctx.arena.bounds(moved));
        }
    }
    chain_a
}
