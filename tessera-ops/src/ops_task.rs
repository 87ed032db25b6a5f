//! The op-list task: records ops for one render target, batches them into
//! chains and drives the prepare/execute flush.
//!
//! ## Usage
//!
//! Record ops with [`OpsTask::add_draw_op`] or [`OpsTask::add_op`], then
//! [`OpsTask::close`] the task and [`OpsTask::flush`] it through a
//! [`FlushState`].

use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::{
    caps::Caps,
    config::OpsTaskConfig,
    draw_state::{
        AppliedClip, DrawOpArgs, DstProxyView, LoadOp, ProcessorAnalysis, XferBarrierFlags,
    },
    error::{ChainInvariantError, FlushError},
    flush_state::{FlushState, OpArgs},
    op::{Op, OpId},
    op_chain::{CombineContext, OpArena, OpChain},
    rect::{IRect, Rect, can_reorder},
    render_pass::{Gpu, RenderPassDesc},
    resource::{ActualUse, AllowRecycling, ProxyId, ResourceAllocator},
};

/// Where a task is in its flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPhase {
    /// Recording, or waiting to be flushed.
    #[default]
    Idle,
    /// Chains are being prepared.
    Preparing,
    /// Chains are executing in a render pass.
    Executing,
}

/// What closing a task predicts for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutcome {
    /// The target will be written within these bounds.
    TargetDirty(IRect),
    /// Nothing visible will be written.
    TargetUnchanged,
}

/// Counters describing how recorded ops were batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecordStats {
    /// Ops submitted to the task.
    pub ops_recorded: usize,
    /// Ops absorbed into another op.
    pub ops_merged: usize,
    /// Ops appended to an existing chain without merging.
    pub ops_chained: usize,
    /// Ops dropped for non-finite bounds.
    pub ops_dropped_non_finite: usize,
    /// Ops dropped because the task was closed.
    pub ops_dropped_closed: usize,
    /// Chains started.
    pub chains_created: usize,
    /// Chains absorbed into a later chain while closing.
    pub chains_forward_combined: usize,
}

/// Summary of one flush of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlushReport {
    /// Chains whose head was prepared.
    pub chains_prepared: usize,
    /// Chains whose prepare failed.
    pub prepare_failures: usize,
    /// Chains executed.
    pub chains_executed: usize,
    /// Chains skipped during execute.
    pub chains_skipped: usize,
    /// Draws that reached the backend.
    pub draws_issued: u32,
    /// Draws abandoned after a failed bind.
    pub failed_draws: u32,
    /// Recorded draws retired without executing.
    pub skipped_draws: u32,
    /// Inline uploads performed during execute.
    pub uploads_performed: u32,
}

/// The surface a task renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    /// The target's proxy.
    pub proxy: ProxyId,
    /// Backing width in pixels.
    pub width: i32,
    /// Backing height in pixels.
    pub height: i32,
    /// The target renders inside a render pass owned by someone else, so its
    /// load op cannot change and its surface cannot be recycled.
    pub fixed_render_pass: bool,
}

impl RenderTarget {
    /// A target of the given backing size.
    pub fn new(proxy: ProxyId, width: i32, height: i32) -> Self {
        Self {
            proxy,
            width,
            height,
            fixed_render_pass: false,
        }
    }

    /// The full backing rectangle.
    pub fn backing_bounds(&self) -> IRect {
        IRect::from_size(self.width, self.height)
    }
}

/// Read-only view of one chain of a task.
#[derive(Clone, Copy)]
pub struct ChainView<'a> {
    chain: &'a OpChain,
    arena: &'a OpArena,
}

impl<'a> ChainView<'a> {
    /// Union of the members' bounds.
    pub fn bounds(&self) -> Rect {
        self.chain.bounds()
    }

    /// Number of ops in the chain.
    pub fn len(&self) -> usize {
        self.chain.list().iter(self.arena).count()
    }

    /// Returns true if the chain holds no ops.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The ops, head first.
    pub fn ops(&self) -> impl Iterator<Item = &'a dyn Op> + use<'a> {
        let arena = self.arena;
        self.chain
            .list()
            .iter(arena)
            .filter_map(move |key| arena.op(key))
    }

    /// Ids of the ops, head first.
    pub fn op_ids(&self) -> Vec<OpId> {
        self.chain
            .list()
            .iter(self.arena)
            .filter_map(|key| self.arena.id(key))
            .collect()
    }

    /// Bounds of each op as tracked by the scheduler, head first.
    pub fn op_bounds(&self) -> Vec<Rect> {
        self.chain
            .list()
            .iter(self.arena)
            .map(|key| self.arena.bounds(key))
            .collect()
    }

    /// Name of the head op.
    pub fn head_name(&self) -> &'static str {
        self.chain
            .list()
            .head()
            .map_or("<empty>", |key| self.arena.name(key))
    }

    /// Returns true if the chain will execute.
    pub fn should_execute(&self) -> bool {
        self.chain.should_execute()
    }

    /// Returns true if the chain was marked to skip execution.
    pub fn skip_execute(&self) -> bool {
        self.chain.skip_execute()
    }

    /// Shared clip.
    pub fn applied_clip(&self) -> Option<&'a AppliedClip> {
        self.chain.applied_clip()
    }

    /// Shared processor analysis.
    pub fn processor_analysis(&self) -> ProcessorAnalysis {
        self.chain.processor_analysis()
    }

    /// Shared destination copy.
    pub fn dst_proxy_view(&self) -> &'a DstProxyView {
        self.chain.dst_proxy_view()
    }
}

/// Records the ops targeting one render target and flushes them.
///
/// Chains are kept in painter's order. A new op joins the most recent chain
/// it is compatible with, searching backward until it would pass a chain it
/// overlaps. Closing the task additionally pulls chains forward into later
/// compatible chains.
pub struct OpsTask {
    config: OpsTaskConfig,
    caps: Caps,
    target: RenderTarget,
    arena: OpArena,
    chains: Vec<OpChain>,
    total_bounds: Rect,
    clipped_content_bounds: IRect,
    color_load_op: LoadOp,
    clear_color: [f32; 4],
    uses_msaa: bool,
    xfer_barriers: XferBarrierFlags,
    sampled_proxies: Vec<ProxyId>,
    deferred_proxies: Vec<ProxyId>,
    closed: bool,
    phase: FlushPhase,
    stats: RecordStats,
    report: FlushReport,
}

impl OpsTask {
    /// Creates an empty task for `target`.
    pub fn new(target: RenderTarget, caps: Caps, config: OpsTaskConfig) -> Self {
        Self {
            config,
            caps,
            target,
            arena: OpArena::new(),
            chains: Vec::new(),
            total_bounds: Rect::EMPTY,
            clipped_content_bounds: IRect::EMPTY,
            color_load_op: LoadOp::Load,
            clear_color: [0.0; 4],
            uses_msaa: false,
            xfer_barriers: XferBarrierFlags::NONE,
            sampled_proxies: Vec::new(),
            deferred_proxies: Vec::new(),
            closed: false,
            phase: FlushPhase::Idle,
            stats: RecordStats::default(),
            report: FlushReport::default(),
        }
    }

    /// The render target.
    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    /// Scheduling configuration.
    pub fn config(&self) -> &OpsTaskConfig {
        &self.config
    }

    /// Backend capabilities used for combining.
    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Batching counters.
    pub fn stats(&self) -> RecordStats {
        self.stats
    }

    /// Report of the last flush.
    pub fn last_report(&self) -> FlushReport {
        self.report
    }

    /// Current flush phase.
    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    /// Returns true once [`OpsTask::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if no chains were recorded.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Number of chains.
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Number of live ops across all chains.
    pub fn op_count(&self) -> usize {
        self.arena.len()
    }

    /// The chains in execution order.
    pub fn chains(&self) -> impl Iterator<Item = ChainView<'_>> {
        self.chains.iter().map(|chain| ChainView {
            chain,
            arena: &self.arena,
        })
    }

    /// The chain at `index`.
    pub fn chain(&self, index: usize) -> Option<ChainView<'_>> {
        self.chains.get(index).map(|chain| ChainView {
            chain,
            arena: &self.arena,
        })
    }

    /// Marks the chain at `index` to be skipped during execute.
    pub fn set_chain_skip_execute(&mut self, index: usize) {
        if let Some(chain) = self.chains.get_mut(index) {
            chain.set_skip_execute();
        }
    }

    /// Union of every recorded op's bounds, or the whole target after a clear.
    pub fn total_bounds(&self) -> Rect {
        self.total_bounds
    }

    /// Total bounds clipped to the target and rounded out, set on close.
    pub fn clipped_content_bounds(&self) -> IRect {
        self.clipped_content_bounds
    }

    /// The color load op.
    pub fn color_load_op(&self) -> LoadOp {
        self.color_load_op
    }

    /// Whether any op needs multisampling.
    pub fn uses_msaa(&self) -> bool {
        self.uses_msaa
    }

    /// Barriers the render pass must support.
    pub fn xfer_barriers(&self) -> XferBarrierFlags {
        self.xfer_barriers
    }

    /// Textures sampled by the task's ops.
    pub fn sampled_proxies(&self) -> &[ProxyId] {
        &self.sampled_proxies
    }

    /// Proxies filled by deferred uploads.
    pub fn deferred_proxies(&self) -> &[ProxyId] {
        &self.deferred_proxies
    }

    fn add_sampled_proxy(&mut self, proxy: ProxyId) {
        if !self.sampled_proxies.contains(&proxy) {
            self.sampled_proxies.push(proxy);
        }
    }

    /// Registers a proxy whose contents are uploaded during the flush.
    pub fn add_deferred_proxy(&mut self, proxy: ProxyId) {
        if !self.deferred_proxies.contains(&proxy) {
            self.deferred_proxies.push(proxy);
        }
    }

    /// Records an op with no processors, clip or destination read.
    pub fn add_op(&mut self, op: Box<dyn Op>) {
        self.record_op(op, false, ProcessorAnalysis::EMPTY, None, None);
    }

    /// Records a draw op with its compatibility metadata.
    ///
    /// Textures read by the op, its clip and its destination copy are noted
    /// for the render pass, along with the barriers the draw needs.
    pub fn add_draw_op(&mut self, op: Box<dyn Op>, args: DrawOpArgs) {
        if self.closed {
            self.drop_closed(op.as_ref());
            return;
        }
        let mut sampled: SmallVec<[ProxyId; 4]> = SmallVec::new();
        op.visit_proxies(&mut |proxy| sampled.push(proxy));
        if let Some(clip) = &args.clip {
            clip.visit_proxies(&mut |proxy| sampled.push(proxy));
        }
        for proxy in sampled {
            self.add_sampled_proxy(proxy);
        }

        let dst = args.dst_proxy_view;
        if let Some(proxy) = dst.proxy {
            debug_assert!(
                !dst.flags.as_input_attachment || dst.offset == [0, 0],
                "input attachment reads cannot be offset"
            );
            if !dst.flags.as_input_attachment {
                self.add_sampled_proxy(proxy);
            }
            if dst.flags.requires_texture_barrier {
                self.xfer_barriers.texture = true;
            }
        }
        if args.processor_analysis.uses_non_coherent_hw_blending {
            self.xfer_barriers.blend = true;
        }
        debug_assert_eq!(
            args.processor_analysis.requires_dst_texture,
            dst.proxy.is_some(),
            "dst texture requirement must match the dst proxy"
        );

        let clip = args.clip.filter(AppliedClip::does_clip);
        let dst_view = args
            .processor_analysis
            .requires_dst_texture
            .then_some(&dst);
        self.record_op(
            op,
            args.uses_msaa,
            args.processor_analysis,
            clip,
            dst_view,
        );
    }

    fn drop_closed(&mut self, op: &dyn Op) {
        warn!("Dropping {} recorded into a closed task", op.name());
        self.stats.ops_dropped_closed += 1;
    }

    fn record_op(
        &mut self,
        op: Box<dyn Op>,
        uses_msaa: bool,
        processor_analysis: ProcessorAnalysis,
        clip: Option<AppliedClip>,
        dst_proxy_view: Option<&DstProxyView>,
    ) {
        if self.closed {
            self.drop_closed(op.as_ref());
            return;
        }
        self.stats.ops_recorded += 1;
        let bounds = op.bounds();
        if !bounds.is_finite() {
            trace!("Dropping {} with non-finite bounds {:?}", op.name(), bounds);
            self.stats.ops_dropped_non_finite += 1;
            return;
        }
        self.uses_msaa |= uses_msaa;
        self.total_bounds = self.total_bounds.join(&bounds);

        let key = self.arena.insert(op);
        let max_candidates = self.config.max_chain_distance.min(self.chains.len());
        let mut ctx = CombineContext {
            arena: &mut self.arena,
            caps: &self.caps,
            max_merge_distance: self.config.max_merge_distance,
            stats: &mut self.stats,
        };
        let mut absorbed = false;
        for (distance, candidate) in self.chains.iter_mut().rev().take(max_candidates).enumerate() {
            match candidate.append_op(
                key,
                processor_analysis,
                dst_proxy_view,
                clip.as_ref(),
                &mut ctx,
            ) {
                None => {
                    trace!("Op joined chain {} back", distance);
                    absorbed = true;
                    break;
                }
                Some(returned) => {
                    if !can_reorder(&candidate.bounds(), &ctx.arena.bounds(returned)) {
                        trace!("Painter's order stop at chain {} back", distance);
                        break;
                    }
                }
            }
        }

        if !absorbed {
            let chain = OpChain::new(
                &self.arena,
                key,
                processor_analysis,
                clip,
                dst_proxy_view,
            );
            self.chains.push(chain);
            self.stats.chains_created += 1;
        }
        self.validate_if_enabled();
    }

    /// Sets how the target's color is loaded when the render pass begins.
    ///
    /// A clear makes the whole target part of the task's content.
    pub fn set_color_load_op(&mut self, load_op: LoadOp, color: [f32; 4]) {
        self.color_load_op = load_op;
        self.clear_color = color;
        if load_op == LoadOp::Clear {
            self.total_bounds = self.target.backing_bounds().to_rect();
        }
    }

    /// Discards the target's contents. Ignored once ops have been recorded.
    pub fn discard(&mut self) {
        if self.is_empty() {
            self.color_load_op = LoadOp::Discard;
            self.total_bounds = Rect::EMPTY;
        }
    }

    /// Prepares the task to be replaced by a fullscreen clear.
    ///
    /// Returns true if recorded work was dropped and the clear can be done
    /// with the load op; false if the caller must record a clear op instead.
    pub fn reset_for_fullscreen_clear(&mut self, can_discard_previous_ops: bool) -> bool {
        if can_discard_previous_ops || self.is_empty() {
            self.delete_ops();
            self.deferred_proxies.clear();
            self.sampled_proxies.clear();
            return !self.target.fixed_render_pass;
        }
        false
    }

    /// Returns true if flushing the task would leave the target untouched.
    pub fn is_color_no_op(&self) -> bool {
        self.chains.is_empty() && self.color_load_op == LoadOp::Load
    }

    /// Returns true if any op, clip or destination copy reads `proxy`.
    pub fn is_used(&self, proxy: ProxyId) -> bool {
        let mut used = false;
        for chain in &self.chains {
            chain.visit_proxies(&self.arena, &mut |visited| used |= visited == proxy);
            if used {
                return true;
            }
        }
        false
    }

    /// Forbids further recording, pulls chains forward into compatible later
    /// chains and computes the clipped content bounds.
    #[tracing::instrument(level = "debug", skip_all, fields(target = ?self.target.proxy))]
    pub fn close(&mut self) -> ExpectedOutcome {
        if !self.closed {
            self.closed = true;
            if !self.chains.is_empty() {
                self.forward_combine();
            }
        }
        let backing = self.target.backing_bounds().to_rect();
        let outcome = match backing.intersection(&self.total_bounds) {
            Some(clipped) => {
                self.clipped_content_bounds = clipped.round_out();
                ExpectedOutcome::TargetDirty(self.clipped_content_bounds)
            }
            None => {
                self.clipped_content_bounds = IRect::EMPTY;
                ExpectedOutcome::TargetUnchanged
            }
        };
        debug!(
            "Closed with {} chains over {} ops: {:?}",
            self.chains.len(),
            self.arena.len(),
            outcome
        );
        outcome
    }

    /// Tries to move each chain forward into a later compatible chain.
    ///
    /// A chain stops looking once it reaches a chain it overlaps, since
    /// moving past that chain would reorder overlapping draws.
    fn forward_combine(&mut self) {
        let len = self.chains.len();
        if len < 2 {
            return;
        }
        let distance = self.config.max_chain_distance;
        let mut ctx = CombineContext {
            arena: &mut self.arena,
            caps: &self.caps,
            max_merge_distance: self.config.max_merge_distance,
            stats: &mut self.stats,
        };
        for i in 0..len - 1 {
            let max_candidate = (i + distance).min(len - 1);
            let (earlier, later) = self.chains.split_at_mut(i + 1);
            let chain = &mut earlier[i];
            for candidate in later.iter_mut().take(max_candidate - i) {
                if candidate.prepend_chain(chain, &mut ctx) {
                    ctx.stats.chains_forward_combined += 1;
                    trace!("Chain {} moved forward", i);
                    break;
                }
                if !can_reorder(&chain.bounds(), &candidate.bounds()) {
                    break;
                }
            }
        }
        self.chains.retain(|chain| !chain.is_empty());
        debug!(
            "Forward combine left {} of {} chains",
            self.chains.len(),
            len
        );
        self.validate_if_enabled();
    }

    /// Reports the op-index intervals over which the target and every
    /// surface the chains read are live.
    pub fn gather_proxy_intervals(&self, alloc: &mut ResourceAllocator) {
        debug_assert!(self.closed, "intervals gathered from an open task");
        if self.is_color_no_op() {
            return;
        }
        for proxy in &self.deferred_proxies {
            alloc.add_interval(*proxy, 0, 0, ActualUse::No, AllowRecycling::Yes);
        }

        let cur = alloc.cur_op();
        if self.chains.is_empty() {
            // A load op with no draws still writes the target.
            alloc.add_interval(
                self.target.proxy,
                cur,
                cur,
                ActualUse::Yes,
                AllowRecycling::Yes,
            );
            alloc.inc_ops();
        } else {
            let last = u32::try_from(self.chains.len() - 1).unwrap_or(u32::MAX);
            alloc.add_interval(
                self.target.proxy,
                cur,
                cur.saturating_add(last),
                ActualUse::Yes,
                AllowRecycling::Yes,
            );
        }

        let allow_recycling = if self.target.fixed_render_pass {
            AllowRecycling::No
        } else {
            AllowRecycling::Yes
        };
        for chain in &self.chains {
            let cur = alloc.cur_op();
            chain.visit_proxies(&self.arena, &mut |proxy| {
                alloc.add_interval(proxy, cur, cur, ActualUse::Yes, allow_recycling);
            });
            alloc.inc_ops();
        }
    }

    /// Marks every chain that reads an uninstantiated surface to be skipped.
    ///
    /// Returns how many chains were newly marked.
    pub fn handle_internal_allocation_failure(&mut self, gpu: &dyn Gpu) -> usize {
        let mut marked = 0;
        for chain in &mut self.chains {
            let mut missing = None;
            chain.visit_proxies(&self.arena, &mut |proxy| {
                if missing.is_none() && !gpu.is_instantiated(proxy) {
                    missing = Some(proxy);
                }
            });
            if let Some(proxy) = missing
                && !chain.skip_execute()
            {
                warn!(
                    "Skipping chain with bounds {:?}: {:?} is not instantiated",
                    chain.bounds(),
                    proxy
                );
                chain.set_skip_execute();
                marked += 1;
            }
        }
        marked
    }

    /// Absorbs the leading run of `tasks` that target the same surface.
    ///
    /// Their chains are appended in order and their bounds, barriers and
    /// proxies joined into this task. Returns how many tasks were merged, or 0
    /// if a mergeable task clears its target.
    pub fn merge_from(&mut self, tasks: &mut [OpsTask]) -> usize {
        if self.phase != FlushPhase::Idle {
            return 0;
        }
        let mut count = 0;
        for task in tasks.iter() {
            if task.target.proxy != self.target.proxy || task.phase != FlushPhase::Idle {
                break;
            }
            if task.color_load_op == LoadOp::Clear {
                return 0;
            }
            count += 1;
        }
        if count == 0 {
            return 0;
        }

        for task in &mut tasks[..count] {
            self.clipped_content_bounds = self
                .clipped_content_bounds
                .join(&task.clipped_content_bounds);
            self.total_bounds = self.total_bounds.join(&task.total_bounds);
            self.xfer_barriers |= task.xfer_barriers;
            self.uses_msaa |= task.uses_msaa;
            for proxy in task.deferred_proxies.drain(..) {
                self.add_deferred_proxy(proxy);
            }
            for proxy in std::mem::take(&mut task.sampled_proxies) {
                self.add_sampled_proxy(proxy);
            }
            for mut chain in task.chains.drain(..) {
                chain.adopt_into(&mut self.arena, &mut task.arena);
                self.chains.push(chain);
            }
        }
        debug!("Merged {} tasks, now {} chains", count, self.chains.len());
        self.validate_if_enabled();
        count
    }

    fn base_op_args(&self) -> OpArgs {
        OpArgs {
            op: OpId(0),
            target: self.target.proxy,
            uses_msaa: self.uses_msaa,
            applied_clip: None,
            dst_proxy_view: DstProxyView::default(),
            xfer_barriers: self.xfer_barriers,
            color_load_op: self.color_load_op,
        }
    }

    fn has_nothing_to_flush(&self) -> bool {
        self.is_color_no_op()
            || (self.clipped_content_bounds.is_empty() && self.color_load_op != LoadOp::Discard)
    }

    /// Runs every chain head's prepare step.
    ///
    /// A failed prepare marks that chain to be skipped; other chains are
    /// unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError`] if the task is still open or already flushing.
    #[tracing::instrument(level = "debug", skip_all, fields(target = ?self.target.proxy))]
    pub fn prepare(&mut self, state: &mut FlushState<'_>) -> Result<(), FlushError> {
        if !self.closed {
            return Err(FlushError::NotClosed);
        }
        if self.phase != FlushPhase::Idle {
            return Err(FlushError::OutOfOrder {
                action: "prepare",
                phase: self.phase,
            });
        }
        self.phase = FlushPhase::Preparing;
        self.report = FlushReport::default();
        if self.has_nothing_to_flush() {
            debug!("Nothing to prepare");
            return Ok(());
        }

        let base = self.base_op_args();
        for chain in &mut self.chains {
            if !chain.should_execute() {
                continue;
            }
            let Some(op) = chain.list().head().and_then(|head| self.arena.id(head)) else {
                continue;
            };
            state.set_op_args(Some(OpArgs {
                op,
                applied_clip: chain.applied_clip().cloned(),
                dst_proxy_view: *chain.dst_proxy_view(),
                ..base.clone()
            }));
            let result = self
                .arena
                .with_chain_ops(chain.list(), |head, chained| head.prepare(state, chained));
            state.set_op_args(None);
            self.report.chains_prepared += 1;
            if let Some(Err(err)) = result {
                warn!("Skipping chain headed by {:?}: {err}", op);
                chain.set_skip_execute();
                self.report.prepare_failures += 1;
            }
        }
        debug!(
            "Prepared {} chains, {} failed",
            self.report.chains_prepared, self.report.prepare_failures
        );
        Ok(())
    }

    /// Executes every chain that is not skipped, in order, inside one render
    /// pass.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError`] if the task was not prepared or the backend
    /// could not begin a render pass.
    #[tracing::instrument(level = "debug", skip_all, fields(target = ?self.target.proxy))]
    pub fn execute(&mut self, state: &mut FlushState<'_>) -> Result<FlushReport, FlushError> {
        if self.phase != FlushPhase::Preparing {
            return Err(FlushError::OutOfOrder {
                action: "execute",
                phase: self.phase,
            });
        }
        self.phase = FlushPhase::Executing;
        if self.has_nothing_to_flush() {
            debug!("Nothing to execute");
            return Ok(self.report);
        }

        let desc = RenderPassDesc {
            target: self.target.proxy,
            bounds: self.clipped_content_bounds,
            color_load_op: self.color_load_op,
            clear_color: self.clear_color,
            uses_msaa: self.uses_msaa,
            xfer_barriers: self.xfer_barriers,
            sampled_proxies: self.sampled_proxies.clone(),
        };
        let before = state.stats();
        if !state.begin_render_pass(desc) {
            warn!("No render pass for {:?}", self.target.proxy);
            return Err(FlushError::RenderPassUnavailable(self.target.proxy));
        }

        let base = self.base_op_args();
        for chain in &self.chains {
            let Some(op) = chain.list().head().and_then(|head| self.arena.id(head)) else {
                continue;
            };
            if !chain.should_execute() {
                trace!("Skipping chain headed by {:?}", op);
                state.skip_draws_for(op);
                self.report.chains_skipped += 1;
                continue;
            }
            state.set_op_args(Some(OpArgs {
                op,
                applied_clip: chain.applied_clip().cloned(),
                dst_proxy_view: *chain.dst_proxy_view(),
                ..base.clone()
            }));
            let bounds = chain.bounds();
            self.arena.with_chain_ops(chain.list(), |head, chained| {
                head.execute(state, chained, bounds);
            });
            // Draws the head recorded but did not replay.
            state.skip_draws_for(op);
            state.set_op_args(None);
            self.report.chains_executed += 1;
        }
        state.end_render_pass();

        let after = state.stats();
        self.report.draws_issued = after.draws_issued.saturating_sub(before.draws_issued);
        self.report.failed_draws = after.failed_draws.saturating_sub(before.failed_draws);
        self.report.skipped_draws = after.skipped_draws.saturating_sub(before.skipped_draws);
        self.report.uploads_performed = after
            .uploads_performed
            .saturating_sub(before.uploads_performed);
        debug!("{:?}", self.report);
        Ok(self.report)
    }

    /// Destroys every chain and op and returns the task to recording.
    pub fn end_flush(&mut self) {
        self.delete_ops();
        self.deferred_proxies.clear();
        self.sampled_proxies.clear();
        self.total_bounds = Rect::EMPTY;
        self.clipped_content_bounds = IRect::EMPTY;
        self.color_load_op = LoadOp::Load;
        self.xfer_barriers = XferBarrierFlags::NONE;
        self.uses_msaa = false;
        self.closed = false;
        self.phase = FlushPhase::Idle;
    }

    /// Runs a whole flush of this task: prepare, allocation-failure handling,
    /// pre-execute uploads, execute and teardown.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError`] for misuse or an unavailable render pass. Op and
    /// chain failures never fail the flush.
    pub fn flush(&mut self, state: &mut FlushState<'_>) -> Result<FlushReport, FlushError> {
        self.prepare(state)?;
        self.handle_internal_allocation_failure(state.gpu());
        state.pre_execute_draws();
        let result = self.execute(state);
        self.end_flush();
        state.reset();
        result
    }

    fn delete_ops(&mut self) {
        for chain in &mut self.chains {
            chain.delete_ops(&mut self.arena);
        }
        self.chains.clear();
    }

    /// Checks every chain's linkage, bounds and metadata.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ChainInvariantError> {
        for (index, chain) in self.chains.iter().enumerate() {
            if chain.is_empty() {
                return Err(ChainInvariantError::EmptyChain(index));
            }
            chain.validate(&self.arena, index)?;
        }
        Ok(())
    }

    fn validate_if_enabled(&self) {
        if !self.config.validate_chains {
            return;
        }
        let result = self.validate();
        if let Err(err) = &result {
            error!("Chain validation failed: {err}");
        }
        debug_assert!(result.is_ok(), "chain validation failed: {result:?}");
    }
}

impl fmt::Display for OpsTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "OpsTask for {:?} ({} chains, {} ops)",
            self.target.proxy,
            self.chains.len(),
            self.arena.len()
        )?;
        match self.color_load_op {
            LoadOp::Clear => writeln!(f, "ColorLoadOp: Clear {:?}", self.clear_color)?,
            load_op => writeln!(f, "ColorLoadOp: {load_op:?}")?,
        }
        for (index, chain) in self.chains().enumerate() {
            let b = chain.bounds();
            writeln!(f, "*******************************")?;
            writeln!(
                f,
                "{index}: {} chain bounds [L: {:.2}, T: {:.2}, R: {:.2}, B: {:.2}]{}",
                chain.head_name(),
                b.left,
                b.top,
                b.right,
                b.bottom,
                if chain.skip_execute() { " (skipped)" } else { "" }
            )?;
            for ((id, op), b) in chain
                .op_ids()
                .into_iter()
                .zip(chain.ops())
                .zip(chain.op_bounds())
            {
                writeln!(
                    f,
                    "\t{:?} {} [L: {:.2}, T: {:.2}, R: {:.2}, B: {:.2}] {}",
                    id,
                    op.name(),
                    b.left,
                    b.top,
                    b.right,
                    b.bottom,
                    op.dump_info()
                )?;
            }
        }
        Ok(())
    }
}
