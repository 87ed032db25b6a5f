use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use tracing_subscriber::EnvFilter;

use crate::{
    ActualUse, AllocError, AppliedClip, BufferBindings, BufferId, BufferKind, BufferPoolConfig,
    Caps, ChainOps, ClipCoverage, CombineResult, DeferredUploadToken, DrawCall, DrawOpArgs,
    DstProxyView, DstSampleFlags, ExpectedOutcome, FlushError, FlushPhase, FlushReport,
    FlushState, Gpu, IRect, LoadOp, Mesh, Op, OpArgs, OpId, OpsTask, OpsTaskConfig, PendingMask,
    PipelineDesc, PrepareError, ProcessorAnalysis, ProxyId, Rect, RenderPassDesc, RenderTarget,
    ResourceAllocator, TextureList, WritePixels, XferBarrierFlags,
};

const TARGET: ProxyId = ProxyId(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum GpuCall {
    CreateBuffer(BufferKind, usize),
    WriteBuffer(BufferId, usize, usize),
    WritePixels(ProxyId),
    BeginRenderPass(ProxyId, LoadOp, IRect),
    EndRenderPass,
    BindPipeline(&'static str, Option<IRect>),
    BindTextures(Vec<ProxyId>),
    BindBuffers(BufferBindings),
    Draw(DrawCall),
}

/// A backend that records every call and fails on request.
#[derive(Default)]
struct MockGpu {
    calls: Vec<GpuCall>,
    max_buffer_size: Option<usize>,
    missing: Vec<ProxyId>,
    uninstantiable: Vec<ProxyId>,
    rejected_pipelines: Vec<&'static str>,
    refuse_render_pass: bool,
    next_buffer: u32,
}

impl MockGpu {
    fn draws(&self) -> Vec<DrawCall> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                GpuCall::Draw(draw) => Some(*draw),
                _ => None,
            })
            .collect()
    }

    fn position(&self, wanted: &GpuCall) -> Option<usize> {
        self.calls.iter().position(|call| call == wanted)
    }

    fn draw_positions(&self) -> Vec<usize> {
        self.calls
            .iter()
            .enumerate()
            .filter_map(|(index, call)| matches!(call, GpuCall::Draw(_)).then_some(index))
            .collect()
    }
}

impl Gpu for MockGpu {
    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> Option<BufferId> {
        if self.max_buffer_size.is_some_and(|max| size > max) {
            return None;
        }
        self.calls.push(GpuCall::CreateBuffer(kind, size));
        self.next_buffer += 1;
        Some(BufferId(self.next_buffer))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) {
        self.calls
            .push(GpuCall::WriteBuffer(buffer, offset, data.len()));
    }

    fn write_pixels(&mut self, proxy: ProxyId, _region: IRect, _pixels: &[u8]) -> bool {
        self.calls.push(GpuCall::WritePixels(proxy));
        !self.missing.contains(&proxy)
    }

    fn is_instantiated(&self, proxy: ProxyId) -> bool {
        !self.missing.contains(&proxy)
    }

    fn instantiate_proxy(&mut self, proxy: ProxyId) -> bool {
        if self.uninstantiable.contains(&proxy) {
            return false;
        }
        self.missing.retain(|missing| *missing != proxy);
        true
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> bool {
        if self.refuse_render_pass {
            return false;
        }
        self.calls.push(GpuCall::BeginRenderPass(
            desc.target,
            desc.color_load_op,
            desc.bounds,
        ));
        true
    }

    fn end_render_pass(&mut self) {
        self.calls.push(GpuCall::EndRenderPass);
    }

    fn bind_pipeline(
        &mut self,
        pipeline: &PipelineDesc,
        scissor: Option<IRect>,
        _draw_bounds: Rect,
    ) -> bool {
        if self.rejected_pipelines.contains(&pipeline.label) {
            return false;
        }
        self.calls
            .push(GpuCall::BindPipeline(pipeline.label, scissor));
        true
    }

    fn bind_textures(&mut self, textures: &[ProxyId]) {
        self.calls.push(GpuCall::BindTextures(textures.to_vec()));
    }

    fn bind_buffers(&mut self, bindings: &BufferBindings) {
        self.calls.push(GpuCall::BindBuffers(*bindings));
    }

    fn draw(&mut self, call: DrawCall) {
        self.calls.push(GpuCall::Draw(call));
    }
}

type Journal = Arc<Mutex<Vec<u32>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    /// Merges with ops it touches, never chains.
    MergeTouching,
    /// Merges with ops of the same key, chains with the rest.
    MergeSameKey(u32),
    Chain,
    Never,
}

/// A draw that writes one vertex run per chain and logs its tags on execute.
struct TestOp {
    rect: Rect,
    combine: Combine,
    tags: Vec<u32>,
    texture: Option<ProxyId>,
    vertex_count: usize,
    journal: Journal,
}

impl TestOp {
    fn new(tag: u32, rect: Rect, combine: Combine, journal: &Journal) -> Box<Self> {
        Box::new(Self {
            rect,
            combine,
            tags: vec![tag],
            texture: None,
            vertex_count: 4,
            journal: Arc::clone(journal),
        })
    }

    fn with_texture(mut self: Box<Self>, proxy: ProxyId) -> Box<Self> {
        self.texture = Some(proxy);
        self
    }

    fn with_vertex_count(mut self: Box<Self>, vertex_count: usize) -> Box<Self> {
        self.vertex_count = vertex_count;
        self
    }

    fn merge(&mut self, other: &mut TestOp) -> CombineResult {
        self.tags.append(&mut other.tags);
        self.rect = self.rect.join(&other.rect);
        self.vertex_count += other.vertex_count;
        if self.texture.is_none() {
            self.texture = other.texture.take();
        }
        CombineResult::Merged
    }
}

impl Op for TestOp {
    fn name(&self) -> &'static str {
        "TestOp"
    }

    fn bounds(&self) -> Rect {
        self.rect
    }

    fn combine_if_possible(&mut self, other: &mut dyn Op, _caps: &Caps) -> CombineResult {
        let Some(other) = other.downcast_mut::<TestOp>() else {
            return CombineResult::CannotCombine;
        };
        match (self.combine, other.combine) {
            (Combine::MergeTouching, Combine::MergeTouching)
                if self.rect.touches_or_overlaps(&other.rect) =>
            {
                self.merge(other)
            }
            (Combine::MergeSameKey(a), Combine::MergeSameKey(b)) if a == b => self.merge(other),
            (Combine::MergeSameKey(_), Combine::MergeSameKey(_))
            | (Combine::Chain, Combine::Chain) => CombineResult::MayChain,
            _ => CombineResult::CannotCombine,
        }
    }

    fn visit_proxies(&self, visitor: &mut dyn FnMut(ProxyId)) {
        if let Some(texture) = self.texture {
            visitor(texture);
        }
    }

    fn prepare(
        &mut self,
        state: &mut FlushState<'_>,
        chained: ChainOps<'_>,
    ) -> Result<(), PrepareError> {
        let vertex_count = self.vertex_count
            + chained
                .downcast_iter::<TestOp>()
                .map(|op| op.vertex_count)
                .sum::<usize>();
        let vertices = vec![[0.5_f32; 2]; vertex_count];
        let (buffer, base_vertex) = {
            let mut space = state.make_vertex_space(size_of::<[f32; 2]>(), vertex_count)?;
            space.write(&vertices);
            (space.buffer, space.base_vertex)
        };

        let mut textures = TextureList::new();
        let chained_textures = chained.downcast_iter::<TestOp>().map(|op| op.texture);
        for texture in std::iter::once(self.texture).chain(chained_textures).flatten() {
            state.add_inline_upload(Box::new(move |writer: &mut WritePixels<'_>| {
                writer.write(texture, IRect::from_size(1, 1), &[0xff]);
            }));
            textures.push(texture);
        }
        state.record_draw(
            PipelineDesc::new("TestOp", 1),
            vec![Mesh::NonIndexed {
                vertex_buffer: Some(buffer),
                vertex_count: u32::try_from(vertex_count).unwrap_or(u32::MAX),
                base_vertex,
            }],
            textures,
        );
        Ok(())
    }

    fn execute(&mut self, state: &mut FlushState<'_>, chained: ChainOps<'_>, chain_bounds: Rect) {
        {
            let mut journal = self.journal.lock();
            journal.extend(self.tags.iter().copied());
            for op in chained.downcast_iter::<TestOp>() {
                journal.extend(op.tags.iter().copied());
            }
        }
        state.execute_draws_and_uploads(chain_bounds);
    }

    fn dump_info(&self) -> String {
        format!("tags {:?}", self.tags)
    }
}

/// A draw of a different class that binds and draws directly on execute.
struct OtherOp {
    tag: u32,
    rect: Rect,
    journal: Journal,
}

impl OtherOp {
    fn new(tag: u32, rect: Rect, journal: &Journal) -> Box<Self> {
        Box::new(Self {
            tag,
            rect,
            journal: Arc::clone(journal),
        })
    }
}

impl Op for OtherOp {
    fn name(&self) -> &'static str {
        "OtherOp"
    }

    fn bounds(&self) -> Rect {
        self.rect
    }

    fn execute(&mut self, state: &mut FlushState<'_>, _chained: ChainOps<'_>, chain_bounds: Rect) {
        self.journal.lock().push(self.tag);
        state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("OtherOp", 2), chain_bounds);
        state.draw(3, 0);
    }
}

/// Samples a mask rendered in the background.
struct MaskOp {
    rect: Rect,
    proxy: ProxyId,
    mask: Option<PendingMask>,
}

impl Op for MaskOp {
    fn name(&self) -> &'static str {
        "MaskOp"
    }

    fn bounds(&self) -> Rect {
        self.rect
    }

    fn visit_proxies(&self, visitor: &mut dyn FnMut(ProxyId)) {
        visitor(self.proxy);
    }

    fn prepare(
        &mut self,
        state: &mut FlushState<'_>,
        _chained: ChainOps<'_>,
    ) -> Result<(), PrepareError> {
        let mask = self
            .mask
            .take()
            .ok_or(PrepareError::MaskUnavailable(self.proxy))?;
        state.add_asap_upload(mask.into_upload(self.proxy));
        state.record_draw(
            PipelineDesc::new("MaskOp", 3),
            vec![Mesh::NonIndexed {
                vertex_buffer: None,
                vertex_count: 4,
                base_vertex: 0,
            }],
            smallvec![self.proxy],
        );
        Ok(())
    }

    fn execute(&mut self, state: &mut FlushState<'_>, _chained: ChainOps<'_>, chain_bounds: Rect) {
        state.execute_draws_and_uploads(chain_bounds);
    }
}

fn xywh(x: f32, y: f32, w: f32, h: f32) -> Rect {
    Rect::from_xywh(x, y, w, h)
}

fn test_config() -> OpsTaskConfig {
    OpsTaskConfig {
        validate_chains: true,
        ..Default::default()
    }
}

fn new_task() -> OpsTask {
    new_task_with(test_config())
}

fn new_task_with(config: OpsTaskConfig) -> OpsTask {
    OpsTask::new(RenderTarget::new(TARGET, 256, 256), Caps::default(), config)
}

fn flush(task: &mut OpsTask, gpu: &mut MockGpu) -> Result<FlushReport, FlushError> {
    let caps = *task.caps();
    let mut state = FlushState::new(gpu, caps, BufferPoolConfig::default());
    task.flush(&mut state)
}

fn op_tags(op: &dyn Op) -> Vec<u32> {
    if let Some(op) = op.downcast_ref::<TestOp>() {
        op.tags.clone()
    } else if let Some(op) = op.downcast_ref::<OtherOp>() {
        vec![op.tag]
    } else {
        Vec::new()
    }
}

/// Tags of every op, per chain.
fn chain_tags(task: &OpsTask) -> Vec<Vec<Vec<u32>>> {
    task.chains()
        .map(|chain| chain.ops().map(op_tags).collect())
        .collect()
}

fn open_pass(state: &mut FlushState<'_>) -> bool {
    state.begin_render_pass(RenderPassDesc {
        target: TARGET,
        bounds: IRect::from_size(64, 64),
        color_load_op: LoadOp::Load,
        clear_color: [0.0; 4],
        uses_msaa: false,
        xfer_barriers: XferBarrierFlags::NONE,
        sampled_proxies: Vec::new(),
    })
}

#[test]
fn test_identical_rects_merge_and_disjoint_rect_starts_new_chain() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    for (tag, rect) in [
        (1, xywh(0.0, 0.0, 10.0, 10.0)),
        (2, xywh(0.0, 0.0, 10.0, 10.0)),
        (3, xywh(20.0, 20.0, 10.0, 10.0)),
    ] {
        task.add_op(TestOp::new(tag, rect, Combine::MergeTouching, &journal));
    }
    task.close();

    assert_eq!(task.chain_count(), 2);
    assert_eq!(chain_tags(&task), vec![vec![vec![1, 2]], vec![vec![3]]]);
    assert_eq!(task.chains().map(|chain| chain.bounds()).collect::<Vec<_>>(), vec![
        xywh(0.0, 0.0, 10.0, 10.0),
        xywh(20.0, 20.0, 10.0, 10.0),
    ]);
    assert_eq!(task.stats().ops_merged, 1);
    assert_eq!(task.op_count(), 2);
}

#[test]
fn test_overlapping_ops_of_different_classes_keep_submission_order() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.add_op(OtherOp::new(2, xywh(5.0, 5.0, 10.0, 10.0), &journal));
    task.close();

    let heads: Vec<_> = task.chains().map(|chain| chain.head_name()).collect();
    assert_eq!(heads, vec!["TestOp", "OtherOp"]);

    let mut gpu = MockGpu::default();
    flush(&mut task, &mut gpu).unwrap();
    assert_eq!(*journal.lock(), vec![1, 2]);
}

#[test]
fn test_disjoint_ops_of_different_classes_survive_forward_combine() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    let first = xywh(0.0, 0.0, 5.0, 5.0);
    let second = xywh(100.0, 100.0, 5.0, 5.0);
    task.add_op(TestOp::new(1, first, Combine::Chain, &journal));
    task.add_op(OtherOp::new(2, second, &journal));
    task.close();

    assert_eq!(task.chain_count(), 2);
    assert_eq!(task.stats().chains_forward_combined, 0);
    let bounds: Vec<_> = task.chains().map(|chain| chain.bounds()).collect();
    assert_eq!(bounds, vec![first, second]);
    assert_eq!(task.validate(), Ok(()));
}

#[test]
fn test_non_finite_op_is_dropped() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(
        1,
        Rect::from_ltrb(f32::NAN, 0.0, 1.0, 1.0),
        Combine::Chain,
        &journal,
    ));

    assert_eq!(task.chain_count(), 0);
    assert_eq!(task.op_count(), 0);
    assert_eq!(task.stats().ops_dropped_non_finite, 1);
    assert_eq!(task.close(), ExpectedOutcome::TargetUnchanged);
    assert!(task.is_color_no_op());
}

#[test]
fn test_failed_prepare_skips_only_its_chain() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Never, &journal));
    task.add_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_vertex_count(1 << 20),
    );
    task.add_op(TestOp::new(3, xywh(40.0, 0.0, 10.0, 10.0), Combine::Never, &journal));
    assert_eq!(task.close(), ExpectedOutcome::TargetDirty(IRect::from_ltrb(0, 0, 50, 10)));
    assert_eq!(task.chain_count(), 3);

    let mut gpu = MockGpu {
        max_buffer_size: Some(1 << 16),
        ..Default::default()
    };
    let report = flush(&mut task, &mut gpu).unwrap();

    assert_eq!(*journal.lock(), vec![1, 3]);
    assert_eq!(report.chains_prepared, 3);
    assert_eq!(report.prepare_failures, 1);
    assert_eq!(report.chains_executed, 2);
    assert_eq!(report.chains_skipped, 1);
    assert_eq!(report.draws_issued, 2);
    assert_eq!(gpu.draws().len(), 2);
    assert_eq!(task.op_count(), 0);
    assert_eq!(task.phase(), FlushPhase::Idle);
}

#[test]
fn test_chained_ops_execute_through_head() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    for tag in 1..=3 {
        let x = tag as f32 * 20.0;
        task.add_op(TestOp::new(tag, xywh(x, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    }
    task.close();

    assert_eq!(task.chain_count(), 1);
    assert_eq!(task.chain(0).map(|chain| chain.len()), Some(3));
    assert_eq!(task.stats().ops_chained, 2);
    assert_eq!(
        task.chain(0).map(|chain| chain.bounds()),
        Some(Rect::from_ltrb(20.0, 0.0, 70.0, 10.0))
    );

    let mut gpu = MockGpu::default();
    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(*journal.lock(), vec![1, 2, 3]);
    assert_eq!(report.chains_executed, 1);
    assert_eq!(gpu.draws(), vec![DrawCall::Draw {
        vertex_count: 12,
        base_vertex: 0,
    }]);
}

#[test]
fn test_backward_merge_across_disjoint_chained_op() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(1), &journal));
    task.add_op(TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(2), &journal));
    task.add_op(TestOp::new(3, xywh(40.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(1), &journal));

    assert_eq!(chain_tags(&task), vec![vec![vec![1, 3], vec![2]]]);
    let chain = task.chain(0).unwrap();
    assert_eq!(chain.op_bounds()[0], Rect::from_ltrb(0.0, 0.0, 50.0, 10.0));
    assert_eq!(chain.bounds(), Rect::from_ltrb(0.0, 0.0, 50.0, 10.0));
    assert_eq!(task.stats().ops_merged, 1);
    assert_eq!(task.stats().ops_chained, 1);
    assert_eq!(task.op_count(), 2);
}

#[test]
fn test_forward_merge_moves_merged_op_after_overlap() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(1), &journal));
    task.add_op(TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(2), &journal));
    // Overlaps op 2, so op 3 must draw after it.
    task.add_op(TestOp::new(3, xywh(15.0, 0.0, 10.0, 10.0), Combine::MergeSameKey(1), &journal));

    assert_eq!(chain_tags(&task), vec![vec![vec![2], vec![1, 3]]]);
    let chain = task.chain(0).unwrap();
    assert_eq!(chain.op_bounds()[1], Rect::from_ltrb(0.0, 0.0, 25.0, 10.0));
    assert_eq!(task.stats().ops_merged, 1);

    task.close();
    let mut gpu = MockGpu::default();
    flush(&mut task, &mut gpu).unwrap();
    assert_eq!(*journal.lock(), vec![2, 1, 3]);
}

#[test]
fn test_forward_combine_moves_chain_past_disjoint_chain() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.add_op(OtherOp::new(2, xywh(20.0, 20.0, 10.0, 10.0), &journal));
    task.add_op(TestOp::new(3, xywh(22.0, 22.0, 10.0, 10.0), Combine::Chain, &journal));
    assert_eq!(task.chain_count(), 3);

    task.close();
    assert_eq!(task.chain_count(), 2);
    assert_eq!(task.stats().chains_forward_combined, 1);
    assert_eq!(chain_tags(&task), vec![vec![vec![2]], vec![vec![1], vec![3]]]);
    assert_eq!(
        task.chain(1).map(|chain| chain.bounds()),
        Some(Rect::from_ltrb(0.0, 0.0, 32.0, 32.0))
    );
}

#[test]
fn test_lookback_limited_by_max_chain_distance() {
    init_tracing();
    let record = |config: OpsTaskConfig| {
        let journal = Journal::default();
        let mut task = new_task_with(config);
        task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::MergeTouching, &journal));
        task.add_op(OtherOp::new(2, xywh(100.0, 0.0, 10.0, 10.0), &journal));
        task.add_op(OtherOp::new(3, xywh(200.0, 0.0, 10.0, 10.0), &journal));
        task.add_op(TestOp::new(4, xywh(0.0, 0.0, 10.0, 10.0), Combine::MergeTouching, &journal));
        task.close();
        chain_tags(&task)
    };

    let near = record(OpsTaskConfig {
        max_chain_distance: 2,
        ..test_config()
    });
    assert_eq!(near.len(), 4);

    let far = record(test_config());
    assert_eq!(far, vec![vec![vec![1, 4]], vec![vec![2]], vec![vec![3]]]);
}

#[test]
fn test_merge_keeps_union_of_bounds() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::MergeTouching, &journal));
    task.add_op(TestOp::new(2, xywh(5.0, 5.0, 10.0, 10.0), Combine::MergeTouching, &journal));

    assert_eq!(task.op_count(), 1);
    let chain = task.chain(0).unwrap();
    assert_eq!(chain.op_bounds(), vec![Rect::from_ltrb(0.0, 0.0, 15.0, 15.0)]);
    assert_eq!(chain.bounds(), Rect::from_ltrb(0.0, 0.0, 15.0, 15.0));
}

#[test]
fn test_disjoint_submissions_commute() {
    init_tracing();
    let record = |order: [u32; 3]| {
        let journal = Journal::default();
        let mut task = new_task();
        for tag in order {
            let op: Box<dyn Op> = match tag {
                1 => OtherOp::new(1, xywh(50.0, 0.0, 10.0, 10.0), &journal),
                _ => TestOp::new(
                    tag,
                    xywh(tag as f32 * 50.0, 0.0, 10.0, 10.0),
                    Combine::MergeSameKey(1),
                    &journal,
                ),
            };
            task.add_op(op);
        }
        task.close();
        let mut merged: Vec<Vec<u32>> = chain_tags(&task).into_iter().flatten().collect();
        for tags in &mut merged {
            tags.sort_unstable();
        }
        merged.sort();
        let coverage = task
            .chains()
            .fold(Rect::EMPTY, |covered, chain| covered.join(&chain.bounds()));
        (merged, coverage)
    };

    let forward = record([0, 1, 2]);
    assert_eq!(forward, record([0, 2, 1]));
    assert_eq!(forward.0, vec![vec![0, 2], vec![1]]);
    assert_eq!(forward.1, Rect::from_ltrb(0.0, 0.0, 110.0, 10.0));
}

#[test]
fn test_closed_task_drops_new_ops() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.close();
    task.add_op(TestOp::new(2, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.add_draw_op(OtherOp::new(3, xywh(0.0, 0.0, 1.0, 1.0), &journal), DrawOpArgs::default());

    assert_eq!(task.op_count(), 1);
    assert_eq!(task.stats().ops_dropped_closed, 2);
    assert_eq!(task.stats().ops_recorded, 1);
}

#[test]
fn test_draw_op_records_sampled_proxies_and_barriers() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    let clip = AppliedClip {
        coverage: Some(ClipCoverage {
            id: 1,
            proxies: smallvec![ProxyId(20)],
        }),
        ..Default::default()
    };
    let analysis = ProcessorAnalysis {
        requires_dst_texture: true,
        uses_non_coherent_hw_blending: true,
        ..ProcessorAnalysis::EMPTY
    };
    let barrier = DstSampleFlags {
        requires_texture_barrier: true,
        as_input_attachment: false,
    };
    task.add_draw_op(
        TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal)
            .with_texture(ProxyId(10)),
        DrawOpArgs {
            uses_msaa: true,
            processor_analysis: analysis,
            clip: Some(clip.clone()),
            dst_proxy_view: DstProxyView::new(ProxyId(30), [0, 0], barrier),
        },
    );
    // Different destination copy, so it cannot share the chain.
    task.add_draw_op(
        TestOp::new(2, xywh(50.0, 0.0, 10.0, 10.0), Combine::Chain, &journal),
        DrawOpArgs {
            uses_msaa: false,
            processor_analysis: analysis,
            clip: Some(clip),
            dst_proxy_view: DstProxyView::new(ProxyId(31), [0, 0], barrier),
        },
    );
    task.add_draw_op(
        TestOp::new(3, xywh(100.0, 0.0, 10.0, 10.0), Combine::Never, &journal),
        DrawOpArgs {
            processor_analysis: ProcessorAnalysis {
                requires_dst_texture: true,
                ..ProcessorAnalysis::EMPTY
            },
            dst_proxy_view: DstProxyView::new(ProxyId(40), [0, 0], DstSampleFlags {
                requires_texture_barrier: false,
                as_input_attachment: true,
            }),
            ..Default::default()
        },
    );

    assert_eq!(task.chain_count(), 3);
    assert_eq!(task.sampled_proxies(), &[
        ProxyId(10),
        ProxyId(20),
        ProxyId(30),
        ProxyId(31)
    ]);
    assert_eq!(task.xfer_barriers(), XferBarrierFlags {
        texture: true,
        blend: true,
    });
    assert!(task.uses_msaa());
    for proxy in [10, 20, 30, 31, 40] {
        assert!(task.is_used(ProxyId(proxy)), "{proxy} should be used");
    }
    assert!(!task.is_used(ProxyId(99)));

    let first = task.chain(0).unwrap();
    assert_eq!(first.dst_proxy_view().proxy, Some(ProxyId(30)));
    assert!(first.applied_clip().is_some());
    assert_eq!(task.validate(), Ok(()));
}

#[test]
fn test_clip_mismatch_prevents_chaining() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    let scissored = |size| DrawOpArgs {
        clip: Some(AppliedClip::scissor(IRect::from_size(size, size))),
        ..Default::default()
    };
    task.add_draw_op(
        TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal),
        scissored(50),
    );
    task.add_draw_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Chain, &journal),
        scissored(60),
    );
    task.add_draw_op(
        TestOp::new(3, xywh(40.0, 0.0, 10.0, 10.0), Combine::Chain, &journal),
        scissored(50),
    );
    assert_eq!(chain_tags(&task), vec![vec![vec![1], vec![3]], vec![vec![2]]]);

    // A clip that clips nothing is the same as no clip.
    let mut unclipped = new_task();
    unclipped.add_op(TestOp::new(4, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    unclipped.add_draw_op(
        TestOp::new(5, xywh(20.0, 0.0, 10.0, 10.0), Combine::Chain, &journal),
        DrawOpArgs {
            clip: Some(AppliedClip::default()),
            ..Default::default()
        },
    );
    assert_eq!(unclipped.chain_count(), 1);
}

#[test]
fn test_scissor_applies_to_chain_draws() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    let scissor = IRect::from_ltrb(0, 0, 8, 8);
    task.add_draw_op(OtherOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), &journal), DrawOpArgs {
        clip: Some(AppliedClip::scissor(scissor)),
        ..Default::default()
    });
    task.close();

    let mut gpu = MockGpu::default();
    flush(&mut task, &mut gpu).unwrap();
    // The pipeline does not enable scissoring, so the clip is dropped at bind.
    assert!(gpu.position(&GpuCall::BindPipeline("OtherOp", None)).is_some());
}

#[test]
fn test_non_overlapping_requirement_splits_overlapping_draws() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    let args = || DrawOpArgs {
        processor_analysis: ProcessorAnalysis {
            requires_non_overlapping_draws: true,
            ..ProcessorAnalysis::EMPTY
        },
        ..Default::default()
    };
    task.add_draw_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal), args());
    task.add_draw_op(TestOp::new(2, xywh(5.0, 5.0, 10.0, 10.0), Combine::Chain, &journal), args());
    task.add_draw_op(
        TestOp::new(3, xywh(50.0, 50.0, 10.0, 10.0), Combine::Chain, &journal),
        args(),
    );
    task.close();

    assert_eq!(chain_tags(&task), vec![vec![vec![1]], vec![vec![2], vec![3]]]);
}

#[test]
fn test_inline_uploads_run_before_their_draw() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(
        TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(10)),
    );
    task.add_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(11)),
    );
    task.close();

    let mut gpu = MockGpu::default();
    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(report.uploads_performed, 2);

    let draws = gpu.draw_positions();
    let first_upload = gpu.position(&GpuCall::WritePixels(ProxyId(10))).unwrap();
    let second_upload = gpu.position(&GpuCall::WritePixels(ProxyId(11))).unwrap();
    assert_eq!(draws.len(), 2);
    assert!(first_upload < draws[0]);
    assert!(draws[0] < second_upload && second_upload < draws[1]);
    assert!(
        gpu.position(&GpuCall::BindTextures(vec![ProxyId(11)]))
            .is_some_and(|bind| bind > second_upload)
    );
}

#[test]
fn test_asap_mask_upload_runs_before_render_pass() {
    init_tracing();
    let mut task = new_task();
    let proxy = ProxyId(12);
    let mask = PendingMask::spawn(4, 4, |w, h| Some(vec![0x80; (w * h) as usize]));
    task.add_draw_op(
        Box::new(MaskOp {
            rect: xywh(0.0, 0.0, 4.0, 4.0),
            proxy,
            mask: Some(mask),
        }),
        DrawOpArgs::default(),
    );
    task.close();

    let mut gpu = MockGpu::default();
    let stats = {
        let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
        task.flush(&mut state).unwrap();
        state.stats()
    };
    assert_eq!(stats.uploads_performed, 1);
    assert_eq!(stats.draws_issued, 1);

    let upload = gpu.position(&GpuCall::WritePixels(proxy)).unwrap();
    let begin = gpu
        .position(&GpuCall::BeginRenderPass(
            TARGET,
            LoadOp::Load,
            IRect::from_size(4, 4),
        ))
        .unwrap();
    assert!(upload < begin);
    assert!(gpu.position(&GpuCall::BindTextures(vec![proxy])).is_some());
}

#[test]
fn test_failed_bind_abandons_only_that_pipeline() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Never, &journal));
    task.add_op(OtherOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), &journal));
    task.close();

    let mut gpu = MockGpu {
        rejected_pipelines: vec!["TestOp"],
        ..Default::default()
    };
    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(report.failed_draws, 1);
    assert_eq!(report.draws_issued, 1);
    assert_eq!(report.chains_executed, 2);
    assert_eq!(gpu.draws(), vec![DrawCall::Draw {
        vertex_count: 3,
        base_vertex: 0,
    }]);
    assert_eq!(*journal.lock(), vec![1, 2]);
}

#[test]
fn test_too_many_attributes_abandons_draws_until_rebind() {
    init_tracing();
    let mut gpu = MockGpu::default();
    let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
    assert!(open_pass(&mut state));

    let wide = PipelineDesc {
        vertex_attribute_count: 12,
        instance_attribute_count: 8,
        ..PipelineDesc::new("wide", 7)
    };
    state.bind_pipeline_and_scissor_clip(&wide, Rect::EMPTY);
    state.draw(3, 0);
    state.draw_indexed(6, 0, 0, 3, 0);
    state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("narrow", 8), Rect::EMPTY);
    state.draw_instanced(2, 0, 4, 0);
    state.end_render_pass();

    let stats = state.stats();
    assert_eq!(stats.failed_draws, 2);
    assert_eq!(stats.draws_issued, 1);
    drop(state);
    assert_eq!(gpu.draws(), vec![DrawCall::Instanced {
        instance_count: 2,
        base_instance: 0,
        vertex_count: 4,
        base_vertex: 0,
    }]);
}

#[test]
fn test_index_pattern_draws_every_repetition() {
    init_tracing();
    let caps = Caps {
        base_instance_support: false,
        ..Caps::default()
    };
    let mut gpu = MockGpu::default();
    {
        let mut state = FlushState::new(&mut gpu, caps, BufferPoolConfig::default());
        assert!(open_pass(&mut state));
        state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("quads", 1), Rect::EMPTY);
        state.draw_index_pattern(6, 5, 2, 4, 10);
        state.end_render_pass();
    }
    assert_eq!(gpu.draws(), vec![
        DrawCall::Indexed {
            index_count: 12,
            base_index: 0,
            min_index_value: 0,
            max_index_value: 7,
            base_vertex: 10,
        },
        DrawCall::Indexed {
            index_count: 12,
            base_index: 0,
            min_index_value: 0,
            max_index_value: 7,
            base_vertex: 18,
        },
        DrawCall::Indexed {
            index_count: 6,
            base_index: 0,
            min_index_value: 0,
            max_index_value: 3,
            base_vertex: 26,
        },
    ]);

    // Base-instance support does not turn the pattern into an instanced
    // draw: the copies have their own vertices.
    let mut gpu = MockGpu::default();
    {
        let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
        assert!(open_pass(&mut state));
        state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("quads", 1), Rect::EMPTY);
        state.draw_index_pattern(6, 3, 8, 4, 0);
        state.end_render_pass();
    }
    assert_eq!(gpu.draws(), vec![DrawCall::Indexed {
        index_count: 18,
        base_index: 0,
        min_index_value: 0,
        max_index_value: 11,
        base_vertex: 0,
    }]);

    let mut gpu = MockGpu::default();
    {
        let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
        assert!(open_pass(&mut state));
        state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("quads", 1), Rect::EMPTY);
        state.draw_mesh(&Mesh::IndexPattern {
            index_buffer: BufferId(3),
            vertex_buffer: Some(BufferId(4)),
            pattern_repeat_count: 5,
            max_pattern_repetitions: 2,
            vertex_count_per_pattern: 4,
            index_count_per_pattern: 6,
            base_vertex: 0,
        });
        state.end_render_pass();
    }
    assert!(
        gpu.position(&GpuCall::BindBuffers(BufferBindings {
            index: Some(BufferId(3)),
            instance: None,
            vertex: Some(BufferId(4)),
        }))
        .is_some()
    );
    let base_vertices: Vec<u32> = gpu
        .draws()
        .into_iter()
        .map(|call| match call {
            DrawCall::Indexed { base_vertex, .. } => base_vertex,
            other => panic!("unexpected draw {other:?}"),
        })
        .collect();
    assert_eq!(base_vertices, vec![0, 8, 16]);
}

#[test]
fn test_index_pattern_offsets_saturate() {
    init_tracing();
    let mut gpu = MockGpu::default();
    {
        let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
        assert!(open_pass(&mut state));
        state.bind_pipeline_and_scissor_clip(&PipelineDesc::new("quads", 1), Rect::EMPTY);
        state.draw_index_pattern(u32::MAX, 2, 1, u32::MAX, 1);
        state.end_render_pass();
    }
    assert_eq!(gpu.draws(), vec![
        DrawCall::Indexed {
            index_count: u32::MAX,
            base_index: 0,
            min_index_value: 0,
            max_index_value: u16::MAX,
            base_vertex: 1,
        },
        DrawCall::Indexed {
            index_count: u32::MAX,
            base_index: 0,
            min_index_value: 0,
            max_index_value: u16::MAX,
            base_vertex: u32::MAX,
        },
    ]);
}

#[test]
fn test_buffer_space_is_pooled_and_element_aligned() {
    init_tracing();
    let mut gpu = MockGpu::default();
    {
        let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
        let (first_buffer, first_base) = {
            let mut space = state.make_vertex_space(12, 3).unwrap();
            space.write(&[[1.0_f32, 2.0, 3.0]; 3]);
            (space.buffer, space.base_vertex)
        };
        assert_eq!(first_base, 0);

        let (second_buffer, second_base) = state
            .make_vertex_space(8, 2)
            .map(|space| (space.buffer, space.base_vertex))
            .unwrap();
        assert_eq!(second_buffer, first_buffer);
        assert_eq!(second_base, 5);

        let index_base = state.make_index_space(6).map(|space| space.base_index).unwrap();
        assert_eq!(index_base, 0);

        let big = state
            .make_vertex_space(4, 20_000)
            .map(|space| (space.buffer, space.base_vertex))
            .unwrap();
        assert_ne!(big.0, first_buffer);
        assert_eq!(big.1, 0);
        assert_eq!(state.pool_block_counts(), (2, 1));

        assert!(matches!(
            state.make_vertex_space(0, 4),
            Err(AllocError::InvalidRequest { .. })
        ));
        state.pre_execute_draws();
    }
    assert!(gpu.position(&GpuCall::WriteBuffer(BufferId(1), 0, 56)).is_some());
    assert!(gpu.position(&GpuCall::WriteBuffer(BufferId(3), 0, 80_000)).is_some());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "wrote 16 bytes into a 12 byte reservation")]
fn test_write_past_reservation_is_caught() {
    init_tracing();
    let mut gpu = MockGpu::default();
    let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
    let mut space = state.make_vertex_space(4, 3).unwrap();
    space.write(&[1.0_f32, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tokens_order_uploads_against_draws() {
    init_tracing();
    let mut gpu = MockGpu::default();
    let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());

    // Outside of prepare there is no head to key the draw to.
    state.record_draw(PipelineDesc::new("orphan", 0), Vec::new(), TextureList::new());
    assert_eq!(state.next_draw_token(), DeferredUploadToken::ALREADY_FLUSHED.next());

    state.set_op_args(Some(OpArgs {
        op: OpId(77),
        target: TARGET,
        uses_msaa: false,
        applied_clip: None,
        dst_proxy_view: DstProxyView::default(),
        xfer_barriers: XferBarrierFlags::NONE,
        color_load_op: LoadOp::Load,
    }));
    let inline = state.add_inline_upload(Box::new(|_: &mut WritePixels<'_>| {}));
    assert_eq!(inline.get(), 1);
    state.record_draw(PipelineDesc::new("first", 0), Vec::new(), TextureList::new());
    assert_eq!(state.next_draw_token().get(), 2);
    let asap = state.add_asap_upload(Box::new(|_: &mut WritePixels<'_>| {}));
    assert_eq!(asap, state.next_token_to_flush());
    assert_eq!(asap.get(), 1);
}

#[test]
fn test_uninstantiated_proxy_skips_chain() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(
        TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(8)),
    );
    task.add_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(9)),
    );
    task.add_op(TestOp::new(3, xywh(40.0, 0.0, 10.0, 10.0), Combine::Never, &journal));
    task.close();

    let mut gpu = MockGpu {
        missing: vec![ProxyId(8), ProxyId(9)],
        uninstantiable: vec![ProxyId(9)],
        ..Default::default()
    };
    let mut alloc = ResourceAllocator::new();
    task.gather_proxy_intervals(&mut alloc);
    assert!(!alloc.instantiate(&mut gpu));
    assert_eq!(alloc.failed_proxies(), &[ProxyId(9)]);

    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(*journal.lock(), vec![1, 3]);
    assert_eq!(report.chains_skipped, 1);
    assert_eq!(report.skipped_draws, 1);
    assert_eq!(report.draws_issued, 2);
}

#[test]
fn test_gather_proxy_intervals() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_deferred_proxy(ProxyId(50));
    task.add_op(
        TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(10)),
    );
    task.add_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Never, &journal)
            .with_texture(ProxyId(11)),
    );
    task.close();

    let mut alloc = ResourceAllocator::new();
    task.gather_proxy_intervals(&mut alloc);
    assert_eq!(alloc.cur_op(), 2);
    let span = |proxy| alloc.interval(ProxyId(proxy)).map(|i| (i.start, i.end));
    assert_eq!(span(1), Some((0, 1)));
    assert_eq!(span(10), Some((0, 0)));
    assert_eq!(span(11), Some((1, 1)));
    assert_eq!(span(50), Some((0, 0)));
    assert_eq!(
        alloc.interval(ProxyId(50)).map(|i| i.actual_use),
        Some(ActualUse::No)
    );

    // A clear with no draws still writes its target.
    let mut clear = OpsTask::new(
        RenderTarget::new(ProxyId(2), 16, 16),
        Caps::default(),
        test_config(),
    );
    clear.set_color_load_op(LoadOp::Clear, [0.0, 0.0, 0.0, 1.0]);
    clear.close();
    clear.gather_proxy_intervals(&mut alloc);
    assert_eq!(alloc.interval(ProxyId(2)).map(|i| (i.start, i.end)), Some((2, 2)));
    assert_eq!(alloc.cur_op(), 3);

    let mut idle = OpsTask::new(
        RenderTarget::new(ProxyId(3), 16, 16),
        Caps::default(),
        test_config(),
    );
    idle.close();
    idle.gather_proxy_intervals(&mut alloc);
    assert!(alloc.interval(ProxyId(3)).is_none());
    assert_eq!(alloc.cur_op(), 3);
}

#[test]
fn test_merge_from_appends_tasks_on_same_target() {
    init_tracing();
    let journal = Journal::default();
    let mut first = new_task();
    first.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    first.close();

    let mut same = new_task();
    same.add_op(
        TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Chain, &journal)
            .with_texture(ProxyId(10)),
    );
    same.close();
    let mut other = OpsTask::new(
        RenderTarget::new(ProxyId(2), 16, 16),
        Caps::default(),
        test_config(),
    );
    other.add_op(OtherOp::new(3, xywh(0.0, 0.0, 1.0, 1.0), &journal));
    other.close();

    let mut rest = vec![same, other];
    assert_eq!(first.merge_from(&mut rest), 1);
    assert_eq!(first.chain_count(), 2);
    assert_eq!(first.op_count(), 2);
    assert_eq!(rest[0].op_count(), 0);
    assert_eq!(rest[1].op_count(), 1);
    assert_eq!(first.clipped_content_bounds(), IRect::from_ltrb(0, 0, 30, 10));
    assert!(first.is_used(ProxyId(10)));
    assert_eq!(first.validate(), Ok(()));

    let mut gpu = MockGpu::default();
    flush(&mut first, &mut gpu).unwrap();
    assert_eq!(*journal.lock(), vec![1, 2]);

    let mut clearing = new_task();
    clearing.set_color_load_op(LoadOp::Clear, [1.0; 4]);
    clearing.close();
    let mut base = new_task();
    base.close();
    assert_eq!(base.merge_from(std::slice::from_mut(&mut clearing)), 0);
}

#[test]
fn test_clear_and_discard_load_ops() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.set_color_load_op(LoadOp::Clear, [0.0, 0.0, 1.0, 1.0]);
    assert_eq!(task.total_bounds(), Rect::from_ltrb(0.0, 0.0, 256.0, 256.0));
    assert_eq!(
        task.close(),
        ExpectedOutcome::TargetDirty(IRect::from_size(256, 256))
    );
    let mut gpu = MockGpu::default();
    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(report.draws_issued, 0);
    assert_eq!(gpu.calls, vec![
        GpuCall::BeginRenderPass(TARGET, LoadOp::Clear, IRect::from_size(256, 256)),
        GpuCall::EndRenderPass,
    ]);

    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.discard();
    assert_eq!(task.color_load_op(), LoadOp::Load);
    assert!(!task.reset_for_fullscreen_clear(false));
    assert_eq!(task.op_count(), 1);
    assert!(task.reset_for_fullscreen_clear(true));
    assert_eq!(task.op_count(), 0);

    task.discard();
    assert_eq!(task.color_load_op(), LoadOp::Discard);
    assert!(!task.is_color_no_op());

    let mut fixed = OpsTask::new(
        RenderTarget {
            fixed_render_pass: true,
            ..RenderTarget::new(ProxyId(5), 8, 8)
        },
        Caps::default(),
        test_config(),
    );
    assert!(!fixed.reset_for_fullscreen_clear(true));
}

#[test]
fn test_color_no_op_task_skips_flush() {
    init_tracing();
    let mut task = new_task();
    assert_eq!(task.close(), ExpectedOutcome::TargetUnchanged);
    let mut gpu = MockGpu::default();
    let report = flush(&mut task, &mut gpu).unwrap();
    assert_eq!(report, FlushReport::default());
    assert!(gpu.calls.is_empty());
}

#[test]
fn test_flush_steps_must_run_in_order() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));

    let mut gpu = MockGpu::default();
    assert_eq!(flush(&mut task, &mut gpu), Err(FlushError::NotClosed));

    task.close();
    let mut state = FlushState::new(&mut gpu, Caps::default(), BufferPoolConfig::default());
    assert_eq!(
        task.execute(&mut state),
        Err(FlushError::OutOfOrder {
            action: "execute",
            phase: FlushPhase::Idle,
        })
    );
    task.prepare(&mut state).unwrap();
    assert_eq!(
        task.prepare(&mut state),
        Err(FlushError::OutOfOrder {
            action: "prepare",
            phase: FlushPhase::Preparing,
        })
    );
}

#[test]
fn test_refused_render_pass_still_tears_down() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.close();

    let mut gpu = MockGpu {
        refuse_render_pass: true,
        ..Default::default()
    };
    assert_eq!(
        flush(&mut task, &mut gpu),
        Err(FlushError::RenderPassUnavailable(TARGET))
    );
    assert_eq!(task.op_count(), 0);
    assert_eq!(task.phase(), FlushPhase::Idle);
    assert!(journal.lock().is_empty());
}

#[test]
fn test_dump_lists_chains_and_ops() {
    init_tracing();
    let journal = Journal::default();
    let mut task = new_task();
    task.add_op(TestOp::new(1, xywh(0.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.add_op(TestOp::new(2, xywh(20.0, 0.0, 10.0, 10.0), Combine::Chain, &journal));
    task.set_chain_skip_execute(0);

    let dump = task.to_string();
    assert!(dump.contains("ColorLoadOp: Load"));
    assert!(
        dump.contains("0: TestOp chain bounds [L: 0.00, T: 0.00, R: 30.00, B: 10.00] (skipped)")
    );
    assert!(dump.contains("tags [2]"));
}

/// Deterministic generator for scene tests.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, bound: u32) -> u32 {
        self.next() % bound
    }
}

fn random_scene(seed: u64, count: u32, journal: &Journal) -> Vec<(Rect, Box<dyn Op>)> {
    let mut rng = Lcg(seed);
    (0..count)
        .map(|tag| {
            let rect = xywh(
                rng.below(160) as f32,
                rng.below(160) as f32,
                (5 + rng.below(40)) as f32,
                (5 + rng.below(40)) as f32,
            );
            let op: Box<dyn Op> = match rng.below(5) {
                0 => TestOp::new(tag, rect, Combine::MergeTouching, journal),
                1 => TestOp::new(tag, rect, Combine::MergeSameKey(rng.below(3)), journal),
                2 => TestOp::new(tag, rect, Combine::Chain, journal),
                3 => TestOp::new(tag, rect, Combine::Never, journal),
                _ => OtherOp::new(tag, rect, journal),
            };
            (rect, op)
        })
        .collect()
}

fn record_scene(config: OpsTaskConfig, seed: u64, count: u32) -> (OpsTask, Vec<Rect>, Journal) {
    let journal = Journal::default();
    let mut task = new_task_with(config);
    let mut rects = Vec::new();
    for (rect, op) in random_scene(seed, count, &journal) {
        rects.push(rect);
        task.add_op(op);
    }
    task.close();
    (task, rects, journal)
}

/// Asserts every overlapping pair runs in submission order, given each
/// tag's position in execution order.
fn assert_overlaps_in_order<K: Ord + std::fmt::Debug>(rects: &[Rect], position: impl Fn(u32) -> K) {
    for (a, rect_a) in rects.iter().enumerate() {
        for (b, rect_b) in rects.iter().enumerate().skip(a + 1) {
            if rect_a.overlaps(rect_b) {
                let (a, b) = (a as u32, b as u32);
                assert!(
                    position(a) < position(b),
                    "op {a} at {:?} must run before op {b} at {:?}",
                    position(a),
                    position(b)
                );
            }
        }
    }
}

#[test]
fn test_scenes_preserve_painters_order() {
    init_tracing();
    for (seed, distance) in [(1, 10), (2, 10), (3, 3), (4, 1), (5, 32)] {
        let config = OpsTaskConfig {
            max_merge_distance: distance,
            max_chain_distance: distance,
            validate_chains: true,
        };
        let (mut task, rects, journal) = record_scene(config, seed, 150);
        assert_eq!(task.validate(), Ok(()));

        let mut scheduled = FxHashMap::default();
        for (chain, ops) in chain_tags(&task).into_iter().enumerate() {
            for (slot, tags) in ops.into_iter().enumerate() {
                for (within, tag) in tags.into_iter().enumerate() {
                    scheduled.insert(tag, (chain, slot, within));
                }
            }
        }
        assert_eq!(scheduled.len(), rects.len());
        assert_overlaps_in_order(&rects, |tag| scheduled[&tag]);

        let mut gpu = MockGpu::default();
        flush(&mut task, &mut gpu).unwrap();
        let executed = journal.lock().clone();
        let order: FxHashMap<u32, usize> = executed
            .iter()
            .enumerate()
            .map(|(index, tag)| (*tag, index))
            .collect();
        assert_overlaps_in_order(&rects, |tag| order[&tag]);
    }
}

#[test]
fn test_scenes_lose_no_ops() {
    init_tracing();
    for seed in [11, 12, 13] {
        let count = 200;
        let (mut task, _, journal) = record_scene(test_config(), seed, count);
        let stats = task.stats();
        assert_eq!(stats.ops_recorded, count as usize);
        assert_eq!(task.op_count(), count as usize - stats.ops_merged);

        let mut gpu = MockGpu::default();
        let report = flush(&mut task, &mut gpu).unwrap();
        assert_eq!(report.failed_draws, 0);
        let mut executed = journal.lock().clone();
        executed.sort_unstable();
        assert_eq!(executed, (0..count).collect::<Vec<_>>());
    }
}

#[test]
fn test_skipped_chain_leaves_others_untouched() {
    init_tracing();
    for seed in [21, 22, 23] {
        let (mut task, _, journal) = record_scene(test_config(), seed, 120);
        let snapshot = |task: &OpsTask| {
            task.chains()
                .map(|chain| (chain.bounds(), chain.op_ids()))
                .collect::<Vec<_>>()
        };
        let before = snapshot(&task);
        let skipped = task.chain_count() / 2;
        task.set_chain_skip_execute(skipped);
        assert_eq!(snapshot(&task), before);

        let expected: Vec<u32> = chain_tags(&task)
            .into_iter()
            .enumerate()
            .filter(|(index, _)| *index != skipped)
            .flat_map(|(_, ops)| ops.into_iter().flatten())
            .collect();
        let mut gpu = MockGpu::default();
        let report = flush(&mut task, &mut gpu).unwrap();
        assert_eq!(report.chains_skipped, 1);
        assert_eq!(*journal.lock(), expected);
    }
}
