//! Per-flush context threaded through prepare and execute.
//!
//! ## Usage
//!
//! Create one [`FlushState`] per flush. During prepare, ops allocate vertex
//! and index space, register uploads and record their draws. Call
//! [`FlushState::pre_execute_draws`] once every task has been prepared, then
//! execute the tasks; ops replay their draws with
//! [`FlushState::execute_draws_and_uploads`].

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::{
    buffer_pool::{BufferKind, BufferPool, IndexSpace, VertexSpace},
    caps::Caps,
    config::BufferPoolConfig,
    draw_state::{AppliedClip, DstProxyView, LoadOp, XferBarrierFlags},
    error::AllocError,
    op::OpId,
    rect::{IRect, Rect},
    render_pass::{
        BufferBindings, DrawCall, Gpu, Mesh, OpsRenderPass, PipelineDesc, RenderPassDesc,
        TextureList,
    },
    resource::ProxyId,
};

/// Orders uploads relative to draws.
///
/// Every recorded draw is issued a token; an upload tagged with a token runs
/// right before the draw holding that token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeferredUploadToken(u64);

impl DeferredUploadToken {
    /// The token that precedes every issued token.
    pub const ALREADY_FLUSHED: Self = Self(0);

    /// The token after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw sequence number.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Issues draw tokens during prepare and retires them during execute.
#[derive(Debug, Default)]
pub(crate) struct TokenTracker {
    last_issued: DeferredUploadToken,
    last_flushed: DeferredUploadToken,
}

impl TokenTracker {
    fn issue_draw_token(&mut self) -> DeferredUploadToken {
        self.last_issued = self.last_issued.next();
        self.last_issued
    }

    fn flush_token(&mut self) {
        self.last_flushed = self.last_flushed.next();
    }

    fn next_draw_token(&self) -> DeferredUploadToken {
        self.last_issued.next()
    }

    fn next_token_to_flush(&self) -> DeferredUploadToken {
        self.last_flushed.next()
    }
}

/// Writes pixels on behalf of a deferred upload.
pub struct WritePixels<'a> {
    gpu: &'a mut dyn Gpu,
    failed: bool,
}

impl WritePixels<'_> {
    /// Writes `pixels` into `region` of `proxy`.
    pub fn write(&mut self, proxy: ProxyId, region: IRect, pixels: &[u8]) -> bool {
        let ok = self.gpu.write_pixels(proxy, region, pixels);
        if !ok {
            warn!("Deferred upload to {:?} failed", proxy);
            self.failed = true;
        }
        ok
    }
}

/// Work that writes surface contents at a scheduled point of the flush.
pub type DeferredUpload = Box<dyn for<'a> FnOnce(&mut WritePixels<'a>) + Send>;

struct InlineUpload {
    upload: DeferredUpload,
    upload_before_token: DeferredUploadToken,
}

struct DrawRecord {
    op: OpId,
    pipeline: PipelineDesc,
    meshes: Vec<Mesh>,
    textures: TextureList,
}

/// Per-chain arguments set by the task around each prepare and execute.
#[derive(Debug, Clone)]
pub struct OpArgs {
    /// The chain head being prepared or executed.
    pub op: OpId,
    /// Target surface.
    pub target: ProxyId,
    /// Whether the task renders with multisampling.
    pub uses_msaa: bool,
    /// Clip shared by the chain.
    pub applied_clip: Option<AppliedClip>,
    /// Destination copy shared by the chain.
    pub dst_proxy_view: DstProxyView,
    /// Barriers available in the render pass.
    pub xfer_barriers: XferBarrierFlags,
    /// The target's color load op.
    pub color_load_op: LoadOp,
}

/// Counters accumulated over a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlushStats {
    /// Draws that reached the backend.
    pub draws_issued: u32,
    /// Draws abandoned after a failed pipeline bind.
    pub failed_draws: u32,
    /// Draws skipped because their chain did not execute.
    pub skipped_draws: u32,
    /// Deferred uploads that wrote all their pixels.
    pub uploads_performed: u32,
    /// Deferred uploads with at least one rejected write.
    pub failed_uploads: u32,
}

/// The context handed to ops during prepare and execute.
pub struct FlushState<'g> {
    gpu: &'g mut dyn Gpu,
    caps: Caps,
    vertex_pool: BufferPool,
    index_pool: BufferPool,
    tokens: TokenTracker,
    asap_uploads: Vec<DeferredUpload>,
    inline_uploads: VecDeque<InlineUpload>,
    draws: VecDeque<DrawRecord>,
    op_args: Option<OpArgs>,
    render_pass: Option<OpsRenderPass>,
    stats: FlushStats,
}

impl<'g> FlushState<'g> {
    /// Creates the state for one flush against `gpu`.
    pub fn new(gpu: &'g mut dyn Gpu, caps: Caps, config: BufferPoolConfig) -> Self {
        Self {
            gpu,
            caps,
            vertex_pool: BufferPool::new(BufferKind::Vertex, config.min_vertex_block_size),
            index_pool: BufferPool::new(BufferKind::Index, config.min_index_block_size),
            tokens: TokenTracker::default(),
            asap_uploads: Vec::new(),
            inline_uploads: VecDeque::new(),
            draws: VecDeque::new(),
            op_args: None,
            render_pass: None,
            stats: FlushStats::default(),
        }
    }

    /// The backend.
    pub fn gpu(&self) -> &dyn Gpu {
        &*self.gpu
    }

    /// Backend capabilities.
    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Arguments of the chain currently being prepared or executed.
    pub fn op_args(&self) -> Option<&OpArgs> {
        self.op_args.as_ref()
    }

    /// Clip of the current chain.
    pub fn applied_clip(&self) -> Option<&AppliedClip> {
        self.op_args.as_ref().and_then(|args| args.applied_clip.as_ref())
    }

    /// Destination copy of the current chain.
    pub fn dst_proxy_view(&self) -> Option<&DstProxyView> {
        self.op_args.as_ref().map(|args| &args.dst_proxy_view)
    }

    pub(crate) fn set_op_args(&mut self, args: Option<OpArgs>) {
        self.op_args = args;
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// The token the next recorded draw will receive.
    pub fn next_draw_token(&self) -> DeferredUploadToken {
        self.tokens.next_draw_token()
    }

    /// The token of the next draw to execute.
    pub fn next_token_to_flush(&self) -> DeferredUploadToken {
        self.tokens.next_token_to_flush()
    }

    /// Reserves space for `vertex_count` vertices of `vertex_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request is empty or the backend cannot
    /// create a block.
    pub fn make_vertex_space(
        &mut self,
        vertex_size: usize,
        vertex_count: usize,
    ) -> Result<VertexSpace<'_>, AllocError> {
        let space = self
            .vertex_pool
            .make_space(&mut *self.gpu, vertex_size, vertex_count)?;
        let base_vertex = u32::try_from(space.offset / vertex_size).map_err(|_| {
            AllocError::InvalidRequest {
                kind: BufferKind::Vertex,
                element_size: vertex_size,
                count: vertex_count,
            }
        })?;
        Ok(VertexSpace::new(space.buffer, base_vertex, space.bytes))
    }

    /// Reserves space for `index_count` 16-bit indices.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request is empty or the backend cannot
    /// create a block.
    pub fn make_index_space(&mut self, index_count: usize) -> Result<IndexSpace<'_>, AllocError> {
        const INDEX_SIZE: usize = size_of::<u16>();
        let space = self
            .index_pool
            .make_space(&mut *self.gpu, INDEX_SIZE, index_count)?;
        let base_index = u32::try_from(space.offset / INDEX_SIZE).map_err(|_| {
            AllocError::InvalidRequest {
                kind: BufferKind::Index,
                element_size: INDEX_SIZE,
                count: index_count,
            }
        })?;
        Ok(IndexSpace::new(space.buffer, base_index, space.bytes))
    }

    /// Registers an upload that runs before any draw of the flush.
    pub fn add_asap_upload(&mut self, upload: DeferredUpload) -> DeferredUploadToken {
        self.asap_uploads.push(upload);
        self.tokens.next_token_to_flush()
    }

    /// Registers an upload that runs right before the next recorded draw.
    pub fn add_inline_upload(&mut self, upload: DeferredUpload) -> DeferredUploadToken {
        let upload_before_token = self.tokens.next_draw_token();
        self.inline_uploads.push_back(InlineUpload {
            upload,
            upload_before_token,
        });
        upload_before_token
    }

    /// Records a draw for the current chain head.
    ///
    /// The draw is replayed by [`FlushState::execute_draws_and_uploads`] when
    /// the same head executes.
    pub fn record_draw(
        &mut self,
        pipeline: PipelineDesc,
        meshes: Vec<Mesh>,
        textures: TextureList,
    ) {
        let Some(op) = self.op_args.as_ref().map(|args| args.op) else {
            warn!("Draw `{}` recorded outside of prepare", pipeline.label);
            return;
        };
        let token = self.tokens.issue_draw_token();
        trace!("{:?} records `{}` as draw {:?}", op, pipeline.label, token);
        self.draws.push_back(DrawRecord {
            op,
            pipeline,
            meshes,
            textures,
        });
    }

    /// Ends the prepare phase: uploads staged buffer bytes and runs every ASAP
    /// upload.
    pub fn pre_execute_draws(&mut self) {
        self.vertex_pool.unmap(&mut *self.gpu);
        self.index_pool.unmap(&mut *self.gpu);
        for upload in std::mem::take(&mut self.asap_uploads) {
            self.run_upload(upload);
        }
        debug!(
            "Pre-execute: {} draws recorded, {} inline uploads pending",
            self.draws.len(),
            self.inline_uploads.len()
        );
    }

    fn run_upload(&mut self, upload: DeferredUpload) {
        let mut writer = WritePixels {
            gpu: &mut *self.gpu,
            failed: false,
        };
        upload(&mut writer);
        if writer.failed {
            self.stats.failed_uploads += 1;
        } else {
            self.stats.uploads_performed += 1;
        }
    }

    /// Runs the inline uploads due before the next draw.
    fn run_due_inline_uploads(&mut self) {
        let due = self.tokens.next_token_to_flush();
        while self
            .inline_uploads
            .front()
            .is_some_and(|upload| upload.upload_before_token <= due)
        {
            if let Some(InlineUpload { upload, .. }) = self.inline_uploads.pop_front() {
                self.run_upload(upload);
            }
        }
    }

    /// Replays the current head's recorded draws in order, running inline
    /// uploads as their tokens come due.
    pub fn execute_draws_and_uploads(&mut self, chain_bounds: Rect) {
        let Some(op) = self.op_args.as_ref().map(|args| args.op) else {
            warn!("Draws executed outside of execute");
            return;
        };
        let scissor = self.applied_clip().and_then(|clip| clip.scissor);
        while self.draws.front().is_some_and(|draw| draw.op == op) {
            self.run_due_inline_uploads();
            let Some(draw) = self.draws.pop_front() else {
                break;
            };
            self.bind_pipeline_and_scissor_clip_with(&draw.pipeline, scissor, chain_bounds);
            self.bind_textures(&draw.textures);
            for mesh in &draw.meshes {
                self.draw_mesh(mesh);
            }
            self.tokens.flush_token();
        }
    }

    /// Retires the draws recorded by a chain that will not execute, still
    /// running the uploads scheduled before them.
    pub(crate) fn skip_draws_for(&mut self, op: OpId) {
        while self.draws.front().is_some_and(|draw| draw.op == op) {
            self.run_due_inline_uploads();
            self.draws.pop_front();
            self.tokens.flush_token();
            self.stats.skipped_draws += 1;
        }
    }

    /// Opens the render pass. Returns false if the backend refuses.
    pub(crate) fn begin_render_pass(&mut self, desc: RenderPassDesc) -> bool {
        debug_assert!(self.render_pass.is_none(), "render pass already open");
        self.render_pass = OpsRenderPass::begin(&mut *self.gpu, self.caps, desc);
        self.render_pass.is_some()
    }

    /// Closes the render pass and folds its counters into the flush stats.
    pub(crate) fn end_render_pass(&mut self) {
        if let Some(pass) = self.render_pass.take() {
            let (draws_issued, failed_draws) = pass.end(&mut *self.gpu);
            self.stats.draws_issued += draws_issued;
            self.stats.failed_draws += failed_draws;
        }
    }

    /// The open render pass.
    pub fn render_pass(&self) -> Option<&OpsRenderPass> {
        self.render_pass.as_ref()
    }

    /// Binds `pipeline`, applying the current chain's scissor if the pipeline
    /// enables it. Draws are abandoned until the next bind if this fails.
    pub fn bind_pipeline_and_scissor_clip(&mut self, pipeline: &PipelineDesc, draw_bounds: Rect) {
        let scissor = self.applied_clip().and_then(|clip| clip.scissor);
        self.bind_pipeline_and_scissor_clip_with(pipeline, scissor, draw_bounds);
    }

    fn bind_pipeline_and_scissor_clip_with(
        &mut self,
        pipeline: &PipelineDesc,
        scissor: Option<IRect>,
        draw_bounds: Rect,
    ) {
        let Some(pass) = self.render_pass.as_mut() else {
            warn!("Pipeline `{}` bound outside of a render pass", pipeline.label);
            return;
        };
        if let Err(err) = pass.bind_pipeline(&mut *self.gpu, pipeline, scissor, draw_bounds) {
            warn!("Abandoning draws: {err}");
        }
    }

    /// Binds the textures for the current pipeline.
    pub fn bind_textures(&mut self, textures: &[ProxyId]) {
        if let Some(pass) = self.render_pass.as_mut()
            && let Err(err) = pass.bind_textures(&mut *self.gpu, textures)
        {
            warn!("Abandoning draws: {err}");
        }
    }

    /// Binds vertex, instance and index buffers.
    pub fn bind_buffers(&mut self, bindings: &BufferBindings) {
        if let Some(pass) = self.render_pass.as_mut() {
            pass.bind_buffers(&mut *self.gpu, bindings);
        }
    }

    fn issue(&mut self, call: DrawCall) {
        match self.render_pass.as_mut() {
            Some(pass) => {
                pass.draw(&mut *self.gpu, call);
            }
            None => {
                warn!("Draw issued outside of a render pass");
                self.stats.failed_draws += 1;
            }
        }
    }

    /// Draws `vertex_count` vertices.
    pub fn draw(&mut self, vertex_count: u32, base_vertex: u32) {
        self.issue(DrawCall::Draw {
            vertex_count,
            base_vertex,
        });
    }

    /// Draws `index_count` indices.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        base_index: u32,
        min_index_value: u16,
        max_index_value: u16,
        base_vertex: u32,
    ) {
        self.issue(DrawCall::Indexed {
            index_count,
            base_index,
            min_index_value,
            max_index_value,
            base_vertex,
        });
    }

    /// Draws `instance_count` instances of `vertex_count` vertices.
    pub fn draw_instanced(
        &mut self,
        instance_count: u32,
        base_instance: u32,
        vertex_count: u32,
        base_vertex: u32,
    ) {
        self.issue(DrawCall::Instanced {
            instance_count,
            base_instance,
            vertex_count,
            base_vertex,
        });
    }

    /// Draws `instance_count` instances of `index_count` indices.
    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        base_index: u32,
        instance_count: u32,
        base_instance: u32,
        base_vertex: u32,
    ) {
        self.issue(DrawCall::IndexedInstanced {
            index_count,
            base_index,
            instance_count,
            base_instance,
            base_vertex,
        });
    }

    /// Draws a repeated index pattern.
    pub fn draw_index_pattern(
        &mut self,
        pattern_index_count: u32,
        pattern_repeat_count: u32,
        max_pattern_repetitions: u32,
        pattern_vertex_count: u32,
        base_vertex: u32,
    ) {
        match self.render_pass.as_mut() {
            Some(pass) => pass.draw_index_pattern(
                &mut *self.gpu,
                pattern_index_count,
                pattern_repeat_count,
                max_pattern_repetitions,
                pattern_vertex_count,
                base_vertex,
            ),
            None => {
                warn!("Draw issued outside of a render pass");
                self.stats.failed_draws += 1;
            }
        }
    }

    /// Binds a mesh's buffers and draws it.
    pub fn draw_mesh(&mut self, mesh: &Mesh) {
        match self.render_pass.as_mut() {
            Some(pass) => pass.draw_mesh(&mut *self.gpu, mesh),
            None => {
                warn!("Draw issued outside of a render pass");
                self.stats.failed_draws += 1;
            }
        }
    }

    /// Drops every draw, upload, token and pool block, readying the state
    /// for another flush.
    pub fn reset(&mut self) {
        if !self.draws.is_empty() {
            warn!("{} recorded draws were never executed", self.draws.len());
        }
        self.vertex_pool.reset();
        self.index_pool.reset();
        self.asap_uploads.clear();
        self.inline_uploads.clear();
        self.draws.clear();
        self.tokens = TokenTracker::default();
        self.op_args = None;
        self.render_pass = None;
    }

    #[cfg(test)]
    pub(crate) fn pool_block_counts(&self) -> (usize, usize) {
        (self.vertex_pool.block_count(), self.index_pool.block_count())
    }
}
