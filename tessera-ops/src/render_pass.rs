//! The backend boundary and the render pass a flush executes into.
//!
//! ## Usage
//!
//! Implement [`Gpu`] for a graphics backend. Ops never talk to it directly;
//! they bind and draw through [`FlushState`](crate::FlushState), which routes
//! every call through [`OpsRenderPass`] so failed binds are contained.

use smallvec::SmallVec;
use tracing::warn;

use crate::{
    buffer_pool::{BufferId, BufferKind},
    caps::Caps,
    draw_state::{LoadOp, XferBarrierFlags},
    error::BindError,
    rect::{IRect, Rect},
    resource::ProxyId,
};

/// The operations the scheduler needs from a graphics backend.
pub trait Gpu {
    /// Creates a buffer of `size` bytes. `None` means the backend is out of
    /// memory.
    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> Option<BufferId>;

    /// Copies staged bytes into a buffer at `offset`.
    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]);

    /// Writes pixels into a region of a surface.
    fn write_pixels(&mut self, proxy: ProxyId, region: IRect, pixels: &[u8]) -> bool;

    /// Returns true if `proxy` is backed by a real surface.
    fn is_instantiated(&self, proxy: ProxyId) -> bool;

    /// Backs `proxy` with a surface. Returns false on allocation failure.
    fn instantiate_proxy(&mut self, proxy: ProxyId) -> bool;

    /// Begins a render pass. Returns false if the target cannot be rendered.
    fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> bool;

    /// Ends the current render pass and submits it.
    fn end_render_pass(&mut self);

    /// Binds a pipeline. Returns false if the backend rejects it.
    fn bind_pipeline(
        &mut self,
        pipeline: &PipelineDesc,
        scissor: Option<IRect>,
        draw_bounds: Rect,
    ) -> bool;

    /// Binds the textures the pipeline samples.
    fn bind_textures(&mut self, textures: &[ProxyId]);

    /// Binds vertex, instance and index buffers.
    fn bind_buffers(&mut self, bindings: &BufferBindings);

    /// Issues one draw with the bound state.
    fn draw(&mut self, call: DrawCall);
}

/// Everything the backend needs to open the render pass for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    /// Target surface.
    pub target: ProxyId,
    /// Region that will be touched.
    pub bounds: IRect,
    /// What happens to existing color contents.
    pub color_load_op: LoadOp,
    /// Clear color used with [`LoadOp::Clear`].
    pub clear_color: [f32; 4],
    /// Whether any op needs multisampling.
    pub uses_msaa: bool,
    /// Barriers that may be issued between draws.
    pub xfer_barriers: XferBarrierFlags,
    /// Textures sampled during the pass.
    pub sampled_proxies: Vec<ProxyId>,
}

/// Primitive topology of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    /// Independent triangles.
    #[default]
    Triangles,
    /// A triangle strip.
    TriangleStrip,
    /// Independent lines.
    Lines,
    /// Points.
    Points,
}

/// The backend-opaque description of a pipeline an op draws with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDesc {
    /// Name used in logs.
    pub label: &'static str,
    /// Backend-specific program key.
    pub program_key: u64,
    /// Per-vertex attributes.
    pub vertex_attribute_count: u32,
    /// Per-instance attributes.
    pub instance_attribute_count: u32,
    /// Topology.
    pub primitive: PrimitiveType,
    /// Whether the clip's scissor applies.
    pub scissor_enabled: bool,
}

impl PipelineDesc {
    /// Creates a triangle pipeline without attributes.
    pub fn new(label: &'static str, program_key: u64) -> Self {
        Self {
            label,
            program_key,
            vertex_attribute_count: 0,
            instance_attribute_count: 0,
            primitive: PrimitiveType::Triangles,
            scissor_enabled: false,
        }
    }
}

/// Buffers bound before a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferBindings {
    /// Index buffer.
    pub index: Option<BufferId>,
    /// Per-instance data.
    pub instance: Option<BufferId>,
    /// Per-vertex data.
    pub vertex: Option<BufferId>,
}

/// A single draw call as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    /// Non-indexed draw.
    Draw {
        /// Vertices drawn.
        vertex_count: u32,
        /// First vertex.
        base_vertex: u32,
    },
    /// Indexed draw.
    Indexed {
        /// Indices drawn.
        index_count: u32,
        /// First index.
        base_index: u32,
        /// Smallest index value referenced.
        min_index_value: u16,
        /// Largest index value referenced.
        max_index_value: u16,
        /// Added to every index.
        base_vertex: u32,
    },
    /// Instanced draw.
    Instanced {
        /// Instances drawn.
        instance_count: u32,
        /// First instance.
        base_instance: u32,
        /// Vertices per instance.
        vertex_count: u32,
        /// First vertex.
        base_vertex: u32,
    },
    /// Indexed instanced draw.
    IndexedInstanced {
        /// Indices per instance.
        index_count: u32,
        /// First index.
        base_index: u32,
        /// Instances drawn.
        instance_count: u32,
        /// First instance.
        base_instance: u32,
        /// Added to every index.
        base_vertex: u32,
    },
}

/// Geometry for one draw, recorded during prepare and replayed on execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mesh {
    /// Plain vertices.
    NonIndexed {
        /// Vertex buffer.
        vertex_buffer: Option<BufferId>,
        /// Vertices drawn.
        vertex_count: u32,
        /// First vertex.
        base_vertex: u32,
    },
    /// Indexed vertices.
    Indexed {
        /// Index buffer.
        index_buffer: BufferId,
        /// Vertex buffer.
        vertex_buffer: Option<BufferId>,
        /// Indices drawn.
        index_count: u32,
        /// First index.
        base_index: u32,
        /// Smallest index value referenced.
        min_index_value: u16,
        /// Largest index value referenced.
        max_index_value: u16,
        /// Added to every index.
        base_vertex: u32,
    },
    /// Instanced vertices.
    Instanced {
        /// Per-instance data.
        instance_buffer: BufferId,
        /// Vertex buffer.
        vertex_buffer: Option<BufferId>,
        /// Instances drawn.
        instance_count: u32,
        /// First instance.
        base_instance: u32,
        /// Vertices per instance.
        vertex_count: u32,
        /// First vertex.
        base_vertex: u32,
    },
    /// A shared index pattern repeated over consecutive vertex runs, such as
    /// a quad's six indices over its four vertices.
    IndexPattern {
        /// Index buffer holding the pattern repeated
        /// `max_pattern_repetitions` times.
        index_buffer: BufferId,
        /// Vertex buffer.
        vertex_buffer: Option<BufferId>,
        /// How many times the pattern is drawn.
        pattern_repeat_count: u32,
        /// Repetitions present in the index buffer.
        max_pattern_repetitions: u32,
        /// Vertices consumed per repetition.
        vertex_count_per_pattern: u32,
        /// Indices per repetition.
        index_count_per_pattern: u32,
        /// First vertex.
        base_vertex: u32,
    },
}

/// Whether draws may be issued right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineStatus {
    NotConfigured,
    Ok,
    FailedToBind,
}

/// The render pass a flush executes into.
///
/// Tracks the bind status: after a failed bind every draw until the next
/// bind is abandoned and counted.
#[derive(Debug)]
pub struct OpsRenderPass {
    desc: RenderPassDesc,
    caps: Caps,
    status: PipelineStatus,
    pipeline_label: &'static str,
    draws_issued: u32,
    failed_draws: u32,
}

impl OpsRenderPass {
    /// Opens a pass on `gpu`. Returns `None` if the backend refuses.
    pub(crate) fn begin(gpu: &mut dyn Gpu, caps: Caps, desc: RenderPassDesc) -> Option<Self> {
        if !gpu.begin_render_pass(&desc) {
            return None;
        }
        Some(Self {
            desc,
            caps,
            status: PipelineStatus::NotConfigured,
            pipeline_label: "",
            draws_issued: 0,
            failed_draws: 0,
        })
    }

    /// Closes the pass.
    pub(crate) fn end(self, gpu: &mut dyn Gpu) -> (u32, u32) {
        gpu.end_render_pass();
        (self.draws_issued, self.failed_draws)
    }

    /// The pass description.
    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    /// Draws that reached the backend.
    pub fn draws_issued(&self) -> u32 {
        self.draws_issued
    }

    /// Draws abandoned because no pipeline was bound.
    pub fn failed_draws(&self) -> u32 {
        self.failed_draws
    }

    pub(crate) fn bind_pipeline(
        &mut self,
        gpu: &mut dyn Gpu,
        pipeline: &PipelineDesc,
        scissor: Option<IRect>,
        draw_bounds: Rect,
    ) -> Result<(), BindError> {
        self.status = PipelineStatus::FailedToBind;
        self.pipeline_label = pipeline.label;
        let requested = pipeline.vertex_attribute_count + pipeline.instance_attribute_count;
        if requested > self.caps.max_vertex_attributes {
            return Err(BindError::TooManyVertexAttributes {
                label: pipeline.label,
                requested,
                max: self.caps.max_vertex_attributes,
            });
        }
        let scissor = if pipeline.scissor_enabled {
            scissor
        } else {
            None
        };
        if !gpu.bind_pipeline(pipeline, scissor, draw_bounds) {
            return Err(BindError::Rejected {
                label: pipeline.label,
            });
        }
        self.status = PipelineStatus::Ok;
        Ok(())
    }

    pub(crate) fn bind_textures(
        &mut self,
        gpu: &mut dyn Gpu,
        textures: &[ProxyId],
    ) -> Result<(), BindError> {
        if self.status != PipelineStatus::Ok {
            return Ok(());
        }
        if let Some(missing) = textures.iter().find(|proxy| !gpu.is_instantiated(**proxy)) {
            self.status = PipelineStatus::FailedToBind;
            return Err(BindError::MissingTexture(*missing));
        }
        gpu.bind_textures(textures);
        Ok(())
    }

    pub(crate) fn bind_buffers(&mut self, gpu: &mut dyn Gpu, bindings: &BufferBindings) {
        if self.status == PipelineStatus::Ok {
            gpu.bind_buffers(bindings);
        }
    }

    /// Issues `call` if the pipeline is bound; otherwise counts it as failed.
    pub(crate) fn draw(&mut self, gpu: &mut dyn Gpu, call: DrawCall) -> bool {
        if self.status != PipelineStatus::Ok {
            if self.status == PipelineStatus::NotConfigured {
                warn!("Draw issued before any pipeline was bound");
            }
            self.failed_draws += 1;
            return false;
        }
        gpu.draw(call);
        self.draws_issued += 1;
        true
    }

    /// Draws `pattern_repeat_count` copies of an index pattern.
    ///
    /// The copies are split into indexed draws of at most
    /// `max_pattern_repetitions` copies, each offset to the vertices of its
    /// first copy. Each copy has its own vertices, so copies are never drawn
    /// as instances.
    pub(crate) fn draw_index_pattern(
        &mut self,
        gpu: &mut dyn Gpu,
        pattern_index_count: u32,
        pattern_repeat_count: u32,
        max_pattern_repetitions: u32,
        pattern_vertex_count: u32,
        base_vertex: u32,
    ) {
        let max_pattern_repetitions = max_pattern_repetitions.max(1);
        let mut base_repetition = 0;
        while base_repetition < pattern_repeat_count {
            let repeat_count =
                (pattern_repeat_count - base_repetition).min(max_pattern_repetitions);
            let max_index_value =
                repeat_count.saturating_mul(pattern_vertex_count).saturating_sub(1);
            self.draw(
                gpu,
                DrawCall::Indexed {
                    index_count: repeat_count.saturating_mul(pattern_index_count),
                    base_index: 0,
                    min_index_value: 0,
                    max_index_value: u16::try_from(max_index_value).unwrap_or(u16::MAX),
                    base_vertex: base_vertex
                        .saturating_add(pattern_vertex_count.saturating_mul(base_repetition)),
                },
            );
            base_repetition += repeat_count;
        }
    }

    /// Binds a mesh's buffers and draws it.
    pub(crate) fn draw_mesh(&mut self, gpu: &mut dyn Gpu, mesh: &Mesh) {
        match *mesh {
            Mesh::NonIndexed {
                vertex_buffer,
                vertex_count,
                base_vertex,
            } => {
                self.bind_buffers(
                    gpu,
                    &BufferBindings {
                        vertex: vertex_buffer,
                        ..Default::default()
                    },
                );
                self.draw(
                    gpu,
                    DrawCall::Draw {
                        vertex_count,
                        base_vertex,
                    },
                );
            }
            Mesh::Indexed {
                index_buffer,
                vertex_buffer,
                index_count,
                base_index,
                min_index_value,
                max_index_value,
                base_vertex,
            } => {
                self.bind_buffers(
                    gpu,
                    &BufferBindings {
                        index: Some(index_buffer),
                        vertex: vertex_buffer,
                        ..Default::default()
                    },
                );
                self.draw(
                    gpu,
                    DrawCall::Indexed {
                        index_count,
                        base_index,
                        min_index_value,
                        max_index_value,
                        base_vertex,
                    },
                );
            }
            Mesh::Instanced {
                instance_buffer,
                vertex_buffer,
                instance_count,
                base_instance,
                vertex_count,
                base_vertex,
            } => {
                self.bind_buffers(
                    gpu,
                    &BufferBindings {
                        instance: Some(instance_buffer),
                        vertex: vertex_buffer,
                        ..Default::default()
                    },
                );
                self.draw(
                    gpu,
                    DrawCall::Instanced {
                        instance_count,
                        base_instance,
                        vertex_count,
                        base_vertex,
                    },
                );
            }
            Mesh::IndexPattern {
                index_buffer,
                vertex_buffer,
                pattern_repeat_count,
                max_pattern_repetitions,
                vertex_count_per_pattern,
                index_count_per_pattern,
                base_vertex,
            } => {
                self.bind_buffers(
                    gpu,
                    &BufferBindings {
                        index: Some(index_buffer),
                        vertex: vertex_buffer,
                        ..Default::default()
                    },
                );
                self.draw_index_pattern(
                    gpu,
                    index_count_per_pattern,
                    pattern_repeat_count,
                    max_pattern_repetitions,
                    vertex_count_per_pattern,
                    base_vertex,
                );
            }
        }
    }
}

/// Collected texture list for a draw.
pub type TextureList = SmallVec<[ProxyId; 4]>;
