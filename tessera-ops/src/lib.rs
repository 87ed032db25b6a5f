//! tessera-ops records GPU draw operations for render targets, batches them
//! and flushes them through a backend in two phases.
//!
//! # Recording
//!
//! Each render target gets an [`OpsTask`]. Ops implement the [`Op`] trait and
//! are recorded with [`OpsTask::add_draw_op`]. A new op is first offered to
//! recent chains: it may merge into an existing op, join a chain as a
//! follower, or start a new chain. The scheduler never moves an op past one
//! it overlaps, so the painter's order of overlapping draws is preserved.
//!
//! ```
//! use tessera_ops::{
//!     Caps, DrawOpArgs, Op, OpsTask, OpsTaskConfig, ProxyId, Rect, RenderTarget,
//! };
//!
//! struct Fill(Rect);
//!
//! impl Op for Fill {
//!     fn name(&self) -> &'static str {
//!         "Fill"
//!     }
//!
//!     fn bounds(&self) -> Rect {
//!         self.0
//!     }
//!
//!     fn execute(
//!         &mut self,
//!         _state: &mut tessera_ops::FlushState<'_>,
//!         _chained: tessera_ops::ChainOps<'_>,
//!         _chain_bounds: Rect,
//!     ) {
//!     }
//! }
//!
//! let target = RenderTarget::new(ProxyId(1), 64, 64);
//! let mut task = OpsTask::new(target, Caps::default(), OpsTaskConfig::default());
//! task.add_draw_op(
//!     Box::new(Fill(Rect::from_ltrb(0.0, 0.0, 8.0, 8.0))),
//!     DrawOpArgs::default(),
//! );
//! task.close();
//! assert_eq!(task.chain_count(), 1);
//! ```
//!
//! # Flushing
//!
//! A flush runs in two phases over a shared [`FlushState`]. During prepare,
//! each chain head allocates vertex and index space, registers texture uploads
//! and records its draws. During execute, the heads replay those draws inside
//! one render pass per target, with each upload running right before the
//! first draw that needs it. A chain whose prepare fails, or that reads a
//! surface that could not be allocated, is skipped without affecting the
//! others.
#![deny(missing_docs, clippy::unwrap_used)]

mod buffer_pool;
pub mod caps;
pub mod config;
pub mod draw_state;
pub mod error;
pub mod flush_state;
pub mod mask;
pub mod op;
pub mod op_chain;
pub mod ops_task;
pub mod rect;
pub mod render_pass;
pub mod resource;

pub use crate::{
    buffer_pool::{BufferId, BufferKind, IndexSpace, VertexSpace},
    caps::Caps,
    config::{BufferPoolConfig, OpsTaskConfig},
    draw_state::{
        AppliedClip, ClipCoverage, DrawOpArgs, DstProxyView, DstSampleFlags, LoadOp,
        ProcessorAnalysis, XferBarrierFlags,
    },
    error::{AllocError, BindError, ChainInvariantError, FlushError, PrepareError},
    flush_state::{
        DeferredUpload, DeferredUploadToken, FlushState, FlushStats, OpArgs, WritePixels,
    },
    mask::PendingMask,
    op::{ChainOps, ClassId, CombineResult, Op, OpId},
    op_chain::{OpArena, OpChain, OpKey, OpList},
    ops_task::{
        ChainView, ExpectedOutcome, FlushPhase, FlushReport, OpsTask, RecordStats, RenderTarget,
    },
    rect::{IRect, Rect, can_reorder},
    render_pass::{
        BufferBindings, DrawCall, Gpu, Mesh, OpsRenderPass, PipelineDesc, PrimitiveType,
        RenderPassDesc, TextureList,
    },
    resource::{ActualUse, AllowRecycling, Interval, ProxyId, ResourceAllocator},
};

#[cfg(test)]
mod test;
