//! Per-draw state that decides whether two chains may be joined.
//!
//! ## Usage
//!
//! Build a [`DrawOpArgs`] for each draw op and pass it to
//! [`OpsTask::add_draw_op`](crate::OpsTask::add_draw_op).

use std::ops::BitOrAssign;

use smallvec::SmallVec;

use crate::{rect::IRect, resource::ProxyId};

/// Summary of the processors (color/coverage stages and blending) a draw uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorAnalysis {
    /// The draw reads the destination through a copy of the target.
    pub requires_dst_texture: bool,
    /// Draws sharing a chain must not overlap, because a barrier or a fresh
    /// destination copy is needed between them.
    pub requires_non_overlapping_draws: bool,
    /// Blending relies on non-coherent hardware advanced blend equations.
    pub uses_non_coherent_hw_blending: bool,
}

impl ProcessorAnalysis {
    /// Analysis of a draw with no processors.
    pub const EMPTY: Self = Self {
        requires_dst_texture: false,
        requires_non_overlapping_draws: false,
        uses_non_coherent_hw_blending: false,
    };
}

/// A clip coverage stage and the mask surfaces it samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipCoverage {
    /// Identity of the coverage stage; equal ids produce equal coverage.
    pub id: u32,
    /// Mask surfaces read by the stage.
    pub proxies: SmallVec<[ProxyId; 2]>,
}

/// The clip state applied to a draw.
///
/// Two chains can only be joined if their clips compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppliedClip {
    /// Hardware scissor rectangle.
    pub scissor: Option<IRect>,
    /// Stencil clip generation, if the stencil buffer holds a clip.
    pub stencil_clip: Option<u32>,
    /// Window rectangles excluded from rendering.
    pub window_rects: SmallVec<[IRect; 1]>,
    /// Fragment coverage stage.
    pub coverage: Option<ClipCoverage>,
}

impl AppliedClip {
    /// Creates a clip that only scissors.
    #[must_use]
    pub fn scissor(rect: IRect) -> Self {
        Self {
            scissor: Some(rect),
            ..Default::default()
        }
    }

    /// Returns true if the clip restricts rendering at all.
    #[must_use]
    pub fn does_clip(&self) -> bool {
        self.scissor.is_some()
            || self.stencil_clip.is_some()
            || !self.window_rects.is_empty()
            || self.coverage.is_some()
    }

    /// Returns true if a coverage stage is attached.
    #[must_use]
    pub fn has_coverage_fragment_processor(&self) -> bool {
        self.coverage.is_some()
    }

    /// Removes and returns the coverage stage.
    pub fn detach_coverage_fragment_processor(&mut self) -> Option<ClipCoverage> {
        self.coverage.take()
    }

    /// Visits every surface the clip samples.
    pub fn visit_proxies(&self, visitor: &mut dyn FnMut(ProxyId)) {
        if let Some(coverage) = &self.coverage {
            for proxy in &coverage.proxies {
                visitor(*proxy);
            }
        }
    }
}

/// How a draw reads its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DstSampleFlags {
    /// A texture barrier must be issued before the draw.
    pub requires_texture_barrier: bool,
    /// The destination is read as an input attachment rather than sampled.
    pub as_input_attachment: bool,
}

/// The destination copy a draw reads from, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DstProxyView {
    /// Surface holding the destination copy.
    pub proxy: Option<ProxyId>,
    /// Offset of the copy within the target.
    pub offset: [i32; 2],
    /// How the copy is read.
    pub flags: DstSampleFlags,
}

impl DstProxyView {
    /// Creates a view onto `proxy` at `offset`.
    #[must_use]
    pub fn new(proxy: ProxyId, offset: [i32; 2], flags: DstSampleFlags) -> Self {
        Self {
            proxy: Some(proxy),
            offset,
            flags,
        }
    }
}

/// Barriers a render pass must be able to issue between draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XferBarrierFlags {
    /// Texture barriers for reading the destination.
    pub texture: bool,
    /// Blend barriers for non-coherent advanced blending.
    pub blend: bool,
}

impl XferBarrierFlags {
    /// No barriers.
    pub const NONE: Self = Self {
        texture: false,
        blend: false,
    };
}

impl BitOrAssign for XferBarrierFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.texture |= rhs.texture;
        self.blend |= rhs.blend;
    }
}

/// What happens to the target's color contents when the render pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    /// Keep existing contents.
    #[default]
    Load,
    /// Clear to the task's clear color.
    Clear,
    /// Contents are undefined.
    Discard,
}

/// Everything recorded alongside a draw op.
#[derive(Debug, Clone, Default)]
pub struct DrawOpArgs {
    /// The draw wants multisampling.
    pub uses_msaa: bool,
    /// Processor analysis for the draw.
    pub processor_analysis: ProcessorAnalysis,
    /// Clip applied to the draw; ignored unless it actually clips.
    pub clip: Option<AppliedClip>,
    /// Destination copy, required iff the analysis requires a dst texture.
    pub dst_proxy_view: DstProxyView,
}
