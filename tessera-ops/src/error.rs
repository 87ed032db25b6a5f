//! Error types for recording, preparing and executing op chains.

use thiserror::Error;

use crate::{buffer_pool::BufferKind, op::OpId, resource::ProxyId};

/// Failure to obtain GPU-visible buffer space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The backend refused to create a buffer block.
    #[error("backend could not create a {kind:?} buffer of {size} bytes")]
    BufferCreation {
        /// Buffer usage.
        kind: BufferKind,
        /// Requested block size in bytes.
        size: usize,
    },
    /// The request itself is unusable (zero-sized element or overflow).
    #[error("invalid {kind:?} space request: {count} elements of {element_size} bytes")]
    InvalidRequest {
        /// Buffer usage.
        kind: BufferKind,
        /// Element size in bytes.
        element_size: usize,
        /// Element count.
        count: usize,
    },
}

/// Failure of an op's prepare step.
///
/// Localized to the chain that produced it: the chain is marked skip-execute
/// and the flush continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PrepareError {
    /// Buffer space could not be allocated.
    #[error(transparent)]
    Allocation(#[from] AllocError),
    /// A surface the op reads was never instantiated.
    #[error("surface {0:?} is not instantiated")]
    Uninstantiated(ProxyId),
    /// An asynchronously produced mask was never delivered.
    #[error("mask for surface {0:?} was not produced")]
    MaskUnavailable(ProxyId),
}

/// Failure to bind a pipeline for a draw.
///
/// Only the draws issued under that pipeline are abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// The pipeline uses more attributes than the backend supports.
    #[error("pipeline `{label}` uses {requested} vertex attributes, the limit is {max}")]
    TooManyVertexAttributes {
        /// Pipeline label.
        label: &'static str,
        /// Attributes requested.
        requested: u32,
        /// Backend maximum.
        max: u32,
    },
    /// The backend rejected the pipeline.
    #[error("backend rejected pipeline `{label}`")]
    Rejected {
        /// Pipeline label.
        label: &'static str,
    },
    /// A texture bound to the pipeline is not instantiated.
    #[error("texture {0:?} is not instantiated")]
    MissingTexture(ProxyId),
}

/// Task-level flush misuse or backend unavailability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError {
    /// The task must be closed before it can be prepared.
    #[error("ops task must be closed before it is flushed")]
    NotClosed,
    /// A flush step was called out of order.
    #[error("cannot {action} while the task is {phase:?}")]
    OutOfOrder {
        /// The attempted step.
        action: &'static str,
        /// The phase the task was in.
        phase: crate::ops_task::FlushPhase,
    },
    /// The backend could not begin a render pass for the target.
    #[error("backend could not begin a render pass for target {0:?}")]
    RenderPassUnavailable(ProxyId),
}

/// A broken chain invariant found by validation.
///
/// These indicate a logic error in the scheduler or in a caller's
/// compatibility metadata; they are never recovered from at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainInvariantError {
    /// A chain in the task holds no ops.
    #[error("chain {0} is empty")]
    EmptyChain(usize),
    /// A node's neighbor does not link back to it.
    #[error("op {op:?} and its neighbor disagree about their link")]
    BrokenLink {
        /// The op whose link is inconsistent.
        op: OpId,
    },
    /// Walking from the head did not end at the recorded tail.
    #[error("chain walk ended at {found:?} instead of the recorded tail {expected:?}")]
    TailMismatch {
        /// The recorded tail.
        expected: Option<OpId>,
        /// Where the walk ended.
        found: Option<OpId>,
    },
    /// The head has a predecessor or the walk revisits a node.
    #[error("chain starting at {head:?} is not a simple list")]
    Cycle {
        /// The chain head.
        head: OpId,
    },
    /// An op reaches outside its chain's bounds.
    #[error("op {op:?} lies outside its chain bounds")]
    BoundsNotConservative {
        /// The offending op.
        op: OpId,
    },
    /// Ops in one chain have different classes.
    #[error("op {op:?} does not share its chain head's class")]
    MixedClasses {
        /// The offending op.
        op: OpId,
    },
    /// A dst-texture requirement and the presence of a dst proxy disagree.
    #[error("chain {0} dst texture requirement does not match its dst proxy")]
    DstProxyMismatch(usize),
}
