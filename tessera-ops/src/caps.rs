//! Backend capabilities consulted while combining ops and binding pipelines.

/// A snapshot of what the backend can do.
///
/// Ops read it when deciding whether two draws can be combined; the render
/// pass reads it when validating pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Caps {
    /// Maximum number of vertex plus instance attributes a pipeline may use.
    pub max_vertex_attributes: u32,
    /// Whether instanced draws may start at a non-zero base instance.
    pub base_instance_support: bool,
    /// Whether single-sample targets can be rendered with dynamic MSAA.
    pub dynamic_msaa_support: bool,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            max_vertex_attributes: 16,
            base_instance_support: true,
            dynamic_msaa_support: false,
        }
    }
}
