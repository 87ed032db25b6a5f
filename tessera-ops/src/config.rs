//! Tunables for op scheduling and flush-time buffer pools.

/// Configuration for an [`OpsTask`](crate::OpsTask).
///
/// # Examples
///
/// ```
/// use tessera_ops::OpsTaskConfig;
///
/// let config = OpsTaskConfig {
///     max_chain_distance: 4,
///     ..Default::default()
/// };
/// assert_eq!(config.max_merge_distance, 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpsTaskConfig {
    /// How many ops of an existing chain are scanned (tail toward head) when
    /// trying to merge an incoming op into it.
    ///
    /// Most merges are found within the first few comparisons; the bound keeps
    /// the worst case of chain concatenation linear in this value.
    pub max_merge_distance: usize,
    /// How many chains are visited when searching backward for a chain to
    /// join on record, and forward for a chain to prepend into on close.
    pub max_chain_distance: usize,
    /// Validate chain linkage, bounds and metadata after every mutation.
    ///
    /// Violations are logged and trip a debug assertion.
    pub validate_chains: bool,
}

impl Default for OpsTaskConfig {
    fn default() -> Self {
        Self {
            max_merge_distance: 10,
            max_chain_distance: 10,
            validate_chains: cfg!(debug_assertions),
        }
    }
}

/// Block sizing for the vertex and index pools owned by a
/// [`FlushState`](crate::FlushState).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferPoolConfig {
    /// Minimum size in bytes of a vertex buffer block.
    pub min_vertex_block_size: usize,
    /// Minimum size in bytes of an index buffer block.
    pub min_index_block_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_vertex_block_size: 1 << 15,
            min_index_block_size: 1 << 14,
        }
    }
}
