// ============================================================================
// Engine configuration
// ============================================================================

/// Ambient tuning knobs for an `Engine` instance. Construct with `Default`
/// and override individual fields; there is no environment/file loading
/// here — config loading is a seam an embedding application owns.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on `postPersist`/`postUpdate`/`postFlush` re-entrancy loops
    /// (§4.5, §9). Exceeding it surfaces `OrmError::State` instead of
    /// looping forever.
    pub max_flush_iterations: u32,

    /// Maximum relation-eager-load recursion depth during hydration (§4.6).
    pub max_hydration_depth: u32,

    /// Whether `flush()` opens and commits its own transaction, versus
    /// assuming the caller already has one open.
    pub owns_transaction: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_flush_iterations: 16,
            max_hydration_depth: 3,
            owns_transaction: true,
        }
    }
}
