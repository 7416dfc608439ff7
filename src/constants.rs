//! Runtime tuning constants.

/// Maximum call depth.
pub const MAX_FRAMES: usize = 64;

/// Operand stack capacity, in value slots.
pub const STACK_SIZE: usize = MAX_FRAMES * 256;

/// Constant-pool indexes must fit in one operand byte.
pub const MAX_PUSH_CONSTANT: usize = 256;

/// Heap bytes allocated before the first collection.
pub const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Threshold multiplier applied after each collection.
pub const GC_GROW_FACTOR: usize = 2;
