/*
 * Per-CPU Cell Padding
 *
 * Per-CPU state sits in arrays indexed by CPU id. Adjacent entries would
 * share cache lines and turn independent per-CPU updates into cross-CPU
 * traffic, so each entry is padded out to a line of its own.
 */

/// A value alone on its cache line.
#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }
}
