//! VM configuration
//!
//! Mirrors the shape of the teacher's standalone config crate (serde +
//! `toml`), but scoped to the handful of tunables the spec actually names:
//! frame/stack limits, the GC growth heuristic, and the debug-only
//! stress/log flags. Callers embedding the VM as a library never need to
//! touch this — `VmConfig::default()` matches the spec's defaults exactly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum depth of the call-frame stack.
    pub frames_max: usize,
    /// Value-stack slots reserved per frame.
    pub stack_slots_per_frame: usize,
    /// Deepest nesting of `while`/`each` loops the compiler will accept.
    pub max_loop_nesting: usize,
    /// Multiplier applied to `bytes_allocated` after each collection to
    /// compute the next collection threshold.
    pub heap_growth_factor: f64,
    /// Initial `next_gc` threshold in bytes, before any collection has run.
    pub initial_gc_threshold: usize,
    /// Collect on every allocation (debug aid, exposes collector bugs that
    /// only manifest under memory pressure).
    pub stress_gc: bool,
    /// Log every mark/sweep to stderr (debug aid).
    pub log_gc: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frames_max: 64,
            stack_slots_per_frame: 256,
            max_loop_nesting: 64,
            heap_growth_factor: 2.0,
            initial_gc_threshold: 1024 * 1024,
            stress_gc: false,
            log_gc: false,
        }
    }
}

impl VmConfig {
    /// Loads overrides from a `trilox.toml`-shaped document, falling back
    /// to defaults for any field the document omits.
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn stack_capacity(&self) -> usize {
        self.frames_max * self.stack_slots_per_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.frames_max, 64);
        assert_eq!(cfg.stack_slots_per_frame, 256);
        assert_eq!(cfg.max_loop_nesting, 64);
        assert_eq!(cfg.heap_growth_factor, 2.0);
        assert_eq!(cfg.initial_gc_threshold, 1024 * 1024);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = VmConfig::from_toml("stress_gc = true\n").unwrap();
        assert!(cfg.stress_gc);
        assert_eq!(cfg.frames_max, 64);
    }
}
