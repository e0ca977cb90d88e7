//! Finalization and debugging configuration

/// Hook invoked once when a registry entry cannot be allocated.
///
/// Receives the number of bytes that were requested and returns `true` if it
/// released memory and the allocation should be retried.
pub type OomHook = fn(usize) -> bool;

/// Finalization configuration
#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    /// Never run finalizers implicitly after a collection; fire the
    /// registered notifier instead (default: false)
    pub finalize_on_demand: bool,
    /// Java-style finalization: objects queued for finalization are not
    /// marked until the "no order" and "unreachable" passes ran (default: false)
    pub java_finalization: bool,
    /// Leak-finding mode: the collector reports unreachable debug objects
    /// that were never freed (default: false)
    pub find_leak: bool,
    /// In leak-finding mode, keep freed debug objects poisoned instead of
    /// releasing them so that writes after free are detected (default: false)
    pub findleak_delay_free: bool,
    /// Record back pointers in debug headers while marking (default: false)
    pub keep_back_ptrs: bool,
    /// Number of random backtraces printed after each collection when back
    /// pointers are kept (default: 0)
    pub backtraces: usize,
    /// Log table growth and per-pass finalization statistics (default: false)
    pub print_stats: bool,
    /// Last-resort recovery hook for registry allocation failures
    pub oom_hook: Option<OomHook>,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            finalize_on_demand: false,
            java_finalization: false,
            find_leak: false,
            findleak_delay_free: false,
            keep_back_ptrs: false,
            backtraces: 0,
            print_stats: false,
            oom_hook: None,
        }
    }
}

impl FinalizeConfig {
    /// Build a configuration from the `GC_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// Boolean variables are enabled by any value other than `0`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| match lookup(key) {
            Some(value) => value.trim() != "0",
            None => default,
        };

        let defaults = Self::default();
        let backtraces = lookup("GC_BACKTRACES")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.backtraces);
        let keep_back_ptrs = flag("GC_KEEP_BACK_PTRS", defaults.keep_back_ptrs);

        Self {
            finalize_on_demand: flag("GC_FINALIZE_ON_DEMAND", defaults.finalize_on_demand),
            java_finalization: flag("GC_JAVA_FINALIZATION", defaults.java_finalization),
            find_leak: flag("GC_FIND_LEAK", defaults.find_leak),
            findleak_delay_free: flag("GC_FINDLEAK_DELAY_FREE", defaults.findleak_delay_free),
            // Backtraces are generated from back pointers.
            keep_back_ptrs: keep_back_ptrs || backtraces > 0,
            backtraces,
            print_stats: flag("GC_PRINT_STATS", defaults.print_stats),
            oom_hook: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FinalizeConfig::default();
        assert!(!config.finalize_on_demand);
        assert!(!config.java_finalization);
        assert_eq!(config.backtraces, 0);
        assert!(config.oom_hook.is_none());
    }

    #[test]
    fn test_from_lookup_flags() {
        let config = FinalizeConfig::from_lookup(lookup_from(&[
            ("GC_FINALIZE_ON_DEMAND", "1"),
            ("GC_JAVA_FINALIZATION", "yes"),
            ("GC_FIND_LEAK", "0"),
        ]));
        assert!(config.finalize_on_demand);
        assert!(config.java_finalization);
        assert!(!config.find_leak);
        assert!(!config.print_stats);
    }

    #[test]
    fn test_backtraces_imply_back_pointers() {
        let config = FinalizeConfig::from_lookup(lookup_from(&[("GC_BACKTRACES", "3")]));
        assert_eq!(config.backtraces, 3);
        assert!(config.keep_back_ptrs);

        let config = FinalizeConfig::from_lookup(lookup_from(&[("GC_BACKTRACES", "many")]));
        assert_eq!(config.backtraces, 0);
        assert!(!config.keep_back_ptrs);
    }
}
