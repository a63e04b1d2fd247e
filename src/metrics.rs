use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Serialize, Clone, Copy)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStat {
    fn new(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        Self {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

impl std::fmt::Display for CacheStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits: {:>8}, misses: {:>8}, hit_rate: {:>6.2}%",
            self.hits,
            self.misses,
            self.hit_rate * 100.0
        )
    }
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct BindStats {
    pub structural_resolutions: u64,
    pub core_cache: CacheStat,
    pub contextual_cache: CacheStat,
    pub identity_cache: CacheStat,
    pub name_cache_recomputes: u64,
    pub weak_compactions: u64,
}

impl std::fmt::Display for BindStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Bind Statistics:")?;
        writeln!(
            f,
            "  Structural Resolutions: {}",
            self.structural_resolutions
        )?;
        writeln!(f, "  Core Bind Cache:        {}", self.core_cache)?;
        writeln!(f, "  Contextual Bind Cache:  {}", self.contextual_cache)?;
        writeln!(f, "  Identity Cache:         {}", self.identity_cache)?;
        writeln!(f, "  Name Cache Recomputes:  {}", self.name_cache_recomputes)?;
        writeln!(f, "  Weak Compactions:       {}", self.weak_compactions)?;
        Ok(())
    }
}

/// Binding counters.
///
/// All counters use `Ordering::Relaxed` because they are independent and do
/// not synchronize memory between threads. We only care that they are
/// updated atomically, not when those updates become visible relative to
/// other memory operations.
#[derive(Debug, Default)]
pub struct BindMetrics {
    structural_resolutions: AtomicU64,
    core_hits: AtomicU64,
    core_misses: AtomicU64,
    contextual_hits: AtomicU64,
    contextual_misses: AtomicU64,
    identity_hits: AtomicU64,
    identity_misses: AtomicU64,
    name_cache_recomputes: AtomicU64,
    weak_compactions: AtomicU64,
}

impl BindMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_structural_resolution(&self) {
        self.structural_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_core_hit(&self) {
        self.core_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_core_miss(&self) {
        self.core_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contextual_hit(&self) {
        self.contextual_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contextual_miss(&self) {
        self.contextual_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_hit(&self) {
        self.identity_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_miss(&self) {
        self.identity_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_name_cache_recompute(&self) {
        self.name_cache_recomputes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_weak_compaction(&self) {
        self.weak_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn structural_resolutions(&self) -> u64 {
        self.structural_resolutions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BindStats {
        BindStats {
            structural_resolutions: self.structural_resolutions.load(Ordering::Relaxed),
            core_cache: CacheStat::new(
                self.core_hits.load(Ordering::Relaxed),
                self.core_misses.load(Ordering::Relaxed),
            ),
            contextual_cache: CacheStat::new(
                self.contextual_hits.load(Ordering::Relaxed),
                self.contextual_misses.load(Ordering::Relaxed),
            ),
            identity_cache: CacheStat::new(
                self.identity_hits.load(Ordering::Relaxed),
                self.identity_misses.load(Ordering::Relaxed),
            ),
            name_cache_recomputes: self.name_cache_recomputes.load(Ordering::Relaxed),
            weak_compactions: self.weak_compactions.load(Ordering::Relaxed),
        }
    }
}
