//! Two-tier bind-result cache.
//!
//! The core tier is process-wide and keyed purely by structural
//! [`BindSignature`]; every binder instance shares it. The contextual tier
//! is scoped to one binder and assumes a single writer at a time, but its
//! lock makes it safe to read from background passes. Failures are cached
//! exactly like successes so repeated negative lookups stay cheap.
use crate::{
    error::FailureReason,
    signature::BindSignature,
    types::{MethodDescription, TypeDescription},
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, OnceLock},
};

/// Structural description of a successful method bind. Not bound to any
/// live arguments; materialized against the current call site on each hit.
#[derive(Clone)]
pub struct MethodBindData {
    pub declaring: TypeDescription,
    pub method: Arc<MethodDescription>,
    /// Set when the bind went through extension-method fallback; names the
    /// type that contributed the method.
    pub via_extension: Option<TypeDescription>,
    pub type_args: Arc<[TypeDescription]>,
}

impl Debug for MethodBindData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}::{}", self.declaring, self.method.name)?;
        if let Some(ext) = &self.via_extension {
            write!(f, " (extension via {:?})", ext)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum CachedBind {
    Method(MethodBindData),
    Failure(FailureReason),
}

/// Process-wide core tier. Empty at startup; append-only during normal
/// operation; explicitly clearable for test isolation or global
/// extension-method changes.
pub struct GlobalBindCache {
    map: DashMap<BindSignature, CachedBind>,
}

static GLOBAL: OnceLock<GlobalBindCache> = OnceLock::new();

impl GlobalBindCache {
    fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub fn global() -> &'static GlobalBindCache {
        GLOBAL.get_or_init(GlobalBindCache::new)
    }

    pub fn lookup(&self, signature: &BindSignature) -> Option<CachedBind> {
        self.map.get(signature).map(|e| e.clone())
    }

    pub fn store(&self, signature: BindSignature, result: CachedBind) {
        self.map.insert(signature, result);
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-binder contextual tier.
pub struct ContextBindCache {
    map: RwLock<HashMap<BindSignature, CachedBind>>,
}

impl ContextBindCache {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, signature: &BindSignature) -> Option<CachedBind> {
        self.map.read().get(signature).cloned()
    }

    pub fn store(&self, signature: BindSignature, result: CachedBind) {
        self.map.write().insert(signature, result);
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}

impl Default for ContextBindCache {
    fn default() -> Self {
        Self::new()
    }
}
