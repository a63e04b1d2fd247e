//! Process-scoped extension-method registry.
//!
//! Extension methods are static methods whose declaring type has been
//! registered here; the binder treats them as instance methods on their
//! first parameter's type during fallback resolution. The registry carries
//! an opaque version token that changes on every mutation, which is how
//! member-name caches know to recompute.
use crate::types::{MethodDescription, TypeDescription};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

pub struct ExtensionRegistry {
    types: RwLock<Vec<TypeDescription>>,
    version: AtomicU64,
}

static GLOBAL: OnceLock<ExtensionRegistry> = OnceLock::new();

impl ExtensionRegistry {
    fn new() -> Self {
        Self {
            types: RwLock::new(vec![]),
            version: AtomicU64::new(0),
        }
    }

    /// The process-wide registry. Empty at startup; cleared explicitly via
    /// [`ExtensionRegistry::clear`] (e.g. for test isolation).
    pub fn global() -> &'static ExtensionRegistry {
        GLOBAL.get_or_init(ExtensionRegistry::new)
    }

    /// Opaque version token; changes whenever the registered set changes.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn register(&self, ty: TypeDescription) {
        let mut types = self.types.write();
        if !types.contains(&ty) {
            types.push(ty);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn unregister(&self, ty: &TypeDescription) {
        let mut types = self.types.write();
        let before = types.len();
        types.retain(|t| t != ty);
        if types.len() != before {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn clear(&self) {
        let mut types = self.types.write();
        if !types.is_empty() {
            types.clear();
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn registered_types(&self) -> Vec<TypeDescription> {
        self.types.read().clone()
    }

    /// All extension methods visible under `name`, paired with the type
    /// that contributes them. A method qualifies when it is static and
    /// takes at least one parameter (the implicit target).
    pub fn candidates(&self, name: &str) -> Vec<(TypeDescription, Arc<MethodDescription>)> {
        let mut found = vec![];
        for ty in self.types.read().iter() {
            for method in ty.methods() {
                if method.is_static
                    && !method.signature.params.is_empty()
                    && (&*method.name == name || method.alt_names.iter().any(|a| &**a == name))
                {
                    found.push((ty.clone(), method.clone()));
                }
            }
        }
        found
    }

    /// Script-visible names of every registered extension method.
    pub fn method_names(&self) -> Vec<Arc<str>> {
        let mut names = vec![];
        for ty in self.types.read().iter() {
            for method in ty.methods() {
                if method.is_static && !method.signature.params.is_empty() {
                    names.push(method.name.clone());
                    names.extend(method.alt_names.iter().cloned());
                }
            }
        }
        names
    }
}
