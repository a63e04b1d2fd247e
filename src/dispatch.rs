//! Native dynamic-dispatch providers.
//!
//! A dispatch provider exposes members by stable numeric identifier. The
//! adapter caches name-to-identifier mappings so repeated access to the
//! same member skips the provider's name lookup. Providers can live
//! in-process ([`MemoryDispatch`]) or inside a shared library loaded
//! through [`DispatchLibraries`].
use crate::{
    dynamic::{AdapterKind, DynamicOps},
    error::BindError,
    signature::InvokeMode,
    value::Value,
};
use dashmap::DashMap;
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use std::{
    ffi::{c_char, c_void, CStr, CString},
    path::PathBuf,
    sync::Arc,
};

/// Provider-stable member identifier. Never reused for a different name
/// within one provider instance.
pub type DispatchId = u32;

/// A host object that performs its own member dispatch by identifier.
pub trait NativeDispatch: Send + Sync {
    fn id_of_name(&self, name: &str) -> Option<DispatchId>;
    fn name_of_id(&self, id: DispatchId) -> Option<Arc<str>>;
    fn invoke_by_id(
        &self,
        id: DispatchId,
        mode: InvokeMode,
        args: &mut [Value],
    ) -> Result<Value, BindError>;
    fn delete_by_id(&self, id: DispatchId) -> bool;
    fn delete_by_name(&self, name: &str) -> bool {
        self.id_of_name(name)
            .map(|id| self.delete_by_id(id))
            .unwrap_or(false)
    }
    /// Enumeration cursor over live member identifiers. `None` input
    /// starts from the beginning; `None` output ends the walk.
    fn next_id(&self, previous: Option<DispatchId>) -> Option<DispatchId>;
    fn member_names(&self) -> Vec<Arc<str>> {
        let mut names = vec![];
        let mut cursor = None;
        while let Some(id) = self.next_id(cursor) {
            if let Some(name) = self.name_of_id(id) {
                names.push(name);
            }
            cursor = Some(id);
        }
        names
    }
    /// Introduce a new member (expando). `None` when the provider is fixed.
    fn add_name(&self, name: &str) -> Option<DispatchId>;
}

/// Capability adapter over a [`NativeDispatch`] provider. Exclusive: once
/// a target routes here, reflection never sees it.
#[derive(Clone)]
pub struct DispatchAdapter {
    dispatch: Arc<dyn NativeDispatch>,
    ids: Arc<DashMap<Arc<str>, DispatchId>>,
}

impl DispatchAdapter {
    pub fn new(dispatch: Arc<dyn NativeDispatch>) -> Self {
        Self {
            dispatch,
            ids: Arc::new(DashMap::new()),
        }
    }

    fn resolve(&self, name: &str) -> Option<DispatchId> {
        if let Some(id) = self.ids.get(name) {
            return Some(*id);
        }
        let id = self.dispatch.id_of_name(name)?;
        self.ids.insert(Arc::from(name), id);
        Some(id)
    }

    fn not_found(name: &str, mode: InvokeMode) -> BindError {
        BindError::MemberNotFound {
            name: name.to_string(),
            mode,
        }
    }
}

impl DynamicOps for DispatchAdapter {
    fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::Dispatch
    }

    fn exclusive(&self) -> bool {
        true
    }

    fn supports_expando(&self) -> bool {
        true
    }

    fn get_member(&self, name: &str) -> Option<Result<Value, BindError>> {
        Some(match self.resolve(name) {
            Some(id) => self.dispatch.invoke_by_id(id, InvokeMode::Get, &mut []),
            None => Err(Self::not_found(name, InvokeMode::Get)),
        })
    }

    fn set_member(&self, name: &str, value: &Value) -> Option<Result<(), BindError>> {
        let id = match self.resolve(name).or_else(|| {
            let added = self.dispatch.add_name(name)?;
            self.ids.insert(Arc::from(name), added);
            Some(added)
        }) {
            Some(id) => id,
            None => return Some(Err(Self::not_found(name, InvokeMode::Set))),
        };
        let mut args = [value.clone()];
        Some(
            self.dispatch
                .invoke_by_id(id, InvokeMode::Set, &mut args)
                .map(|_| ()),
        )
    }

    fn invoke_member(&self, name: &str, args: &mut [Value]) -> Option<Result<Value, BindError>> {
        Some(match self.resolve(name) {
            Some(id) => self.dispatch.invoke_by_id(id, InvokeMode::Call, args),
            None => Err(Self::not_found(name, InvokeMode::Call)),
        })
    }

    fn delete_member(&self, name: &str) -> Option<Result<bool, BindError>> {
        Some(Ok(match self.resolve(name) {
            Some(id) => {
                let deleted = self.dispatch.delete_by_id(id);
                if deleted {
                    self.ids.remove(name);
                }
                deleted
            }
            None => false,
        }))
    }

    fn get_index(&self, index: usize) -> Option<Result<Value, BindError>> {
        self.get_member(&index.to_string())
    }

    fn set_index(&self, index: usize, value: &Value) -> Option<Result<(), BindError>> {
        self.set_member(&index.to_string(), value)
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        self.dispatch.member_names()
    }

    fn indices(&self) -> Vec<usize> {
        self.dispatch
            .member_names()
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect()
    }
}

/// In-process dispatch provider backed by a slot table. Identifiers are
/// slot indices and survive deletion (deleted slots stay tombstoned).
pub struct MemoryDispatch {
    slots: RwLock<Vec<Option<(Arc<str>, Value)>>>,
}

impl MemoryDispatch {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![]),
        }
    }

    pub fn with_members(members: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Self {
            slots: RwLock::new(
                members
                    .into_iter()
                    .map(|(name, value)| Some((Arc::from(name), value)))
                    .collect(),
            ),
        }
    }
}

impl Default for MemoryDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDispatch for MemoryDispatch {
    fn id_of_name(&self, name: &str) -> Option<DispatchId> {
        self.slots.read().iter().position(|slot| {
            matches!(slot, Some((n, _)) if &**n == name)
        }).map(|i| i as DispatchId)
    }

    fn name_of_id(&self, id: DispatchId) -> Option<Arc<str>> {
        self.slots
            .read()
            .get(id as usize)
            .and_then(|slot| slot.as_ref().map(|(n, _)| n.clone()))
    }

    fn next_id(&self, previous: Option<DispatchId>) -> Option<DispatchId> {
        let start = previous.map(|id| id as usize + 1).unwrap_or(0);
        let slots = self.slots.read();
        (start..slots.len())
            .find(|&i| slots[i].is_some())
            .map(|i| i as DispatchId)
    }

    fn invoke_by_id(
        &self,
        id: DispatchId,
        mode: InvokeMode,
        args: &mut [Value],
    ) -> Result<Value, BindError> {
        let index = id as usize;
        match mode {
            InvokeMode::Get => match self.slots.read().get(index) {
                Some(Some((_, value))) => Ok(value.clone()),
                _ => Err(BindError::MemberNotFound {
                    name: format!("#{}", id),
                    mode,
                }),
            },
            InvokeMode::Set => {
                let mut slots = self.slots.write();
                match slots.get_mut(index) {
                    Some(Some((_, value))) => {
                        *value = args
                            .first()
                            .cloned()
                            .ok_or_else(|| BindError::InvalidArgumentCount {
                                name: format!("#{}", id),
                                expected: 1,
                                actual: 0,
                            })?;
                        Ok(Value::Null)
                    }
                    _ => Err(BindError::MemberNotFound {
                        name: format!("#{}", id),
                        mode,
                    }),
                }
            }
            InvokeMode::Call => {
                let callable = match self.slots.read().get(index) {
                    Some(Some((_, Value::Callable(c)))) => c.clone(),
                    Some(Some((name, _))) => {
                        return Err(BindError::InvalidInvocationMode {
                            name: name.to_string(),
                            mode,
                        })
                    }
                    _ => {
                        return Err(BindError::MemberNotFound {
                            name: format!("#{}", id),
                            mode,
                        })
                    }
                };
                callable.invoke(args)
            }
            InvokeMode::Construct => Err(BindError::InvalidInvocationMode {
                name: format!("#{}", id),
                mode,
            }),
        }
    }

    fn delete_by_id(&self, id: DispatchId) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn add_name(&self, name: &str) -> Option<DispatchId> {
        let mut slots = self.slots.write();
        slots.push(Some((Arc::from(name), Value::Null)));
        Some((slots.len() - 1) as DispatchId)
    }
}

/// Scalar variant crossing the C ABI to native providers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DispatchVariant {
    /// 0 null, 1 bool, 2 i32, 3 i64, 4 f64.
    pub kind: u32,
    pub b: u8,
    pub i: i32,
    pub l: i64,
    pub d: f64,
}

impl DispatchVariant {
    pub const NULL: DispatchVariant = DispatchVariant {
        kind: 0,
        b: 0,
        i: 0,
        l: 0,
        d: 0.0,
    };

    fn from_value(value: &Value) -> Result<DispatchVariant, BindError> {
        Ok(match value {
            Value::Null => DispatchVariant::NULL,
            Value::Bool(b) => DispatchVariant {
                kind: 1,
                b: *b as u8,
                ..DispatchVariant::NULL
            },
            Value::Int32(i) => DispatchVariant {
                kind: 2,
                i: *i,
                ..DispatchVariant::NULL
            },
            Value::Int64(l) => DispatchVariant {
                kind: 3,
                l: *l,
                ..DispatchVariant::NULL
            },
            Value::Float64(d) => DispatchVariant {
                kind: 4,
                d: *d,
                ..DispatchVariant::NULL
            },
            other => {
                return Err(BindError::UnsupportedTargetType(format!(
                    "{:?} cannot cross the native dispatch boundary",
                    other.kind()
                )))
            }
        })
    }

    fn into_value(self) -> Value {
        match self.kind {
            1 => Value::Bool(self.b != 0),
            2 => Value::Int32(self.i),
            3 => Value::Int64(self.l),
            4 => Value::Float64(self.d),
            _ => Value::Null,
        }
    }
}

/// The function table a provider library hands back from its factory
/// symbol. All calls receive the provider's opaque state pointer.
#[repr(C)]
pub struct RawDispatchVTable {
    pub state: *mut c_void,
    /// Returns the member's identifier, or a negative value when unknown.
    pub id_of_name: unsafe extern "C" fn(*mut c_void, *const c_char) -> i64,
    /// Mode: 0 get, 1 set, 2 call. Returns 0 on success.
    pub invoke_by_id: unsafe extern "C" fn(
        *mut c_void,
        u32,
        u32,
        *const DispatchVariant,
        usize,
        *mut DispatchVariant,
    ) -> i32,
    pub delete_by_id: unsafe extern "C" fn(*mut c_void, u32) -> i32,
    pub member_count: unsafe extern "C" fn(*mut c_void) -> usize,
    /// Writes the name at `index` into the buffer; returns the full name
    /// length, or a negative value for an invalid index.
    pub name_of_index: unsafe extern "C" fn(*mut c_void, usize, *mut c_char, usize) -> isize,
    pub add_name: unsafe extern "C" fn(*mut c_void, *const c_char) -> i64,
}

pub const DISPATCH_FACTORY_SYMBOL: &str = "hostbridge_dispatch_factory";

type DispatchFactory = unsafe extern "C" fn() -> *const RawDispatchVTable;

/// [`NativeDispatch`] over a loaded provider vtable.
pub struct LibraryDispatch {
    vtable: *const RawDispatchVTable,
}

// Provider contract requires the vtable's functions to be callable from
// any thread against the same state pointer.
unsafe impl Send for LibraryDispatch {}
unsafe impl Sync for LibraryDispatch {}

impl LibraryDispatch {
    fn vtable(&self) -> &RawDispatchVTable {
        // SAFETY: the vtable outlives us; its library is never unloaded.
        unsafe { &*self.vtable }
    }

    fn fault(id: DispatchId, mode: InvokeMode, code: i32) -> BindError {
        BindError::HostFault(format!(
            "native dispatch provider returned {} for member #{} ({:?})",
            code, id, mode
        ))
    }

    /// Member names in provider index order.
    fn names_by_index(&self) -> Vec<Arc<str>> {
        let vt = self.vtable();
        let count = unsafe { (vt.member_count)(vt.state) };
        let mut names = Vec::with_capacity(count);
        let mut buf = vec![0 as c_char; 256];
        for index in 0..count {
            let len =
                unsafe { (vt.name_of_index)(vt.state, index, buf.as_mut_ptr(), buf.len()) };
            if len < 0 {
                continue;
            }
            if len as usize >= buf.len() {
                buf.resize(len as usize + 1, 0);
                unsafe { (vt.name_of_index)(vt.state, index, buf.as_mut_ptr(), buf.len()) };
            }
            let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
            names.push(Arc::from(name.to_string_lossy().as_ref()));
        }
        names
    }

    /// Live identifiers in provider index order.
    fn ids_by_index(&self) -> Vec<DispatchId> {
        self.names_by_index()
            .iter()
            .filter_map(|name| self.id_of_name(name))
            .collect()
    }
}

impl NativeDispatch for LibraryDispatch {
    fn id_of_name(&self, name: &str) -> Option<DispatchId> {
        let cname = CString::new(name).ok()?;
        let vt = self.vtable();
        let id = unsafe { (vt.id_of_name)(vt.state, cname.as_ptr()) };
        u32::try_from(id).ok()
    }

    fn invoke_by_id(
        &self,
        id: DispatchId,
        mode: InvokeMode,
        args: &mut [Value],
    ) -> Result<Value, BindError> {
        let mode_code = match mode {
            InvokeMode::Get => 0,
            InvokeMode::Set => 1,
            InvokeMode::Call => 2,
            InvokeMode::Construct => {
                return Err(BindError::InvalidInvocationMode {
                    name: format!("#{}", id),
                    mode,
                })
            }
        };
        let raw_args = args
            .iter()
            .map(DispatchVariant::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = DispatchVariant::NULL;
        let vt = self.vtable();
        let code = unsafe {
            (vt.invoke_by_id)(
                vt.state,
                id,
                mode_code,
                raw_args.as_ptr(),
                raw_args.len(),
                &mut out,
            )
        };
        if code != 0 {
            return Err(Self::fault(id, mode, code));
        }
        Ok(out.into_value())
    }

    fn delete_by_id(&self, id: DispatchId) -> bool {
        let vt = self.vtable();
        unsafe { (vt.delete_by_id)(vt.state, id) != 0 }
    }

    fn name_of_id(&self, id: DispatchId) -> Option<Arc<str>> {
        self.names_by_index()
            .into_iter()
            .find(|name| self.id_of_name(name) == Some(id))
    }

    fn next_id(&self, previous: Option<DispatchId>) -> Option<DispatchId> {
        let ids = self.ids_by_index();
        match previous {
            None => ids.first().copied(),
            Some(prev) => ids
                .iter()
                .position(|&id| id == prev)
                .and_then(|i| ids.get(i + 1).copied()),
        }
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        self.names_by_index()
    }

    fn add_name(&self, name: &str) -> Option<DispatchId> {
        let cname = CString::new(name).ok()?;
        let vt = self.vtable();
        let id = unsafe { (vt.add_name)(vt.state, cname.as_ptr()) };
        u32::try_from(id).ok()
    }
}

#[derive(Debug)]
pub enum DispatchLoadError {
    LibraryNotFound(String),
    SymbolNotFound(String, String),
    LoadError(String, String),
    BadFactory(String),
}

impl std::fmt::Display for DispatchLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchLoadError::LibraryNotFound(name) => {
                write!(f, "Unable to find dispatch library '{}'", name)
            }
            DispatchLoadError::SymbolNotFound(lib, sym) => write!(
                f,
                "Unable to find entry point '{}' in dispatch library '{}'",
                sym, lib
            ),
            DispatchLoadError::LoadError(name, err) => {
                write!(f, "Failed to load dispatch library '{}': {}", name, err)
            }
            DispatchLoadError::BadFactory(name) => write!(
                f,
                "Dispatch library '{}' returned a null provider table",
                name
            ),
        }
    }
}

/// Loader for shared-library dispatch providers rooted at one directory.
/// Libraries stay loaded for the life of the process.
pub struct DispatchLibraries {
    root: PathBuf,
    libraries: DashMap<String, Library>,
}

impl DispatchLibraries {
    pub fn new(root: impl AsRef<str>) -> Self {
        Self {
            root: PathBuf::from(root.as_ref()),
            libraries: DashMap::new(),
        }
    }

    fn find_library_path(&self, name: &str) -> Option<PathBuf> {
        let exact = self.root.join(name);
        if exact.exists() {
            return Some(exact);
        }

        // Try with platform extension
        #[cfg(target_os = "linux")]
        let extensions = &[".so", ".dylib", ".dll"];
        #[cfg(target_os = "macos")]
        let extensions = &[".dylib", ".so", ".dll"];
        #[cfg(target_os = "windows")]
        let extensions = &[".dll", ".so", ".dylib"];
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        let extensions = &[".so", ".dll", ".dylib"];

        for ext in extensions {
            let path = self.root.join(format!("{}{}", name, ext));
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load (or reuse) the named provider library and build a dispatch
    /// interface from its factory symbol.
    pub fn open_provider(&self, name: &str) -> Result<Arc<dyn NativeDispatch>, DispatchLoadError> {
        if !self.libraries.contains_key(name) {
            let path = self
                .find_library_path(name)
                .ok_or_else(|| DispatchLoadError::LibraryNotFound(name.to_string()))?;
            let lib = unsafe { Library::new(&path) }
                .map_err(|e| DispatchLoadError::LoadError(name.to_string(), e.to_string()))?;
            self.libraries.entry(name.to_string()).or_insert(lib);
        }

        let lib = self
            .libraries
            .get(name)
            .ok_or_else(|| DispatchLoadError::LibraryNotFound(name.to_string()))?;
        let factory: Symbol<DispatchFactory> =
            unsafe { lib.get(DISPATCH_FACTORY_SYMBOL.as_bytes()) }.map_err(|_| {
                DispatchLoadError::SymbolNotFound(
                    name.to_string(),
                    DISPATCH_FACTORY_SYMBOL.to_string(),
                )
            })?;
        let vtable = unsafe { factory() };
        if vtable.is_null() {
            return Err(DispatchLoadError::BadFactory(name.to_string()));
        }
        Ok(Arc::new(LibraryDispatch { vtable }))
    }
}
