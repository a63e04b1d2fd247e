//! # hostbridge
//!
//! Dynamic member binding and marshaling between a loosely-typed script
//! runtime and statically-typed host objects.
//!
//! ## Subsystems
//!
//! - **Target Model** (`target`): Uniform wrappers around values, types,
//!   bound members, and variable cells, with weak identity caching.
//! - **Binding Engine** (`binder`): Scored overload resolution, alternate
//!   names, interface/root fallback, and extension methods.
//! - **Bind Caches** (`cache`, `signature`): Structural signatures with a
//!   process-wide core tier and a per-binder contextual tier.
//! - **Dynamic Routing** (`dynamic`, `dispatch`): Capability adapters for
//!   native dispatch, property bags, lists, and metaobjects.
//! - **Delegate Shims** (`shim`): Host-callable wrappers over script
//!   callables, including libffi-backed native trampolines.
//! - **Name Enumeration** (`names`, `extensions`): Cached member-name sets
//!   invalidated by extension-registry versioning.

pub mod binder;
pub mod cache;
pub mod dispatch;
pub mod dynamic;
pub mod error;
pub mod extensions;
pub mod metrics;
pub mod names;
pub mod shim;
pub mod signature;
pub mod target;
pub mod types;
pub mod value;

pub use binder::{Binder, BinderOptions};
pub use error::BindError;
pub use signature::{BindSignature, InvokeMode};
pub use target::{Target, TargetFlags, VariableCell};
pub use types::{
    DefaultAccess, FieldDescription, MethodDescription, ParamDescription, PropertyDescription,
    ScriptAccess, TypeDescription, TypeRegistry, TypeTag,
};
pub use value::{Capabilities, ListHandle, ObjectHandle, ScriptCallable, Value};
