//! Delegate shims: host-callable wrappers around script callables.
//!
//! A shim marshals a fixed-arity host call into script values, routes
//! by-ref parameters through shared cells, and writes cell contents back
//! to the caller whether the call returned or failed. Trampolines for raw
//! native callers are built on libffi closures.
use crate::{
    error::BindError,
    value::{ByRefSlot, RefKind, ScriptCallable, Value},
};
use libffi::{
    low::ffi_cif,
    middle::{Cif, Closure, Type},
};
use std::{ffi::c_void, sync::Arc};

/// Upper bound on shim arity, matching the widest generic delegate shape
/// the marshaler will fabricate.
pub const MAX_SHIM_ARITY: usize = 16;

/// Shape of a shimmed delegate: how many parameters, and which of them
/// carry by-ref semantics.
#[derive(Debug, Clone)]
pub struct ShimDescriptor {
    arity: usize,
    by_ref: Arc<[bool]>,
}

impl ShimDescriptor {
    /// Excess arity is a construction-time error, never a latent invoke
    /// failure.
    pub fn new(by_ref: &[bool]) -> Result<ShimDescriptor, BindError> {
        if by_ref.len() > MAX_SHIM_ARITY {
            return Err(BindError::InvalidArgumentCount {
                name: "delegate shim".to_string(),
                expected: MAX_SHIM_ARITY,
                actual: by_ref.len(),
            });
        }
        Ok(ShimDescriptor {
            arity: by_ref.len(),
            by_ref: by_ref.to_vec().into(),
        })
    }

    pub fn by_value(arity: usize) -> Result<ShimDescriptor, BindError> {
        ShimDescriptor::new(&vec![false; arity])
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn has_by_ref(&self) -> bool {
        self.by_ref.iter().any(|b| *b)
    }
}

/// Writes shim-cell contents back into the caller's argument slots when
/// dropped, so the write-back happens on success, failure, and unwind
/// alike.
struct WriteBackGuard<'a> {
    args: &'a mut [Value],
    cells: Vec<(usize, ByRefSlot)>,
}

impl Drop for WriteBackGuard<'_> {
    fn drop(&mut self) {
        for (position, cell) in &self.cells {
            match &mut self.args[*position] {
                Value::ByRef(slot) => slot.write(cell.read()),
                slot => *slot = cell.read(),
            }
        }
    }
}

#[derive(Clone)]
pub struct DelegateShim {
    descriptor: ShimDescriptor,
    callable: ScriptCallable,
}

impl DelegateShim {
    pub fn new(descriptor: ShimDescriptor, callable: ScriptCallable) -> Self {
        Self {
            descriptor,
            callable,
        }
    }

    pub fn descriptor(&self) -> &ShimDescriptor {
        &self.descriptor
    }

    /// Invoke the wrapped callable with host-side arguments.
    ///
    /// By-ref positions accept either a caller-provided [`ByRefSlot`] or a
    /// plain value; in both cases the final cell contents land back in the
    /// caller's slot before this returns, including on the error path.
    pub fn invoke(&self, args: &mut [Value]) -> Result<Value, BindError> {
        if args.len() != self.descriptor.arity {
            return Err(BindError::InvalidArgumentCount {
                name: "delegate shim".to_string(),
                expected: self.descriptor.arity,
                actual: args.len(),
            });
        }

        if !self.descriptor.has_by_ref() {
            let mut buffer = args.to_vec();
            return self.callable.invoke(&mut buffer);
        }

        let mut cells = vec![];
        let mut buffer = Vec::with_capacity(args.len());
        for (position, arg) in args.iter().enumerate() {
            if self.descriptor.by_ref[position] {
                let initial = match arg {
                    Value::ByRef(slot) => slot.read(),
                    other => other.clone(),
                };
                let cell = ByRefSlot::new(RefKind::Ref, initial);
                cells.push((position, cell.clone()));
                buffer.push(Value::ByRef(cell));
            } else {
                buffer.push(arg.clone());
            }
        }

        let _guard = WriteBackGuard { args, cells };
        self.callable.invoke(&mut buffer)
    }
}

struct TrampolineData {
    shim: DelegateShim,
}

unsafe extern "C" fn unary_f64_trampoline(
    _cif: &ffi_cif,
    result: &mut f64,
    args: *const *const c_void,
    userdata: &TrampolineData,
) {
    let x = **(args as *const *const f64);
    let mut call_args = [Value::Float64(x)];
    *result = match userdata.shim.invoke(&mut call_args) {
        Ok(value) => value.as_f64().unwrap_or(f64::NAN),
        Err(_) => f64::NAN,
    };
}

/// A native `f64 -> f64` entry point backed by a shim. The closure and its
/// captured shim live as long as this value does.
pub struct NativeShim {
    closure: Closure<'static>,
    // Keeps the trampoline's userdata alive; the closure borrows it.
    _data: Box<TrampolineData>,
}

impl NativeShim {
    pub fn unary_f64(shim: DelegateShim) -> NativeShim {
        let data = Box::new(TrampolineData { shim });
        // SAFETY: `data` is heap-pinned inside this struct and dropped only
        // after `closure`, so extending the borrow to 'static never lets
        // the callback observe a dead reference.
        let data_ref: &'static TrampolineData =
            unsafe { &*(data.as_ref() as *const TrampolineData) };
        let cif = Cif::new(vec![Type::f64()], Type::f64());
        let closure = Closure::new(cif, unary_f64_trampoline, data_ref);
        NativeShim {
            closure,
            _data: data,
        }
    }

    /// The callable native entry point.
    ///
    /// # Safety
    /// The returned pointer is only valid while this shim is alive.
    pub unsafe fn entry(&self) -> unsafe extern "C" fn(f64) -> f64 {
        std::mem::transmute(*self.closure.code_ptr())
    }
}
