//! Foreign call engine: precondition checks, ABI frame building, and the
//! raw invocation.

use std::ffi::c_void;
use std::sync::Mutex;

use libffi::middle::{Arg, Cif, CodePtr, Type};
use memory::{Scope, Value};

use crate::convert;
use crate::error::{FfiError, FfiResult};
use crate::layout::{Descriptor, Field, TypeTag};
use crate::marshal;

/// Calling-convention strategy, fixed when an engine is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// The platform's default C convention.
    Native,
    /// The legacy 32-bit x86 `stdcall` convention. On targets without it,
    /// calls go through the platform default.
    Legacy32,
}

/// Typed storage for one encoded argument. libffi argument pointers
/// reference these slots directly, so the slot vector is frozen before any
/// pointer is taken from it.
enum ArgSlot {
    Bool(u8),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(usize),
}

impl ArgSlot {
    fn arg(&self) -> Arg {
        match self {
            ArgSlot::Bool(v) => Arg::new(v),
            ArgSlot::I8(v) => Arg::new(v),
            ArgSlot::U8(v) => Arg::new(v),
            ArgSlot::I16(v) => Arg::new(v),
            ArgSlot::U16(v) => Arg::new(v),
            ArgSlot::I32(v) => Arg::new(v),
            ArgSlot::U32(v) => Arg::new(v),
            ArgSlot::I64(v) => Arg::new(v),
            ArgSlot::U64(v) => Arg::new(v),
            ArgSlot::F32(v) => Arg::new(v),
            ArgSlot::F64(v) => Arg::new(v),
            ArgSlot::Ptr(v) => Arg::new(v),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, ArgSlot::F32(_) | ArgSlot::F64(_))
    }
}

/// Accumulates the ABI-encoded arguments of one invocation. Reset at the
/// start of every call; never shared between in-flight calls.
#[derive(Default)]
struct CallFrame {
    types: Vec<Type>,
    slots: Vec<ArgSlot>,
}

impl CallFrame {
    fn reset(&mut self) {
        self.types.clear();
        self.slots.clear();
    }

    /// Integer/pointer-class channel.
    fn push_integer(&mut self, ty: Type, slot: ArgSlot) {
        debug_assert!(!slot.is_float());
        self.types.push(ty);
        self.slots.push(slot);
    }

    /// Floating-point-class channel. Kept separate from the integer channel
    /// because the two classes travel through different registers in every
    /// ABI this engine targets.
    fn push_float(&mut self, ty: Type, slot: ArgSlot) {
        debug_assert!(slot.is_float());
        self.types.push(ty);
        self.slots.push(slot);
    }

    fn args(&self) -> Vec<Arg> {
        self.slots.iter().map(ArgSlot::arg).collect()
    }
}

/// Generic foreign-call engine bound to one calling convention.
///
/// The engine owns a single call frame behind a mutex: one in-flight
/// invocation at a time, callers serialize on the lock rather than on
/// accidental single-threaded discipline.
pub struct CallEngine {
    conv: CallConv,
    frame: Mutex<CallFrame>,
}

impl CallEngine {
    pub fn new(conv: CallConv) -> Self {
        CallEngine {
            conv,
            frame: Mutex::new(CallFrame::default()),
        }
    }

    pub fn convention(&self) -> CallConv {
        self.conv
    }

    /// Invoke `func` with `args` converted per the parameter descriptor,
    /// returning the raw native result converted per the return
    /// descriptor's single field.
    ///
    /// All validation happens before the frame is built; once the native
    /// call is issued it runs to completion or faults the process. String
    /// and identifier arguments are staged in `scope`, so the scope must
    /// outlive any use the callee makes of those pointers.
    pub fn call(
        &self,
        func: *const c_void,
        ret: &Descriptor,
        params: &Descriptor,
        args: &[Value],
        scope: &Scope<'_>,
    ) -> FfiResult<Value> {
        if func.is_null() {
            return Err(FfiError::Definition("null function pointer".into()));
        }
        if ret.len() != 1 {
            return Err(FfiError::Definition(
                "return descriptor must have exactly one field".into(),
            ));
        }
        let ret_field = &ret.fields()[0];
        check_return_tag(ret_field)?;
        for field in params.fields() {
            if field.count > 0 {
                return Err(FfiError::Unsupported(format!(
                    "parameter '{}' is an array; arrays cannot be passed as call arguments",
                    field.name
                )));
            }
        }
        if args.len() != params.len() {
            return Err(FfiError::Arity {
                expected: params.len(),
                got: args.len(),
            });
        }

        // The frame is reset below; a poisoned lock carries no usable state.
        let mut frame = match self.frame.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        frame.reset();
        for (field, value) in params.fields().iter().zip(args) {
            push_arg(&mut frame, field, value, scope)?;
        }

        let cif = self.build_cif(frame.types.clone(), return_type(ret_field.tag));
        let ffi_args = frame.args();
        let code = CodePtr(func as *mut _);

        let result = match ret_field.tag {
            TypeTag::Void => {
                unsafe { cif.call::<()>(code, &ffi_args) };
                Value::Nil
            }
            TypeTag::Bool => Value::Bool(unsafe { cif.call::<u8>(code, &ffi_args) } != 0),
            TypeTag::I8 => Value::Int(unsafe { cif.call::<i8>(code, &ffi_args) } as i64),
            TypeTag::U8 => Value::Int(unsafe { cif.call::<u8>(code, &ffi_args) } as i64),
            TypeTag::I16 => Value::Int(unsafe { cif.call::<i16>(code, &ffi_args) } as i64),
            TypeTag::U16 => Value::Int(unsafe { cif.call::<u16>(code, &ffi_args) } as i64),
            TypeTag::I32 => Value::Int(unsafe { cif.call::<i32>(code, &ffi_args) } as i64),
            TypeTag::U32 => Value::Int(unsafe { cif.call::<u32>(code, &ffi_args) } as i64),
            TypeTag::I64 => Value::Int(unsafe { cif.call::<i64>(code, &ffi_args) }),
            TypeTag::U64 => Value::Int(unsafe { cif.call::<u64>(code, &ffi_args) } as i64),
            TypeTag::F32 => Value::Float(unsafe { cif.call::<f32>(code, &ffi_args) } as f64),
            TypeTag::F64 => Value::Float(unsafe { cif.call::<f64>(code, &ffi_args) }),
            TypeTag::Handle => Value::Int(unsafe { cif.call::<usize>(code, &ffi_args) } as i64),
            TypeTag::CStr => {
                let addr = unsafe { cif.call::<usize>(code, &ffi_args) };
                unsafe { marshal::read_cstr_ptr(addr) }
            }
            TypeTag::WStr => {
                let addr = unsafe { cif.call::<usize>(code, &ffi_args) };
                unsafe { marshal::read_wstr_ptr(addr) }
            }
            TypeTag::Sid => {
                let addr = unsafe { cif.call::<usize>(code, &ffi_args) };
                unsafe { marshal::read_sid_ptr(addr) }?
            }
            TypeTag::SizeMarker | TypeTag::Struct => {
                unreachable!("return tag rejected before invocation")
            }
        };
        Ok(result)
    }

    #[cfg(all(windows, target_arch = "x86"))]
    fn build_cif(&self, args: Vec<Type>, ret: Type) -> Cif {
        use libffi::middle::Builder;
        use libffi::raw;
        let abi = match self.conv {
            CallConv::Native => raw::ffi_abi_FFI_DEFAULT_ABI,
            CallConv::Legacy32 => raw::ffi_abi_FFI_STDCALL,
        };
        args.into_iter()
            .fold(Builder::new(), |b, t| b.arg(t))
            .res(ret)
            .abi(abi)
            .into_cif()
    }

    #[cfg(not(all(windows, target_arch = "x86")))]
    fn build_cif(&self, args: Vec<Type>, ret: Type) -> Cif {
        Cif::new(args, ret)
    }
}

fn check_return_tag(field: &Field) -> FfiResult<()> {
    match field.tag {
        TypeTag::SizeMarker | TypeTag::Struct => Err(FfiError::Unsupported(format!(
            "return type {} is not a callable return class",
            field.tag.token()
        ))),
        _ if field.count > 0 => Err(FfiError::Unsupported(
            "return descriptor field may not be an array".into(),
        )),
        _ => Ok(()),
    }
}

fn return_type(tag: TypeTag) -> Type {
    match tag {
        TypeTag::Void => Type::void(),
        TypeTag::Bool | TypeTag::U8 => Type::u8(),
        TypeTag::I8 => Type::i8(),
        TypeTag::I16 => Type::i16(),
        TypeTag::U16 => Type::u16(),
        TypeTag::I32 => Type::i32(),
        TypeTag::U32 => Type::u32(),
        TypeTag::I64 => Type::i64(),
        TypeTag::U64 => Type::u64(),
        TypeTag::F32 => Type::f32(),
        TypeTag::F64 => Type::f64(),
        TypeTag::Handle | TypeTag::CStr | TypeTag::WStr | TypeTag::Sid => Type::pointer(),
        TypeTag::SizeMarker | TypeTag::Struct => {
            unreachable!("return tag rejected before invocation")
        }
    }
}

/// Convert one argument and push it into the frame through the channel of
/// its ABI class. Rejections here happen before any native call.
fn push_arg(
    frame: &mut CallFrame,
    field: &Field,
    value: &Value,
    scope: &Scope<'_>,
) -> FfiResult<()> {
    match field.tag {
        TypeTag::Void | TypeTag::Struct | TypeTag::SizeMarker => {
            return Err(FfiError::Unsupported(format!(
                "parameter '{}' has type {} which cannot be passed by value",
                field.name,
                field.tag.token()
            )));
        }
        TypeTag::Bool => {
            frame.push_integer(Type::u8(), ArgSlot::Bool(convert::to_bool(value)? as u8))
        }
        TypeTag::I8 => frame.push_integer(Type::i8(), ArgSlot::I8(convert::to_int(value)? as i8)),
        TypeTag::U8 => frame.push_integer(Type::u8(), ArgSlot::U8(convert::to_int(value)? as u8)),
        TypeTag::I16 => {
            frame.push_integer(Type::i16(), ArgSlot::I16(convert::to_int(value)? as i16))
        }
        TypeTag::U16 => {
            frame.push_integer(Type::u16(), ArgSlot::U16(convert::to_int(value)? as u16))
        }
        TypeTag::I32 => {
            frame.push_integer(Type::i32(), ArgSlot::I32(convert::to_int(value)? as i32))
        }
        TypeTag::U32 => {
            frame.push_integer(Type::u32(), ArgSlot::U32(convert::to_int(value)? as u32))
        }
        TypeTag::I64 => frame.push_integer(Type::i64(), ArgSlot::I64(convert::to_int(value)?)),
        TypeTag::U64 => {
            frame.push_integer(Type::u64(), ArgSlot::U64(convert::to_int(value)? as u64))
        }
        TypeTag::F32 => {
            frame.push_float(Type::f32(), ArgSlot::F32(convert::to_float(value)? as f32))
        }
        TypeTag::F64 => frame.push_float(Type::f64(), ArgSlot::F64(convert::to_float(value)?)),
        TypeTag::Handle => {
            frame.push_integer(Type::pointer(), ArgSlot::Ptr(convert::to_handle(value)?))
        }
        TypeTag::CStr => {
            frame.push_integer(Type::pointer(), ArgSlot::Ptr(marshal::stage_cstr(value, scope)?))
        }
        TypeTag::WStr => {
            frame.push_integer(Type::pointer(), ArgSlot::Ptr(marshal::stage_wstr(value, scope)?))
        }
        TypeTag::Sid => {
            frame.push_integer(Type::pointer(), ArgSlot::Ptr(marshal::stage_sid(value, scope)?))
        }
    }
    Ok(())
}
