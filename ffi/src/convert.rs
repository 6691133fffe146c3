//! Scalar conversion primitives shared by the marshaler and the call
//! engine: dynamic value -> native scalar, and fixed-width reads/writes at
//! field offsets inside a struct image. Struct images use host byte order.

use byteorder::{ByteOrder, NativeEndian};
use memory::Value;

use crate::error::{FfiError, FfiResult};
use crate::layout::{TypeTag, PTR_SIZE};

pub fn to_bool(value: &Value) -> FfiResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(n) => Ok(*n != 0),
        Value::Nil => Ok(false),
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to bool",
            other.type_name()
        ))),
    }
}

pub fn to_int(value: &Value) -> FfiResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to integer",
            other.type_name()
        ))),
    }
}

pub fn to_float(value: &Value) -> FfiResult<f64> {
    value.as_number().ok_or_else(|| {
        FfiError::TypeMismatch(format!("cannot convert {} to float", value.type_name()))
    })
}

/// Pointer-sized integer; nil converts to the null handle.
pub fn to_handle(value: &Value) -> FfiResult<usize> {
    match value {
        Value::Int(n) => Ok(*n as usize),
        Value::Nil => Ok(0),
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to handle",
            other.type_name()
        ))),
    }
}

pub fn write_ptr(buf: &mut [u8], off: usize, addr: usize) {
    NativeEndian::write_uint(&mut buf[off..off + PTR_SIZE], addr as u64, PTR_SIZE);
}

pub fn read_ptr(buf: &[u8], off: usize) -> usize {
    NativeEndian::read_uint(&buf[off..off + PTR_SIZE], PTR_SIZE) as usize
}

/// Write one fixed-width scalar element at `off`. Strings, identifiers, and
/// nested structs are staged by the marshaler, not here.
pub fn write_scalar(buf: &mut [u8], off: usize, tag: TypeTag, value: &Value) -> FfiResult<()> {
    match tag {
        TypeTag::Bool => buf[off] = to_bool(value)? as u8,
        TypeTag::I8 | TypeTag::U8 => buf[off] = to_int(value)? as u8,
        TypeTag::I16 | TypeTag::U16 => {
            NativeEndian::write_u16(&mut buf[off..off + 2], to_int(value)? as u16)
        }
        TypeTag::I32 | TypeTag::U32 => {
            NativeEndian::write_u32(&mut buf[off..off + 4], to_int(value)? as u32)
        }
        TypeTag::I64 | TypeTag::U64 => {
            NativeEndian::write_u64(&mut buf[off..off + 8], to_int(value)? as u64)
        }
        TypeTag::F32 => NativeEndian::write_f32(&mut buf[off..off + 4], to_float(value)? as f32),
        TypeTag::F64 => NativeEndian::write_f64(&mut buf[off..off + 8], to_float(value)?),
        TypeTag::Handle => write_ptr(buf, off, to_handle(value)?),
        _ => unreachable!("non-scalar tag {} in scalar writer", tag.token()),
    }
    Ok(())
}

/// Read one fixed-width scalar element back into a dynamic value. Signed
/// widths sign-extend, unsigned widths zero-extend; `ui8` keeps the raw bit
/// pattern of the 64-bit word.
pub fn read_scalar(buf: &[u8], off: usize, tag: TypeTag) -> Value {
    match tag {
        TypeTag::Bool => Value::Bool(buf[off] != 0),
        TypeTag::I8 => Value::Int(buf[off] as i8 as i64),
        TypeTag::U8 => Value::Int(buf[off] as i64),
        TypeTag::I16 => Value::Int(NativeEndian::read_u16(&buf[off..off + 2]) as i16 as i64),
        TypeTag::U16 => Value::Int(NativeEndian::read_u16(&buf[off..off + 2]) as i64),
        TypeTag::I32 => Value::Int(NativeEndian::read_u32(&buf[off..off + 4]) as i32 as i64),
        TypeTag::U32 | TypeTag::SizeMarker => {
            Value::Int(NativeEndian::read_u32(&buf[off..off + 4]) as i64)
        }
        TypeTag::I64 | TypeTag::U64 => Value::Int(NativeEndian::read_u64(&buf[off..off + 8]) as i64),
        TypeTag::F32 => Value::Float(NativeEndian::read_f32(&buf[off..off + 4]) as f64),
        TypeTag::F64 => Value::Float(NativeEndian::read_f64(&buf[off..off + 8])),
        TypeTag::Handle => Value::Int(read_ptr(buf, off) as i64),
        _ => unreachable!("non-scalar tag {} in scalar reader", tag.token()),
    }
}
