//! Bidirectional value <-> raw-memory marshaling driven by a [`Descriptor`].
//!
//! `pack` writes dynamically typed values into a single arena buffer laid
//! out per the descriptor; `unpack` walks a raw buffer back into a value
//! list. String and identifier payloads live in the same arena scope as the
//! struct buffer, so a packed image stays valid for the whole
//! marshal-then-call sequence.

use byteorder::{ByteOrder, NativeEndian};
use memory::{Scope, Value};

use crate::convert;
use crate::error::{FfiError, FfiResult};
use crate::layout::{Descriptor, Field, TypeTag};
use crate::sid;

/// Most output slots one positional unpack may produce.
pub const MAX_UNPACK_VALUES: usize = 32;
/// Most name/value pairs one named unpack may produce.
pub const MAX_UNPACK_NAMED: usize = 16;

/// Marshal `values` into a fresh `descriptor.size()`-byte buffer from
/// `scope`. Values map to fields positionally and must match the field
/// count exactly.
pub fn pack<'s>(
    descriptor: &Descriptor,
    values: &[Value],
    scope: &'s Scope<'_>,
) -> FfiResult<&'s mut [u8]> {
    if values.len() != descriptor.len() {
        return Err(FfiError::Arity {
            expected: descriptor.len(),
            got: values.len(),
        });
    }
    let buf = scope.alloc_zeroed(descriptor.size());
    pack_into(descriptor, values, buf, scope)?;
    Ok(buf)
}

fn pack_into(
    descriptor: &Descriptor,
    values: &[Value],
    buf: &mut [u8],
    scope: &Scope<'_>,
) -> FfiResult<()> {
    if values.len() != descriptor.len() {
        return Err(FfiError::Arity {
            expected: descriptor.len(),
            got: values.len(),
        });
    }
    for (field, value) in descriptor.fields().iter().zip(values) {
        pack_field(field, value, buf, descriptor.size(), scope)?;
    }
    Ok(())
}

fn pack_field(
    field: &Field,
    value: &Value,
    buf: &mut [u8],
    struct_size: usize,
    scope: &Scope<'_>,
) -> FfiResult<()> {
    if field.count > 0 {
        let items = value.as_list().ok_or_else(|| {
            FfiError::TypeMismatch(format!(
                "field '{}' expects a list of {} elements, got {}",
                field.name,
                field.count,
                value.type_name()
            ))
        })?;
        if items.len() < field.count {
            return Err(FfiError::Range(format!(
                "field '{}' needs {} elements, got {}",
                field.name,
                field.count,
                items.len()
            )));
        }
        for (i, item) in items.iter().take(field.count).enumerate() {
            pack_element(field, item, buf, field.offset + i * field.size, struct_size, scope)?;
        }
        return Ok(());
    }
    pack_element(field, value, buf, field.offset, struct_size, scope)
}

fn pack_element(
    field: &Field,
    value: &Value,
    buf: &mut [u8],
    off: usize,
    struct_size: usize,
    scope: &Scope<'_>,
) -> FfiResult<()> {
    match field.tag {
        TypeTag::Void => {} // no storage
        TypeTag::Struct => {
            let child = field.child.as_ref().ok_or_else(|| {
                FfiError::System(format!("struct field '{}' has no child layout", field.name))
            })?;
            let items = value.as_list().ok_or_else(|| {
                FfiError::TypeMismatch(format!(
                    "field '{}' expects a list for the nested struct, got {}",
                    field.name,
                    value.type_name()
                ))
            })?;
            pack_into(child, items, &mut buf[off..off + child.size()], scope)?;
        }
        TypeTag::CStr => {
            let addr = stage_cstr(value, scope)?;
            convert::write_ptr(buf, off, addr);
        }
        TypeTag::WStr => {
            let addr = stage_wstr(value, scope)?;
            convert::write_ptr(buf, off, addr);
        }
        TypeTag::Sid => {
            let addr = stage_sid(value, scope)?;
            convert::write_ptr(buf, off, addr);
        }
        TypeTag::SizeMarker => {
            let n = convert::to_int(value)?;
            if n == 0 {
                // Self-describing convention: 0 means "this struct's size".
                NativeEndian::write_u32(&mut buf[off..off + 4], struct_size as u32);
            } else if n < 0 || n as usize > struct_size {
                return Err(FfiError::Range(format!(
                    "cbsize value {} out of range for field '{}' (struct is {} bytes)",
                    n, field.name, struct_size
                )));
            } else {
                NativeEndian::write_u32(&mut buf[off..off + 4], n as u32);
            }
        }
        _ => convert::write_scalar(buf, off, field.tag, value)?,
    }
    Ok(())
}

/// Copy a string into scope memory with a terminating NUL byte and return
/// its address; nil stages the null pointer.
pub(crate) fn stage_cstr(value: &Value, scope: &Scope<'_>) -> FfiResult<usize> {
    match value {
        Value::Nil => Ok(0),
        Value::Str(s) => {
            let dst = scope.alloc_zeroed(s.len() + 1);
            dst[..s.len()].copy_from_slice(s.as_bytes());
            Ok(dst.as_ptr() as usize)
        }
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to string",
            other.type_name()
        ))),
    }
}

/// Like [`stage_cstr`] but as UTF-16 units with a NUL terminator.
pub(crate) fn stage_wstr(value: &Value, scope: &Scope<'_>) -> FfiResult<usize> {
    match value {
        Value::Nil => Ok(0),
        Value::Str(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            let dst = scope.alloc_zeroed((units.len() + 1) * 2);
            for (i, unit) in units.iter().enumerate() {
                NativeEndian::write_u16(&mut dst[i * 2..i * 2 + 2], *unit);
            }
            Ok(dst.as_ptr() as usize)
        }
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to wide string",
            other.type_name()
        ))),
    }
}

/// Parse an identifier's textual form (learning its true binary length) and
/// copy it into scope memory of exactly that length.
pub(crate) fn stage_sid(value: &Value, scope: &Scope<'_>) -> FfiResult<usize> {
    match value {
        Value::Nil => Ok(0),
        Value::Str(s) => {
            let bytes = sid::parse_text(s)?;
            let dst = scope.alloc_zeroed(bytes.len());
            dst.copy_from_slice(&bytes);
            Ok(dst.as_ptr() as usize)
        }
        other => Err(FfiError::TypeMismatch(format!(
            "cannot convert {} to identifier",
            other.type_name()
        ))),
    }
}

/// Read a NUL-terminated byte string; a null address yields nil.
pub(crate) unsafe fn read_cstr_ptr(addr: usize) -> Value {
    if addr == 0 {
        return Value::Nil;
    }
    let ptr = addr as *const u8;
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let bytes = std::slice::from_raw_parts(ptr, len);
    Value::Str(String::from_utf8_lossy(bytes).into_owned())
}

/// Read a NUL-terminated UTF-16 string; a null address yields nil.
pub(crate) unsafe fn read_wstr_ptr(addr: usize) -> Value {
    if addr == 0 {
        return Value::Nil;
    }
    let ptr = addr as *const u16;
    let mut units: Vec<u16> = Vec::new();
    loop {
        // Wide strings in native buffers are not always 2-aligned.
        let unit = ptr.add(units.len()).read_unaligned();
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    Value::Str(String::from_utf16_lossy(&units))
}

/// Probe-then-copy an identifier and render its textual form; a null
/// address yields nil.
pub(crate) unsafe fn read_sid_ptr(addr: usize) -> FfiResult<Value> {
    if addr == 0 {
        return Ok(Value::Nil);
    }
    let bytes = sid::copy_from_ptr(addr as *const u8)?;
    Ok(Value::Str(sid::to_text(&bytes)?))
}

/// Decode a raw struct image back into a value list, positionally or with
/// each field's declared name interleaved before its value (`named`).
///
/// `declared` is the caller's size claim: when present it must equal the
/// descriptor's size; `None` skips the check (trust-caller sentinel). The
/// buffer itself must always hold at least `descriptor.size()` bytes.
/// Output staging is bounded: descriptors beyond [`MAX_UNPACK_VALUES`]
/// fields (or [`MAX_UNPACK_NAMED`] named pairs) are rejected up front.
///
/// # Safety
/// Pointer-bearing fields (`cstr`, `wstr`, `psid`) are dereferenced. The
/// buffer must have been produced by [`pack`] or by a native collaborator
/// that honors the descriptor, with every embedded pointer either null or
/// pointing to readable, properly terminated data.
pub unsafe fn unpack(
    buf: &[u8],
    declared: Option<usize>,
    descriptor: &Descriptor,
    named: bool,
) -> FfiResult<Value> {
    if let Some(n) = declared {
        if n != descriptor.size() {
            return Err(FfiError::Range(format!(
                "buffer size {} does not match struct size {}",
                n,
                descriptor.size()
            )));
        }
    }
    if buf.len() < descriptor.size() {
        return Err(FfiError::Range(format!(
            "buffer holds {} bytes, struct needs {}",
            buf.len(),
            descriptor.size()
        )));
    }
    let cap = if named {
        MAX_UNPACK_NAMED
    } else {
        MAX_UNPACK_VALUES
    };
    if descriptor.len() > cap {
        return Err(FfiError::Range(format!(
            "struct has {} fields, unpack staging holds {}",
            descriptor.len(),
            cap
        )));
    }

    let mut out = Vec::with_capacity(if named {
        descriptor.len() * 2
    } else {
        descriptor.len()
    });
    for field in descriptor.fields() {
        if named {
            out.push(Value::Str(field.name.clone()));
        }
        out.push(unpack_field(field, buf)?);
    }
    Ok(Value::List(out))
}

unsafe fn unpack_field(field: &Field, buf: &[u8]) -> FfiResult<Value> {
    if field.count > 0 {
        let mut items = Vec::with_capacity(field.count);
        for i in 0..field.count {
            items.push(unpack_element(field, buf, field.offset + i * field.size)?);
        }
        return Ok(Value::List(items));
    }
    unpack_element(field, buf, field.offset)
}

unsafe fn unpack_element(field: &Field, buf: &[u8], off: usize) -> FfiResult<Value> {
    match field.tag {
        TypeTag::Void => Ok(Value::Nil),
        TypeTag::Struct => {
            let child = field.child.as_ref().ok_or_else(|| {
                FfiError::System(format!("struct field '{}' has no child layout", field.name))
            })?;
            if child.len() > MAX_UNPACK_VALUES {
                return Err(FfiError::Range(format!(
                    "nested struct '{}' has {} fields, unpack staging holds {}",
                    field.name,
                    child.len(),
                    MAX_UNPACK_VALUES
                )));
            }
            let sub = &buf[off..off + child.size()];
            let mut items = Vec::with_capacity(child.len());
            for child_field in child.fields() {
                items.push(unpack_field(child_field, sub)?);
            }
            Ok(Value::List(items))
        }
        TypeTag::CStr => Ok(read_cstr_ptr(convert::read_ptr(buf, off))),
        TypeTag::WStr => Ok(read_wstr_ptr(convert::read_ptr(buf, off))),
        TypeTag::Sid => read_sid_ptr(convert::read_ptr(buf, off)),
        _ => Ok(convert::read_scalar(buf, off, field.tag)),
    }
}
