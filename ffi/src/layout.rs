use std::sync::Arc;

use memory::Value;

use crate::error::{FfiError, FfiResult};

pub(crate) const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Closed vocabulary of field type tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    CStr,
    WStr,
    SizeMarker,
    Handle,
    Sid,
    Struct,
}

impl TypeTag {
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "void" => TypeTag::Void,
            "bool" => TypeTag::Bool,
            "i1" => TypeTag::I8,
            "ui1" => TypeTag::U8,
            "i2" => TypeTag::I16,
            "ui2" => TypeTag::U16,
            "i4" => TypeTag::I32,
            "ui4" => TypeTag::U32,
            "i8" => TypeTag::I64,
            "ui8" => TypeTag::U64,
            "r4" => TypeTag::F32,
            "r8" => TypeTag::F64,
            "cstr" => TypeTag::CStr,
            "wstr" => TypeTag::WStr,
            "cbsize" => TypeTag::SizeMarker,
            "handle" => TypeTag::Handle,
            "psid" => TypeTag::Sid,
            "struct" => TypeTag::Struct,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            TypeTag::Void => "void",
            TypeTag::Bool => "bool",
            TypeTag::I8 => "i1",
            TypeTag::U8 => "ui1",
            TypeTag::I16 => "i2",
            TypeTag::U16 => "ui2",
            TypeTag::I32 => "i4",
            TypeTag::U32 => "ui4",
            TypeTag::I64 => "i8",
            TypeTag::U64 => "ui8",
            TypeTag::F32 => "r4",
            TypeTag::F64 => "r8",
            TypeTag::CStr => "cstr",
            TypeTag::WStr => "wstr",
            TypeTag::SizeMarker => "cbsize",
            TypeTag::Handle => "handle",
            TypeTag::Sid => "psid",
            TypeTag::Struct => "struct",
        }
    }

    /// Element size in bytes, platform-natural. `Struct` reports 0 here; a
    /// struct field takes its size from the compiled child.
    pub fn size(self) -> usize {
        match self {
            TypeTag::Void | TypeTag::Struct => 0,
            TypeTag::Bool | TypeTag::I8 | TypeTag::U8 => 1,
            TypeTag::I16 | TypeTag::U16 => 2,
            TypeTag::I32 | TypeTag::U32 | TypeTag::F32 | TypeTag::SizeMarker => 4,
            TypeTag::I64 | TypeTag::U64 | TypeTag::F64 => 8,
            TypeTag::CStr | TypeTag::WStr | TypeTag::Handle | TypeTag::Sid => PTR_SIZE,
        }
    }
}

/// One compiled field of a [`Descriptor`].
#[derive(Debug, Clone)]
pub struct Field {
    /// Declared name, display-only (and the key emitted by named unpack).
    pub name: String,
    pub tag: TypeTag,
    /// 0 = scalar, >= 1 = fixed-length array of that many elements.
    pub count: usize,
    /// Byte offset from the start of the struct.
    pub offset: usize,
    /// Size of one element in bytes.
    pub size: usize,
    /// Compiled layout of the nested struct; `Struct` fields only.
    pub child: Option<Arc<Descriptor>>,
}

impl Field {
    /// A primitive aligns to its own size; a nested struct to its child's
    /// alignment.
    pub fn alignment(&self) -> usize {
        match &self.child {
            Some(child) => child.align(),
            None => self.size.max(1),
        }
    }

    /// Total bytes this field occupies, all array elements included.
    pub fn total_size(&self) -> usize {
        self.size * self.count.max(1)
    }
}

/// Compiled, immutable layout of a struct: ordered fields with resolved
/// offsets, total size, and alignment.
///
/// Descriptors are published only behind `Arc`, so concurrent marshal and
/// call operations share one compiled layout and it cannot be destroyed
/// while any of them borrows it. Nested children are embedded as `Arc`
/// clones at compile time, which makes cycles unconstructible.
#[derive(Debug)]
pub struct Descriptor {
    fields: Vec<Field>,
    size: usize,
    align: usize,
}

impl Descriptor {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total size in bytes, tail padding included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Look up a field by its declared name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True for the single-field `void` descriptor that expresses "no
    /// return value".
    pub fn is_void(&self) -> bool {
        self.fields.len() == 1 && self.fields[0].tag == TypeTag::Void
    }
}

pub(crate) fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Compile a structural type definition into an immutable descriptor.
///
/// `definition` is dynamic data: a list of field specs, each itself a list
/// of two to four entries `[name, type, count, child]`. `count` defaults to
/// 0 (scalar); the fourth entry is a nested definition list and is mandatory
/// for (and exclusive to) `struct` fields. An empty definition is rejected
/// unless `allow_empty` is set (parameter lists of zero-argument calls).
///
/// Nothing is published on failure; children already compiled for a failing
/// definition are released by drop.
pub fn compile(definition: &Value, allow_empty: bool) -> FfiResult<Arc<Descriptor>> {
    let specs = definition
        .as_list()
        .ok_or_else(|| FfiError::Definition("definition must be a list of field specs".into()))?;
    if specs.is_empty() && !allow_empty {
        return Err(FfiError::Definition("definition has no fields".into()));
    }

    let mut fields: Vec<Field> = Vec::with_capacity(specs.len());
    let mut offset = 0usize;
    let mut align = 1usize;

    for spec in specs {
        let mut field = compile_field(spec, specs.len())?;
        let field_align = field.alignment();
        align = align.max(field_align);
        offset = round_up(offset, field_align);
        field.offset = offset;
        offset += field.total_size();
        fields.push(field);
    }

    let size = round_up(offset, align);
    Ok(Arc::new(Descriptor {
        fields,
        size,
        align,
    }))
}

fn compile_field(spec: &Value, nfields: usize) -> FfiResult<Field> {
    let parts = spec
        .as_list()
        .ok_or_else(|| FfiError::Definition("field spec must be a list".into()))?;
    if parts.len() < 2 || parts.len() > 4 {
        return Err(FfiError::Definition(format!(
            "field spec must have 2 to 4 entries, got {}",
            parts.len()
        )));
    }

    let name = parts[0]
        .as_str()
        .ok_or_else(|| FfiError::Definition("field name must be a string".into()))?
        .to_string();
    let token = parts[1]
        .as_str()
        .ok_or_else(|| FfiError::Definition(format!("field '{}' type must be a string", name)))?;
    let tag = TypeTag::from_token(token)
        .ok_or_else(|| FfiError::Definition(format!("unknown type token '{}'", token)))?;

    let count = match parts.get(2) {
        None | Some(Value::Nil) => 0,
        Some(v) => {
            let n = v.as_int().ok_or_else(|| {
                FfiError::Definition(format!("array count for '{}' must be an integer", name))
            })?;
            if n < 0 {
                return Err(FfiError::Definition(format!(
                    "negative array count for '{}'",
                    name
                )));
            }
            n as usize
        }
    };

    match tag {
        TypeTag::Void if nfields != 1 => {
            return Err(FfiError::Definition(
                "void is only legal as the sole field".into(),
            ));
        }
        TypeTag::SizeMarker if count > 0 => {
            return Err(FfiError::Definition(format!(
                "cbsize field '{}' may not be an array",
                name
            )));
        }
        TypeTag::Struct => {
            let child_def = parts.get(3).ok_or_else(|| {
                FfiError::Definition(format!("struct field '{}' needs a nested definition", name))
            })?;
            let child = compile(child_def, false)?;
            return Ok(Field {
                name,
                tag,
                count,
                offset: 0,
                size: child.size(),
                child: Some(child),
            });
        }
        _ => {}
    }

    if parts.len() == 4 {
        return Err(FfiError::Definition(format!(
            "field '{}' is not a struct but carries a nested definition",
            name
        )));
    }

    Ok(Field {
        name,
        tag,
        count,
        offset: 0,
        size: tag.size(),
        child: None,
    })
}
