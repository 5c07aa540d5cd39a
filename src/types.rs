//! Type layout queries.
//!
//! An interned pool of the types the lowerers care about, answering the
//! size/alignment/classification questions code generation asks. Layout
//! follows the AAPCS64 data model: 8-byte pointers, integers rounded up to
//! a power-of-two number of bytes, error codes as 16-bit values.

use std::collections::HashMap;

/// Dense handle into a [`TypePool`].
pub type TypeIndex = u32;

/// Pointer size in bytes on AArch64.
pub const PTR_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

/// Width and signedness of an integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntInfo {
    pub signedness: Signedness,
    pub bits: u16,
}

/// Calling convention of a function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    C,
    Naked,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    NoReturn,
    Usize,
    Int {
        signedness: Signedness,
        bits: u16,
    },
    Pointer {
        elem: TypeIndex,
    },
    Slice {
        elem: TypeIndex,
    },
    Optional {
        payload: TypeIndex,
    },
    /// A set of error codes; represented as a 16-bit integer.
    ErrorSet,
    ErrorUnion {
        payload: TypeIndex,
    },
    Struct {
        fields: Vec<TypeIndex>,
    },
    Array {
        elem: TypeIndex,
        len: u32,
    },
    Fn {
        params: Vec<TypeIndex>,
        ret: TypeIndex,
        cc: CallConv,
    },
}

/// Interned type storage. The four scalar types every function touches are
/// pre-seeded at fixed indices.
pub struct TypePool {
    types: Vec<Type>,
    interned: HashMap<Type, TypeIndex>,
}

pub const VOID: TypeIndex = 0;
pub const BOOL: TypeIndex = 1;
pub const NO_RETURN: TypeIndex = 2;
pub const USIZE: TypeIndex = 3;

impl TypePool {
    pub fn new() -> Self {
        let mut pool = Self {
            types: Vec::new(),
            interned: HashMap::new(),
        };
        assert_eq!(pool.intern(Type::Void), VOID);
        assert_eq!(pool.intern(Type::Bool), BOOL);
        assert_eq!(pool.intern(Type::NoReturn), NO_RETURN);
        assert_eq!(pool.intern(Type::Usize), USIZE);
        pool
    }

    pub fn intern(&mut self, ty: Type) -> TypeIndex {
        if let Some(&index) = self.interned.get(&ty) {
            return index;
        }
        let index = self.types.len() as TypeIndex;
        self.types.push(ty.clone());
        self.interned.insert(ty, index);
        index
    }

    /// Convenience for the common integer types.
    pub fn int(&mut self, signedness: Signedness, bits: u16) -> TypeIndex {
        self.intern(Type::Int { signedness, bits })
    }

    pub fn pointer(&mut self, elem: TypeIndex) -> TypeIndex {
        self.intern(Type::Pointer { elem })
    }

    pub fn get(&self, index: TypeIndex) -> &Type {
        &self.types[index as usize]
    }

    /// Size of a value of this type in bytes per the ABI.
    pub fn abi_size(&self, index: TypeIndex) -> u32 {
        match self.get(index) {
            Type::Void | Type::NoReturn => 0,
            Type::Bool => 1,
            Type::Int { bits, .. } => int_byte_size(*bits),
            Type::Usize | Type::Pointer { .. } => PTR_SIZE,
            Type::Slice { .. } => 2 * PTR_SIZE,
            Type::Optional { payload } => {
                let payload = *payload;
                if !self.has_runtime_bits(payload) {
                    return 1;
                }
                if matches!(self.get(payload), Type::Pointer { .. }) {
                    // Non-null pointers let the null state ride in the
                    // pointer itself.
                    return PTR_SIZE;
                }
                let payload_size = self.abi_size(payload);
                let payload_align = self.abi_alignment(payload);
                crate::core::align_up(payload_size + 1, payload_align)
            }
            Type::ErrorSet => 2,
            Type::ErrorUnion { payload } => {
                let payload = *payload;
                if !self.has_runtime_bits(payload) {
                    return 2;
                }
                let payload_align = self.abi_alignment(payload);
                let payload_offset = crate::core::align_up(2, payload_align);
                let align = self.abi_alignment(index);
                crate::core::align_up(payload_offset + self.abi_size(payload), align)
            }
            Type::Struct { fields } => {
                let mut size = 0u32;
                for &field in fields {
                    size = crate::core::align_up(size, self.abi_alignment(field));
                    size += self.abi_size(field);
                }
                crate::core::align_up(size, self.abi_alignment(index))
            }
            Type::Array { elem, len } => self.abi_size(*elem) * len,
            Type::Fn { .. } => 0,
        }
    }

    /// Required alignment of this type in bytes.
    pub fn abi_alignment(&self, index: TypeIndex) -> u32 {
        match self.get(index) {
            Type::Void | Type::NoReturn | Type::Fn { .. } => 1,
            Type::Bool => 1,
            Type::Int { bits, .. } => int_byte_size(*bits).min(16),
            Type::Usize | Type::Pointer { .. } | Type::Slice { .. } => PTR_SIZE,
            Type::Optional { payload } => {
                if !self.has_runtime_bits(*payload) {
                    1
                } else {
                    self.abi_alignment(*payload)
                }
            }
            Type::ErrorSet => 2,
            Type::ErrorUnion { payload } => {
                if !self.has_runtime_bits(*payload) {
                    2
                } else {
                    self.abi_alignment(*payload).max(2)
                }
            }
            Type::Struct { fields } => fields
                .iter()
                .map(|&f| self.abi_alignment(f))
                .max()
                .unwrap_or(1),
            Type::Array { elem, .. } => self.abi_alignment(*elem),
        }
    }

    /// Whether values of this type occupy any bits at runtime.
    pub fn has_runtime_bits(&self, index: TypeIndex) -> bool {
        match self.get(index) {
            Type::Void | Type::NoReturn | Type::Fn { .. } => false,
            Type::Int { bits, .. } => *bits > 0,
            Type::Array { elem, len } => *len > 0 && self.has_runtime_bits(*elem),
            Type::Struct { fields } => fields.iter().any(|&f| self.has_runtime_bits(f)),
            _ => true,
        }
    }

    /// Integer width and signedness; booleans and error sets classify as
    /// unsigned for comparison purposes.
    pub fn int_info(&self, index: TypeIndex) -> Option<IntInfo> {
        match self.get(index) {
            Type::Int { signedness, bits } => Some(IntInfo {
                signedness: *signedness,
                bits: *bits,
            }),
            Type::Bool => Some(IntInfo {
                signedness: Signedness::Unsigned,
                bits: 1,
            }),
            Type::Usize | Type::Pointer { .. } => Some(IntInfo {
                signedness: Signedness::Unsigned,
                bits: 64,
            }),
            Type::ErrorSet => Some(IntInfo {
                signedness: Signedness::Unsigned,
                bits: 16,
            }),
            _ => None,
        }
    }

    pub fn is_signed(&self, index: TypeIndex) -> bool {
        matches!(
            self.int_info(index),
            Some(IntInfo {
                signedness: Signedness::Signed,
                ..
            })
        )
    }

    /// The pointee of a pointer or the payload of an optional.
    pub fn child_type(&self, index: TypeIndex) -> TypeIndex {
        match self.get(index) {
            Type::Pointer { elem } => *elem,
            Type::Optional { payload } => *payload,
            _ => panic!("child_type of non-container"),
        }
    }

    /// Element type of an array or slice.
    pub fn elem_type(&self, index: TypeIndex) -> TypeIndex {
        match self.get(index) {
            Type::Array { elem, .. } | Type::Slice { elem } | Type::Pointer { elem } => *elem,
            _ => panic!("elem_type of non-sequence"),
        }
    }

    pub fn error_union_payload(&self, index: TypeIndex) -> TypeIndex {
        match self.get(index) {
            Type::ErrorUnion { payload } => *payload,
            _ => panic!("error_union_payload of non-error-union"),
        }
    }

    /// The pointer field type of a slice.
    pub fn slice_ptr_field_type(&mut self, index: TypeIndex) -> TypeIndex {
        match self.get(index) {
            Type::Slice { elem } => {
                let elem = *elem;
                self.pointer(elem)
            }
            _ => panic!("slice_ptr_field_type of non-slice"),
        }
    }

    /// Byte offset of a struct field from the start of the struct.
    pub fn struct_field_offset(&self, index: TypeIndex, field: u32) -> u32 {
        match self.get(index) {
            Type::Struct { fields } => {
                let mut offset = 0u32;
                for (i, &f) in fields.iter().enumerate() {
                    offset = crate::core::align_up(offset, self.abi_alignment(f));
                    if i == field as usize {
                        return offset;
                    }
                    offset += self.abi_size(f);
                }
                panic!("struct field index out of range");
            }
            _ => panic!("struct_field_offset of non-struct"),
        }
    }

    pub fn fn_info(&self, index: TypeIndex) -> (&[TypeIndex], TypeIndex, CallConv) {
        match self.get(index) {
            Type::Fn { params, ret, cc } => (params, *ret, *cc),
            _ => panic!("fn_info of non-function"),
        }
    }
}

impl Default for TypePool {
    fn default() -> Self {
        Self::new()
    }
}

/// ABI byte size of an integer of the given bit width.
fn int_byte_size(bits: u16) -> u32 {
    (((bits as u32) + 7) / 8).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_sizes_round_to_power_of_two() {
        let mut pool = TypePool::new();
        let i7 = pool.int(Signedness::Signed, 7);
        let u9 = pool.int(Signedness::Unsigned, 9);
        let i33 = pool.int(Signedness::Signed, 33);
        assert_eq!(pool.abi_size(i7), 1);
        assert_eq!(pool.abi_size(u9), 2);
        assert_eq!(pool.abi_size(i33), 8);
    }

    #[test]
    fn test_interning_is_stable() {
        let mut pool = TypePool::new();
        let a = pool.int(Signedness::Unsigned, 32);
        let b = pool.int(Signedness::Unsigned, 32);
        assert_eq!(a, b);
        assert_ne!(a, pool.int(Signedness::Signed, 32));
    }

    #[test]
    fn test_optional_with_zero_sized_payload() {
        let mut pool = TypePool::new();
        let opt_void = pool.intern(Type::Optional { payload: VOID });
        assert_eq!(pool.abi_size(opt_void), 1);
        assert!(pool.has_runtime_bits(opt_void));
    }

    #[test]
    fn test_optional_pointer_is_pointer_sized() {
        let mut pool = TypePool::new();
        let u8_ty = pool.int(Signedness::Unsigned, 8);
        let ptr = pool.pointer(u8_ty);
        let opt = pool.intern(Type::Optional { payload: ptr });
        assert_eq!(pool.abi_size(opt), 8);
    }

    #[test]
    fn test_error_union_of_void_is_error_code() {
        let mut pool = TypePool::new();
        let eu = pool.intern(Type::ErrorUnion { payload: VOID });
        assert_eq!(pool.abi_size(eu), 2);
        assert_eq!(pool.abi_alignment(eu), 2);
    }

    #[test]
    fn test_struct_field_offsets() {
        let mut pool = TypePool::new();
        let u8_ty = pool.int(Signedness::Unsigned, 8);
        let u32_ty = pool.int(Signedness::Unsigned, 32);
        let s = pool.intern(Type::Struct {
            fields: vec![u8_ty, u32_ty, u8_ty],
        });
        assert_eq!(pool.struct_field_offset(s, 0), 0);
        assert_eq!(pool.struct_field_offset(s, 1), 4);
        assert_eq!(pool.struct_field_offset(s, 2), 8);
        assert_eq!(pool.abi_size(s), 12);
        assert_eq!(pool.abi_alignment(s), 4);
    }

    #[test]
    fn test_slice_layout() {
        let mut pool = TypePool::new();
        let u8_ty = pool.int(Signedness::Unsigned, 8);
        let slice = pool.intern(Type::Slice { elem: u8_ty });
        assert_eq!(pool.abi_size(slice), 16);
        let ptr = pool.slice_ptr_field_type(slice);
        assert_eq!(pool.abi_size(ptr), 8);
    }
}
