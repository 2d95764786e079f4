//! Device-reported kernel parameter signatures.

use std::fmt;

use crate::driver::AddressQualifier;
use crate::element::DataType;
use crate::error::{ClkitError, Result};

/// OpenCL C type names the binder understands, and the host element type
/// each one binds to. Vector types bind to their lane type.
const TYPE_TABLE: &[(&str, DataType)] = &[
    ("float", DataType::F32),
    ("float4", DataType::F32),
    ("double", DataType::F64),
    ("int", DataType::I32),
    ("uint", DataType::U32),
    ("uchar", DataType::U8),
    ("uchar4", DataType::U8),
    ("long", DataType::I64),
];

/// Host element type for a device type name, if supported.
pub fn lookup_type(name: &str) -> Option<DataType> {
    TYPE_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, ty)| *ty)
}

/// Signature of one kernel parameter as the device reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub qualifier: AddressQualifier,
    pub data_type: DataType,
    pub is_pointer: bool,
    /// Type name exactly as reported, e.g. `float*`.
    pub type_name: String,
}

impl ArgInfo {
    /// Parse a reported type name such as `uint` or `float4*`.
    pub fn parse(type_name: &str, qualifier: AddressQualifier) -> Result<Self> {
        let cleaned = type_name.trim_end_matches('\0').trim();
        let (base, is_pointer) = match cleaned.strip_suffix('*') {
            Some(base) => (base.trim_end(), true),
            None => (cleaned, false),
        };
        let data_type = lookup_type(base).ok_or_else(|| ClkitError::UnsupportedArgType {
            type_name: cleaned.to_string(),
        })?;
        Ok(Self {
            qualifier,
            data_type,
            is_pointer,
            type_name: cleaned.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.qualifier == AddressQualifier::Local
    }

    /// The parameter as the device declares it, e.g. `uint` or
    /// `__global float4*`. Used in mismatch errors.
    pub fn device_spelling(&self) -> String {
        if self.is_pointer {
            self.to_string()
        } else {
            self.type_name.clone()
        }
    }
}

impl fmt::Display for ArgInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.qualifier, self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pointer_marker_is_stripped() {
        let info = ArgInfo::parse("float4*", AddressQualifier::Global).unwrap();
        assert!(info.is_pointer);
        assert_eq!(info.data_type, DataType::F32);
        assert_eq!(info.type_name, "float4*");
        assert_eq!(info.device_spelling(), "__global float4*");
    }

    #[test]
    fn scalars_are_not_pointers() {
        let info = ArgInfo::parse("uint", AddressQualifier::Private).unwrap();
        assert!(!info.is_pointer);
        assert_eq!(info.data_type, DataType::U32);
        assert_eq!(info.device_spelling(), "uint");
    }

    #[test]
    fn trailing_nul_from_driver_is_ignored() {
        let info = ArgInfo::parse("long\0", AddressQualifier::Private).unwrap();
        assert_eq!(info.data_type, DataType::I64);
        assert_eq!(info.type_name, "long");
    }

    #[test]
    fn unknown_types_are_rejected() {
        for name in ["short", "half*", "float2", "image2d_t", ""] {
            let err = ArgInfo::parse(name, AddressQualifier::Global).unwrap_err();
            assert!(
                matches!(err, ClkitError::UnsupportedArgType { .. }),
                "{name:?} gave {err}"
            );
        }
    }

    fn table_entry() -> impl Strategy<Value = (&'static str, DataType)> {
        prop::sample::select(TYPE_TABLE.to_vec())
    }

    fn qualifier() -> impl Strategy<Value = AddressQualifier> {
        prop_oneof![
            Just(AddressQualifier::Global),
            Just(AddressQualifier::Local),
            Just(AddressQualifier::Constant),
            Just(AddressQualifier::Private),
        ]
    }

    proptest! {
        /// Every table entry parses, with or without a pointer marker, to its
        /// element type.
        #[test]
        fn table_types_parse((name, ty) in table_entry(), pointer in any::<bool>(), q in qualifier()) {
            let reported = if pointer { format!("{name}*") } else { name.to_string() };
            let info = ArgInfo::parse(&reported, q).unwrap();
            prop_assert_eq!(info.data_type, ty);
            prop_assert_eq!(info.is_pointer, pointer);
            prop_assert_eq!(info.qualifier, q);
        }
    }

    proptest! {
        /// Names outside the table never parse.
        #[test]
        fn unknown_names_fail(name in "[a-z_][a-z0-9_]{0,12}\\*?") {
            let base = name.trim_end_matches('*');
            prop_assume!(lookup_type(base).is_none());
            prop_assert!(ArgInfo::parse(&name, AddressQualifier::Global).is_err());
        }
    }
}
