//! Fixed-width numeric element types that may live in a compute buffer or be
//! passed to a kernel by value.

use std::fmt;

use bytemuck::Pod;

/// Host-side element type a kernel parameter resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F64,
    I32,
    U32,
    U8,
    I64,
}

impl DataType {
    /// Rust spelling of the type, used in mismatch diagnostics.
    pub fn rust_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::U8 => "u8",
            Self::I64 => "i64",
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rust_name())
    }
}

/// A scalar kernel argument, tagged with its element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    F64(f64),
    I32(i32),
    U32(u32),
    U8(u8),
    I64(i64),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::F32,
            Self::F64(_) => DataType::F64,
            Self::I32(_) => DataType::I32,
            Self::U32(_) => DataType::U32,
            Self::U8(_) => DataType::U8,
            Self::I64(_) => DataType::I64,
        }
    }

    /// Native-endian byte payload, as a driver expects it.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match *self {
            Self::F32(v) => v.to_ne_bytes().to_vec(),
            Self::F64(v) => v.to_ne_bytes().to_vec(),
            Self::I32(v) => v.to_ne_bytes().to_vec(),
            Self::U32(v) => v.to_ne_bytes().to_vec(),
            Self::U8(v) => vec![v],
            Self::I64(v) => v.to_ne_bytes().to_vec(),
        }
    }
}

/// Element types supported by buffers and scalar kernel arguments.
pub trait Element: Pod + PartialEq + fmt::Debug {
    const DATA_TYPE: DataType;

    fn into_scalar(self) -> ScalarValue;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$variant;

                fn into_scalar(self) -> ScalarValue {
                    ScalarValue::$variant(self)
                }
            }
        )*
    };
}

impl_element! {
    f32 => F32,
    f64 => F64,
    i32 => I32,
    u32 => U32,
    u8 => U8,
    i64 => I64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_rust_types() {
        assert_eq!(f32::DATA_TYPE.size(), std::mem::size_of::<f32>());
        assert_eq!(f64::DATA_TYPE.size(), std::mem::size_of::<f64>());
        assert_eq!(i32::DATA_TYPE.size(), std::mem::size_of::<i32>());
        assert_eq!(u32::DATA_TYPE.size(), std::mem::size_of::<u32>());
        assert_eq!(u8::DATA_TYPE.size(), std::mem::size_of::<u8>());
        assert_eq!(i64::DATA_TYPE.size(), std::mem::size_of::<i64>());
    }

    #[test]
    fn scalar_payload_is_native_bytes() {
        let v = 0x0102_0304_i32.into_scalar();
        assert_eq!(v.data_type(), DataType::I32);
        assert_eq!(v.to_ne_bytes(), 0x0102_0304_i32.to_ne_bytes().to_vec());
        assert_eq!(7u8.into_scalar().to_ne_bytes(), vec![7]);
    }
}
