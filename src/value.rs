//! Wasm values as moved between compiled code and the runtime.

use std::fmt;

use anyhow::{bail, Result};

/// The four wasm number types the compiler checkpoints. The discriminants
/// match the type encoding the compiler stores in stackmap constants and in
/// the snapshot wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
}

impl ValType {
    /// Decode the compiler's integer type encoding.
    pub fn from_encoding(encoded: i64) -> Result<ValType> {
        Ok(match encoded {
            0 => ValType::I32,
            1 => ValType::I64,
            2 => ValType::F32,
            3 => ValType::F64,
            other => bail!("invalid value type encoding {other}"),
        })
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
        }
    }
}

/// A single wasm value. Values are plain copies; there is no ownership
/// graph behind them.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn unwrap_i32(self) -> i32 {
        match self {
            Value::I32(v) => v,
            _ => panic!("expected i32, got {self}"),
        }
    }

    pub fn unwrap_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            _ => panic!("expected i64, got {self}"),
        }
    }

    pub fn unwrap_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            _ => panic!("expected f32, got {self}"),
        }
    }

    pub fn unwrap_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            _ => panic!("expected f64, got {self}"),
        }
    }

    /// The raw bit pattern, zero-extended to 64 bits.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }
}

// Equality is by type and bit pattern so that NaN payloads survive a
// checkpoint/restore round trip unchanged.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.ty() == other.ty() && self.to_bits() == other.to_bits()
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32({v})"),
            Value::I64(v) => write!(f, "i64({v})"),
            Value::F32(v) => write!(f, "f32({v})"),
            Value::F64(v) => write!(f, "f64({v})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_encoding_round_trips() {
        for (enc, ty) in [
            (0, ValType::I32),
            (1, ValType::I64),
            (2, ValType::F32),
            (3, ValType::F64),
        ] {
            assert_eq!(ValType::from_encoding(enc).unwrap(), ty);
        }
        assert!(ValType::from_encoding(4).is_err());
        assert!(ValType::from_encoding(-1).is_err());
    }

    #[test]
    fn equality_is_bitwise() {
        let nan = f64::from_bits(0x7ff8_dead_beef_0001);
        assert_eq!(Value::F64(nan), Value::F64(nan));
        assert_ne!(Value::F64(nan), Value::F64(f64::NAN));
        // Same bits, different type: not equal.
        assert_ne!(Value::I32(0), Value::F32(0.0));
        assert_ne!(Value::I64(1), Value::I32(1));
    }
}
