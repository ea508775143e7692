//! Integer fast path.
//!
//! Integers are stored as plain decimal text so that the server can operate
//! on them with INCRBY/DECRBY. [`as_integer`] detects values that serialize
//! as a single integer without running a real serializer.

use serde::de::IntoDeserializer;
use serde::de::value::I64Deserializer;
use serde::de::DeserializeOwned;
use serde::ser::{self, Impossible, Serialize};
use std::fmt;

/// Returns the value as `i64` if it serializes as a bare integer.
pub fn as_integer<T: Serialize + ?Sized>(value: &T) -> Option<i64> {
    value.serialize(IntegerProbe).ok()
}

/// Parses a stored decimal integer.
pub fn parse_integer(bytes: &[u8]) -> Option<i64> {
    match bytes.first() {
        Some(b'-' | b'0'..=b'9') => std::str::from_utf8(bytes).ok()?.parse().ok(),
        _ => None,
    }
}

/// Offers an integer to `T`'s deserializer.
pub fn integer_into<T: DeserializeOwned>(value: i64) -> Result<T, serde::de::value::Error> {
    let deserializer: I64Deserializer<serde::de::value::Error> = value.into_deserializer();
    T::deserialize(deserializer)
}

#[derive(Debug)]
struct NotInteger;

impl fmt::Display for NotInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not an integer")
    }
}

impl std::error::Error for NotInteger {}

impl ser::Error for NotInteger {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        NotInteger
    }
}

struct IntegerProbe;

type Reject = Impossible<i64, NotInteger>;

impl ser::Serializer for IntegerProbe {
    type Ok = i64;
    type Error = NotInteger;
    type SerializeSeq = Reject;
    type SerializeTuple = Reject;
    type SerializeTupleStruct = Reject;
    type SerializeTupleVariant = Reject;
    type SerializeMap = Reject;
    type SerializeStruct = Reject;
    type SerializeStructVariant = Reject;

    fn serialize_i8(self, v: i8) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<i64, NotInteger> {
        Ok(v)
    }

    fn serialize_u8(self, v: u8) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<i64, NotInteger> {
        Ok(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<i64, NotInteger> {
        i64::try_from(v).map_err(|_| NotInteger)
    }

    fn serialize_bool(self, _v: bool) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_f32(self, _v: f32) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_f64(self, _v: f64) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_char(self, _v: char) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_str(self, _v: &str) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_none(self) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_unit(self) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _value: &T,
    ) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<i64, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_accepts_integers_only() {
        assert_eq!(as_integer(&7u8), Some(7));
        assert_eq!(as_integer(&-12i32), Some(-12));
        assert_eq!(as_integer(&i64::MIN), Some(i64::MIN));
        assert_eq!(as_integer(&u64::MAX), None);
        assert_eq!(as_integer(&1.5f64), None);
        assert_eq!(as_integer("12"), None);
        assert_eq!(as_integer(&Some(3)), None);
        assert_eq!(as_integer(&vec![1, 2]), None);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(b"42"), Some(42));
        assert_eq!(parse_integer(b"-3"), Some(-3));
        assert_eq!(parse_integer(b"4x"), None);
        assert_eq!(parse_integer(b"\x00\"a\""), None);
        assert_eq!(parse_integer(b""), None);
    }

    #[test]
    fn test_integer_into_respects_target_type() {
        assert_eq!(integer_into::<u16>(9).unwrap(), 9);
        assert_eq!(integer_into::<f64>(2).unwrap(), 2.0);
        assert!(integer_into::<u8>(-1).is_err());
        assert!(integer_into::<String>(5).is_err());
    }
}
