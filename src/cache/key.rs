//! Cache Key Module
//!
//! Canonical encoding of a call's argument list. Arguments are walked with a
//! serde `Serializer` owned by this module, so the encoding of every value
//! (floats, strings, map members) is defined here rather than borrowed from
//! a data format.

use std::fmt::{self, Display, Write};

use serde::ser::{
    self, Serialize, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant,
    SerializeTuple, SerializeTupleStruct, SerializeTupleVariant, Serializer,
};
use thiserror::Error;

use crate::error::{MemoizeError, Result};

// == Cache Key ==
/// Deterministic encoding of a call's argument list.
///
/// Argument lists that are equal by value produce equal keys:
/// - map and struct members are sorted, so iteration order is irrelevant
/// - integral floats encode like integers (`1.0` and `1` share a key)
/// - `NaN`, `inf` and `-inf` have tokens of their own, distinct from `None`
/// - strings are quoted and escaped, so `("a,b",)` and `("a", "b")` differ
///
/// Sequences keep their order, so `(1, 2)` and `(2, 1)` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    // == Derive ==
    /// Encodes `args`, usually a tuple holding the call's arguments.
    ///
    /// Fails with [`MemoizeError::UnsupportedArgument`] when the `Serialize`
    /// impl of an argument reports an error.
    pub fn derive<A>(args: &A) -> Result<Self>
    where
        A: Serialize + ?Sized,
    {
        let encoded = encode(args).map_err(|err| MemoizeError::UnsupportedArgument(err.0))?;
        Ok(Self(encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error raised by an argument's own `Serialize` impl.
#[derive(Debug, Error)]
#[error("{0}")]
struct KeyError(String);

impl ser::Error for KeyError {
    fn custom<T: Display>(msg: T) -> Self {
        KeyError(msg.to_string())
    }
}

type KeyResult<T = ()> = std::result::Result<T, KeyError>;

fn encode<T: Serialize + ?Sized>(value: &T) -> KeyResult<String> {
    let mut out = String::new();
    value.serialize(KeyEncoder { out: &mut out })?;
    Ok(out)
}

// Writing into a String cannot fail, so `write!` results are discarded.
fn encode_display(value: impl Display, out: &mut String) {
    let _ = write!(out, "{value}");
}

/// Non-finite floats get bare tokens that no other value can produce.
/// Integral floats print all their digits so they match the integer form.
fn encode_float(n: f64, out: &mut String) {
    if n.is_nan() {
        out.push_str("NaN");
    } else if n.is_infinite() {
        out.push_str(if n > 0.0 { "inf" } else { "-inf" });
    } else if n == 0.0 {
        out.push('0');
    } else if n.fract() == 0.0 {
        let _ = write!(out, "{n:.0}");
    } else {
        encode_display(n, out);
    }
}

/// Quotes `text`, escaping `"`, `\` and control characters as `\uXXXX`.
fn encode_str(text: &str, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// == Key Encoder ==
struct KeyEncoder<'a> {
    out: &'a mut String,
}

impl<'a> Serializer for KeyEncoder<'a> {
    type Ok = ();
    type Error = KeyError;
    type SerializeSeq = SeqEncoder<'a>;
    type SerializeTuple = SeqEncoder<'a>;
    type SerializeTupleStruct = SeqEncoder<'a>;
    type SerializeTupleVariant = SeqEncoder<'a>;
    type SerializeMap = MapEncoder<'a>;
    type SerializeStruct = MapEncoder<'a>;
    type SerializeStructVariant = MapEncoder<'a>;

    fn serialize_bool(self, v: bool) -> KeyResult {
        self.out.push_str(if v { "true" } else { "false" });
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> KeyResult {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> KeyResult {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> KeyResult {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> KeyResult {
        encode_display(v, self.out);
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> KeyResult {
        encode_display(v, self.out);
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> KeyResult {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> KeyResult {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> KeyResult {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> KeyResult {
        encode_display(v, self.out);
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> KeyResult {
        encode_display(v, self.out);
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> KeyResult {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> KeyResult {
        encode_float(v, self.out);
        Ok(())
    }

    fn serialize_char(self, v: char) -> KeyResult {
        let mut buf = [0u8; 4];
        encode_str(v.encode_utf8(&mut buf), self.out);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> KeyResult {
        encode_str(v, self.out);
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> KeyResult {
        let mut seq = self.serialize_seq(Some(v.len()))?;
        for byte in v {
            SerializeSeq::serialize_element(&mut seq, byte)?;
        }
        SerializeSeq::end(seq)
    }

    fn serialize_none(self) -> KeyResult {
        self.serialize_unit()
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> KeyResult {
        value.serialize(self)
    }

    fn serialize_unit(self) -> KeyResult {
        self.out.push_str("null");
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> KeyResult {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> KeyResult {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> KeyResult {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> KeyResult {
        let out = self.out;
        open_variant(variant, out);
        value.serialize(KeyEncoder { out: &mut *out })?;
        out.push('}');
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> KeyResult<SeqEncoder<'a>> {
        Ok(SeqEncoder::open(self.out, ""))
    }

    fn serialize_tuple(self, len: usize) -> KeyResult<SeqEncoder<'a>> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> KeyResult<SeqEncoder<'a>> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> KeyResult<SeqEncoder<'a>> {
        let out = self.out;
        open_variant(variant, out);
        Ok(SeqEncoder::open(out, "}"))
    }

    fn serialize_map(self, _len: Option<usize>) -> KeyResult<MapEncoder<'a>> {
        Ok(MapEncoder::open(self.out, ""))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> KeyResult<MapEncoder<'a>> {
        Ok(MapEncoder::open(self.out, ""))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> KeyResult<MapEncoder<'a>> {
        let out = self.out;
        open_variant(variant, out);
        Ok(MapEncoder::open(out, "}"))
    }
}

/// Variants with data encode as `{"Variant":data}`.
fn open_variant(variant: &str, out: &mut String) {
    out.push('{');
    encode_str(variant, out);
    out.push(':');
}

// == Sequences ==
struct SeqEncoder<'a> {
    out: &'a mut String,
    first: bool,
    suffix: &'static str,
}

impl<'a> SeqEncoder<'a> {
    fn open(out: &'a mut String, suffix: &'static str) -> Self {
        out.push('[');
        Self {
            out,
            first: true,
            suffix,
        }
    }

    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        if !self.first {
            self.out.push(',');
        }
        self.first = false;
        value.serialize(KeyEncoder { out: &mut *self.out })
    }

    fn finish(self) -> KeyResult {
        self.out.push(']');
        self.out.push_str(self.suffix);
        Ok(())
    }
}

impl SerializeSeq for SeqEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        self.element(value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

impl SerializeTuple for SeqEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        self.element(value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

impl SerializeTupleStruct for SeqEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        self.element(value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

impl SerializeTupleVariant for SeqEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        self.element(value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

// == Maps and Structs ==
/// Buffers encoded members so they can be written out sorted by key.
struct MapEncoder<'a> {
    out: &'a mut String,
    members: Vec<(String, String)>,
    pending_key: Option<String>,
    suffix: &'static str,
}

impl<'a> MapEncoder<'a> {
    fn open(out: &'a mut String, suffix: &'static str) -> Self {
        Self {
            out,
            members: Vec::new(),
            pending_key: None,
            suffix,
        }
    }

    fn member<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> KeyResult {
        let value = encode(value)?;
        self.members.push((key, value));
        Ok(())
    }

    fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> KeyResult {
        let mut key = String::new();
        encode_str(name, &mut key);
        self.member(key, value)
    }

    fn finish(mut self) -> KeyResult {
        self.members.sort_unstable();

        self.out.push('{');
        for (index, (key, value)) in self.members.iter().enumerate() {
            if index > 0 {
                self.out.push(',');
            }
            self.out.push_str(key);
            self.out.push(':');
            self.out.push_str(value);
        }
        self.out.push('}');
        self.out.push_str(self.suffix);
        Ok(())
    }
}

impl SerializeMap for MapEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> KeyResult {
        self.pending_key = Some(encode(key)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> KeyResult {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| KeyError("map value serialized before its key".to_string()))?;
        self.member(key, value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

impl SerializeStruct for MapEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, name: &'static str, value: &T) -> KeyResult {
        self.field(name, value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}

impl SerializeStructVariant for MapEncoder<'_> {
    type Ok = ();
    type Error = KeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, name: &'static str, value: &T) -> KeyResult {
        self.field(name, value)
    }

    fn end(self) -> KeyResult {
        self.finish()
    }
}
