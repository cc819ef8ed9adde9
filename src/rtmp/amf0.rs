//! AMF0 (Action Message Format v0) codec.
//!
//! Supports the marker set RTMP command/data messages actually use: Number,
//! Boolean, String, Object, Null, ECMA Array, and Strict Array. AMF3 and the
//! remaining AMF0 markers (Undefined aside, which we accept on decode for
//! interop but never emit) are out of scope.

use thiserror::Error;

use super::bytes::{read_u16_be, read_u32_be};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;

#[derive(Debug, Error)]
pub enum AmfError {
    #[error("unexpected end of AMF0 data")]
    UnexpectedEof,
    #[error("unsupported AMF0 marker: {0:#04x}")]
    UnsupportedMarker(u8),
    #[error("object property list missing its 0x00 0x00 0x09 terminator")]
    UnterminatedObject,
}

pub type AmfResult<T> = Result<T, AmfError>;

/// An in-memory AMF0 value. Objects and ECMA arrays keep insertion order so
/// that encoding a value decoded from the wire reproduces the same bytes.
#[derive(Debug, Clone)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
}

impl PartialEq for Amf0Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Compare bit patterns, not IEEE-754 equality: NaN must compare
            // equal to itself for round-trip assertions to be meaningful.
            (Amf0Value::Number(a), Amf0Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Amf0Value::Boolean(a), Amf0Value::Boolean(b)) => a == b,
            (Amf0Value::String(a), Amf0Value::String(b)) => a == b,
            (Amf0Value::Object(a), Amf0Value::Object(b)) => a == b,
            (Amf0Value::Null, Amf0Value::Null) => true,
            (Amf0Value::Undefined, Amf0Value::Undefined) => true,
            (Amf0Value::EcmaArray(a), Amf0Value::EcmaArray(b)) => a == b,
            (Amf0Value::StrictArray(a), Amf0Value::StrictArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Amf0Value {
    pub fn string(s: impl Into<String>) -> Self {
        Amf0Value::String(s.into())
    }

    pub fn object(pairs: impl IntoIterator<Item = (&'static str, Amf0Value)>) -> Self {
        Amf0Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_pairs(&self) -> Option<&[(String, Amf0Value)]> {
        match self {
            Amf0Value::Object(pairs) | Amf0Value::EcmaArray(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        self.as_pairs()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Encodes a single value and appends it to `out`.
pub fn encode(out: &mut Vec<u8>, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            out.push(MARKER_NUMBER);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Amf0Value::Boolean(b) => {
            out.push(MARKER_BOOLEAN);
            out.push(if *b { 1 } else { 0 });
        }
        Amf0Value::String(s) => {
            out.push(MARKER_STRING);
            encode_utf8(out, s);
        }
        Amf0Value::Null => out.push(MARKER_NULL),
        Amf0Value::Undefined => out.push(MARKER_UNDEFINED),
        Amf0Value::Object(pairs) => {
            out.push(MARKER_OBJECT);
            encode_properties(out, pairs);
        }
        Amf0Value::EcmaArray(pairs) => {
            out.push(MARKER_ECMA_ARRAY);
            out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
            encode_properties(out, pairs);
        }
        Amf0Value::StrictArray(items) => {
            out.push(MARKER_STRICT_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode(out, item);
            }
        }
    }
}

fn encode_utf8(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&bytes[..len as usize]);
}

fn encode_properties(out: &mut Vec<u8>, pairs: &[(String, Amf0Value)]) {
    for (key, value) in pairs {
        encode_utf8(out, key);
        encode(out, value);
    }
    out.extend_from_slice(&[0x00, 0x00, MARKER_OBJECT_END]);
}

/// Encodes a sequence of values back to back with no delimiter, as a
/// command message payload does (name, transaction id, then arguments).
pub fn encode_all(values: &[Amf0Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        encode(&mut out, value);
    }
    out
}

/// Cursor-based decoder over a byte slice.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn decode(&mut self) -> AmfResult<Amf0Value> {
        let marker = self.take(1)?[0];
        match marker {
            MARKER_NUMBER => {
                let bytes = self.take(8)?;
                Ok(Amf0Value::Number(f64::from_be_bytes(bytes.try_into().unwrap())))
            }
            MARKER_BOOLEAN => Ok(Amf0Value::Boolean(self.take(1)?[0] != 0)),
            MARKER_STRING => Ok(Amf0Value::String(self.decode_utf8()?)),
            MARKER_OBJECT => Ok(Amf0Value::Object(self.decode_properties()?)),
            MARKER_NULL => Ok(Amf0Value::Null),
            MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
            MARKER_ECMA_ARRAY => {
                let _advisory_count = read_u32_be(self.take(4)?);
                Ok(Amf0Value::EcmaArray(self.decode_properties()?))
            }
            MARKER_STRICT_ARRAY => {
                let count = read_u32_be(self.take(4)?) as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                Ok(Amf0Value::StrictArray(items))
            }
            other => Err(AmfError::UnsupportedMarker(other)),
        }
    }

    /// Decodes values until the underlying slice is exhausted.
    pub fn decode_all(&mut self) -> AmfResult<Vec<Amf0Value>> {
        let mut values = Vec::new();
        while !self.is_empty() {
            values.push(self.decode()?);
        }
        Ok(values)
    }

    fn take(&mut self, n: usize) -> AmfResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(AmfError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn decode_utf8(&mut self) -> AmfResult<String> {
        let len = read_u16_be(self.take(2)?) as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn decode_properties(&mut self) -> AmfResult<Vec<(String, Amf0Value)>> {
        let mut pairs = Vec::new();
        loop {
            // End marker: a zero-length key followed by 0x09.
            if self.pos + 3 <= self.data.len()
                && self.data[self.pos] == 0x00
                && self.data[self.pos + 1] == 0x00
                && self.data[self.pos + 2] == MARKER_OBJECT_END
            {
                self.pos += 3;
                return Ok(pairs);
            }
            if self.pos >= self.data.len() {
                return Err(AmfError::UnterminatedObject);
            }
            let key = self.decode_utf8()?;
            let value = self.decode()?;
            pairs.push((key, value));
        }
    }
}

/// Decodes every value in `data`, failing if any value is truncated or uses
/// an unsupported marker.
pub fn decode_all(data: &[u8]) -> AmfResult<Vec<Amf0Value>> {
    Decoder::new(data).decode_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_golden_vector() {
        let mut out = Vec::new();
        encode(&mut out, &Amf0Value::Number(1.0));
        assert_eq!(out, vec![0x00, 0x3F, 0xF0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn boolean_golden_vectors() {
        let mut t = Vec::new();
        encode(&mut t, &Amf0Value::Boolean(true));
        assert_eq!(t, vec![0x01, 0x01]);

        let mut f = Vec::new();
        encode(&mut f, &Amf0Value::Boolean(false));
        assert_eq!(f, vec![0x01, 0x00]);
    }

    #[test]
    fn string_golden_vector() {
        let mut out = Vec::new();
        encode(&mut out, &Amf0Value::string("test"));
        assert_eq!(out, vec![0x02, 0x00, 0x04, 0x74, 0x65, 0x73, 0x74]);
    }

    #[test]
    fn null_golden_vector() {
        let mut out = Vec::new();
        encode(&mut out, &Amf0Value::Null);
        assert_eq!(out, vec![0x05]);
    }

    #[test]
    fn object_golden_vector() {
        let mut out = Vec::new();
        encode(&mut out, &Amf0Value::object([("key", Amf0Value::string("value"))]));
        assert_eq!(
            out,
            vec![
                0x03, 0x00, 0x03, b'k', b'e', b'y', 0x02, 0x00, 0x05, b'v', b'a', b'l', b'u', b'e',
                0x00, 0x00, 0x09,
            ]
        );
    }

    #[test]
    fn strict_array_golden_vector() {
        let mut out = Vec::new();
        encode(
            &mut out,
            &Amf0Value::StrictArray(vec![
                Amf0Value::Number(1.0),
                Amf0Value::Number(2.0),
                Amf0Value::Number(3.0),
            ]),
        );
        let mut expected = vec![0x0A, 0x00, 0x00, 0x00, 0x03];
        expected.extend_from_slice(&1.0f64.to_be_bytes());
        expected.extend_from_slice(&2.0f64.to_be_bytes());
        expected.extend_from_slice(&3.0f64.to_be_bytes());
        assert_eq!(out, expected);
    }

    fn round_trip(value: Amf0Value) {
        let mut out = Vec::new();
        encode(&mut out, &value);
        let decoded = Decoder::new(&out).decode().unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_every_supported_shape() {
        round_trip(Amf0Value::Number(0.0));
        round_trip(Amf0Value::Number(-1.5));
        round_trip(Amf0Value::Number(f64::NAN));
        round_trip(Amf0Value::Number(f64::INFINITY));
        round_trip(Amf0Value::Number(f64::NEG_INFINITY));
        round_trip(Amf0Value::Boolean(true));
        round_trip(Amf0Value::Boolean(false));
        round_trip(Amf0Value::String(String::new()));
        round_trip(Amf0Value::string("世界"));
        round_trip(Amf0Value::String("x".repeat(65535)));
        round_trip(Amf0Value::Null);
        round_trip(Amf0Value::EcmaArray(vec![]));
        round_trip(Amf0Value::StrictArray(vec![]));
        round_trip(Amf0Value::object([]));

        // nested object, depth 3
        round_trip(Amf0Value::object([(
            "level1",
            Amf0Value::object([(
                "level2",
                Amf0Value::object([("level3", Amf0Value::Number(42.0))]),
            )]),
        )]));

        round_trip(Amf0Value::StrictArray(vec![
            Amf0Value::Number(1.0),
            Amf0Value::string("mixed"),
            Amf0Value::Boolean(true),
            Amf0Value::Null,
        ]));
    }

    #[test]
    fn boolean_decode_is_lenient_about_truthy_bytes() {
        let bytes = [MARKER_BOOLEAN, 0x7F];
        assert_eq!(Decoder::new(&bytes).decode().unwrap(), Amf0Value::Boolean(true));
    }

    #[test]
    fn decode_all_reads_command_shaped_payload() {
        let mut out = Vec::new();
        encode(&mut out, &Amf0Value::string("connect"));
        encode(&mut out, &Amf0Value::Number(1.0));
        encode(&mut out, &Amf0Value::object([("app", Amf0Value::string("live"))]));

        let values = decode_all(&out).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].as_str(), Some("connect"));
        assert_eq!(values[1].as_f64(), Some(1.0));
        assert_eq!(values[2].get("app").and_then(|v| v.as_str()), Some("live"));
    }

    #[test]
    fn unterminated_object_is_an_error() {
        let mut out = vec![MARKER_OBJECT];
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(b"ab");
        encode(&mut out, &Amf0Value::Number(1.0));
        // no terminator appended
        assert!(matches!(Decoder::new(&out).decode(), Err(AmfError::UnterminatedObject)));
    }

    #[test]
    fn unsupported_marker_is_an_error() {
        let bytes = [0x0B]; // AMF0 Date, unsupported here
        assert!(matches!(
            Decoder::new(&bytes).decode(),
            Err(AmfError::UnsupportedMarker(0x0B))
        ));
    }
}
