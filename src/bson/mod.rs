//! BSON codec over [`ByteRope`](crate::rope::ByteRope).
//! - builder writing element bytes straight into a rope
//! - lazy reader interpreting documents in place, zero-copy for
//!   embedded documents and binary payloads

mod builder;
mod reader;

pub use builder::DocumentBuilder;
pub use reader::Fields;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::rope::{ByteRope, RopeReader};

/// BSON element tags, byte-for-byte as they appear on the wire.
pub mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const UTF8: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOLEAN: u8 = 0x08;
    pub const UTC_DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const DB_POINTER: u8 = 0x0C;
    pub const JAVASCRIPT: u8 = 0x0D;
    pub const SYMBOL: u8 = 0x0E;
    pub const SCOPED_JAVASCRIPT: u8 = 0x0F;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
}

/// A decoded BSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum BsonValue {
    Double(f64),
    Utf8(String),
    Document(BsonDocument),
    Array(Vec<BsonValue>),
    Binary { subtype: u8, payload: Bytes },
    Undefined,
    ObjectId([u8; 12]),
    Boolean(bool),
    /// Milliseconds since the UNIX epoch.
    UtcDatetime(i64),
    Null,
    Regex { pattern: String, options: String },
    DbPointer { namespace: String, id: [u8; 12] },
    JavaScript(String),
    Symbol(String),
    ScopedJavaScript { code: String, scope: BsonDocument },
    Int32(i32),
    Timestamp(i64),
    Int64(i64),
}

impl BsonValue {
    pub fn tag(&self) -> u8 {
        match self {
            BsonValue::Double(_) => tag::DOUBLE,
            BsonValue::Utf8(_) => tag::UTF8,
            BsonValue::Document(_) => tag::DOCUMENT,
            BsonValue::Array(_) => tag::ARRAY,
            BsonValue::Binary { .. } => tag::BINARY,
            BsonValue::Undefined => tag::UNDEFINED,
            BsonValue::ObjectId(_) => tag::OBJECT_ID,
            BsonValue::Boolean(_) => tag::BOOLEAN,
            BsonValue::UtcDatetime(_) => tag::UTC_DATETIME,
            BsonValue::Null => tag::NULL,
            BsonValue::Regex { .. } => tag::REGEX,
            BsonValue::DbPointer { .. } => tag::DB_POINTER,
            BsonValue::JavaScript(_) => tag::JAVASCRIPT,
            BsonValue::Symbol(_) => tag::SYMBOL,
            BsonValue::ScopedJavaScript { .. } => tag::SCOPED_JAVASCRIPT,
            BsonValue::Int32(_) => tag::INT32,
            BsonValue::Timestamp(_) => tag::TIMESTAMP,
            BsonValue::Int64(_) => tag::INT64,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BsonValue::Double(_) => "double",
            BsonValue::Utf8(_) => "utf8-string",
            BsonValue::Document(_) => "document",
            BsonValue::Array(_) => "array",
            BsonValue::Binary { .. } => "binary",
            BsonValue::Undefined => "undefined",
            BsonValue::ObjectId(_) => "object-id",
            BsonValue::Boolean(_) => "boolean",
            BsonValue::UtcDatetime(_) => "utc-datetime",
            BsonValue::Null => "null",
            BsonValue::Regex { .. } => "regex",
            BsonValue::DbPointer { .. } => "db-pointer",
            BsonValue::JavaScript(_) => "js-code",
            BsonValue::Symbol(_) => "symbol",
            BsonValue::ScopedJavaScript { .. } => "scoped-js-code",
            BsonValue::Int32(_) => "int32",
            BsonValue::Timestamp(_) => "timestamp",
            BsonValue::Int64(_) => "int64",
        }
    }
}

/// A BSON document, canonically stored as its serialized bytes. Field views
/// are derived on demand; embedded documents share the parent's storage.
#[derive(Clone)]
pub struct BsonDocument {
    bytes: ByteRope,
}

impl BsonDocument {
    /// Wraps serialized bytes, checking the framing invariants: the declared
    /// int32 length equals the rope length and the document ends in NUL.
    /// Field contents stay unvalidated until read.
    pub fn from_rope(bytes: ByteRope) -> Result<Self, DecodeError> {
        if bytes.len() < 5 {
            return Err(DecodeError::Truncated);
        }
        let declared = RopeReader::new(&bytes).read_i32_le()?;
        if declared < 5 || declared as usize != bytes.len() {
            return Err(DecodeError::LengthMismatch);
        }
        if bytes.last_byte() != Some(0) {
            return Err(DecodeError::LengthMismatch);
        }
        Ok(Self { bytes })
    }

    /// For ropes produced by [`DocumentBuilder`], which are valid by
    /// construction.
    pub(crate) fn from_rope_unchecked(bytes: ByteRope) -> Self {
        Self { bytes }
    }

    /// The five-byte document with no fields.
    pub fn empty() -> Self {
        Self {
            bytes: ByteRope::from_bytes(Bytes::from_static(&[5, 0, 0, 0, 0])),
        }
    }

    pub fn as_rope(&self) -> &ByteRope {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.to_bytes()
    }

    /// Serialized size in bytes, including the length prefix and terminator.
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Lazy walk over `(name, value)` pairs in on-wire order.
    pub fn fields(&self) -> Fields {
        Fields::new(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First field named `name`, in on-wire order. Returns `None` for
    /// missing fields and for documents that fail to parse; use the typed
    /// accessors to observe decode failures.
    pub fn get(&self, name: &str) -> Option<BsonValue> {
        for field in self.fields() {
            match field {
                Ok((n, v)) if n == name => return Some(v),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    pub fn get_double(&self, name: &str) -> Result<f64, DecodeError> {
        match self.lookup(name, "double")? {
            BsonValue::Double(v) => Ok(v),
            other => Err(mismatch(name, "double", &other)),
        }
    }

    pub fn get_int32(&self, name: &str) -> Result<i32, DecodeError> {
        match self.lookup(name, "int32")? {
            BsonValue::Int32(v) => Ok(v),
            other => Err(mismatch(name, "int32", &other)),
        }
    }

    pub fn get_int64(&self, name: &str) -> Result<i64, DecodeError> {
        match self.lookup(name, "int64")? {
            BsonValue::Int64(v) => Ok(v),
            other => Err(mismatch(name, "int64", &other)),
        }
    }

    pub fn get_utf8(&self, name: &str) -> Result<String, DecodeError> {
        match self.lookup(name, "utf8-string")? {
            BsonValue::Utf8(v) => Ok(v),
            other => Err(mismatch(name, "utf8-string", &other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, DecodeError> {
        match self.lookup(name, "boolean")? {
            BsonValue::Boolean(v) => Ok(v),
            other => Err(mismatch(name, "boolean", &other)),
        }
    }

    pub fn get_datetime_ms(&self, name: &str) -> Result<i64, DecodeError> {
        match self.lookup(name, "utc-datetime")? {
            BsonValue::UtcDatetime(v) => Ok(v),
            other => Err(mismatch(name, "utc-datetime", &other)),
        }
    }

    pub fn get_object_id(&self, name: &str) -> Result<[u8; 12], DecodeError> {
        match self.lookup(name, "object-id")? {
            BsonValue::ObjectId(v) => Ok(v),
            other => Err(mismatch(name, "object-id", &other)),
        }
    }

    pub fn get_binary(&self, name: &str) -> Result<(u8, Bytes), DecodeError> {
        match self.lookup(name, "binary")? {
            BsonValue::Binary { subtype, payload } => Ok((subtype, payload)),
            other => Err(mismatch(name, "binary", &other)),
        }
    }

    pub fn get_array(&self, name: &str) -> Result<Vec<BsonValue>, DecodeError> {
        match self.lookup(name, "array")? {
            BsonValue::Array(v) => Ok(v),
            other => Err(mismatch(name, "array", &other)),
        }
    }

    pub fn get_document(&self, name: &str) -> Result<BsonDocument, DecodeError> {
        match self.lookup(name, "document")? {
            BsonValue::Document(v) => Ok(v),
            other => Err(mismatch(name, "document", &other)),
        }
    }

    fn lookup(&self, name: &str, expected: &'static str) -> Result<BsonValue, DecodeError> {
        for field in self.fields() {
            let (n, v) = field?;
            if n == name {
                return Ok(v);
            }
        }
        Err(DecodeError::TypeMismatch {
            field: name.to_string(),
            expected,
            found: "missing",
        })
    }
}

fn mismatch(name: &str, expected: &'static str, found: &BsonValue) -> DecodeError {
    DecodeError::TypeMismatch {
        field: name.to_string(),
        expected,
        found: found.type_name(),
    }
}

impl PartialEq for BsonDocument {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for BsonDocument {}

impl std::fmt::Debug for BsonDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for BsonDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for field in self.fields() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match field {
                Ok((name, value)) => write!(f, "{name}: {value}")?,
                Err(_) => {
                    write!(f, "..invalid..")?;
                    break;
                }
            }
        }
        write!(f, "}}")
    }
}

impl std::fmt::Display for BsonValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BsonValue::Double(v) => write!(f, "{v}"),
            BsonValue::Utf8(v) => write!(f, "{v:?}"),
            BsonValue::Document(v) => write!(f, "{v}"),
            BsonValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            BsonValue::Binary { subtype, payload } => {
                write!(f, "binary(0x{subtype:02x}, {} bytes)", payload.len())
            }
            BsonValue::Undefined => write!(f, "undefined"),
            BsonValue::ObjectId(id) => {
                for b in id {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            BsonValue::Boolean(v) => write!(f, "{v}"),
            BsonValue::UtcDatetime(ms) => write!(f, "datetime({ms}ms)"),
            BsonValue::Null => write!(f, "null"),
            BsonValue::Regex { pattern, options } => write!(f, "/{pattern}/{options}"),
            BsonValue::DbPointer { namespace, id } => {
                write!(f, "dbpointer({namespace}, ")?;
                for b in id {
                    write!(f, "{b:02x}")?;
                }
                write!(f, ")")
            }
            BsonValue::JavaScript(code) => write!(f, "js({code:?})"),
            BsonValue::Symbol(v) => write!(f, "symbol({v:?})"),
            BsonValue::ScopedJavaScript { code, scope } => write!(f, "js({code:?}, {scope})"),
            BsonValue::Int32(v) => write!(f, "{v}"),
            BsonValue::Timestamp(v) => write!(f, "timestamp({v})"),
            BsonValue::Int64(v) => write!(f, "{v}"),
        }
    }
}
