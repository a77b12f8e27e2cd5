use bytes::Bytes;

use crate::error::EncodeError;
use crate::rope::RopeBuilder;

use super::{BsonDocument, BsonValue, tag};

/// Builds a BSON document by appending tagged fields straight into a rope.
/// The length prefix is spliced on at [`finish`](DocumentBuilder::finish);
/// embedded documents and binary payloads are shared, not copied.
///
/// ```
/// use mongoflux::bson::DocumentBuilder;
///
/// let doc = DocumentBuilder::new()
///     .double("score", 42.0)?
///     .utf8("name", "arthur")?
///     .finish()?;
/// assert_eq!(doc.get_double("score"), Ok(42.0));
/// # Ok::<(), mongoflux::EncodeError>(())
/// ```
#[derive(Default, Debug)]
pub struct DocumentBuilder {
    fields: RopeBuilder,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn double(mut self, name: &str, v: f64) -> Result<Self, EncodeError> {
        self.element(tag::DOUBLE, name)?;
        self.fields.append_f64_le(v);
        Ok(self)
    }

    pub fn utf8(mut self, name: &str, v: &str) -> Result<Self, EncodeError> {
        self.element(tag::UTF8, name)?;
        self.fields.append_utf8_string(v)?;
        Ok(self)
    }

    pub fn document(mut self, name: &str, doc: &BsonDocument) -> Result<Self, EncodeError> {
        self.element(tag::DOCUMENT, name)?;
        self.fields.append_rope(doc.as_rope().clone());
        Ok(self)
    }

    /// Array of `items`, encoded as a document keyed "0", "1", ….
    pub fn array(mut self, name: &str, items: &[BsonValue]) -> Result<Self, EncodeError> {
        self.element(tag::ARRAY, name)?;
        let encoded = array_document(items)?;
        self.fields.append_rope(encoded.as_rope().clone());
        Ok(self)
    }

    pub fn binary(mut self, name: &str, subtype: u8, payload: Bytes) -> Result<Self, EncodeError> {
        if payload.len() > i32::MAX as usize {
            return Err(EncodeError::ValueTooLarge(payload.len()));
        }
        self.element(tag::BINARY, name)?;
        self.fields.append_i32_le(payload.len() as i32);
        self.fields.append_u8(subtype);
        self.fields.append_chunk(payload);
        Ok(self)
    }

    pub fn undefined(mut self, name: &str) -> Result<Self, EncodeError> {
        self.element(tag::UNDEFINED, name)?;
        Ok(self)
    }

    pub fn object_id(mut self, name: &str, id: [u8; 12]) -> Result<Self, EncodeError> {
        self.element(tag::OBJECT_ID, name)?;
        self.fields.append_bytes(&id);
        Ok(self)
    }

    pub fn boolean(mut self, name: &str, v: bool) -> Result<Self, EncodeError> {
        self.element(tag::BOOLEAN, name)?;
        self.fields.append_u8(v as u8);
        Ok(self)
    }

    /// Milliseconds since the UNIX epoch.
    pub fn datetime(mut self, name: &str, ms: i64) -> Result<Self, EncodeError> {
        self.element(tag::UTC_DATETIME, name)?;
        self.fields.append_i64_le(ms);
        Ok(self)
    }

    pub fn null(mut self, name: &str) -> Result<Self, EncodeError> {
        self.element(tag::NULL, name)?;
        Ok(self)
    }

    /// `options` must be drawn from {i,l,m,s,u,x} in ascending order.
    pub fn regex(mut self, name: &str, pattern: &str, options: &str) -> Result<Self, EncodeError> {
        validate_regex_options(options)?;
        self.element(tag::REGEX, name)?;
        self.fields.append_cstring(pattern)?;
        self.fields.append_cstring(options)?;
        Ok(self)
    }

    pub fn db_pointer(
        mut self,
        name: &str,
        namespace: &str,
        id: [u8; 12],
    ) -> Result<Self, EncodeError> {
        self.element(tag::DB_POINTER, name)?;
        self.fields.append_utf8_string(namespace)?;
        self.fields.append_bytes(&id);
        Ok(self)
    }

    pub fn javascript(mut self, name: &str, code: &str) -> Result<Self, EncodeError> {
        self.element(tag::JAVASCRIPT, name)?;
        self.fields.append_utf8_string(code)?;
        Ok(self)
    }

    pub fn symbol(mut self, name: &str, v: &str) -> Result<Self, EncodeError> {
        self.element(tag::SYMBOL, name)?;
        self.fields.append_utf8_string(v)?;
        Ok(self)
    }

    pub fn javascript_with_scope(
        mut self,
        name: &str,
        code: &str,
        scope: &BsonDocument,
    ) -> Result<Self, EncodeError> {
        // total-size + utf8-string + scope document
        let total = 4 + (4 + code.len() + 1) + scope.len_bytes();
        if total > i32::MAX as usize {
            return Err(EncodeError::ValueTooLarge(total));
        }
        self.element(tag::SCOPED_JAVASCRIPT, name)?;
        self.fields.append_i32_le(total as i32);
        self.fields.append_utf8_string(code)?;
        self.fields.append_rope(scope.as_rope().clone());
        Ok(self)
    }

    pub fn int32(mut self, name: &str, v: i32) -> Result<Self, EncodeError> {
        self.element(tag::INT32, name)?;
        self.fields.append_i32_le(v);
        Ok(self)
    }

    pub fn timestamp(mut self, name: &str, v: i64) -> Result<Self, EncodeError> {
        self.element(tag::TIMESTAMP, name)?;
        self.fields.append_i64_le(v);
        Ok(self)
    }

    pub fn int64(mut self, name: &str, v: i64) -> Result<Self, EncodeError> {
        self.element(tag::INT64, name)?;
        self.fields.append_i64_le(v);
        Ok(self)
    }

    pub fn value(self, name: &str, v: &BsonValue) -> Result<Self, EncodeError> {
        match v {
            BsonValue::Double(x) => self.double(name, *x),
            BsonValue::Utf8(x) => self.utf8(name, x),
            BsonValue::Document(x) => self.document(name, x),
            BsonValue::Array(x) => self.array(name, x),
            BsonValue::Binary { subtype, payload } => {
                self.binary(name, *subtype, payload.clone())
            }
            BsonValue::Undefined => self.undefined(name),
            BsonValue::ObjectId(x) => self.object_id(name, *x),
            BsonValue::Boolean(x) => self.boolean(name, *x),
            BsonValue::UtcDatetime(x) => self.datetime(name, *x),
            BsonValue::Null => self.null(name),
            BsonValue::Regex { pattern, options } => self.regex(name, pattern, options),
            BsonValue::DbPointer { namespace, id } => self.db_pointer(name, namespace, *id),
            BsonValue::JavaScript(x) => self.javascript(name, x),
            BsonValue::Symbol(x) => self.symbol(name, x),
            BsonValue::ScopedJavaScript { code, scope } => {
                self.javascript_with_scope(name, code, scope)
            }
            BsonValue::Int32(x) => self.int32(name, *x),
            BsonValue::Timestamp(x) => self.timestamp(name, *x),
            BsonValue::Int64(x) => self.int64(name, *x),
        }
    }

    /// Wraps the accumulated fields with the leading int32 length (counting
    /// itself and the trailing NUL) and the trailing NUL.
    pub fn finish(self) -> Result<BsonDocument, EncodeError> {
        let mut fields = self.fields;
        fields.append_u8(0);
        let mut rope = fields.finish();
        let total = rope.len() + 4;
        if total > i32::MAX as usize {
            return Err(EncodeError::ValueTooLarge(total));
        }
        rope.prepend_chunk(Bytes::copy_from_slice(&(total as i32).to_le_bytes()));
        Ok(BsonDocument::from_rope_unchecked(rope))
    }

    fn element(&mut self, tag: u8, name: &str) -> Result<(), EncodeError> {
        self.fields.append_u8(tag);
        self.fields.append_cstring(name)
    }
}

fn array_document(items: &[BsonValue]) -> Result<BsonDocument, EncodeError> {
    let mut builder = DocumentBuilder::new();
    for (i, item) in items.iter().enumerate() {
        builder = builder.value(&i.to_string(), item)?;
    }
    builder.finish()
}

fn validate_regex_options(options: &str) -> Result<(), EncodeError> {
    const ALLOWED: &[u8] = b"ilmsux";
    let mut last = None;
    for b in options.bytes() {
        if !ALLOWED.contains(&b) || last.is_some_and(|prev| prev >= b) {
            return Err(EncodeError::InvalidRegexOptions(options.to_string()));
        }
        last = Some(b);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_field_exact_bytes() {
        let doc = DocumentBuilder::new().double("double", 42.0).unwrap().finish().unwrap();
        let bytes = doc.to_bytes();
        // int32 length + tag + "double\0" + ieee754 + terminator
        assert_eq!(bytes.len(), 21);
        assert_eq!(&bytes[0..4], &21i32.to_le_bytes());
        assert_eq!(bytes[4], tag::DOUBLE);
        assert_eq!(&bytes[5..12], b"double\0");
        assert_eq!(&bytes[12..20], &42.0f64.to_le_bytes());
        assert_eq!(bytes[20], 0);
    }

    #[test]
    fn test_string_field_exact_bytes() {
        let doc = DocumentBuilder::new()
            .utf8("string", "fourty-two")
            .unwrap()
            .finish()
            .unwrap();
        let bytes = doc.to_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &28i32.to_le_bytes());
        assert_eq!(bytes[4], tag::UTF8);
        assert_eq!(&bytes[5..12], b"string\0");
        // utf8-string length counts the terminator
        assert_eq!(&bytes[12..16], &11i32.to_le_bytes());
        assert_eq!(&bytes[16..26], b"fourty-two");
        assert_eq!(bytes[26], 0);
        assert_eq!(bytes[27], 0);
    }

    #[test]
    fn test_boolean_value_bytes() {
        let doc = DocumentBuilder::new()
            .boolean("true", true)
            .unwrap()
            .boolean("false", false)
            .unwrap()
            .finish()
            .unwrap();
        let bytes = doc.to_bytes();
        assert_eq!(bytes.len(), 20);
        // value byte follows tag + "true\0"
        assert_eq!(bytes[10], 0x01);
        // and tag + "false\0" after it
        assert_eq!(bytes[18], 0x00);
    }

    #[test]
    fn test_regex_field_exact_bytes() {
        let doc = DocumentBuilder::new()
            .regex("regex", "pattern", "ilmsux")
            .unwrap()
            .finish()
            .unwrap();
        let bytes = doc.to_bytes();
        assert_eq!(bytes.len(), 27);
        assert_eq!(bytes[4], tag::REGEX);
        assert_eq!(&bytes[11..19], b"pattern\0");
        assert_eq!(&bytes[19..26], b"ilmsux\0");
    }

    #[test]
    fn test_field_name_with_nul_is_rejected() {
        let err = DocumentBuilder::new().int32("bad\0name", 1).unwrap_err();
        assert_eq!(err, EncodeError::InvalidFieldName);
    }

    #[test]
    fn test_bogus_regex_options_are_rejected() {
        let err = DocumentBuilder::new()
            .regex("regex", "pattern", "fubar")
            .unwrap_err();
        assert_eq!(err, EncodeError::InvalidRegexOptions("fubar".to_string()));
    }

    #[test]
    fn test_regex_options_must_ascend() {
        assert!(validate_regex_options("").is_ok());
        assert!(validate_regex_options("im").is_ok());
        assert!(validate_regex_options("mi").is_err());
        assert!(validate_regex_options("ii").is_err());
    }

    #[test]
    fn test_empty_document_is_five_bytes() {
        let doc = DocumentBuilder::new().finish().unwrap();
        assert_eq!(doc.to_bytes().as_ref(), &[5, 0, 0, 0, 0]);
        assert_eq!(doc, BsonDocument::empty());
    }

    #[test]
    fn test_array_uses_decimal_string_keys() {
        let doc = DocumentBuilder::new()
            .array(
                "xs",
                &[BsonValue::Int32(7), BsonValue::Utf8("seven".into())],
            )
            .unwrap()
            .finish()
            .unwrap();
        let items = doc.get_array("xs").unwrap();
        assert_eq!(items, vec![BsonValue::Int32(7), BsonValue::Utf8("seven".into())]);

        // raw view: the array payload is a document keyed "0", "1"
        let bytes = doc.to_bytes();
        let hay = bytes.as_ref();
        assert!(hay.windows(2).any(|w| w == b"0\0"));
        assert!(hay.windows(2).any(|w| w == b"1\0"));
    }
}
