use crate::error::DecodeError;
use crate::rope::RopeReader;

use super::{BsonDocument, BsonValue, tag};

/// Lazy iterator over a document's `(name, value)` pairs. Each step advances
/// past one tag, one cstring name and the tag-dictated payload width;
/// embedded documents come out as rope views over the parent's bytes.
pub struct Fields {
    reader: RopeReader,
    finished: bool,
}

impl Fields {
    pub(crate) fn new(doc: &BsonDocument) -> Self {
        let mut reader = RopeReader::new(doc.as_rope());
        // Framing was checked when the document was constructed; a rope too
        // short for its own length prefix never gets here.
        let finished = reader.skip(4).is_err();
        Fields { reader, finished }
    }
}

impl Iterator for Fields {
    type Item = Result<(String, BsonValue), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let step = || -> Result<Option<(String, BsonValue)>, DecodeError> {
            let tag = self.reader.read_u8()?;
            if tag == 0 {
                if self.reader.remaining() != 0 {
                    return Err(DecodeError::LengthMismatch);
                }
                return Ok(None);
            }
            let name = self.reader.read_cstring()?;
            let value = decode_value(&mut self.reader, tag)?;
            Ok(Some((name, value)))
        }();
        match step {
            Ok(Some(field)) => Some(Ok(field)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_value(reader: &mut RopeReader, tag_byte: u8) -> Result<BsonValue, DecodeError> {
    let value = match tag_byte {
        tag::DOUBLE => BsonValue::Double(reader.read_f64_le()?),
        tag::UTF8 => BsonValue::Utf8(reader.read_utf8_string()?),
        tag::DOCUMENT => BsonValue::Document(read_document(reader)?),
        tag::ARRAY => {
            let doc = read_document(reader)?;
            let mut items = Vec::new();
            for field in doc.fields() {
                let (_, item) = field?;
                items.push(item);
            }
            BsonValue::Array(items)
        }
        tag::BINARY => {
            let len = reader.read_i32_le()?;
            if len < 0 {
                return Err(DecodeError::LengthMismatch);
            }
            let subtype = reader.read_u8()?;
            let payload = reader.read_bytes(len as usize)?;
            BsonValue::Binary { subtype, payload }
        }
        tag::UNDEFINED => BsonValue::Undefined,
        tag::OBJECT_ID => {
            let raw = reader.read_bytes(12)?;
            let mut id = [0u8; 12];
            id.copy_from_slice(&raw);
            BsonValue::ObjectId(id)
        }
        tag::BOOLEAN => BsonValue::Boolean(reader.read_u8()? != 0),
        tag::UTC_DATETIME => BsonValue::UtcDatetime(reader.read_i64_le()?),
        tag::NULL => BsonValue::Null,
        tag::REGEX => {
            let pattern = reader.read_cstring()?;
            let options = reader.read_cstring()?;
            BsonValue::Regex { pattern, options }
        }
        tag::DB_POINTER => {
            let namespace = reader.read_utf8_string()?;
            let raw = reader.read_bytes(12)?;
            let mut id = [0u8; 12];
            id.copy_from_slice(&raw);
            BsonValue::DbPointer { namespace, id }
        }
        tag::JAVASCRIPT => BsonValue::JavaScript(reader.read_utf8_string()?),
        tag::SYMBOL => BsonValue::Symbol(reader.read_utf8_string()?),
        tag::SCOPED_JAVASCRIPT => {
            let total = reader.read_i32_le()?;
            if total < 4 {
                return Err(DecodeError::LengthMismatch);
            }
            let start = reader.position();
            let code = reader.read_utf8_string()?;
            let scope = read_document(reader)?;
            if reader.position() - start != total as usize - 4 {
                return Err(DecodeError::LengthMismatch);
            }
            BsonValue::ScopedJavaScript { code, scope }
        }
        tag::INT32 => BsonValue::Int32(reader.read_i32_le()?),
        tag::TIMESTAMP => BsonValue::Timestamp(reader.read_i64_le()?),
        tag::INT64 => BsonValue::Int64(reader.read_i64_le()?),
        other => return Err(DecodeError::BadTag(other)),
    };
    Ok(value)
}

/// Slices an embedded document out of the reader without copying it.
fn read_document(reader: &mut RopeReader) -> Result<BsonDocument, DecodeError> {
    let declared = reader.peek_i32_le()?;
    if declared < 5 {
        return Err(DecodeError::LengthMismatch);
    }
    let rope = reader.slice_next(declared as usize)?;
    BsonDocument::from_rope(rope)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::super::DocumentBuilder;
    use super::*;
    use crate::rope::ByteRope;

    fn sample_values() -> Vec<(&'static str, BsonValue)> {
        vec![
            ("double", BsonValue::Double(42.0)),
            ("string", BsonValue::Utf8("fourty-two".into())),
            (
                "doc",
                BsonValue::Document(
                    DocumentBuilder::new()
                        .int32("inner", 1)
                        .unwrap()
                        .finish()
                        .unwrap(),
                ),
            ),
            (
                "array",
                BsonValue::Array(vec![BsonValue::Int32(1), BsonValue::Int64(2)]),
            ),
            (
                "binary",
                BsonValue::Binary {
                    subtype: 0x04,
                    payload: Bytes::from_static(&[1, 2, 3, 4]),
                },
            ),
            ("undefined", BsonValue::Undefined),
            ("oid", BsonValue::ObjectId([7; 12])),
            ("flag", BsonValue::Boolean(true)),
            ("when", BsonValue::UtcDatetime(1_500_000_000_000)),
            ("nothing", BsonValue::Null),
            (
                "re",
                BsonValue::Regex {
                    pattern: "^a.*z$".into(),
                    options: "im".into(),
                },
            ),
            (
                "ptr",
                BsonValue::DbPointer {
                    namespace: "db.coll".into(),
                    id: [9; 12],
                },
            ),
            ("js", BsonValue::JavaScript("return 1;".into())),
            ("sym", BsonValue::Symbol("tick".into())),
            (
                "scoped",
                BsonValue::ScopedJavaScript {
                    code: "return x;".into(),
                    scope: DocumentBuilder::new()
                        .int32("x", 3)
                        .unwrap()
                        .finish()
                        .unwrap(),
                },
            ),
            ("i32", BsonValue::Int32(-7)),
            ("ts", BsonValue::Timestamp(99)),
            ("i64", BsonValue::Int64(1 << 40)),
        ]
    }

    #[test]
    fn test_every_tag_round_trips() {
        for (name, value) in sample_values() {
            let doc = DocumentBuilder::new()
                .value(name, &value)
                .unwrap()
                .finish()
                .unwrap();
            assert_eq!(doc.get(name), Some(value.clone()), "field {name}");
        }
    }

    #[test]
    fn test_whole_document_round_trips_byte_for_byte() {
        let mut builder = DocumentBuilder::new();
        for (name, value) in sample_values() {
            builder = builder.value(name, &value).unwrap();
        }
        let doc = builder.finish().unwrap();

        let reparsed = BsonDocument::from_rope(ByteRope::from_bytes(doc.to_bytes())).unwrap();
        assert_eq!(reparsed, doc);

        let names: Vec<String> = reparsed
            .fields()
            .map(|f| f.unwrap().0)
            .collect();
        let expected: Vec<String> = sample_values().iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_field_order_and_first_match_wins() {
        // Duplicate names are tolerated; get returns the first.
        let doc = DocumentBuilder::new()
            .int32("x", 1)
            .unwrap()
            .int32("x", 2)
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(doc.get("x"), Some(BsonValue::Int32(1)));
    }

    #[test]
    fn test_type_mismatch_and_missing() {
        let doc = DocumentBuilder::new().int32("x", 1).unwrap().finish().unwrap();
        assert_eq!(
            doc.get_double("x"),
            Err(DecodeError::TypeMismatch {
                field: "x".into(),
                expected: "double",
                found: "int32",
            })
        );
        assert_eq!(
            doc.get_int32("y"),
            Err(DecodeError::TypeMismatch {
                field: "y".into(),
                expected: "int32",
                found: "missing",
            })
        );
        assert_eq!(doc.get_int32("x"), Ok(1));
        assert!(doc.contains("x"));
        assert!(!doc.contains("y"));
    }

    #[test]
    fn test_bad_tag_surfaces() {
        // length 10: prefix + bogus tag + "x\0" + two junk bytes + terminator
        let raw = [10u8, 0, 0, 0, 0x7f, b'x', 0, 1, 2, 0];
        let doc = BsonDocument::from_rope(ByteRope::from_bytes(Bytes::copy_from_slice(&raw))).unwrap();
        let err = doc.fields().next().unwrap().unwrap_err();
        assert_eq!(err, DecodeError::BadTag(0x7f));
    }

    #[test]
    fn test_truncated_document_is_rejected() {
        let raw = [12u8, 0, 0, 0, 0x10];
        assert_eq!(
            BsonDocument::from_rope(ByteRope::from_bytes(Bytes::copy_from_slice(&raw))),
            Err(DecodeError::LengthMismatch)
        );

        let raw = [4u8, 0, 0, 0];
        assert_eq!(
            BsonDocument::from_rope(ByteRope::from_bytes(Bytes::copy_from_slice(&raw))),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_truncated_field_payload() {
        // Declares an int64 field but ends before its payload.
        let mut raw = vec![0u8; 0];
        raw.extend_from_slice(&13i32.to_le_bytes());
        raw.push(tag::INT64);
        raw.extend_from_slice(b"n\0");
        raw.extend_from_slice(&[1, 2, 3, 4, 5]); // 5 of 8 bytes
        raw.push(0);
        let doc = BsonDocument::from_rope(ByteRope::from_bytes(Bytes::from(raw))).unwrap();
        let err = doc.fields().next().unwrap().unwrap_err();
        assert_eq!(err, DecodeError::Truncated);
    }

    #[test]
    fn test_embedded_document_shares_parent_storage() {
        let inner = DocumentBuilder::new().int32("i", 9).unwrap().finish().unwrap();
        let outer = DocumentBuilder::new()
            .document("inner", &inner)
            .unwrap()
            .finish()
            .unwrap();
        let extracted = outer.get_document("inner").unwrap();
        assert_eq!(extracted, inner);
    }
}
