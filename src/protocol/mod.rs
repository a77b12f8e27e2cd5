//! MongoDB wire protocol.
//! - 16-byte message header, little-endian throughout
//! - request encoding for the legacy client op-codes
//! - OP_REPLY decoding with zero-copy document slices

use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;

use crate::bson::BsonDocument;
use crate::error::{DecodeError, EncodeError};
use crate::rope::{ByteRope, RopeBuilder, RopeReader};

pub const OP_REPLY: i32 = 1;
pub const OP_MSG: i32 = 1000;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_RESERVED: i32 = 2003;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;

pub const HEADER_LEN: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: i32 {
        const UPSERT = 1;
        const MULTI_UPDATE = 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 1;
    }
}

bitflags! {
    /// Bit 0 is reserved and bit 3 (oplog replay) is never set by the
    /// driver core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: i32 {
        const TAILABLE_CURSOR = 2;
        const SLAVE_OK = 4;
        const NO_CURSOR_TIMEOUT = 16;
        const AWAIT_DATA = 32;
        const EXHAUST = 64;
        const PARTIAL = 128;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeleteFlags: i32 {
        const SINGLE_REMOVE = 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: i32 {
        const CURSOR_NOT_FOUND = 1;
        const QUERY_FAILURE = 2;
        const SHARD_CONFIG_STALE = 4;
        const AWAIT_CAPABLE = 8;
    }
}

/// The 16-byte header every wire message starts with. `message_length`
/// counts the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    fn write(&self, out: &mut RopeBuilder) {
        out.append_i32_le(self.message_length);
        out.append_i32_le(self.request_id);
        out.append_i32_le(self.response_to);
        out.append_i32_le(self.op_code);
    }
}

#[derive(Debug, Clone)]
pub struct Update {
    pub namespace: String,
    pub flags: UpdateFlags,
    pub selector: BsonDocument,
    pub update: BsonDocument,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub namespace: String,
    pub flags: InsertFlags,
    pub documents: Vec<BsonDocument>,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub namespace: String,
    pub flags: QueryFlags,
    pub number_to_skip: i32,
    /// Forwarded verbatim. The server treats 1 as -1 and closes the cursor
    /// immediately; callers wanting more than one document pass 0 or >= 2.
    pub number_to_return: i32,
    pub query: BsonDocument,
    pub return_fields: Option<BsonDocument>,
}

#[derive(Debug, Clone)]
pub struct GetMore {
    pub namespace: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub namespace: String,
    pub flags: DeleteFlags,
    pub selector: BsonDocument,
}

#[derive(Debug, Clone)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// The closed set of client messages. Encoding dispatches on the variant;
/// there is no open polymorphism on the wire.
#[derive(Debug, Clone)]
pub enum Request {
    Update(Update),
    Insert(Insert),
    Query(Query),
    GetMore(GetMore),
    Delete(Delete),
    KillCursors(KillCursors),
}

impl Request {
    pub fn op_code(&self) -> i32 {
        match self {
            Request::Update(_) => OP_UPDATE,
            Request::Insert(_) => OP_INSERT,
            Request::Query(_) => OP_QUERY,
            Request::GetMore(_) => OP_GET_MORE,
            Request::Delete(_) => OP_DELETE,
            Request::KillCursors(_) => OP_KILL_CURSORS,
        }
    }

    /// Whether the server answers this message with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query(_) | Request::GetMore(_))
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Request::Update(m) => Some(&m.namespace),
            Request::Insert(m) => Some(&m.namespace),
            Request::Query(m) => Some(&m.namespace),
            Request::GetMore(m) => Some(&m.namespace),
            Request::Delete(m) => Some(&m.namespace),
            Request::KillCursors(_) => None,
        }
    }

    /// Encodes the full frame, header included. The frame never touches the
    /// socket if it exceeds `max_frame_bytes`.
    pub fn encode(&self, request_id: i32, max_frame_bytes: usize) -> Result<ByteRope, EncodeError> {
        let body = self.encode_body()?;
        let total = HEADER_LEN + body.len();
        if total > max_frame_bytes || total > i32::MAX as usize {
            return Err(EncodeError::FrameTooLarge {
                len: total,
                max: max_frame_bytes,
            });
        }
        let mut out = RopeBuilder::new();
        MessageHeader {
            message_length: total as i32,
            request_id,
            response_to: 0,
            op_code: self.op_code(),
        }
        .write(&mut out);
        out.append_rope(body);
        Ok(out.finish())
    }

    fn encode_body(&self) -> Result<ByteRope, EncodeError> {
        let mut out = RopeBuilder::new();
        match self {
            Request::Update(m) => {
                out.append_i32_le(0); // ZERO, reserved
                out.append_cstring(&m.namespace)?;
                out.append_i32_le(m.flags.bits());
                out.append_rope(m.selector.as_rope().clone());
                out.append_rope(m.update.as_rope().clone());
            }
            Request::Insert(m) => {
                out.append_i32_le(m.flags.bits());
                out.append_cstring(&m.namespace)?;
                for doc in &m.documents {
                    out.append_rope(doc.as_rope().clone());
                }
            }
            Request::Query(m) => {
                out.append_i32_le(m.flags.bits());
                out.append_cstring(&m.namespace)?;
                out.append_i32_le(m.number_to_skip);
                out.append_i32_le(m.number_to_return);
                out.append_rope(m.query.as_rope().clone());
                if let Some(fields) = &m.return_fields {
                    out.append_rope(fields.as_rope().clone());
                }
            }
            Request::GetMore(m) => {
                out.append_i32_le(0); // ZERO, reserved
                out.append_cstring(&m.namespace)?;
                out.append_i32_le(m.number_to_return);
                out.append_i64_le(m.cursor_id);
            }
            Request::Delete(m) => {
                out.append_i32_le(0); // ZERO, reserved
                out.append_cstring(&m.namespace)?;
                out.append_i32_le(m.flags.bits());
                out.append_rope(m.selector.as_rope().clone());
            }
            Request::KillCursors(m) => {
                out.append_i32_le(0); // ZERO, reserved
                out.append_i32_le(m.cursor_ids.len() as i32);
                for id in &m.cursor_ids {
                    out.append_i64_le(*id);
                }
            }
        }
        Ok(out.finish())
    }
}

impl From<Update> for Request {
    fn from(m: Update) -> Self {
        Request::Update(m)
    }
}

impl From<Insert> for Request {
    fn from(m: Insert) -> Self {
        Request::Insert(m)
    }
}

impl From<Query> for Request {
    fn from(m: Query) -> Self {
        Request::Query(m)
    }
}

impl From<GetMore> for Request {
    fn from(m: GetMore) -> Self {
        Request::GetMore(m)
    }
}

impl From<Delete> for Request {
    fn from(m: Delete) -> Self {
        Request::Delete(m)
    }
}

impl From<KillCursors> for Request {
    fn from(m: KillCursors) -> Self {
        Request::KillCursors(m)
    }
}

/// A decoded OP_REPLY body. Documents are rope views sliced out of the
/// inbound frame.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response_flags: ReplyFlags,
    /// 0 means the server holds no further data for this query.
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<BsonDocument>,
}

impl Reply {
    /// Decodes the body of an OP_REPLY (header already stripped).
    pub fn decode(body: ByteRope) -> Result<Self, DecodeError> {
        let mut reader = RopeReader::new(&body);
        let response_flags = ReplyFlags::from_bits_truncate(reader.read_i32_le()?);
        let cursor_id = reader.read_i64_le()?;
        let starting_from = reader.read_i32_le()?;
        let number_returned = reader.read_i32_le()?;
        if number_returned < 0 {
            return Err(DecodeError::LengthMismatch);
        }

        let mut documents = Vec::with_capacity(number_returned as usize);
        for _ in 0..number_returned {
            let declared = reader.peek_i32_le()?;
            if declared < 5 {
                return Err(DecodeError::LengthMismatch);
            }
            let rope = reader.slice_next(declared as usize)?;
            documents.push(BsonDocument::from_rope(rope)?);
        }
        if reader.remaining() != 0 {
            return Err(DecodeError::LengthMismatch);
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// The acknowledgement delivered for messages the server never answers
    /// (a written KILL_CURSORS).
    pub fn empty() -> Self {
        Self {
            response_flags: ReplyFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            number_returned: 0,
            documents: Vec::new(),
        }
    }
}

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Next process-global request id: strictly positive, monotonic, wrapping
/// modulo 2^31 and skipping zero.
pub fn next_request_id() -> i32 {
    loop {
        let id = REQUEST_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & i32::MAX;
        if id != 0 {
            return id;
        }
    }
}
