//! Scripted mongod stand-in: binds a loopback listener, decodes the
//! driver's request frames and writes back whatever OP_REPLY the test
//! dictates.
#![allow(dead_code)]

use bytes::Bytes;
use mongoflux::bson::BsonDocument;
use mongoflux::protocol::{
    MessageHeader, OP_DELETE, OP_GET_MORE, OP_INSERT, OP_KILL_CURSORS, OP_QUERY, OP_REPLY,
    OP_UPDATE,
};
use mongoflux::rope::{ByteRope, RopeBuilder, RopeReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// A request as the server decodes it off the socket.
#[derive(Debug)]
pub struct InboundRequest {
    pub header: MessageHeader,
    pub body: RequestBody,
}

#[derive(Debug)]
pub enum RequestBody {
    Update {
        namespace: String,
        flags: i32,
        selector: BsonDocument,
        update: BsonDocument,
    },
    Insert {
        namespace: String,
        flags: i32,
        documents: Vec<BsonDocument>,
    },
    Query {
        namespace: String,
        flags: i32,
        number_to_skip: i32,
        number_to_return: i32,
        query: BsonDocument,
    },
    GetMore {
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    Delete {
        namespace: String,
        flags: i32,
        selector: BsonDocument,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

/// Reads one frame; `None` once the driver has closed the connection.
pub async fn read_request(stream: &mut TcpStream) -> Option<InboundRequest> {
    let mut header_buf = [0u8; 16];
    if stream.read_exact(&mut header_buf).await.is_err() {
        return None;
    }
    let header = MessageHeader::parse(&header_buf).unwrap();
    let mut body_buf = vec![0u8; header.message_length as usize - 16];
    stream.read_exact(&mut body_buf).await.unwrap();

    let rope = ByteRope::from_bytes(Bytes::from(body_buf));
    let mut r = RopeReader::new(&rope);
    let body = match header.op_code {
        OP_UPDATE => {
            r.read_i32_le().unwrap(); // ZERO
            let namespace = r.read_cstring().unwrap();
            let flags = r.read_i32_le().unwrap();
            let selector = read_doc(&mut r);
            let update = read_doc(&mut r);
            RequestBody::Update {
                namespace,
                flags,
                selector,
                update,
            }
        }
        OP_INSERT => {
            let flags = r.read_i32_le().unwrap();
            let namespace = r.read_cstring().unwrap();
            let mut documents = Vec::new();
            while r.remaining() > 0 {
                documents.push(read_doc(&mut r));
            }
            RequestBody::Insert {
                namespace,
                flags,
                documents,
            }
        }
        OP_QUERY => {
            let flags = r.read_i32_le().unwrap();
            let namespace = r.read_cstring().unwrap();
            let number_to_skip = r.read_i32_le().unwrap();
            let number_to_return = r.read_i32_le().unwrap();
            let query = read_doc(&mut r);
            RequestBody::Query {
                namespace,
                flags,
                number_to_skip,
                number_to_return,
                query,
            }
        }
        OP_GET_MORE => {
            r.read_i32_le().unwrap(); // ZERO
            let namespace = r.read_cstring().unwrap();
            let number_to_return = r.read_i32_le().unwrap();
            let cursor_id = r.read_i64_le().unwrap();
            RequestBody::GetMore {
                namespace,
                number_to_return,
                cursor_id,
            }
        }
        OP_DELETE => {
            r.read_i32_le().unwrap(); // ZERO
            let namespace = r.read_cstring().unwrap();
            let flags = r.read_i32_le().unwrap();
            let selector = read_doc(&mut r);
            RequestBody::Delete {
                namespace,
                flags,
                selector,
            }
        }
        OP_KILL_CURSORS => {
            r.read_i32_le().unwrap(); // ZERO
            let count = r.read_i32_le().unwrap();
            let mut cursor_ids = Vec::new();
            for _ in 0..count {
                cursor_ids.push(r.read_i64_le().unwrap());
            }
            RequestBody::KillCursors { cursor_ids }
        }
        other => panic!("unexpected op code {other}"),
    };
    Some(InboundRequest { header, body })
}

fn read_doc(r: &mut RopeReader) -> BsonDocument {
    let declared = r.peek_i32_le().unwrap();
    BsonDocument::from_rope(r.slice_next(declared as usize).unwrap()).unwrap()
}

/// Writes an OP_REPLY answering `response_to`.
pub async fn write_reply(
    stream: &mut TcpStream,
    response_to: i32,
    response_flags: i32,
    cursor_id: i64,
    documents: &[BsonDocument],
) {
    let docs_len: usize = documents.iter().map(|d| d.len_bytes()).sum();
    let total = 16 + 20 + docs_len;

    let mut b = RopeBuilder::new();
    b.append_i32_le(total as i32);
    b.append_i32_le(response_to.wrapping_add(10_000)); // server-side id
    b.append_i32_le(response_to);
    b.append_i32_le(OP_REPLY);
    b.append_i32_le(response_flags);
    b.append_i64_le(cursor_id);
    b.append_i32_le(0); // starting_from
    b.append_i32_le(documents.len() as i32);
    for doc in documents {
        b.append_rope(doc.as_rope().clone());
    }
    let frame = b.finish();
    for chunk in frame.chunks() {
        stream.write_all(chunk).await.unwrap();
    }
    stream.flush().await.unwrap();
}
