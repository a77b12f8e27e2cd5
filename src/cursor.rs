//! Demand-driven cursor streams. One server batch is buffered at a time;
//! the next GET_MORE goes out only after the consumer has drained the
//! current batch, and dropping a live stream queues KILL_CURSORS.

use std::collections::VecDeque;

use tokio::time::{Duration, timeout};

use crate::bson::BsonDocument;
use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::error::{Error, Result};
use crate::protocol::{GetMore, Reply, ReplyFlags, Request};

/// A query result set, pulled batch by batch over the connection that ran
/// the query.
#[derive(Debug)]
pub struct CursorStream {
    namespace: String,
    conn: ConnectionHandle,
    cursor_id: i64,
    buffer: VecDeque<BsonDocument>,
    batch_size: i32,
    request_timeout: Duration,
}

impl CursorStream {
    pub(crate) fn open(
        namespace: String,
        reply: Reply,
        conn: ConnectionHandle,
        config: &Config,
    ) -> Result<Self> {
        let mut stream = Self {
            namespace,
            conn,
            cursor_id: reply.cursor_id,
            buffer: VecDeque::new(),
            batch_size: config.cursor_batch_size,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        };
        stream.absorb(reply)?;
        Ok(stream)
    }

    /// The server-side cursor id; 0 once the server holds no more data.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// Whether another document can be produced, fetching a batch if the
    /// local buffer is empty and the server cursor is still open.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.buffer.is_empty() {
            self.fetch().await?;
        }
        Ok(!self.buffer.is_empty())
    }

    /// The next document, or `None` once the result set is exhausted.
    pub async fn next(&mut self) -> Result<Option<BsonDocument>> {
        if self.buffer.is_empty() {
            self.fetch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Collects every remaining document. Mostly a test convenience.
    pub async fn collect_remaining(&mut self) -> Result<Vec<BsonDocument>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    /// One GET_MORE round at a time; the reply refills the buffer and may
    /// retire the cursor.
    async fn fetch(&mut self) -> Result<()> {
        while self.buffer.is_empty() && self.cursor_id != 0 {
            let request = Request::GetMore(GetMore {
                namespace: self.namespace.clone(),
                number_to_return: self.batch_size,
                cursor_id: self.cursor_id,
            });
            let reply = match timeout(self.request_timeout, self.conn.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
            // Leave cursor_id standing on transport failures: the drop
            // handler still tries to kill the server cursor, and on a dead
            // connection that attempt is logged and discarded.
            let reply = reply?;
            self.cursor_id = reply.cursor_id;
            self.absorb(reply)?;
        }
        Ok(())
    }

    fn absorb(&mut self, reply: Reply) -> Result<()> {
        if reply.response_flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
            self.cursor_id = 0;
            return Err(Error::CursorInvalid);
        }
        if reply.response_flags.contains(ReplyFlags::QUERY_FAILURE) {
            self.cursor_id = 0;
            let detail = reply
                .documents
                .into_iter()
                .next()
                .unwrap_or_else(BsonDocument::empty);
            return Err(Error::ServerError(detail));
        }
        self.buffer.extend(reply.documents);
        Ok(())
    }
}

impl Drop for CursorStream {
    fn drop(&mut self) {
        if self.cursor_id != 0 {
            tracing::debug!(
                namespace = %self.namespace,
                cursor_id = self.cursor_id,
                "stream dropped with live cursor; queueing kill_cursors"
            );
            self.conn.kill_cursors(vec![self.cursor_id]);
        }
    }
}
