//! One task per socket. The task owns the stream, the in-flight table and
//! the write queue; everything else talks to it over channels. Requests are
//! pipelined and replies are matched back to callers by `responseTo`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, timeout};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{
    self, HEADER_LEN, KillCursors, MessageHeader, OP_REPLY, Query, Reply, Request,
};

/// How many submissions may sit between producers and the connection task
/// before senders suspend.
const SUBMISSION_QUEUE_DEPTH: usize = 64;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) enum Command {
    /// One request. Reply-bearing ops complete with the server's reply;
    /// the rest complete with an empty reply once their frame is written.
    Send {
        request: Request,
        completion: oneshot::Sender<Result<Reply>>,
    },
    /// A write followed immediately by its acknowledgement query, encoded
    /// back to back so no other producer's frame can land between them.
    SendAcked {
        write: Request,
        ack: Query,
        completion: oneshot::Sender<Result<Reply>>,
    },
    /// Fire-and-forget KILL_CURSORS; a failure to encode or deliver is
    /// logged, never surfaced.
    Kill { cursor_ids: Vec<i64> },
}

pub(crate) enum ConnEvent {
    Ready { id: u64 },
    Terminated { id: u64, error: Option<Error> },
}

/// Cheap handle to a connection task. Cursors clone it so GET_MORE and
/// KILL_CURSORS stay on the connection that opened the cursor.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: u64,
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub(crate) async fn send(&self, request: Request) -> Result<Reply> {
        let (completion, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { request, completion })
            .await
            .map_err(|_| Error::NotReady)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub(crate) async fn send_acked(&self, write: Request, ack: Query) -> Result<Reply> {
        let (completion, rx) = oneshot::channel();
        self.tx
            .send(Command::SendAcked {
                write,
                ack,
                completion,
            })
            .await
            .map_err(|_| Error::NotReady)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Best-effort; used from `Drop` so it must not wait for queue space.
    pub(crate) fn kill_cursors(&self, cursor_ids: Vec<i64>) {
        if self.tx.try_send(Command::Kill { cursor_ids }).is_err() {
            tracing::warn!(connection = self.id, "could not queue kill_cursors");
        }
    }
}

/// Spawns the owning task for one endpoint socket. Submissions buffer in
/// the command queue while the socket is still connecting. The returned
/// drain sender moves the connection to Draining.
pub(crate) fn spawn(
    id: u64,
    addr: String,
    config: Arc<Config>,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> (ConnectionHandle, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
    let (drain_tx, drain_rx) = mpsc::channel(1);
    tokio::spawn(run(id, addr, config, rx, drain_rx, events));
    (ConnectionHandle { id, tx }, drain_tx)
}

async fn run(
    id: u64,
    addr: String,
    config: Arc<Config>,
    mut commands: mpsc::Receiver<Command>,
    drain: mpsc::Receiver<()>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let connect = timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect(addr.as_str()),
    )
    .await;
    let stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let error = Error::ConnectRefused(format!("{addr}: {err}"));
            reject_pending(&mut commands, &error);
            let _ = events.send(ConnEvent::Terminated {
                id,
                error: Some(error),
            });
            return;
        }
        Err(_) => {
            let error = Error::ConnectRefused(format!("{addr}: connect timed out"));
            reject_pending(&mut commands, &error);
            let _ = events.send(ConnEvent::Terminated {
                id,
                error: Some(error),
            });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::debug!(connection = id, %addr, "connected");
    let _ = events.send(ConnEvent::Ready { id });

    let mut actor = Actor {
        id,
        config,
        in_flight: HashMap::new(),
        write_queue: VecDeque::new(),
        read_buf: BytesMut::with_capacity(READ_CHUNK),
    };
    match actor.drive(&stream, &mut commands, drain).await {
        Ok(()) => {
            tracing::debug!(connection = id, "closed");
            let _ = events.send(ConnEvent::Terminated { id, error: None });
        }
        Err(error) => {
            tracing::warn!(connection = id, error = %error, "connection failed");
            actor.fail_all(&mut commands, &error);
            let _ = events.send(ConnEvent::Terminated {
                id,
                error: Some(error),
            });
        }
    }
}

/// A frame queued for the socket, with the write cursor that lets partial
/// writes resume without reordering.
struct Outgoing {
    chunks: Vec<Bytes>,
    chunk: usize,
    offset: usize,
    written: Option<oneshot::Sender<Result<Reply>>>,
}

impl Outgoing {
    fn new(frame: crate::rope::ByteRope, written: Option<oneshot::Sender<Result<Reply>>>) -> Self {
        Self {
            chunks: frame.chunks().cloned().collect(),
            chunk: 0,
            offset: 0,
            written,
        }
    }
}

enum ReadOutcome {
    Open,
    Eof,
}

struct Actor {
    id: u64,
    config: Arc<Config>,
    in_flight: HashMap<i32, oneshot::Sender<Result<Reply>>>,
    write_queue: VecDeque<Outgoing>,
    read_buf: BytesMut,
}

impl Actor {
    async fn drive(
        &mut self,
        stream: &TcpStream,
        commands: &mut mpsc::Receiver<Command>,
        mut drain: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut commands_open = true;
        let mut draining = false;
        let mut drain_deadline = Instant::now();

        loop {
            if draining
                && !commands_open
                && self.in_flight.is_empty()
                && self.write_queue.is_empty()
            {
                return Ok(());
            }

            let interest = if self.write_queue.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };

            tokio::select! {
                cmd = commands.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => {
                            self.handle_command(cmd);
                            self.flush_writes(stream)?;
                        }
                        None => {
                            // Every handle is gone; finish what was accepted.
                            commands_open = false;
                            if !draining {
                                draining = true;
                                drain_deadline = self.grace_deadline();
                            }
                        }
                    }
                }
                _ = drain.recv(), if !draining => {
                    draining = true;
                    drain_deadline = self.grace_deadline();
                    commands.close();
                }
                ready = stream.ready(interest) => {
                    let ready = ready.map_err(|e| Error::Io(Arc::new(e)))?;
                    if ready.is_writable() {
                        self.flush_writes(stream)?;
                    }
                    if ready.is_readable() {
                        match self.fill_from_socket(stream)? {
                            ReadOutcome::Open => {}
                            ReadOutcome::Eof => {
                                if draining && self.in_flight.is_empty() {
                                    return Ok(());
                                }
                                return Err(Error::ReadFailed(Arc::new(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "server closed the connection",
                                ))));
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(drain_deadline), if draining => {
                    // Grace expired with requests still outstanding.
                    for (_, completion) in self.in_flight.drain() {
                        let _ = completion.send(Err(Error::Shutdown));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn grace_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms)
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                request,
                completion,
            } => {
                let request_id = protocol::next_request_id();
                match request.encode(request_id, self.config.max_frame_bytes) {
                    Ok(frame) => {
                        if request.expects_reply() {
                            self.in_flight.insert(request_id, completion);
                            self.write_queue.push_back(Outgoing::new(frame, None));
                        } else {
                            self.write_queue
                                .push_back(Outgoing::new(frame, Some(completion)));
                        }
                    }
                    Err(err) => {
                        let _ = completion.send(Err(err.into()));
                    }
                }
            }
            Command::SendAcked {
                write,
                ack,
                completion,
            } => {
                let write_id = protocol::next_request_id();
                let write_frame = match write.encode(write_id, self.config.max_frame_bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = completion.send(Err(err.into()));
                        return;
                    }
                };
                let ack_id = protocol::next_request_id();
                let ack_frame =
                    match Request::Query(ack).encode(ack_id, self.config.max_frame_bytes) {
                        Ok(frame) => frame,
                        Err(err) => {
                            let _ = completion.send(Err(err.into()));
                            return;
                        }
                    };
                self.in_flight.insert(ack_id, completion);
                self.write_queue.push_back(Outgoing::new(write_frame, None));
                self.write_queue.push_back(Outgoing::new(ack_frame, None));
            }
            Command::Kill { cursor_ids } => {
                let request = Request::KillCursors(KillCursors { cursor_ids });
                let request_id = protocol::next_request_id();
                match request.encode(request_id, self.config.max_frame_bytes) {
                    Ok(frame) => self.write_queue.push_back(Outgoing::new(frame, None)),
                    Err(err) => {
                        tracing::warn!(
                            connection = self.id,
                            error = %err,
                            "failed to encode kill_cursors"
                        );
                    }
                }
            }
        }
    }

    /// Writes queued frames in acceptance order; a partial write leaves the
    /// cursor where it stopped.
    fn flush_writes(&mut self, stream: &TcpStream) -> Result<()> {
        while let Some(front) = self.write_queue.front_mut() {
            while front.chunk < front.chunks.len() {
                let chunk = &front.chunks[front.chunk];
                match stream.try_write(&chunk[front.offset..]) {
                    Ok(n) => {
                        front.offset += n;
                        if front.offset == chunk.len() {
                            front.chunk += 1;
                            front.offset = 0;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(Error::WriteFailed(Arc::new(e))),
                }
            }
            if let Some(written) = front.written.take() {
                let _ = written.send(Ok(Reply::empty()));
            }
            self.write_queue.pop_front();
        }
        Ok(())
    }

    fn fill_from_socket(&mut self, stream: &TcpStream) -> Result<ReadOutcome> {
        loop {
            self.read_buf.reserve(READ_CHUNK);
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(_) => self.process_frames()?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Open);
                }
                Err(e) => return Err(Error::ReadFailed(Arc::new(e))),
            }
        }
    }

    /// Peels complete frames off the read buffer. Anything structurally
    /// wrong here is fatal to the connection.
    fn process_frames(&mut self) -> Result<()> {
        while self.read_buf.len() >= 4 {
            let declared = i32::from_le_bytes([
                self.read_buf[0],
                self.read_buf[1],
                self.read_buf[2],
                self.read_buf[3],
            ]);
            if (declared as usize) < HEADER_LEN || declared < 0 {
                return Err(decode_fatal(crate::error::DecodeError::LengthMismatch));
            }
            if declared as usize > self.config.max_frame_bytes {
                return Err(Error::Encode(crate::error::EncodeError::FrameTooLarge {
                    len: declared as usize,
                    max: self.config.max_frame_bytes,
                }));
            }
            if self.read_buf.len() < declared as usize {
                break;
            }
            let frame = self.read_buf.split_to(declared as usize).freeze();
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        let header = MessageHeader::parse(&frame).map_err(decode_fatal)?;
        if header.op_code != OP_REPLY {
            tracing::warn!(
                connection = self.id,
                op_code = header.op_code,
                "ignoring non-reply frame from server"
            );
            return Ok(());
        }
        let body = crate::rope::ByteRope::from_bytes(frame.slice(HEADER_LEN..));
        let reply = Reply::decode(body).map_err(decode_fatal)?;
        match self.in_flight.remove(&header.response_to) {
            Some(completion) => {
                if completion.send(Ok(reply)).is_err() {
                    // Caller timed out or was cancelled; the slot was
                    // already orphaned.
                    tracing::debug!(
                        connection = self.id,
                        response_to = header.response_to,
                        "reply for an abandoned request discarded"
                    );
                }
            }
            None => {
                tracing::warn!(
                    connection = self.id,
                    response_to = header.response_to,
                    "no in-flight request matches reply; discarding"
                );
            }
        }
        Ok(())
    }

    /// Completes every waiter with the failure that killed the connection.
    fn fail_all(&mut self, commands: &mut mpsc::Receiver<Command>, error: &Error) {
        for (_, completion) in self.in_flight.drain() {
            let _ = completion.send(Err(error.clone()));
        }
        for outgoing in self.write_queue.drain(..) {
            if let Some(written) = outgoing.written {
                let _ = written.send(Err(error.clone()));
            }
        }
        reject_pending(commands, error);
    }
}

/// In-flight decode failures surface to callers as an i/o error carrying
/// the decode cause.
fn decode_fatal(err: crate::error::DecodeError) -> Error {
    Error::Io(Arc::new(io::Error::new(io::ErrorKind::InvalidData, err)))
}

fn reject_pending(commands: &mut mpsc::Receiver<Command>, error: &Error) {
    commands.close();
    while let Ok(cmd) = commands.try_recv() {
        match cmd {
            Command::Send { completion, .. } | Command::SendAcked { completion, .. } => {
                let _ = completion.send(Err(error.clone()));
            }
            Command::Kill { .. } => {}
        }
    }
}
