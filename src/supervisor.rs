//! Per-endpoint connection pool. A single task owns the pool state;
//! `Supervisor` is a cheap handle into it. Failed connections are replaced
//! after exponential backoff, and an endpoint that keeps failing is marked
//! unreachable until one reconnect succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep, sleep_until, timeout};

use crate::bson::DocumentBuilder;
use crate::config::Config;
use crate::connection::{self, ConnEvent, ConnectionHandle};
use crate::cursor::CursorStream;
use crate::error::{Error, Result};
use crate::protocol::{Query, QueryFlags, Reply, Request};

enum PoolCommand {
    Acquire {
        reply: oneshot::Sender<Result<ConnectionHandle>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Respawn,
}

/// Handle to one endpoint's pool. Cloneable and cheap; all clones feed the
/// same pool task.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<PoolCommand>,
    config: Arc<Config>,
}

impl Supervisor {
    pub(crate) fn spawn(endpoint: String, config: Arc<Config>) -> Supervisor {
        let (tx, rx) = mpsc::channel(32);
        let pool = Pool::new(endpoint, config.clone(), tx.clone());
        tokio::spawn(pool.run(rx));
        Supervisor { tx, config }
    }

    /// Sends one request and resolves with its reply, within
    /// `request_timeout_ms`.
    ///
    /// QUERY and GET_MORE resolve with the server's OP_REPLY. UPDATE,
    /// INSERT and DELETE are paired with a `getLastError` query on the same
    /// connection and resolve with the acknowledgement's reply.
    /// KILL_CURSORS resolves with an empty reply once written.
    pub async fn send(&self, request: impl Into<Request>) -> Result<Reply> {
        let request = request.into();
        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        timeout(deadline, self.send_inner(request))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Runs a query and exposes the result set as a demand-driven stream.
    pub async fn query(&self, query: Query) -> Result<CursorStream> {
        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        let namespace = query.namespace.clone();
        let (conn, reply) = timeout(deadline, async {
            let conn = self.acquire().await?;
            let reply = conn.send(Request::Query(query)).await?;
            Ok::<_, Error>((conn, reply))
        })
        .await
        .map_err(|_| Error::Timeout)??;
        CursorStream::open(namespace, reply, conn, &self.config)
    }

    /// Idempotent. Drains every connection and resolves once the pool task
    /// has terminated (bounded by `shutdown_timeout_ms`).
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send_inner(&self, request: Request) -> Result<Reply> {
        let conn = self.acquire().await?;
        let needs_ack = matches!(
            request,
            Request::Update(_) | Request::Insert(_) | Request::Delete(_)
        );
        if !needs_ack {
            return conn.send(request).await;
        }
        let ack = match request.namespace() {
            Some(namespace) => get_last_error(database_of(namespace))?,
            None => return conn.send(request).await,
        };
        conn.send_acked(request, ack).await
    }

    async fn acquire(&self) -> Result<ConnectionHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }
}

fn database_of(namespace: &str) -> &str {
    namespace.split('.').next().unwrap_or(namespace)
}

/// The `getLastError` command that turns a fire-and-forget write into an
/// acknowledged one.
fn get_last_error(db: &str) -> Result<Query> {
    let command = DocumentBuilder::new().int32("getLastError", 1)?.finish()?;
    Ok(Query {
        namespace: format!("{db}.$cmd"),
        flags: QueryFlags::empty(),
        number_to_skip: 0,
        number_to_return: -1,
        query: command,
        return_fields: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Connecting,
    Ready,
}

struct Slot {
    handle: ConnectionHandle,
    drain: mpsc::Sender<()>,
    state: SlotState,
}

struct Pool {
    endpoint: String,
    config: Arc<Config>,
    tx: mpsc::Sender<PoolCommand>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    round_robin: usize,
    consecutive_failures: u32,
    unreachable: bool,
    retry_scheduled: bool,
    waiters: Vec<oneshot::Sender<Result<ConnectionHandle>>>,
}

impl Pool {
    fn new(endpoint: String, config: Arc<Config>, tx: mpsc::Sender<PoolCommand>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            config,
            tx,
            events_tx,
            events_rx,
            slots: HashMap::new(),
            next_id: 0,
            round_robin: 0,
            consecutive_failures: 0,
            unreachable: false,
            retry_scheduled: false,
            waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<PoolCommand>) {
        let mut shutdown_done: Vec<oneshot::Sender<()>> = Vec::new();
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(PoolCommand::Acquire { reply }) => self.handle_acquire(reply),
                        Some(PoolCommand::Shutdown { done }) => {
                            shutdown_done.push(done);
                            break;
                        }
                        Some(PoolCommand::Respawn) => self.handle_respawn(),
                        // All supervisor handles dropped; shut down quietly.
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }
        self.finish_shutdown(&mut commands, shutdown_done).await;
    }

    fn handle_acquire(&mut self, reply: oneshot::Sender<Result<ConnectionHandle>>) {
        if self.unreachable {
            let _ = reply.send(Err(Error::Unreachable));
            return;
        }
        let mut ready: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .map(|(id, _)| *id)
            .collect();
        if !ready.is_empty() {
            ready.sort_unstable();
            let id = ready[self.round_robin % ready.len()];
            self.round_robin = self.round_robin.wrapping_add(1);
            let _ = reply.send(Ok(self.slots[&id].handle.clone()));
            return;
        }
        // No ready connection; submissions buffer on a connecting one.
        if let Some(slot) = self
            .slots
            .values()
            .find(|s| s.state == SlotState::Connecting)
        {
            let _ = reply.send(Ok(slot.handle.clone()));
            return;
        }
        if self.slots.len() < self.config.max_connections_per_endpoint {
            let handle = self.spawn_connection();
            let _ = reply.send(Ok(handle));
            return;
        }
        self.waiters.push(reply);
    }

    fn handle_respawn(&mut self) {
        self.retry_scheduled = false;
        if self.slots.len() < self.config.max_connections_per_endpoint {
            self.spawn_connection();
        }
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Ready { id } => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.state = SlotState::Ready;
                }
                if self.unreachable {
                    tracing::info!(endpoint = %self.endpoint, "endpoint recovered");
                }
                self.consecutive_failures = 0;
                self.unreachable = false;
                if let Some(slot) = self.slots.get(&id) {
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Ok(slot.handle.clone()));
                    }
                }
            }
            ConnEvent::Terminated { id, error } => {
                self.slots.remove(&id);
                let Some(error) = error else {
                    return;
                };
                self.consecutive_failures += 1;
                tracing::warn!(
                    endpoint = %self.endpoint,
                    connection = id,
                    error = %error,
                    failures = self.consecutive_failures,
                    "connection lost"
                );
                if self.consecutive_failures >= self.config.max_consecutive_failures
                    && !self.unreachable
                {
                    self.unreachable = true;
                    tracing::warn!(endpoint = %self.endpoint, "endpoint marked unreachable");
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Err(Error::Unreachable));
                    }
                }
                self.schedule_respawn();
            }
        }
    }

    fn spawn_connection(&mut self) -> ConnectionHandle {
        let id = self.next_id;
        self.next_id += 1;
        let (handle, drain) = connection::spawn(
            id,
            self.endpoint.clone(),
            self.config.clone(),
            self.events_tx.clone(),
        );
        tracing::debug!(endpoint = %self.endpoint, connection = id, "spawning connection");
        self.slots.insert(
            id,
            Slot {
                handle: handle.clone(),
                drain,
                state: SlotState::Connecting,
            },
        );
        handle
    }

    /// Exponential backoff with jitter; keeps ticking at the cap while the
    /// endpoint is unreachable so recovery needs no caller involvement.
    fn schedule_respawn(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        let base = self.config.reconnect_base_ms.saturating_mul(1 << exponent);
        let capped = base.min(self.config.reconnect_cap_ms);
        let jitter = self.config.reconnect_jitter;
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        let delay = Duration::from_millis((capped as f64 * factor).max(1.0) as u64);
        tracing::debug!(endpoint = %self.endpoint, ?delay, "scheduling reconnect");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(PoolCommand::Respawn).await;
        });
    }

    async fn finish_shutdown(
        &mut self,
        commands: &mut mpsc::Receiver<PoolCommand>,
        mut shutdown_done: Vec<oneshot::Sender<()>>,
    ) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Shutdown));
        }
        for slot in self.slots.values() {
            let _ = slot.drain.try_send(());
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        let mut commands_open = true;
        while !self.slots.is_empty() {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(ConnEvent::Terminated { id, .. }) => {
                            self.slots.remove(&id);
                        }
                        Some(ConnEvent::Ready { id }) => {
                            // Connected mid-shutdown; drain it right away.
                            if let Some(slot) = self.slots.get(&id) {
                                let _ = slot.drain.try_send(());
                            }
                        }
                        None => break,
                    }
                }
                cmd = commands.recv(), if commands_open => {
                    match cmd {
                        Some(PoolCommand::Acquire { reply }) => {
                            let _ = reply.send(Err(Error::Shutdown));
                        }
                        Some(PoolCommand::Shutdown { done }) => shutdown_done.push(done),
                        Some(PoolCommand::Respawn) => {}
                        None => commands_open = false,
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }
        tracing::debug!(endpoint = %self.endpoint, "supervisor terminated");
        for done in shutdown_done {
            let _ = done.send(());
        }
    }
}
