//! Background reconnection and socket handoff.
//!
//! ```text
//! client task                    agent reconnect listener
//!   sleep(window)
//!   wait for PROCESSING
//!   dial ───── RODS_RECONNECT{cookie} ─────▶ cookie lookup, park socket
//!        ◀──── RODS_RECONNECT{status} ──────
//!   park socket in SocketSlot
//!
//! client main path (next boundary)        agent main path
//!   RODS_RECONNECT on old socket ────────▶ take parked socket
//!   swap active, close old                 swap active, close old
//! ```
//!
//! A [`SocketSlot`] holds only the parked socket and the per-side state
//! flags. The active stream stays with its single owner, so a swap can
//! only happen where that owner checks the slot: between frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, GridError, Result};
use crate::net::connector::{attempt_connect, ConnectOptions};
use crate::net::framer::{self, MsgType};
use crate::net::pack::PackStruct;
use crate::net::GridStream;
use crate::protocol::{ReconnMsg, DEFAULT_COOKIE};

/// Delay between failed background reconnect attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Wait for the reconnect control message on a fresh socket.
pub const RECONNECT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// What one end of a connection is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcState {
    /// Between messages
    #[default]
    Processing = 0,
    /// Waiting for or reading a message
    Receiving = 1,
    /// Writing a message
    Sending = 2,
    /// Waiting for a reconnect
    ConnWait = 3,
}

impl ProcState {
    /// Wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// State for wire value `value`; unknown values read as `Processing`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Receiving,
            2 => Self::Sending,
            3 => Self::ConnWait,
            _ => Self::Processing,
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    parked: Option<GridStream>,
    local: ProcState,
    remote: ProcState,
}

/// Handoff point for a socket opened in the background.
#[derive(Debug, Default)]
pub struct SocketSlot {
    state: Mutex<SlotState>,
    processing: Notify,
    parked: Notify,
}

impl SocketSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the local end's state.
    pub fn set_local(&self, state: ProcState) {
        self.lock().local = state;
        if state == ProcState::Processing {
            self.processing.notify_one();
        }
    }

    /// Local end's state.
    pub fn local(&self) -> ProcState {
        self.lock().local
    }

    /// Record the peer's last reported state.
    pub fn set_remote(&self, state: ProcState) {
        self.lock().remote = state;
    }

    /// Peer's last reported state.
    pub fn remote(&self) -> ProcState {
        self.lock().remote
    }

    /// Wait until the local end is between messages.
    pub async fn wait_processing(&self) {
        loop {
            if self.local() == ProcState::Processing {
                return;
            }
            self.processing.notified().await;
        }
    }

    /// Park `stream`, returning any socket it displaces.
    pub fn park(&self, stream: GridStream) -> Option<GridStream> {
        let displaced = self.lock().parked.replace(stream);
        self.parked.notify_one();
        displaced
    }

    /// Take the parked socket.
    pub fn take(&self) -> Option<GridStream> {
        self.lock().parked.take()
    }

    /// Take the parked socket, waiting up to `limit` for one to arrive.
    pub async fn take_within(&self, limit: Duration) -> Option<GridStream> {
        let wait = async {
            loop {
                if let Some(stream) = self.take() {
                    return stream;
                }
                self.parked.notified().await;
            }
        };
        tokio::time::timeout(limit, wait).await.ok()
    }

    /// Check if a socket is parked.
    pub fn is_ready(&self) -> bool {
        self.lock().parked.is_some()
    }
}

/// Random session cookie, never the "not offered" value.
pub fn random_cookie() -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let cookie = rng.gen_range(1..i32::MAX);
        if cookie != DEFAULT_COOKIE {
            return cookie;
        }
    }
}

/// Send a reconnect control message.
pub async fn send_reconn_msg(stream: &mut GridStream, msg: &ReconnMsg) -> Result<()> {
    framer::send_message(stream, MsgType::Reconnect, &msg.pack(), &[], &[], msg.status).await
}

/// Read a reconnect control message.
pub async fn read_reconn_msg(stream: &mut GridStream, deadline: Duration) -> Result<ReconnMsg> {
    let header = framer::read_header(stream, Some(deadline)).await?;
    framer::expect_type(&header, MsgType::Reconnect)?;
    framer::warn_unexpected_aux(&header);
    let body = framer::read_body(stream, &header).await?;
    ReconnMsg::unpack(&body.structure)
}

/// Where and how the client reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectTarget {
    /// Agent reconnect listener host
    pub host: String,
    /// Agent reconnect listener port
    pub port: u16,
    /// Session cookie from the version message
    pub cookie: i32,
    /// Idle time before dialing
    pub window: Duration,
    /// Connector settings
    pub options: ConnectOptions,
}

/// Client side: the background task and its slot.
#[derive(Debug)]
pub struct ReconnectHandle {
    slot: Arc<SocketSlot>,
    cookie: i32,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    /// Start the background task for `target`.
    pub fn spawn(target: ReconnectTarget) -> Self {
        let slot = Arc::new(SocketSlot::new());
        let cookie = target.cookie;
        let task = tokio::spawn(run_client(target, Arc::clone(&slot)));
        Self { slot, cookie, task }
    }

    /// Shared slot.
    pub fn slot(&self) -> &SocketSlot {
        &self.slot
    }

    /// Session cookie.
    pub fn cookie(&self) -> i32 {
        self.cookie
    }

    /// Check if a replacement socket is waiting.
    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Stop the task and return any parked socket.
    pub fn shutdown(self) -> Option<GridStream> {
        self.task.abort();
        self.slot.take()
    }
}

impl Drop for ReconnectHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_client(target: ReconnectTarget, slot: Arc<SocketSlot>) {
    tokio::time::sleep(target.window).await;
    loop {
        slot.wait_processing().await;
        match dial(&target, slot.local()).await {
            Ok((stream, reply)) => {
                slot.set_remote(ProcState::from_i32(reply.proc_state));
                if let Some(stale) = slot.park(stream) {
                    let _ = stale.close().await;
                }
                info!(
                    "Reconnect socket to {}:{} ready",
                    target.host, target.port
                );
                return;
            },
            Err(e) => {
                warn!("Background reconnect failed: {}", e);
                tokio::time::sleep(RETRY_DELAY).await;
            },
        }
    }
}

async fn dial(target: &ReconnectTarget, state: ProcState) -> Result<(GridStream, ReconnMsg)> {
    let tcp = attempt_connect(&target.host, target.port, &target.options).await?;
    let mut stream = GridStream::from(tcp);
    let request = ReconnMsg {
        status: 0,
        cookie: target.cookie,
        proc_state: state.as_i32(),
        flag: 0,
    };
    let exchanged = async {
        send_reconn_msg(&mut stream, &request).await?;
        read_reconn_msg(&mut stream, RECONNECT_READ_TIMEOUT).await
    };
    let reply = match exchanged.await {
        Ok(reply) => reply,
        Err(e) => {
            let _ = stream.close().await;
            return Err(e);
        },
    };
    if reply.status < 0 {
        let _ = stream.close().await;
        return Err(GridError::from_code(
            ErrorCode(reply.status),
            "agent rejected the reconnect",
        ));
    }
    Ok((stream, reply))
}

/// Agent side: sessions that accept reconnects, keyed by cookie.
///
/// Dropping the last handle stops the reconnect listener.
#[derive(Debug)]
pub struct ReconnectRegistry {
    local_addr: SocketAddr,
    sessions: Mutex<HashMap<i32, Arc<SocketSlot>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectRegistry {
    /// Bind the reconnect listener and start accepting.
    pub async fn bind(addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GridError::transport(
                ErrorCode::USER_SOCK_OPEN_ERR,
                format!("cannot bind reconnect listener on {addr}: {e}"),
            )
        })?;
        let registry = Arc::new(Self {
            local_addr: listener.local_addr()?,
            sessions: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
        });
        info!("Reconnect listener on {}", registry.local_addr);

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&registry)));
        *registry
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(registry)
    }

    /// Listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Arc<SocketSlot>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session under a fresh cookie.
    pub fn register(&self) -> (i32, Arc<SocketSlot>) {
        let mut sessions = self.sessions();
        let cookie = loop {
            let cookie = random_cookie();
            if !sessions.contains_key(&cookie) {
                break cookie;
            }
        };
        let slot = Arc::new(SocketSlot::new());
        sessions.insert(cookie, Arc::clone(&slot));
        (cookie, slot)
    }

    /// Forget the session under `cookie`.
    pub fn unregister(&self, cookie: i32) {
        if let Some(slot) = self.sessions().remove(&cookie) {
            drop(slot.take());
        }
    }

    async fn accept_one(&self, mut stream: GridStream) -> Result<()> {
        let request = read_reconn_msg(&mut stream, RECONNECT_READ_TIMEOUT).await?;
        let slot = self.sessions().get(&request.cookie).cloned();
        let Some(slot) = slot else {
            let reply = ReconnMsg {
                status: ErrorCode::SYS_RECONNECT_ERR.0,
                cookie: request.cookie,
                proc_state: ProcState::Processing.as_i32(),
                flag: 0,
            };
            send_reconn_msg(&mut stream, &reply).await?;
            let _ = stream.close().await;
            return Err(GridError::transport(
                ErrorCode::SYS_RECONNECT_ERR,
                format!("unknown reconnect cookie {}", request.cookie),
            ));
        };

        slot.set_remote(ProcState::from_i32(request.proc_state));
        let reply = ReconnMsg {
            status: 0,
            cookie: request.cookie,
            proc_state: slot.local().as_i32(),
            flag: 0,
        };
        send_reconn_msg(&mut stream, &reply).await?;
        if let Some(stale) = slot.park(stream) {
            let _ = stale.close().await;
        }
        debug!("Parked reconnect socket for cookie {}", request.cookie);
        Ok(())
    }
}

impl Drop for ReconnectRegistry {
    fn drop(&mut self) {
        let task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, registry: Weak<ReconnectRegistry>) {
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(e) = registry.accept_one(GridStream::from(tcp)).await {
                        warn!("Reconnect from {} failed: {}", peer, e);
                    }
                });
            },
            Err(e) => warn!("Reconnect accept failed: {}", e),
        }
    }
    debug!("Reconnect listener on {:?} stopped", listener.local_addr());
}
