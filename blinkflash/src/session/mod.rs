//! Connection session.
//!
//! A [`Session`] owns at most one link to an OpenBlink device and keeps it
//! alive: an unexpected drop starts bounded automatic recovery with
//! exponential backoff, and a user disconnect always wins over a recovery in
//! flight.
//!
//! The state machine runs as a single task. [`Session`] is a cheap handle
//! that sends requests to it; link drops, connect completions and retry
//! completions come back as messages on the same channel, so every
//! transition happens in one place.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!      ^                        |                 |  drop
//!      |                        +--err------------+----> Reconnecting(1)
//!      |                                                   |  retry fails
//!      +------ attempts exhausted / disconnect ----- Reconnecting(n+1)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use blinkflash::link::sim::SimCentral;
//! use blinkflash::session::{Session, SessionConfig};
//! use blinkflash::transfer::{FirmwareImage, Slot};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let (central, _device) = SimCentral::with_default_device();
//! let session = Session::spawn(Arc::new(central), SessionConfig::default());
//!
//! session.connect().await.unwrap();
//! let image = FirmwareImage::new(b"RITE0300".to_vec(), Slot::Two).unwrap();
//! let outcome = session.send_firmware(&image, |_, _| {}).await.unwrap();
//! assert_eq!(outcome.total_bytes, 8);
//! session.shutdown().await;
//! # });
//! ```

mod state;

pub use state::{ConnectionState, DEFAULT_CONNECT_TIMEOUT, ReconnectPolicy, SessionConfig};

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::console::forward_console;
use crate::error::{Error, Result};
use crate::event::{EventSink, SessionEvent};
use crate::link::{Central, ConsoleSink, DeviceInfo, DiscoveryFilter, Link, LinkId};
use crate::mtu::{MtuPolicy, NegotiatedMtu, negotiate};
use crate::transfer::{self, FirmwareImage, TransferOutcome};

const MAILBOX_CAPACITY: usize = 32;

/// Result of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new link was established.
    Connected {
        /// Device the link goes to.
        device: DeviceInfo,
        /// Negotiated MTU.
        mtu: NegotiatedMtu,
    },
    /// A link was already up; nothing changed.
    AlreadyConnected,
    /// A connect or recovery is already in progress; nothing changed.
    AlreadyConnecting,
}

/// Shared view of the current link, held for the duration of a transfer.
#[derive(Clone)]
struct Lease {
    link: Arc<dyn Link>,
    mtu: NegotiatedMtu,
}

/// A link that finished connecting, MTU negotiation and console setup.
struct Established {
    link: Arc<dyn Link>,
    mtu: NegotiatedMtu,
}

impl Established {
    async fn close(self, sink_id: u64) {
        close_link(self.link.as_ref(), sink_id).await;
    }
}

enum Message {
    Connect {
        device: Option<DeviceInfo>,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Lease {
        reply: oneshot::Sender<Result<Lease>>,
    },
    ConnectFinished {
        generation: u64,
        result: Result<Established>,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    },
    LinkDropped {
        link: LinkId,
    },
    RetryFinished {
        generation: u64,
        attempt: u32,
        result: Result<Established>,
    },
}

struct Active {
    link: Arc<dyn Link>,
    mtu: NegotiatedMtu,
    watcher: CancellationToken,
}

enum Phase {
    Disconnected,
    Connecting {
        generation: u64,
    },
    Connected(Active),
    Reconnecting {
        attempt: u32,
        device: DeviceInfo,
        retry: CancellationToken,
    },
}

/// Everything a connect task needs, cloned out of the actor.
#[derive(Clone)]
struct Connector {
    central: Arc<dyn Central>,
    discovery: DiscoveryFilter,
    mtu: MtuPolicy,
    connect_timeout: Duration,
    events: EventSink,
    sink: ConsoleSink,
}

impl Connector {
    async fn establish(&self, device: Option<DeviceInfo>) -> Result<Established> {
        let device = match device {
            Some(device) => device,
            None => self
                .central
                .scan(&self.discovery)
                .await?
                .into_iter()
                .next()
                .ok_or(Error::DeviceNotFound)?,
        };

        debug!("Connecting to {device}");
        let link = tokio::time::timeout(self.connect_timeout, self.central.connect(&device))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", device.name)))??;
        let mtu = negotiate(link.as_ref(), &self.mtu, &self.events).await;

        if let Err(e) = link.subscribe_console(self.sink.clone()).await {
            close_link(link.as_ref(), self.sink.id()).await;
            return Err(e);
        }

        Ok(Established { link, mtu })
    }
}

async fn close_link(link: &dyn Link, sink_id: u64) {
    if let Err(e) = link.unsubscribe_console(sink_id).await {
        debug!("Console unsubscribe on {} failed: {e}", link.id());
    }
    if let Err(e) = link.disconnect().await {
        debug!("Disconnect of {} failed: {e}", link.id());
    }
}

/// Post `message` to the actor. A message the actor can no longer receive
/// is handed back so the caller can release what it carries.
async fn post(mailbox: &mpsc::WeakSender<Message>, message: Message) -> Option<Message> {
    match mailbox.upgrade() {
        Some(tx) => tx.send(message).await.err().map(|e| e.0),
        None => Some(message),
    }
}

/// Release the link carried by an undeliverable message.
async fn abandon(message: Message, sink_id: u64) {
    if let Message::ConnectFinished {
        result: Ok(est), ..
    }
    | Message::RetryFinished {
        result: Ok(est), ..
    } = message
    {
        est.close(sink_id).await;
    }
}

struct Actor {
    phase: Phase,
    generation: u64,
    connector: Connector,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    mailbox: mpsc::WeakSender<Message>,
    shutdown: CancellationToken,
}

impl Actor {
    fn events(&self) -> &EventSink {
        &self.connector.events
    }

    fn sink_id(&self) -> u64 {
        self.connector.sink.id()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Session state: {next}");
            self.events().state(next);
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Message>) {
        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message).await;
                }
                () = self.shutdown.cancelled() => break,
            }
        }

        self.generation += 1;
        self.release().await;
        self.set_state(ConnectionState::Disconnected);

        // Anything still queued carries either a reply nobody needs or a
        // link nobody will use.
        inbox.close();
        while let Ok(message) = inbox.try_recv() {
            abandon(message, self.sink_id()).await;
        }
        debug!("Session task stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Connect { device, reply } => self.on_connect(device, reply),
            Message::Disconnect { reply } => {
                self.on_disconnect().await;
                let _ = reply.send(());
            },
            Message::Lease { reply } => {
                let lease = match &self.phase {
                    Phase::Connected(active) if active.link.is_connected() => Ok(Lease {
                        link: active.link.clone(),
                        mtu: active.mtu,
                    }),
                    _ => Err(Error::NotConnected),
                };
                let _ = reply.send(lease);
            },
            Message::ConnectFinished {
                generation,
                result,
                reply,
            } => self.on_connect_finished(generation, result, reply).await,
            Message::LinkDropped { link } => self.on_link_dropped(link).await,
            Message::RetryFinished {
                generation,
                attempt,
                result,
            } => self.on_retry_finished(generation, attempt, result).await,
        }
    }

    fn on_connect(
        &mut self,
        device: Option<DeviceInfo>,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    ) {
        match self.phase {
            Phase::Connected(_) => {
                let _ = reply.send(Ok(ConnectOutcome::AlreadyConnected));
                return;
            },
            Phase::Connecting { .. } | Phase::Reconnecting { .. } => {
                let _ = reply.send(Ok(ConnectOutcome::AlreadyConnecting));
                return;
            },
            Phase::Disconnected => {},
        }

        self.generation += 1;
        let generation = self.generation;
        self.phase = Phase::Connecting { generation };
        self.set_state(ConnectionState::Connecting);

        let connector = self.connector.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = connector.establish(device).await;
            let message = Message::ConnectFinished {
                generation,
                result,
                reply,
            };
            if let Some(message) = post(&mailbox, message).await {
                abandon(message, connector.sink.id()).await;
            }
        });
    }

    async fn on_connect_finished(
        &mut self,
        generation: u64,
        result: Result<Established>,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    ) {
        let current = matches!(self.phase, Phase::Connecting { generation: g } if g == generation);
        if !current {
            if let Ok(est) = result {
                debug!("Discarding superseded connect to {}", est.link.device());
                est.close(self.sink_id()).await;
            }
            let _ = reply.send(Err(Error::Cancelled));
            return;
        }

        match result {
            Ok(est) => {
                let outcome = ConnectOutcome::Connected {
                    device: est.link.device().clone(),
                    mtu: est.mtu,
                };
                self.enter_connected(est);
                let _ = reply.send(Ok(outcome));
            },
            Err(e) => {
                warn!("Connect failed: {e}");
                self.events().status(e.status_line());
                self.phase = Phase::Disconnected;
                self.set_state(ConnectionState::Disconnected);
                let _ = reply.send(Err(e));
            },
        }
    }

    fn enter_connected(&mut self, est: Established) {
        let Established { link, mtu } = est;
        let watcher = self.shutdown.child_token();

        let watched = link.clone();
        let stop = watcher.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = watched.closed() => {
                    let _ = post(&mailbox, Message::LinkDropped { link: watched.id() }).await;
                }
                () = stop.cancelled() => {}
            }
        });

        info!("Connected to {} (MTU {}, {})", link.device(), mtu.value, mtu.source);
        self.events()
            .status(format!("Connected to device: {}", link.device().name));
        self.phase = Phase::Connected(Active { link, mtu, watcher });
        self.set_state(ConnectionState::Connected);
    }

    async fn on_link_dropped(&mut self, id: LinkId) {
        let Phase::Connected(active) = &self.phase else {
            return;
        };
        if active.link.id() != id {
            return;
        }

        let Phase::Connected(active) =
            std::mem::replace(&mut self.phase, Phase::Disconnected)
        else {
            return;
        };
        active.watcher.cancel();
        let device = active.link.device().clone();
        warn!("Link to {device} dropped");
        self.events()
            .status(format!("Device disconnected: {}", device.name));
        close_link(active.link.as_ref(), self.sink_id()).await;

        if self.reconnect.is_enabled() {
            self.schedule_retry(device, 1);
        } else {
            self.give_up();
        }
    }

    fn give_up(&mut self) {
        self.events()
            .status("Max reconnection attempts reached. Please reconnect manually.");
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_retry(&mut self, device: DeviceInfo, attempt: u32) {
        let delay = self.reconnect.delay_for(attempt);
        self.events().status(format!(
            "Attempting to reconnect ({attempt}/{}) in {}ms...",
            self.reconnect.max_attempts,
            delay.as_millis()
        ));

        let retry = self.shutdown.child_token();
        let generation = self.generation;
        let connector = self.connector.clone();
        let mailbox = self.mailbox.clone();
        let cancelled = retry.clone();
        let target = device.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancelled.cancelled() => return,
            }
            let result = connector.establish(Some(target)).await;
            let message = Message::RetryFinished {
                generation,
                attempt,
                result,
            };
            if let Some(message) = post(&mailbox, message).await {
                abandon(message, connector.sink.id()).await;
            }
        });

        self.phase = Phase::Reconnecting {
            attempt,
            device,
            retry,
        };
        self.set_state(ConnectionState::Reconnecting { attempt });
    }

    async fn on_retry_finished(
        &mut self,
        generation: u64,
        attempt: u32,
        result: Result<Established>,
    ) {
        let current = generation == self.generation
            && matches!(self.phase, Phase::Reconnecting { attempt: a, .. } if a == attempt);
        if !current {
            if let Ok(est) = result {
                self.events()
                    .status("Reconnect attempt was cancelled by user.");
                est.close(self.sink_id()).await;
            }
            return;
        }

        let Phase::Reconnecting { device, .. } =
            std::mem::replace(&mut self.phase, Phase::Disconnected)
        else {
            return;
        };

        match result {
            Ok(est) => {
                self.events().status("Reconnected successfully!");
                self.enter_connected(est);
            },
            Err(e) => {
                warn!("Reconnect attempt {attempt} failed: {e}");
                if self.reconnect.allows_after(attempt) {
                    self.schedule_retry(device, attempt + 1);
                } else {
                    self.give_up();
                }
            },
        }
    }

    async fn on_disconnect(&mut self) {
        self.generation += 1;
        self.release().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop whatever the current phase holds and return to `Disconnected`.
    async fn release(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Disconnected => {},
            Phase::Connecting { .. } => {
                debug!("Abandoning connect in progress");
            },
            Phase::Connected(active) => {
                self.events().status("Disconnecting from device...");
                active.watcher.cancel();
                close_link(active.link.as_ref(), self.sink_id()).await;
                self.events().status("Disconnected from device.");
            },
            Phase::Reconnecting { retry, .. } => {
                retry.cancel();
                self.events()
                    .status("Reconnect attempt was cancelled by user.");
            },
        }
    }
}

/// Handle to a running session.
///
/// Cloning is cheap; all clones talk to the same state machine. The session
/// task stops on [`Session::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    tx: mpsc::Sender<Message>,
    state: watch::Receiver<ConnectionState>,
    events: EventSink,
    central: Arc<dyn Central>,
    discovery: DiscoveryFilter,
    shutdown: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session on the current tokio runtime.
    pub fn spawn(central: Arc<dyn Central>, config: SessionConfig) -> Self {
        let events = EventSink::new();
        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (tx, inbox) = mpsc::channel(MAILBOX_CAPACITY);

        let (sink, console_rx) = ConsoleSink::channel();
        tokio::spawn(forward_console(
            console_rx,
            events.clone(),
            shutdown.child_token(),
        ));

        let actor = Actor {
            phase: Phase::Disconnected,
            generation: 0,
            connector: Connector {
                central: central.clone(),
                discovery: config.discovery.clone(),
                mtu: config.mtu,
                connect_timeout: config.connect_timeout,
                events: events.clone(),
                sink,
            },
            reconnect: config.reconnect,
            state: state_tx,
            mailbox: tx.downgrade(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run(inbox));

        Self {
            tx,
            state: state_rx,
            events,
            central,
            discovery: config.discovery,
            shutdown,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Scan for devices matching the session's discovery filter.
    pub async fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let found = self.central.scan(&self.discovery).await;
        if let Err(e) = &found {
            self.events.status(e.status_line());
        }
        found
    }

    /// Connect to the first device matching the discovery filter.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        self.request(|reply| Message::Connect {
            device: None,
            reply,
        })
        .await?
    }

    /// Connect to a specific discovered device.
    pub async fn connect_to(&self, device: DeviceInfo) -> Result<ConnectOutcome> {
        self.request(|reply| Message::Connect {
            device: Some(device),
            reply,
        })
        .await?
    }

    /// Disconnect and cancel any pending recovery.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Message::Disconnect { reply }).await
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to status, console and state events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Event sink shared with the session, for callers that report their
    /// own status lines alongside the session's.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// MTU of the current link.
    pub async fn mtu(&self) -> Result<NegotiatedMtu> {
        Ok(self.lease().await?.mtu)
    }

    async fn lease(&self) -> Result<Lease> {
        self.request(|reply| Message::Lease { reply }).await?
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            match e {
                // Already reported frame by frame.
                Error::ChunkWrite { .. } | Error::FrameWrite { .. } => {},
                other => self.events.status(other.status_line()),
            }
        }
        result
    }

    /// Send `image` over the current link.
    ///
    /// The transfer runs in the caller's task; a drop during the transfer
    /// fails it while the session starts recovery on its own.
    pub async fn send_firmware<F>(&self, image: &FirmwareImage, progress: F) -> Result<TransferOutcome>
    where
        F: FnMut(usize, usize) + Send,
    {
        let result = async {
            let lease = self.lease().await?;
            transfer::send_firmware(lease.link.as_ref(), lease.mtu, image, &self.events, progress)
                .await
        }
        .await;
        self.report(result)
    }

    /// Ask the device to reset.
    pub async fn send_reset(&self) -> Result<()> {
        let result = async {
            let lease = self.lease().await?;
            transfer::send_reset(lease.link.as_ref(), &self.events).await
        }
        .await;
        self.report(result)
    }

    /// Ask the device to reload its program.
    pub async fn send_reload(&self) -> Result<()> {
        let result = async {
            let lease = self.lease().await?;
            transfer::send_reload(lease.link.as_ref(), &self.events).await
        }
        .await;
        self.report(result)
    }

    /// Disconnect and stop the session task.
    pub async fn shutdown(&self) {
        let _ = self.disconnect().await;
        self.shutdown.cancel();
    }
}
