// =============================================================================
// Ingestion Worker — one socket per exchange, owned end to end
// =============================================================================
//
// Lifecycle:
//   connect → send subscribe frames for every active symbol → bootstrap
//   (REST snapshots where the venue needs them) → read loop.
//
// The read loop also serves the heartbeat and the command channel. Any frame
// from the venue marks the connection alive; a heartbeat tick that finds it
// still not alive since the previous ping forces a reconnect. Reconnects use
// exponential backoff and always resubscribe the full active set, since the
// venue forgets subscriptions with the socket.
//
// After `max_attempts` consecutive failures the worker reports `failed` and
// keeps retrying at the maximum delay. Cancellation stops it from any state.
//
// Symbols leaving the active set (unsubscribe, or the worker stopping) are
// announced downstream as `MarketEvent::Released`.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::{payload_head, ExchangeAdapter, Parsed, WorkerStatus, WorkerStatusSnapshot};
use crate::runtime_config::ReconnectConfig;
use crate::types::{now_ms, Exchange, MarketEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// How a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Cancelled, or nobody is consuming events any more.
    Shutdown,
    /// Connection lost; reconnect.
    Lost(String),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control surface for a running worker.
pub struct WorkerHandle {
    exchange: Exchange,
    commands: mpsc::Sender<WorkerCommand>,
    status: Arc<WorkerStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker that connects and subscribes `symbols`, emitting events
    /// on `events`. It stops when `parent` or its own token is cancelled.
    pub fn connect<A: ExchangeAdapter>(
        adapter: A,
        symbols: Vec<String>,
        events: mpsc::Sender<MarketEvent>,
        config: ReconnectConfig,
        parent: &CancellationToken,
    ) -> Self {
        let exchange = adapter.exchange();
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let status = Arc::new(WorkerStatus::default());
        let cancel = parent.child_token();

        let worker = Worker {
            adapter,
            active: symbols.into_iter().collect(),
            events,
            commands: rx,
            commands_open: true,
            status: status.clone(),
            config,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            exchange,
            commands: tx,
            status,
            cancel,
            task,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub async fn subscribe(&self, symbols: Vec<String>) -> Result<()> {
        self.commands
            .send(WorkerCommand::Subscribe(symbols))
            .await
            .context("worker stopped")
    }

    pub async fn unsubscribe(&self, symbols: Vec<String>) -> Result<()> {
        self.commands
            .send(WorkerCommand::Unsubscribe(symbols))
            .await
            .context("worker stopped")
    }

    /// Stop the worker. Safe to call any number of times.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> WorkerStatusSnapshot {
        self.status.snapshot(self.exchange)
    }

    pub fn status_handle(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(exchange = %self.exchange, error = %e, "worker task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker<A> {
    adapter: A,
    active: BTreeSet<String>,
    events: mpsc::Sender<MarketEvent>,
    commands: mpsc::Receiver<WorkerCommand>,
    commands_open: bool,
    status: Arc<WorkerStatus>,
    config: ReconnectConfig,
    cancel: CancellationToken,
}

impl<A: ExchangeAdapter> Worker<A> {
    async fn run(mut self) {
        let exchange = self.adapter.exchange();
        let mut backoff = Backoff::new(&self.config);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let url = self.adapter.ws_url();
            info!(%exchange, %url, symbols = ?self.active, "connecting");

            let connect = tokio::time::timeout(self.config.connect_timeout(), connect_async(&url));
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = connect => res,
            };

            match attempt {
                Ok(Ok((ws, _response))) => {
                    info!(%exchange, "connected");
                    self.status.connected.store(true, Relaxed);
                    self.status.failed.store(false, Relaxed);
                    backoff.reset();

                    let end = self.session(ws).await;
                    self.status.connected.store(false, Relaxed);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => warn!(%exchange, %reason, "connection lost"),
                    }
                }
                Ok(Err(e)) => warn!(%exchange, error = %e, "connection failed"),
                Err(_) => warn!(%exchange, "connection timed out"),
            }

            let delay = match backoff.next_delay() {
                Some(d) => d,
                None => {
                    if !self.status.failed.swap(true, Relaxed) {
                        error!(
                            %exchange,
                            attempts = backoff.attempt(),
                            "reconnect attempts exhausted, retrying at max delay"
                        );
                    }
                    backoff.max_delay()
                }
            };
            self.status.reconnects.fetch_add(1, Relaxed);
            debug!(%exchange, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            if !self.wait(delay).await {
                break;
            }
        }

        self.status.connected.store(false, Relaxed);
        // Best effort: the pipeline may already be gone at shutdown.
        for symbol in std::mem::take(&mut self.active) {
            let _ = self.events.try_send(MarketEvent::Released { exchange, symbol });
        }
        info!(%exchange, "worker stopped");
    }

    /// Sleep out a backoff delay, still tracking subscription changes.
    /// Returns false when cancelled.
    async fn wait(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(WorkerCommand::Subscribe(syms)) => self.active.extend(syms),
                    Some(WorkerCommand::Unsubscribe(syms)) => {
                        let gone: Vec<String> = syms.into_iter().filter(|s| self.active.remove(s)).collect();
                        if self.release(&gone).await.is_err() {
                            return false;
                        }
                    }
                    None => self.commands_open = false,
                },
            }
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let symbols: Vec<String> = self.active.iter().cloned().collect();
        if let Err(end) = self.subscribe(&mut write, &symbols).await {
            return end;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;
        let mut alive = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if !alive {
                        return SessionEnd::Lost("heartbeat missed".into());
                    }
                    alive = false;
                    let ping = match self.adapter.ping_frame() {
                        Some(text) => Message::Text(text),
                        None => Message::Ping(Vec::new()),
                    };
                    if let Err(e) = write.send(ping).await {
                        return SessionEnd::Lost(format!("ping failed: {e}"));
                    }
                }
                cmd = self.commands.recv(), if self.commands_open => {
                    let result = match cmd {
                        Some(WorkerCommand::Subscribe(syms)) => {
                            let fresh: Vec<String> = syms
                                .into_iter()
                                .filter(|s| self.active.insert(s.clone()))
                                .collect();
                            self.subscribe(&mut write, &fresh).await
                        }
                        Some(WorkerCommand::Unsubscribe(syms)) => {
                            let gone: Vec<String> = syms.into_iter().filter(|s| self.active.remove(s)).collect();
                            match self.send_frames(&mut write, self.adapter.unsubscribe_frames(&gone)).await {
                                Ok(()) => self.release(&gone).await,
                                Err(end) => {
                                    // The state is dropped either way; the socket is reconnecting.
                                    let _ = self.release(&gone).await;
                                    Err(end)
                                }
                            }
                        }
                        None => {
                            self.commands_open = false;
                            Ok(())
                        }
                    };
                    if let Err(end) = result {
                        return end;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        alive = true;
                        if let Err(end) = self.handle_text(&text, &mut write).await {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by peer: {frame:?}"));
                    }
                    Some(Ok(_)) => alive = true,
                    Some(Err(e)) => return SessionEnd::Lost(format!("read error: {e}")),
                    None => return SessionEnd::Lost("stream ended".into()),
                },
            }
        }
    }

    /// Send subscribe frames for `symbols` and emit their bootstrap events.
    async fn subscribe(&mut self, write: &mut WsSink, symbols: &[String]) -> Result<(), SessionEnd> {
        if symbols.is_empty() {
            return Ok(());
        }
        self.send_frames(write, self.adapter.subscribe_frames(symbols)).await?;
        info!(exchange = %self.adapter.exchange(), ?symbols, "subscribed");

        match self.adapter.bootstrap(symbols).await {
            Ok(events) => {
                for ev in events {
                    self.emit(ev).await?;
                }
            }
            Err(e) => warn!(exchange = %self.adapter.exchange(), error = %e, "bootstrap failed"),
        }
        Ok(())
    }

    async fn send_frames(&self, write: &mut WsSink, frames: Vec<String>) -> Result<(), SessionEnd> {
        for frame in frames {
            write
                .send(Message::Text(frame))
                .await
                .map_err(|e| SessionEnd::Lost(format!("send failed: {e}")))?;
        }
        Ok(())
    }

    async fn emit(&self, event: MarketEvent) -> Result<(), SessionEnd> {
        self.events.send(event).await.map_err(|_| SessionEnd::Shutdown)
    }

    async fn release(&self, symbols: &[String]) -> Result<(), SessionEnd> {
        let exchange = self.adapter.exchange();
        for symbol in symbols {
            debug!(%exchange, %symbol, "releasing symbol");
            self.emit(MarketEvent::Released {
                exchange,
                symbol: symbol.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_text(&mut self, text: &str, write: &mut WsSink) -> Result<(), SessionEnd> {
        self.status.messages.fetch_add(1, Relaxed);
        self.status.last_message_ms.store(now_ms().max(0) as u64, Relaxed);

        match self.adapter.parse(text) {
            Parsed::Events(events) => {
                for ev in events {
                    self.emit(ev).await?;
                }
            }
            Parsed::Reply(frame) => self.send_frames(write, vec![frame]).await?,
            Parsed::Control => {}
            Parsed::Unrecognized(reason) => {
                self.status.parse_errors.fetch_add(1, Relaxed);
                warn!(
                    exchange = %self.adapter.exchange(),
                    %reason,
                    payload_head = payload_head(text),
                    "unrecognized message dropped"
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
