// =============================================================================
// Subscription Hub — per-connection subscriptions and fan-out
// =============================================================================
//
// Every push connection gets an id and a bounded outbound queue. A subscribe
// request is registered and acknowledged first. Live updates matching it are
// held in a per-subscription priming buffer while the current state is read
// from the cache (nothing on a miss); the state is then queued, followed by
// whatever was held. Live updates arrive through the bridge: cache
// notifications are parsed back into topics and broadcast to every matching
// subscription. A bridge stream that ends is resubscribed with backoff.
//
// A connection whose queue is full or closed is removed on the spot and its
// token cancelled; the socket task notices and closes. Other connections are
// untouched.
//
// Matching:
//   orderbook + exchange → orderbook:update:{ex}:{sym}
//   orderbook + "all"    → agg:book:update:{sym}
//   trades    + exchange → trades:update:{ex}:{sym}
//   trades    + "all"    → trades:update:*:{sym}
//   chart     + exchange → candles:update:{ex}:{sym}:{tf}
//   chart     + "all"    → aggregated:candles:{sym}:{tf}
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ClientError;
use crate::cache::{keys, keys::Topic, Notification, SharedCache};
use crate::ingestion::backoff::Backoff;
use crate::runtime_config::ReconnectConfig;
use crate::types::{now_ms, Exchange, Timeframe};

pub type ConnectionId = Uuid;

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Orderbook,
    Trades,
    Chart,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::Trades => "trades",
            Self::Chart => "chart",
        }
    }
}

/// One exchange, or the cross-exchange view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Venue {
    Exchange(Exchange),
    All,
}

impl Venue {
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        raw.parse()
            .map(Self::Exchange)
            .map_err(|_| ClientError::UnknownExchange(raw.to_string()))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Exchange(ex) => ex.as_str(),
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscription {
    pub id: String,
    pub connection: ConnectionId,
    pub kind: StreamKind,
    pub symbol: String,
    pub venue: Venue,
    /// Always set for charts.
    pub timeframe: Option<Timeframe>,
}

impl ClientSubscription {
    pub fn matches(&self, topic: &Topic) -> bool {
        match (self.kind, topic) {
            (StreamKind::Orderbook, Topic::OrderBook { exchange, symbol }) => {
                self.venue == Venue::Exchange(*exchange) && self.symbol == *symbol
            }
            (StreamKind::Orderbook, Topic::AggregatedBook { symbol }) => {
                self.venue == Venue::All && self.symbol == *symbol
            }
            (StreamKind::Trades, Topic::Trades { exchange, symbol }) => {
                (self.venue == Venue::All || self.venue == Venue::Exchange(*exchange))
                    && self.symbol == *symbol
            }
            (StreamKind::Chart, Topic::Candle { exchange, symbol, timeframe }) => {
                self.venue == Venue::Exchange(*exchange)
                    && self.symbol == *symbol
                    && self.timeframe == Some(*timeframe)
            }
            (StreamKind::Chart, Topic::AggregatedCandle { symbol, timeframe }) => {
                self.venue == Venue::All && self.symbol == *symbol && self.timeframe == Some(*timeframe)
            }
            _ => false,
        }
    }

    /// Cache keys holding the current state for this subscription.
    fn state_keys(&self) -> Vec<String> {
        let sym = self.symbol.as_str();
        match (self.kind, self.venue) {
            (StreamKind::Orderbook, Venue::Exchange(ex)) => vec![keys::orderbook(ex, sym)],
            (StreamKind::Orderbook, Venue::All) => vec![keys::agg_book(sym)],
            (StreamKind::Trades, Venue::Exchange(ex)) => vec![keys::trades(ex, sym)],
            (StreamKind::Trades, Venue::All) => {
                Exchange::ALL.iter().map(|ex| keys::trades(*ex, sym)).collect()
            }
            (StreamKind::Chart, Venue::Exchange(ex)) => {
                self.timeframe.map(|tf| keys::candle(ex, sym, tf)).into_iter().collect()
            }
            (StreamKind::Chart, Venue::All) => {
                self.timeframe.map(|tf| keys::agg_candle(sym, tf)).into_iter().collect()
            }
        }
    }
}

// =============================================================================
// Client protocol
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionParams {
    pub timeframe: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: ClientAction,
    #[serde(rename = "type")]
    pub kind: Option<StreamKind>,
    pub symbol: Option<String>,
    pub exchange: Option<String>,
    #[serde(default)]
    pub params: SubscriptionParams,
    pub subscription_id: Option<String>,
}

/// A validated subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub id: Option<String>,
    pub kind: StreamKind,
    pub symbol: String,
    pub venue: Venue,
    pub timeframe: Option<Timeframe>,
}

impl SubscribeRequest {
    pub fn from_message(msg: ClientMessage) -> Result<Self, ClientError> {
        let kind = msg.kind.ok_or(ClientError::MissingField("subscribe", "type"))?;
        let symbol = msg
            .symbol
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or(ClientError::MissingField("subscribe", "symbol"))?;
        let venue = Venue::parse(msg.exchange.as_deref().unwrap_or("all"))?;

        let timeframe = match (kind, msg.params.timeframe) {
            (StreamKind::Chart, None) => {
                return Err(ClientError::MissingField("chart", "params.timeframe"));
            }
            (_, Some(raw)) => Some(
                raw.parse::<Timeframe>()
                    .map_err(|_| ClientError::UnknownTimeframe(raw.clone()))?,
            ),
            (_, None) => None,
        };

        Ok(Self {
            id: msg.subscription_id,
            kind,
            symbol,
            venue,
            timeframe: if kind == StreamKind::Chart { timeframe } else { None },
        })
    }
}

/// Push envelope: `{type, data, subscriptionId, timestamp}`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription_id: Option<&'a str>,
    timestamp: i64,
}

fn envelope(kind: &str, data: &Value, subscription_id: Option<&str>) -> Option<String> {
    let env = Envelope {
        kind,
        data,
        subscription_id,
        timestamp: now_ms(),
    };
    match serde_json::to_string(&env) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, kind, "push envelope not serialisable");
            None
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

struct Connection {
    outbound: mpsc::Sender<String>,
    subscriptions: HashMap<String, ClientSubscription>,
    /// subscription id → live frames held back until its initial state is queued
    priming: Mutex<HashMap<String, Vec<String>>>,
    closed: CancellationToken,
}

/// What a socket task needs to serve one connection.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<String>,
    /// Cancelled when the hub drops the connection.
    pub closed: CancellationToken,
}

pub struct Hub {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    cache: SharedCache,
    max_subscriptions: usize,
    queue_capacity: usize,
    resubscribe: ReconnectConfig,
}

impl Hub {
    pub fn new(cache: SharedCache, max_subscriptions: usize, queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            cache,
            max_subscriptions,
            queue_capacity: queue_capacity.max(1),
            resubscribe: ReconnectConfig::default(),
        }
    }

    /// Backoff used when a bridge stream has to be resubscribed.
    pub fn with_resubscribe(mut self, config: ReconnectConfig) -> Self {
        self.resubscribe = config;
        self
    }

    pub fn connect(&self) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let closed = CancellationToken::new();
        self.connections.write().insert(
            id,
            Connection {
                outbound: tx,
                subscriptions: HashMap::new(),
                priming: Mutex::new(HashMap::new()),
                closed: closed.clone(),
            },
        );
        debug!(connection = %id, "push connection registered");
        ConnectionHandle {
            id,
            outbound: rx,
            closed,
        }
    }

    /// Drop a connection and all its subscriptions. Returns false if it was
    /// already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections.write().remove(&id) else {
            return false;
        };
        conn.closed.cancel();
        info!(
            connection = %id,
            subscriptions = conn.subscriptions.len(),
            "push connection removed"
        );
        true
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }

    /// Register a subscription, acknowledge it and push the cached state.
    pub async fn subscribe(
        &self,
        conn_id: ConnectionId,
        request: SubscribeRequest,
    ) -> Result<ClientSubscription, ClientError> {
        let sub = ClientSubscription {
            id: request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            connection: conn_id,
            kind: request.kind,
            symbol: request.symbol,
            venue: request.venue,
            timeframe: request.timeframe,
        };
        let ack = json!({
            "type": sub.kind.as_str(),
            "symbol": sub.symbol,
            "exchange": sub.venue.label(),
            "timeframe": sub.timeframe.map(|tf| tf.as_str()),
        });

        let acked = {
            let mut conns = self.connections.write();
            let conn = conns.get_mut(&conn_id).ok_or(ClientError::ConnectionClosed)?;
            if conn.subscriptions.len() >= self.max_subscriptions {
                return Err(ClientError::TooManySubscriptions(self.max_subscriptions));
            }
            if conn.subscriptions.contains_key(&sub.id) {
                return Err(ClientError::DuplicateSubscription(sub.id));
            }
            conn.subscriptions.insert(sub.id.clone(), sub.clone());
            conn.priming.lock().insert(sub.id.clone(), Vec::new());
            envelope("subscribed", &ack, Some(&sub.id)).map_or(true, |f| conn.outbound.try_send(f).is_ok())
        };
        if !acked {
            return self.drop_overflowed(conn_id);
        }

        let state = self.cached_state(&sub).await;

        // Exclusive lock: no broadcast may reach the queue until the state and
        // the held frames are in, in that order.
        let (flushed, held) = {
            let conns = self.connections.write();
            let conn = conns.get(&conn_id).ok_or(ClientError::ConnectionClosed)?;
            let Some(live) = conn.priming.lock().remove(&sub.id) else {
                // Unsubscribed in the meantime.
                return Ok(sub);
            };
            let held = live.len();
            let flushed = state
                .iter()
                .filter_map(|v| envelope(sub.kind.as_str(), v, Some(&sub.id)))
                .chain(live)
                .all(|f| conn.outbound.try_send(f).is_ok());
            (flushed, held)
        };
        if !flushed {
            return self.drop_overflowed(conn_id);
        }

        debug!(
            connection = %conn_id,
            subscription = %sub.id,
            kind = sub.kind.as_str(),
            symbol = %sub.symbol,
            exchange = sub.venue.label(),
            initial = state.len(),
            held,
            "subscribed"
        );
        Ok(sub)
    }

    async fn cached_state(&self, sub: &ClientSubscription) -> Vec<Value> {
        let mut state = Vec::new();
        for key in sub.state_keys() {
            match self.cache.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => state.push(value),
                    Err(e) => warn!(%key, error = %e, "cached state is not JSON, skipped"),
                },
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "cache read failed for initial push"),
            }
        }
        state
    }

    fn drop_overflowed(&self, conn_id: ConnectionId) -> Result<ClientSubscription, ClientError> {
        warn!(connection = %conn_id, "outbound queue full during initial push");
        self.disconnect(conn_id);
        Err(ClientError::ConnectionClosed)
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, subscription_id: &str) -> Result<(), ClientError> {
        let mut conns = self.connections.write();
        let conn = conns.get_mut(&conn_id).ok_or(ClientError::ConnectionClosed)?;
        conn.priming.lock().remove(subscription_id);
        conn.subscriptions
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| ClientError::UnknownSubscription(subscription_id.to_string()))
    }

    /// Push `payload` to every subscription matching `topic`. Returns the
    /// number of messages queued.
    pub fn broadcast(&self, topic: &Topic, payload: &str) -> usize {
        let data: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(?topic, error = %e, "notification payload is not JSON, dropped");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let conns = self.connections.read();
            for (id, conn) in conns.iter() {
                for sub in conn.subscriptions.values().filter(|s| s.matches(topic)) {
                    let Some(text) = envelope(sub.kind.as_str(), &data, Some(&sub.id)) else {
                        continue;
                    };
                    if let Some(held) = conn.priming.lock().get_mut(&sub.id) {
                        if held.len() >= self.queue_capacity {
                            warn!(connection = %id, "slow consumer while priming, dropping connection");
                            dead.push(*id);
                            break;
                        }
                        held.push(text);
                        delivered += 1;
                        continue;
                    }
                    match conn.outbound.try_send(text) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            warn!(connection = %id, "slow consumer, dropping connection");
                            dead.push(*id);
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            dead.push(*id);
                            break;
                        }
                    }
                }
            }
        }
        for id in dead {
            self.disconnect(id);
        }
        delivered
    }

    /// Queue a reply on one connection. A full queue drops the connection.
    fn reply(&self, conn_id: ConnectionId, kind: &str, data: &Value, subscription_id: Option<&str>) {
        let Some(text) = envelope(kind, data, subscription_id) else {
            return;
        };
        let failed = match self.connections.read().get(&conn_id) {
            Some(conn) => conn.outbound.try_send(text).is_err(),
            None => false,
        };
        if failed {
            self.disconnect(conn_id);
        }
    }

    fn reply_error(&self, conn_id: ConnectionId, subscription_id: Option<&str>, err: &ClientError) {
        debug!(connection = %conn_id, error = %err, "client message rejected");
        self.reply(conn_id, "error", &json!({ "message": err.to_string() }), subscription_id);
    }

    /// Handle one text frame from a client.
    pub async fn handle_client_message(&self, conn_id: ConnectionId, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                self.reply_error(conn_id, None, &ClientError::Malformed(e.to_string()));
                return;
            }
        };

        match msg.action {
            ClientAction::Ping => self.reply(conn_id, "pong", &json!({}), None),
            ClientAction::Subscribe => {
                let requested = msg.subscription_id.clone();
                let result = match SubscribeRequest::from_message(msg) {
                    Ok(req) => self.subscribe(conn_id, req).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.reply_error(conn_id, requested.as_deref(), &e);
                }
            }
            ClientAction::Unsubscribe => {
                let Some(id) = msg.subscription_id else {
                    let err = ClientError::MissingField("unsubscribe", "subscriptionId");
                    self.reply_error(conn_id, None, &err);
                    return;
                };
                match self.unsubscribe(conn_id, &id) {
                    Ok(()) => self.reply(conn_id, "unsubscribed", &json!({}), Some(&id)),
                    Err(e) => self.reply_error(conn_id, Some(&id), &e),
                }
            }
        }
    }

    // ── Cache bridge ────────────────────────────────────────────────────

    /// Subscribe to every fan-out channel pattern and spawn the forwarding
    /// tasks. Patterns that subscribe now are registered when this returns;
    /// the others, and any stream that ends later, are retried with backoff
    /// until `cancel` fires.
    pub async fn spawn_bridge(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut receivers = Vec::with_capacity(keys::FANOUT_PATTERNS.len());
        for pattern in keys::FANOUT_PATTERNS {
            let rx = match self.cache.subscribe(pattern).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(pattern, error = %e, "fan-out subscribe failed, retrying in background");
                    None
                }
            };
            receivers.push((pattern, rx));
        }

        let hub = self.clone();
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for (pattern, rx) in receivers {
                tasks.spawn(hub.clone().forward(pattern, rx, cancel.clone()));
            }
            info!(patterns = keys::FANOUT_PATTERNS.len(), "fan-out bridge running");
            while tasks.join_next().await.is_some() {}
            info!("fan-out bridge stopped");
        })
    }

    async fn forward(
        self: Arc<Self>,
        pattern: &'static str,
        mut rx: Option<mpsc::Receiver<Notification>>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::new(&self.resubscribe);
        loop {
            let Some(stream) = rx.as_mut() else {
                let delay = backoff.next_delay_or_max();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.cache.subscribe(pattern).await {
                    Ok(fresh) => {
                        info!(pattern, attempt = backoff.attempt(), "fan-out resubscribed");
                        rx = Some(fresh);
                    }
                    Err(e) => warn!(pattern, error = %e, "fan-out resubscribe failed"),
                }
                continue;
            };

            let note = tokio::select! {
                _ = cancel.cancelled() => break,
                note = stream.recv() => note,
            };
            let Some(note) = note else {
                warn!(pattern, "notification stream closed, resubscribing");
                rx = None;
                continue;
            };
            backoff.reset();
            match keys::parse_channel(&note.channel) {
                Some(topic) => {
                    self.broadcast(&topic, &note.payload);
                }
                None => debug!(channel = %note.channel, "unroutable notification"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::FlakyCache;
    use crate::cache::{self, CacheStore, MemoryCache};
    use std::time::Duration;

    fn hub(max_subs: usize, queue: usize) -> (Arc<Hub>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (Arc::new(Hub::new(cache.clone(), max_subs, queue)), cache)
    }

    fn next(handle: &mut ConnectionHandle) -> Value {
        let text = handle.outbound.try_recv().expect("a queued message");
        serde_json::from_str(&text).unwrap()
    }

    fn request(kind: StreamKind, venue: Venue, tf: Option<Timeframe>) -> SubscribeRequest {
        SubscribeRequest {
            id: None,
            kind,
            symbol: "BTC".into(),
            venue,
            timeframe: tf,
        }
    }

    fn book_topic(exchange: Exchange) -> Topic {
        Topic::OrderBook {
            exchange,
            symbol: "BTC".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_pushes_cached_state_after_ack() {
        let (hub, cache) = hub(50, 16);
        cache
            .set("orderbook:binance:BTC", r#"{"sequence":7}"#.into(), Duration::from_secs(5))
            .await
            .unwrap();

        let mut conn = hub.connect();
        let sub = hub
            .subscribe(conn.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
            .await
            .unwrap();

        let ack = next(&mut conn);
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["subscriptionId"], sub.id.as_str());
        let state = next(&mut conn);
        assert_eq!(state["type"], "orderbook");
        assert_eq!(state["data"]["sequence"], 7);
        assert!(state["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn cache_miss_pushes_nothing_but_the_ack() {
        let (hub, _) = hub(50, 16);
        let mut conn = hub.connect();
        hub.subscribe(conn.id, request(StreamKind::Trades, Venue::Exchange(Exchange::Lighter), None))
            .await
            .unwrap();
        assert_eq!(next(&mut conn)["type"], "subscribed");
        assert!(conn.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_matches_kind_exchange_symbol_and_timeframe() {
        let (hub, _) = hub(50, 16);
        let mut a = hub.connect();
        let mut b = hub.connect();
        hub.subscribe(a.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
            .await
            .unwrap();
        hub.subscribe(b.id, request(StreamKind::Chart, Venue::Exchange(Exchange::Binance), Some(Timeframe::M5)))
            .await
            .unwrap();
        next(&mut a);
        next(&mut b);

        assert_eq!(hub.broadcast(&book_topic(Exchange::Binance), r#"{"x":1}"#), 1);
        assert_eq!(hub.broadcast(&book_topic(Exchange::Lighter), r#"{"x":2}"#), 0);
        assert_eq!(next(&mut a)["data"]["x"], 1);
        assert!(a.outbound.try_recv().is_err());

        let m1 = Topic::Candle {
            exchange: Exchange::Binance,
            symbol: "BTC".into(),
            timeframe: Timeframe::M1,
        };
        let m5 = Topic::Candle {
            exchange: Exchange::Binance,
            symbol: "BTC".into(),
            timeframe: Timeframe::M5,
        };
        assert_eq!(hub.broadcast(&m1, "{}"), 0);
        assert_eq!(hub.broadcast(&m5, "{}"), 1);
        assert_eq!(next(&mut b)["type"], "chart");
    }

    #[tokio::test]
    async fn all_venue_follows_aggregated_streams() {
        let (hub, cache) = hub(50, 16);
        cache
            .set("agg:book:BTC", r#"{"symbol":"BTC"}"#.into(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut conn = hub.connect();
        hub.subscribe(conn.id, request(StreamKind::Orderbook, Venue::All, None))
            .await
            .unwrap();
        next(&mut conn);
        assert_eq!(next(&mut conn)["data"]["symbol"], "BTC");

        assert_eq!(hub.broadcast(&book_topic(Exchange::Binance), "{}"), 0);
        let agg = Topic::AggregatedBook { symbol: "BTC".into() };
        assert_eq!(hub.broadcast(&agg, "{}"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (hub, _) = hub(50, 16);
        let mut conn = hub.connect();
        let sub = hub
            .subscribe(conn.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
            .await
            .unwrap();
        next(&mut conn);

        hub.unsubscribe(conn.id, &sub.id).unwrap();
        assert_eq!(hub.broadcast(&book_topic(Exchange::Binance), "{}"), 0);
        assert_eq!(
            hub.unsubscribe(conn.id, &sub.id),
            Err(ClientError::UnknownSubscription(sub.id.clone()))
        );
    }

    #[tokio::test]
    async fn slow_consumer_is_removed_without_affecting_others() {
        let (hub, _) = hub(50, 2);
        let slow = hub.connect();
        let mut fast = hub.connect();
        for conn in [&slow, &fast] {
            hub.subscribe(conn.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
                .await
                .unwrap();
        }
        next(&mut fast);

        // slow still holds its ack; one more fills it, the next overflows.
        hub.broadcast(&book_topic(Exchange::Binance), r#"{"n":1}"#);
        next(&mut fast);
        hub.broadcast(&book_topic(Exchange::Binance), r#"{"n":2}"#);

        assert!(slow.closed.is_cancelled());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(next(&mut fast)["data"]["n"], 2);
        assert!(!fast.closed.is_cancelled());
    }

    #[tokio::test]
    async fn malformed_messages_get_scoped_errors() {
        let (hub, _) = hub(50, 16);
        let mut conn = hub.connect();

        hub.handle_client_message(conn.id, "not json").await;
        let err = next(&mut conn);
        assert_eq!(err["type"], "error");
        assert!(err["data"]["message"].as_str().unwrap().starts_with("malformed"));

        hub.handle_client_message(
            conn.id,
            r#"{"action":"subscribe","type":"chart","symbol":"btc","exchange":"binance","subscriptionId":"c1"}"#,
        )
        .await;
        let err = next(&mut conn);
        assert_eq!(err["subscriptionId"], "c1");
        assert_eq!(err["data"]["message"], "chart requires `params.timeframe`");

        hub.handle_client_message(conn.id, r#"{"action":"subscribe","type":"trades","symbol":"BTC","exchange":"kraken"}"#)
            .await;
        assert_eq!(next(&mut conn)["data"]["message"], "unknown exchange `kraken`");

        hub.handle_client_message(conn.id, r#"{"action":"ping"}"#).await;
        assert_eq!(next(&mut conn)["type"], "pong");
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn client_protocol_round_trip() {
        let (hub, _) = hub(50, 16);
        let mut conn = hub.connect();

        hub.handle_client_message(
            conn.id,
            r#"{"action":"subscribe","type":"chart","symbol":"eth","exchange":"all","params":{"timeframe":"1h"},"subscriptionId":"s1"}"#,
        )
        .await;
        let ack = next(&mut conn);
        assert_eq!(ack["subscriptionId"], "s1");
        assert_eq!(ack["data"]["symbol"], "ETH");
        assert_eq!(ack["data"]["timeframe"], "1h");

        let topic = Topic::AggregatedCandle {
            symbol: "ETH".into(),
            timeframe: Timeframe::H1,
        };
        assert_eq!(hub.broadcast(&topic, "{}"), 1);
        next(&mut conn);

        hub.handle_client_message(conn.id, r#"{"action":"unsubscribe","subscriptionId":"s1"}"#).await;
        assert_eq!(next(&mut conn)["type"], "unsubscribed");
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn subscription_limit_and_duplicates() {
        let (hub, _) = hub(2, 16);
        let conn = hub.connect();
        let mut req = request(StreamKind::Trades, Venue::All, None);
        req.id = Some("t".into());
        hub.subscribe(conn.id, req.clone()).await.unwrap();
        assert_eq!(
            hub.subscribe(conn.id, req).await,
            Err(ClientError::DuplicateSubscription("t".into()))
        );
        hub.subscribe(conn.id, request(StreamKind::Trades, Venue::All, None))
            .await
            .unwrap();
        assert_eq!(
            hub.subscribe(conn.id, request(StreamKind::Trades, Venue::All, None)).await,
            Err(ClientError::TooManySubscriptions(2))
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (hub, _) = hub(50, 16);
        let conn = hub.connect();
        assert!(hub.disconnect(conn.id));
        assert!(!hub.disconnect(conn.id));
        assert!(conn.closed.is_cancelled());
        assert_eq!(
            hub.subscribe(conn.id, request(StreamKind::Trades, Venue::All, None)).await,
            Err(ClientError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn bridge_forwards_cache_notifications() {
        let (hub, cache) = hub(50, 16);
        let cancel = CancellationToken::new();
        let bridge = hub.spawn_bridge(cancel.clone()).await;

        let mut conn = hub.connect();
        hub.subscribe(conn.id, request(StreamKind::Trades, Venue::All, None))
            .await
            .unwrap();
        next(&mut conn);

        cache::set_and_publish(
            cache.as_ref(),
            "trades:hyperliquid:BTC",
            "trades:update:hyperliquid:BTC",
            &vec![json!({"id": "1"})],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let text = tokio::time::timeout(Duration::from_secs(1), conn.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let msg: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["type"], "trades");
        assert_eq!(msg["data"][0]["id"], "1");

        cancel.cancel();
        bridge.await.unwrap();
    }

    /// Broadcasts a live book update from inside the first cache read, the
    /// way a notification can land while a subscriber's state is loading.
    struct UpdateDuringRead {
        inner: MemoryCache,
        hub: std::sync::OnceLock<std::sync::Weak<Hub>>,
    }

    #[async_trait::async_trait]
    impl CacheStore for UpdateDuringRead {
        async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            if let Some(hub) = self.hub.get().and_then(|h| h.upgrade()) {
                assert_eq!(hub.broadcast(&book_topic(Exchange::Binance), r#"{"sequence":8}"#), 1);
            }
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }

        async fn publish(&self, channel: &str, message: String) -> anyhow::Result<()> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, pattern: &str) -> anyhow::Result<mpsc::Receiver<Notification>> {
            self.inner.subscribe(pattern).await
        }

        async fn ping(&self) -> anyhow::Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn update_during_initial_read_follows_the_cached_state() {
        let cache = Arc::new(UpdateDuringRead {
            inner: MemoryCache::new(),
            hub: std::sync::OnceLock::new(),
        });
        cache
            .inner
            .set("orderbook:binance:BTC", r#"{"sequence":7}"#.into(), Duration::from_secs(5))
            .await
            .unwrap();
        let hub = Arc::new(Hub::new(cache.clone(), 50, 16));
        cache.hub.set(Arc::downgrade(&hub)).unwrap();

        let mut conn = hub.connect();
        hub.subscribe(conn.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
            .await
            .unwrap();

        assert_eq!(next(&mut conn)["type"], "subscribed");
        assert_eq!(next(&mut conn)["data"]["sequence"], 7);
        assert_eq!(next(&mut conn)["data"]["sequence"], 8);
        assert!(conn.outbound.try_recv().is_err());

        // Once primed, updates go straight to the queue.
        assert_eq!(hub.broadcast(&book_topic(Exchange::Binance), r#"{"sequence":9}"#), 1);
        assert_eq!(next(&mut conn)["data"]["sequence"], 9);
    }

    /// Publish on `channel` until `conn` receives something.
    async fn delivered_after_retries(cache: &FlakyCache, conn: &mut ConnectionHandle, channel: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "nothing delivered on {channel}");
            cache.publish(channel, r#"{"ok":true}"#.into()).await.unwrap();
            if let Ok(Some(text)) = tokio::time::timeout(Duration::from_millis(25), conn.outbound.recv()).await {
                // Earlier attempts may still be in flight.
                tokio::time::sleep(Duration::from_millis(50)).await;
                while conn.outbound.try_recv().is_ok() {}
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn bridge_resubscribes_after_failures_and_closed_streams() {
        // The first pattern (orderbook updates) is refused once at startup.
        let cache = Arc::new(FlakyCache::new(1));
        let fast = ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 40,
            ..ReconnectConfig::default()
        };
        let hub = Arc::new(Hub::new(cache.clone(), 50, 64).with_resubscribe(fast));
        let cancel = CancellationToken::new();
        let bridge = hub.spawn_bridge(cancel.clone()).await;

        let mut conn = hub.connect();
        hub.subscribe(conn.id, request(StreamKind::Orderbook, Venue::Exchange(Exchange::Binance), None))
            .await
            .unwrap();
        hub.subscribe(conn.id, request(StreamKind::Trades, Venue::All, None))
            .await
            .unwrap();
        while conn.outbound.try_recv().is_ok() {}

        let book = delivered_after_retries(&cache, &mut conn, "orderbook:update:binance:BTC").await;
        assert_eq!(book["type"], "orderbook");

        // Every stream ends, as when the pubsub connection drops.
        cache.drop_streams();
        let trades = delivered_after_retries(&cache, &mut conn, "trades:update:lighter:BTC").await;
        assert_eq!(trades["type"], "trades");
        let book = delivered_after_retries(&cache, &mut conn, "orderbook:update:binance:BTC").await;
        assert_eq!(book["data"]["ok"], true);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), bridge)
            .await
            .unwrap()
            .unwrap();
    }
}
