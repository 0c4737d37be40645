//! Persistent realtime channel with keepalive and bounded fixed-delay
//! reconnection.
//!
//! One driver task owns the open channel. Every `connect`/`reconnect` starts a
//! new generation; a superseded driver may still be unwinding but can no
//! longer touch the shared link state.

use chat_proto::{ClientFrame, EventFrame, Features, ServerEvent};
use chatcore::SyncError;
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SyncError>> + Send>>;

/// Opens the raw text channel. Swappable so the manager can be driven
/// without a network.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str, token: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SyncError>>;
}

/// WebSocket connector authenticating with a bearer header.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

fn transport<E: std::fmt::Display>(e: E) -> SyncError {
    SyncError::Transport(e.to_string())
}

impl Connector for WsConnector {
    fn open(&self, url: &str, token: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SyncError>> {
        let request = url.into_client_request().map_err(transport).and_then(|mut req| {
            let value = format!("Bearer {token}")
                .parse::<HeaderValue>()
                .map_err(transport)?;
            req.headers_mut().insert("Authorization", value);
            Ok(req)
        });
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(request?)
                .await
                .map_err(transport)?;
            let (sink, stream) = ws.split();
            let sink = sink
                .sink_map_err(transport)
                .with(|text: String| futures::future::ready(Ok::<_, SyncError>(WsMessage::Text(text))));
            let stream = stream.filter_map(|msg| {
                futures::future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Close(_)) => Some(Err(SyncError::Transport("closed by server".into()))),
                    Ok(_) => None,
                    Err(e) => Some(Err(transport(e))),
                })
            });
            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub token: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/ws".into(),
            token: String::new(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    /// Realtime endpoint of an HTTP base URL (`http://host` -> `ws://host/ws`).
    pub fn for_server(base_url: &str, token: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = match base.split_once("://") {
            Some(("https", rest)) => format!("wss://{rest}/ws"),
            Some((_, rest)) => format!("ws://{rest}/ws"),
            None => format!("ws://{base}/ws"),
        };
        Self {
            url,
            token: token.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Reconnect attempts exhausted; no further automatic retries.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Closed,
    /// The channel dropped; a reconnect is scheduled.
    Lost,
    /// Too many consecutive failed opens.
    GaveUp,
}

/// Callbacks for connection transitions and inbound frames. Called on the
/// driver task; implementations must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self, _session_id: Uuid, _features: &Features) {}
    fn on_frame(&self, _frame: &EventFrame) {}
    fn on_disconnected(&self, _reason: DisconnectReason) {}
    fn on_error(&self, _error: &SyncError) {}
}

struct Link {
    generation: u64,
    state: ConnectionState,
    outbound: Option<UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
    attempts: u32,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    link: Mutex<Link>,
}

impl Inner {
    fn notify(&self, f: impl Fn(&dyn ConnectionObserver)) {
        let observers = self.observers.read().clone();
        for o in observers {
            f(o.as_ref());
        }
    }

    /// Mutate the link only if `generation` is still current.
    fn update<R>(&self, generation: u64, f: impl FnOnce(&mut Link) -> R) -> Option<R> {
        let mut link = self.link.lock();
        (link.generation == generation).then(|| f(&mut link))
    }

    fn send_text(&self, text: String) -> bool {
        let link = self.link.lock();
        match (&link.outbound, link.state) {
            (Some(tx), ConnectionState::Open) => tx.send(text).is_ok(),
            _ => false,
        }
    }
}

/// Client side of the realtime channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                observers: RwLock::new(Vec::new()),
                link: Mutex::new(Link {
                    generation: 0,
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    cancel: None,
                    attempts: 0,
                }),
            }),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// Consecutive failed opens since the last successful one.
    pub fn attempts(&self) -> u32 {
        self.inner.link.lock().attempts
    }

    /// A handle that sends frames without keeping the manager alive.
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open the channel. A no-op while connecting, open or waiting to
    /// reconnect.
    pub fn connect(&self) {
        let mut link = self.inner.link.lock();
        if matches!(
            link.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting
        ) {
            return;
        }
        self.start(&mut link);
    }

    /// Tear down the channel and cancel any pending reconnect.
    pub fn disconnect(&self) {
        let was_active = {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            if let Some(cancel) = link.cancel.take() {
                cancel.cancel();
            }
            link.outbound = None;
            let was = link.state != ConnectionState::Disconnected;
            link.state = ConnectionState::Disconnected;
            was
        };
        if was_active {
            info!("realtime channel closed by user");
            self.inner
                .notify(|o| o.on_disconnected(DisconnectReason::Closed));
        }
    }

    /// Reset the attempt counter and open a fresh channel right away,
    /// superseding any backoff in progress.
    pub fn reconnect(&self) {
        let mut link = self.inner.link.lock();
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }
        link.outbound = None;
        link.attempts = 0;
        self.start(&mut link);
    }

    /// Send a control frame. Returns false, dropping the frame, unless the
    /// channel is open.
    pub fn send(&self, frame: &ClientFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.inner.send_text(text),
            Err(_) => false,
        }
    }

    fn start(&self, link: &mut Link) {
        link.generation += 1;
        link.state = ConnectionState::Connecting;
        let cancel = CancellationToken::new();
        link.cancel = Some(cancel.clone());
        let generation = link.generation;
        let inner = self.inner.clone();
        tokio::spawn(drive(inner, generation, cancel));
    }
}

/// Weak frame sender handed to observers.
#[derive(Clone)]
pub struct FrameSender {
    inner: Weak<Inner>,
}

impl FrameSender {
    pub fn send(&self, frame: &ClientFrame) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => inner.send_text(text),
            Err(_) => false,
        }
    }
}

async fn drive(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    let config = inner.config.clone();
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            r = inner.connector.open(&config.url, &config.token) => r,
        };
        match opened {
            Ok((sink, stream)) => {
                let (tx, rx) = unbounded_channel();
                let current = inner.update(generation, |link| {
                    link.attempts = 0;
                    link.state = ConnectionState::Open;
                    link.outbound = Some(tx);
                });
                if current.is_none() {
                    return;
                }
                debug!(url = %config.url, "realtime channel open");
                pump(&inner, &config, sink, stream, rx, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                let current = inner.update(generation, |link| {
                    link.outbound = None;
                    link.state = ConnectionState::Reconnecting;
                });
                if current.is_none() {
                    return;
                }
                warn!("realtime channel lost, reconnecting");
                inner.notify(|o| o.on_disconnected(DisconnectReason::Lost));
            }
            Err(e) => {
                let attempts = inner.update(generation, |link| {
                    link.attempts += 1;
                    link.state = if link.attempts >= config.max_reconnect_attempts {
                        ConnectionState::Failed
                    } else {
                        ConnectionState::Reconnecting
                    };
                    link.attempts
                });
                let Some(attempts) = attempts else {
                    return;
                };
                warn!(attempts, error = %e, "realtime connect failed");
                inner.notify(|o| o.on_error(&e));
                if attempts >= config.max_reconnect_attempts {
                    inner.notify(|o| o.on_disconnected(DisconnectReason::GaveUp));
                    return;
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(config.reconnect_delay) => {}
        }
        if inner
            .update(generation, |link| link.state = ConnectionState::Connecting)
            .is_none()
        {
            return;
        }
    }
}

/// Run an open channel until it drops or the run is cancelled.
async fn pump(
    inner: &Inner,
    config: &ConnectionConfig,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) {
    let ping = serde_json::to_string(&ClientFrame::Ping).unwrap_or_default();
    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            Some(text) = outbound.recv() => {
                if sink.send(text).await.is_err() {
                    return;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(ping.clone()).await.is_err() {
                    return;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match serde_json::from_str::<EventFrame>(&text) {
                    Ok(frame) => {
                        if let ServerEvent::Connected { session_id, features, .. } = &frame.event {
                            info!(%session_id, "realtime session established");
                            inner.notify(|o| o.on_connected(*session_id, features));
                        }
                        inner.notify(|o| o.on_frame(&frame));
                    }
                    Err(e) => {
                        let err = SyncError::validation(format!("unreadable frame: {e}"));
                        inner.notify(|o| o.on_error(&err));
                    }
                },
                Some(Err(e)) => {
                    debug!(error = %e, "realtime channel error");
                    return;
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Server half of an in-memory channel.
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<Result<String, SyncError>>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    #[derive(Default)]
    struct Scripted {
        fail_first: AtomicU32,
        opens: AtomicU32,
        ends: Mutex<Vec<ServerEnd>>,
    }

    impl Scripted {
        fn failing(n: u32) -> Arc<Self> {
            let s = Self::default();
            s.fail_first.store(n, Ordering::SeqCst);
            Arc::new(s)
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }

        fn take_end(&self) -> ServerEnd {
            self.ends.lock().remove(0)
        }
    }

    impl Connector for Scripted {
        fn open(&self, _url: &str, _token: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SyncError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let left = self.fail_first.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_first.store(left - 1, Ordering::SeqCst);
                return futures::future::ready(Err(SyncError::Transport("refused".into()))).boxed();
            }
            let (c2s_tx, c2s_rx) = mpsc::unbounded::<String>();
            let (s2c_tx, s2c_rx) = mpsc::unbounded::<Result<String, SyncError>>();
            self.ends.lock().push(ServerEnd {
                to_client: s2c_tx,
                from_client: c2s_rx,
            });
            let sink: FrameSink = Box::pin(c2s_tx.sink_map_err(transport));
            let stream: FrameStream = Box::pin(s2c_rx);
            futures::future::ready(Ok((sink, stream))).boxed()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connected(&self, _session_id: Uuid, _features: &Features) {
            self.events.lock().push("connected".into());
        }
        fn on_disconnected(&self, reason: DisconnectReason) {
            self.events.lock().push(format!("disconnected:{reason:?}"));
        }
        fn on_error(&self, _error: &SyncError) {
            self.events.lock().push("error".into());
        }
    }

    fn config(max: u32) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(10),
            ping_interval: Duration::from_secs(3600),
            max_reconnect_attempts: max,
            ..ConnectionConfig::default()
        }
    }

    async fn eventually(f: impl Fn() -> bool) {
        for _ in 0..300 {
            if f() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_reconnect_resets() {
        let connector = Scripted::failing(3);
        let manager = ConnectionManager::with_connector(config(3), connector.clone());
        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());
        manager.connect();
        eventually(|| manager.state() == ConnectionState::Failed).await;
        assert_eq!(manager.attempts(), 3);
        assert_eq!(connector.opens(), 3);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.opens(), 3, "no retries after giving up");
        assert_eq!(
            recorder.events.lock().last().map(String::as_str),
            Some("disconnected:GaveUp")
        );

        // a manual reconnect starts over from zero attempts
        manager.reconnect();
        eventually(|| manager.state() == ConnectionState::Open).await;
        assert_eq!(manager.attempts(), 0);
        assert_eq!(connector.opens(), 4);
    }

    #[tokio::test]
    async fn send_only_while_open_and_connect_is_idempotent() {
        let connector = Arc::new(Scripted::default());
        let manager = ConnectionManager::with_connector(config(5), connector.clone());
        assert!(!manager.send(&ClientFrame::Ping));
        manager.connect();
        manager.connect();
        eventually(|| manager.state() == ConnectionState::Open).await;
        assert_eq!(connector.opens(), 1);

        let mut end = connector.take_end();
        assert!(manager.send(&ClientFrame::GetStatus));
        let text = end.from_client.next().await.unwrap();
        let frame: ClientFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, ClientFrame::GetStatus);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.send(&ClientFrame::Ping));
    }

    #[tokio::test]
    async fn lost_channel_reconnects() {
        let connector = Arc::new(Scripted::default());
        let manager = ConnectionManager::with_connector(config(5), connector.clone());
        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());
        manager.connect();
        eventually(|| manager.state() == ConnectionState::Open).await;

        let end = connector.take_end();
        let hello = EventFrame::unsequenced(ServerEvent::Connected {
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            features: Features::default(),
        });
        end.to_client
            .unbounded_send(Ok(serde_json::to_string(&hello).unwrap()))
            .unwrap();
        eventually(|| recorder.events.lock().contains(&"connected".to_string())).await;

        drop(end);
        eventually(|| connector.opens() == 2 && manager.state() == ConnectionState::Open).await;
        assert!(recorder
            .events
            .lock()
            .contains(&"disconnected:Lost".to_string()));
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = Scripted::failing(u32::MAX);
        let mut cfg = config(5);
        cfg.reconnect_delay = Duration::from_millis(200);
        let manager = ConnectionManager::with_connector(cfg, connector.clone());
        manager.connect();
        eventually(|| manager.state() == ConnectionState::Reconnecting).await;
        manager.disconnect();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn websocket_url_from_http_base() {
        assert_eq!(
            ConnectionConfig::for_server("http://localhost:8787/", "t").url,
            "ws://localhost:8787/ws"
        );
        assert_eq!(
            ConnectionConfig::for_server("https://chat.example.org", "t").url,
            "wss://chat.example.org/ws"
        );
    }
}
