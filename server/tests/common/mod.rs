#![allow(dead_code)]

use chat_proto::EventFrame;
use chat_server::api::{build_router, AppState};
use chat_server::auth;
use chat_server::config::Config;
use futures::StreamExt;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<()>,
    pub tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, user: Uuid, name: &str) -> String {
        auth::issue_jwt(&self.state.jwt_secret, user, name, time::Duration::hours(1)).unwrap()
    }
}

pub async fn spawn_server() -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    spawn_server_in(tmp).await
}

pub async fn spawn_server_in(tmp: tempfile::TempDir) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let config = Config::new(addr.to_string(), tmp.path());
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let handle = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        state,
        handle,
        tmp,
    }
}

/// Open a realtime session and consume the `connected` frame.
pub async fn connect(addr: SocketAddr, token: &str) -> (Ws, EventFrame) {
    let mut req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", token).parse().unwrap());
    let (mut ws, _) = connect_async(req).await.unwrap();
    let hello = next_frame(&mut ws).await;
    (ws, hello)
}

pub async fn next_frame(ws: &mut Ws) -> EventFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip frames until one matches.
pub async fn next_matching(ws: &mut Ws, pred: impl Fn(&EventFrame) -> bool) -> EventFrame {
    loop {
        let frame = next_frame(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

/// True if nothing matching arrives within `wait`.
pub async fn none_matching(ws: &mut Ws, wait: Duration, pred: impl Fn(&EventFrame) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                let frame: EventFrame = serde_json::from_str(&text).unwrap();
                if pred(&frame) {
                    return false;
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(_) => return true,
        }
    }
}

pub async fn send(ws: &mut Ws, frame: serde_json::Value) {
    use futures::SinkExt;
    ws.send(WsMessage::Text(frame.to_string())).await.unwrap();
}
