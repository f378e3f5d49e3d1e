//! MTProto adapter.
//!
//! Drives an external MTProto bridge process (one per user) over
//! newline-delimited JSON on stdio and maps it onto the `tgfwd-core`
//! client port. Requests carry an id and receive exactly one response;
//! the bridge additionally pushes `{"event":"message", ...}` lines for
//! subscribed channel posts.
//!
//! Upstream `FLOOD_WAIT` surfaces as `Error::RateLimited` with the
//! retry-after attached; `AUTH_KEY_UNREGISTERED`-class failures as
//! `Error::AuthRejected`.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use tgfwd_core::{
    domain::{
        AlbumPart, ChannelPost, ChatDescriptor, ChatId, MessageId, PollSpec, QrPollOutcome,
        QrToken, SentCode, SignInOutcome, UserId,
    },
    errors::Error,
    ident::ChannelRef,
    mtproto::{MtConnector, MtProto, PostHandler},
    Result,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub command: PathBuf,
    pub api_id: i32,
    pub api_hash: String,
}

/// Spawns one bridge process per user.
pub struct BridgeConnector {
    cfg: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl MtConnector for BridgeConnector {
    async fn connect(
        &self,
        user_id: UserId,
        session: Option<String>,
    ) -> Result<Arc<dyn MtProto>> {
        let client = BridgeClient::spawn(&self.cfg, user_id, session).await?;
        Ok(Arc::new(client))
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type HandlerMap = Arc<Mutex<HashMap<u64, PostHandler>>>;

pub struct BridgeClient {
    user_id: UserId,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    handlers: HandlerMap,
    next_id: AtomicU64,
    next_sub: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    async fn spawn(cfg: &BridgeConfig, user_id: UserId, session: Option<String>) -> Result<Self> {
        let mut cmd = Command::new(&cfg.command);
        cmd.arg("--user")
            .arg(user_id.0.to_string())
            .arg("--api-id")
            .arg(cfg.api_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The api hash and session are secrets; they go over the pipe,
        // not argv.
        let mut child = cmd.spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            let uid = user_id.0;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(user_id = uid, line, "bridge stderr");
                }
            });
        }

        let init = json!({
            "method": "init",
            "params": {
                "api_hash": cfg.api_hash,
                "session": session,
            }
        });
        let mut line = init.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handlers: HandlerMap = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(Self::read_loop(
            user_id,
            BufReader::new(stdout),
            pending.clone(),
            handlers.clone(),
        ));

        Ok(Self {
            user_id,
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            handlers,
            next_id: AtomicU64::new(1),
            next_sub: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn read_loop(
        user_id: UserId,
        stdout: BufReader<tokio::process::ChildStdout>,
        pending: PendingMap,
        handlers: HandlerMap,
    ) {
        let mut lines = stdout.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(user_id = user_id.0, error = %e, "bridge stdout read failed");
                    break;
                }
            };

            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    debug!(user_id = user_id.0, line, "unparseable bridge line");
                    continue;
                }
            };

            if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(value);
                }
                continue;
            }

            if value.get("event").and_then(|v| v.as_str()) == Some("message") {
                let Some(data) = value.get("data") else {
                    continue;
                };
                let post: ChannelPost = match serde_json::from_value(data.clone()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(user_id = user_id.0, error = %e, "bad pushed post");
                        continue;
                    }
                };
                let targets: Vec<PostHandler> =
                    handlers.lock().await.values().cloned().collect();
                for handler in targets {
                    handler(post.clone()).await;
                }
            }
        }

        // The process went away: fail everything still in flight.
        let stale: Vec<oneshot::Sender<Value>> =
            pending.lock().await.drain().map(|(_, tx)| tx).collect();
        for tx in stale {
            let _ = tx.send(json!({
                "id": 0,
                "ok": false,
                "error": { "kind": "transport", "message": "bridge process exited" }
            }));
        }
        debug!(user_id = user_id.0, "bridge reader stopped");
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({ "id": id, "method": method, "params": params });
        let mut line = request.to_string();
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(Error::Transport(format!("bridge write failed: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(Error::Transport(format!("bridge flush failed: {e}")));
            }
        }

        let response = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => {
                return Err(Error::Transport("bridge dropped the response".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Transport(format!("bridge call {method} timed out")));
            }
        };

        if response.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(map_bridge_error(response.get("error")))
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("bad bridge payload: {e}")))
    }
}

fn map_bridge_error(error: Option<&Value>) -> Error {
    let Some(error) = error else {
        return Error::Transport("bridge reported an unspecified error".to_string());
    };
    let kind = error.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown bridge error")
        .to_string();

    match kind {
        "flood_wait" => Error::RateLimited {
            retry_after: error
                .get("retry_after")
                .and_then(|v| v.as_u64())
                .unwrap_or(60),
        },
        "auth_rejected" => Error::AuthRejected(message),
        "code_invalid" => Error::CodeInvalid,
        "code_expired" => Error::CodeExpired,
        "password_invalid" => Error::PasswordInvalid,
        "not_found" => Error::NotFound(message),
        "permanent" => Error::Permanent(message),
        _ => Error::Transport(message),
    }
}

#[async_trait]
impl MtProto for BridgeClient {
    async fn connect(&self) -> Result<()> {
        self.call("connect", json!({})).await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        let _ = self.call("disconnect", json!({})).await;
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
        }
        *child = None;
        debug!(user_id = self.user_id.0, "bridge client shut down");
        Ok(())
    }

    async fn request_code(&self, phone: &str) -> Result<SentCode> {
        Self::parse(self.call("request_code", json!({ "phone": phone })).await?)
    }

    async fn sign_in(&self, phone: &str, code_hash: &str, code: &str) -> Result<SignInOutcome> {
        Self::parse(
            self.call(
                "sign_in",
                json!({ "phone": phone, "phone_code_hash": code_hash, "code": code }),
            )
            .await?,
        )
    }

    async fn check_password(&self, password: &str) -> Result<()> {
        self.call("check_password", json!({ "password": password }))
            .await
            .map(|_| ())
    }

    async fn export_qr_token(&self) -> Result<QrToken> {
        Self::parse(self.call("export_qr_token", json!({})).await?)
    }

    async fn poll_qr_token(&self) -> Result<QrPollOutcome> {
        Self::parse(self.call("poll_qr_token", json!({})).await?)
    }

    async fn export_session(&self) -> Result<String> {
        Self::parse(self.call("export_session", json!({})).await?)
    }

    async fn who_am_i(&self) -> Result<UserId> {
        Self::parse(self.call("who_am_i", json!({})).await?)
    }

    async fn warm_peer_cache(&self, limit: u32) -> u32 {
        match self.call("warm_peer_cache", json!({ "limit": limit })).await {
            Ok(value) => value.as_u64().unwrap_or(0) as u32,
            Err(e) => {
                warn!(user_id = self.user_id.0, error = %e, "peer cache warm failed");
                0
            }
        }
    }

    async fn resolve_chat(&self, ident: &ChannelRef) -> Result<ChatDescriptor> {
        Self::parse(
            self.call("resolve_chat", json!({ "ident": ident })).await?,
        )
    }

    async fn fetch_history(
        &self,
        chat: ChatId,
        since_id: MessageId,
        limit: u32,
    ) -> Result<Vec<ChannelPost>> {
        Self::parse(
            self.call(
                "fetch_history",
                json!({ "chat_id": chat, "since_id": since_id, "limit": limit }),
            )
            .await?,
        )
    }

    async fn copy_message(
        &self,
        dst: ChatId,
        src: ChatId,
        msg_id: MessageId,
    ) -> Result<MessageId> {
        Self::parse(
            self.call(
                "copy_message",
                json!({ "dst": dst, "src": src, "msg_id": msg_id }),
            )
            .await?,
        )
    }

    async fn send_album(
        &self,
        dst: ChatId,
        src: ChatId,
        parts: &[AlbumPart],
    ) -> Result<Vec<MessageId>> {
        Self::parse(
            self.call(
                "send_album",
                json!({ "dst": dst, "src": src, "parts": parts }),
            )
            .await?,
        )
    }

    async fn send_poll(&self, dst: ChatId, poll: &PollSpec) -> Result<MessageId> {
        Self::parse(
            self.call("send_poll", json!({ "dst": dst, "poll": poll })).await?,
        )
    }

    async fn download_media(&self, chat: ChatId, msg_id: MessageId) -> Result<Vec<u8>> {
        let value = self
            .call(
                "download_media",
                json!({ "chat_id": chat, "msg_id": msg_id }),
            )
            .await?;
        let encoded = value
            .get("bytes_b64")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Transport("download result missing payload".to_string()))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::Transport(format!("bad media payload: {e}")))
    }

    async fn subscribe(&self, handler: PostHandler) -> Result<u64> {
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut handlers = self.handlers.lock().await;
            handlers.insert(id, handler);
            handlers.len() == 1
        };
        // Tell the bridge to start pushing once someone listens.
        if first {
            self.call("subscribe", json!({})).await.map(|_| ())?;
        }
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: u64) -> Result<()> {
        let empty = {
            let mut handlers = self.handlers.lock().await;
            handlers.remove(&subscription);
            handlers.is_empty()
        };
        if empty {
            let _ = self.call("unsubscribe", json!({})).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_errors_map_to_engine_errors() {
        let flood = json!({ "kind": "flood_wait", "retry_after": 7, "message": "FLOOD_WAIT_7" });
        assert!(matches!(
            map_bridge_error(Some(&flood)),
            Error::RateLimited { retry_after: 7 }
        ));

        let auth = json!({ "kind": "auth_rejected", "message": "AUTH_KEY_UNREGISTERED" });
        assert!(matches!(map_bridge_error(Some(&auth)), Error::AuthRejected(_)));

        let code = json!({ "kind": "code_invalid" });
        assert!(matches!(map_bridge_error(Some(&code)), Error::CodeInvalid));

        assert!(matches!(map_bridge_error(None), Error::Transport(_)));
    }

    #[test]
    fn flood_wait_without_seconds_gets_a_floor() {
        let flood = json!({ "kind": "flood_wait" });
        assert!(matches!(
            map_bridge_error(Some(&flood)),
            Error::RateLimited { retry_after: 60 }
        ));
    }

    #[test]
    fn pushed_posts_deserialize() {
        let data = json!({
            "chat_id": -1001234567890i64,
            "chat_title": "News",
            "chat_handle": "newschan",
            "msg_id": 101,
            "kind": "photo",
            "text": "caption",
            "file_size": 2048,
            "group_id": "g1"
        });
        let post: ChannelPost = serde_json::from_value(data).unwrap();
        assert_eq!(post.chat_id, ChatId(-1001234567890));
        assert_eq!(post.msg_id, MessageId(101));
        assert_eq!(post.group_id.as_deref(), Some("g1"));
    }
}
