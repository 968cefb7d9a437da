//! Janus gateway transport over WebSocket
//!
//! One WebSocket carries one Janus session. Every outgoing message gets a
//! fresh transaction id; replies are matched back to the waiting request
//! through the pending map, everything else is surfaced as a
//! [`SignalingEvent`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::{PluginReply, SignalingChannel, SignalingConnector, SignalingEvent};
use super::protocol::VideoRoomRequest;
use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::rtc::{IceCandidate, SessionDescription};
use crate::types::{HandleId, TrackKind};

const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";
const JANUS_SUBPROTOCOL: &str = "janus-protocol";

/// Opens Janus sessions against the configured gateway
pub struct JanusConnector {
    config: SignalingConfig,
}

impl JanusConnector {
    #[must_use]
    pub const fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalingConnector for JanusConnector {
    async fn connect(
        &self,
        auth_token: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let mut request = self
            .config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::SignalingUnavailable(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(JANUS_SUBPROTOCOL));

        let url = &self.config.server_url;
        let connecting = tokio_tungstenite::connect_async(request);
        let (socket, _) = timeout(self.config.request_timeout(), connecting)
            .await
            .map_err(|_| Error::SignalingUnavailable(format!("connecting to {url} timed out")))?
            .map_err(|e| Error::SignalingUnavailable(e.to_string()))?;
        info!(url = %self.config.server_url, "Signaling socket connected");

        let (mut sink, mut stream) = socket.split();
        let (inner, mut outbound, events) =
            JanusInner::new(auth_token, self.config.request_timeout());

        let closed = inner.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    message = outbound.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = sink.send(message).await {
                            debug!(error = %e, "Signaling socket write failed");
                            break;
                        }
                    }
                }
            }
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    () = reader.closed.cancelled() => break "closed locally".to_string(),
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Value>(&text) {
                                Ok(message) => reader.dispatch(message),
                                Err(e) => warn!(error = %e, "Unparseable signaling message"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string());
                            break reason.unwrap_or_else(|| "socket closed".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "socket closed".to_string(),
                    },
                }
            };
            reader.shutdown(&reason);
        });

        let session_id = match create_session(&inner).await {
            Ok(session_id) => session_id,
            Err(e) => {
                inner.abandon();
                return Err(e);
            }
        };
        let _ = inner.session_id.set(session_id);
        info!(session_id, "Janus session created");

        spawn_keepalive(Arc::clone(&inner), self.config.keepalive_interval());

        Ok((Arc::new(JanusChannel { inner }), events))
    }
}

async fn create_session(inner: &JanusInner) -> Result<u64> {
    let created = inner
        .request(json!({"janus": "create"}), false)
        .await
        .map_err(|e| Error::SignalingUnavailable(e.to_string()))?;
    created["data"]["id"]
        .as_u64()
        .ok_or_else(|| Error::SignalingUnavailable("session create reply without id".to_string()))
}

fn spawn_keepalive(inner: Arc<JanusInner>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = inner.closed.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner.request(json!({"janus": "keepalive"}), true).await {
                        warn!(error = %e, "Keepalive failed");
                    }
                }
            }
        }
    });
}

struct Pending {
    reply: oneshot::Sender<Result<Value>>,
    /// Trickle and keepalive complete on the transport-level `ack`
    resolve_on_ack: bool,
}

struct JanusInner {
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    pending: Mutex<HashMap<String, Pending>>,
    token: Option<String>,
    session_id: OnceLock<u64>,
    request_timeout: Duration,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl JanusInner {
    fn new(
        auth_token: &str,
        request_timeout: Duration,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Self {
            outbound,
            events,
            pending: Mutex::new(HashMap::new()),
            token: (!auth_token.is_empty()).then(|| auth_token.to_string()),
            session_id: OnceLock::new(),
            request_timeout,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        (inner, outbound_rx, events_rx)
    }

    /// Send `message` and wait for the reply carrying its transaction
    async fn request(&self, mut message: Value, resolve_on_ack: bool) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(Error::Signaling("signaling channel closed".to_string()));
        }

        let transaction = nanoid::nanoid!(12);
        let kind = message["janus"].as_str().unwrap_or_default().to_string();
        if let Some(fields) = message.as_object_mut() {
            fields.insert("transaction".to_string(), Value::from(transaction.clone()));
            if let Some(token) = &self.token {
                fields.insert("token".to_string(), Value::from(token.clone()));
            }
            if let Some(session_id) = self.session_id.get() {
                fields.insert("session_id".to_string(), Value::from(*session_id));
            }
        }

        let (reply, response) = oneshot::channel();
        self.pending.lock().insert(
            transaction.clone(),
            Pending {
                reply,
                resolve_on_ack,
            },
        );

        trace!(kind = %kind, transaction = %transaction, "Signaling request");
        if self.outbound.send(Message::Text(message.to_string().into())).is_err() {
            self.pending.lock().remove(&transaction);
            return Err(Error::Signaling("signaling transport closed".to_string()));
        }

        match timeout(self.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Signaling(
                "signaling transport closed before reply".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&transaction);
                Err(Error::Timeout(format!("janus {kind} request")))
            }
        }
    }

    fn dispatch(&self, message: Value) {
        let kind = message["janus"].as_str().unwrap_or_default().to_string();
        let transaction = message["transaction"].as_str().map(str::to_string);

        if let Some(transaction) = transaction {
            let mut pending = self.pending.lock();
            let resolves = match (kind.as_str(), pending.get(&transaction)) {
                ("ack", Some(waiting)) => waiting.resolve_on_ack,
                ("success" | "error" | "event", Some(_)) => true,
                _ => false,
            };
            if resolves {
                if let Some(waiting) = pending.remove(&transaction) {
                    drop(pending);
                    let _ = waiting.reply.send(reply_outcome(message));
                    return;
                }
            }
            if kind == "ack" {
                return;
            }
        }

        match classify_event(&kind, &message) {
            Some(event) => {
                let _ = self.events.send(event);
            }
            None => trace!(kind = %kind, "Ignoring signaling message"),
        }
    }

    /// Close the socket without reporting a loss
    fn abandon(&self) {
        self.closing.store(true, Ordering::Release);
        self.closed.cancel();
    }

    /// Fail every waiting request and report the loss unless we closed ourselves
    fn shutdown(&self, reason: &str) {
        self.closed.cancel();
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, waiting) in pending {
            let _ = waiting
                .reply
                .send(Err(Error::Signaling(format!("signaling lost: {reason}"))));
        }
        if !self.closing.load(Ordering::Acquire) {
            warn!(reason, "Signaling channel lost");
            let _ = self.events.send(SignalingEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

/// Turn a transaction reply into the request outcome
fn reply_outcome(message: Value) -> Result<Value> {
    if message["janus"] == "error" {
        let code = message["error"]["code"].as_i64().unwrap_or_default();
        let reason = message["error"]["reason"].as_str().unwrap_or("unknown error");
        return Err(Error::Signaling(format!("janus error {code}: {reason}")));
    }

    let data = &message["plugindata"]["data"];
    if let Some(code) = data["error_code"].as_i64() {
        return Err(Error::Plugin {
            code,
            reason: data["error"].as_str().unwrap_or_default().to_string(),
        });
    }
    Ok(message)
}

fn sender_handle(message: &Value) -> Option<HandleId> {
    serde_json::from_value(message.get("sender")?.clone()).ok()
}

fn jsep_of(message: &Value) -> Option<SessionDescription> {
    serde_json::from_value(message.get("jsep")?.clone()).ok()
}

/// Map an unsolicited Janus message onto a [`SignalingEvent`]
fn classify_event(kind: &str, message: &Value) -> Option<SignalingEvent> {
    if kind == "timeout" {
        return Some(SignalingEvent::Closed {
            reason: "janus session timed out".to_string(),
        });
    }

    let handle = sender_handle(message)?;
    let event = match kind {
        "event" => SignalingEvent::Message {
            handle,
            data: message["plugindata"]["data"].clone(),
            jsep: jsep_of(message),
        },
        "trickle" => {
            let candidate = &message["candidate"];
            let candidate = if candidate["completed"].as_bool().unwrap_or(false) {
                None
            } else {
                Some(serde_json::from_value::<IceCandidate>(candidate.clone()).ok()?)
            };
            SignalingEvent::Trickle { handle, candidate }
        }
        "hangup" => SignalingEvent::HangUp {
            handle,
            reason: message["reason"].as_str().unwrap_or_default().to_string(),
        },
        "webrtcup" => SignalingEvent::WebRtcUp { handle },
        "media" => SignalingEvent::Media {
            handle,
            kind: match message["type"].as_str()? {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            },
            receiving: message["receiving"].as_bool().unwrap_or(false),
        },
        "detached" => SignalingEvent::Detached { handle },
        _ => return None,
    };
    Some(event)
}

/// [`SignalingChannel`] for one Janus session
pub struct JanusChannel {
    inner: Arc<JanusInner>,
}

#[async_trait]
impl SignalingChannel for JanusChannel {
    async fn attach(&self) -> Result<HandleId> {
        let reply = self
            .inner
            .request(json!({"janus": "attach", "plugin": VIDEOROOM_PLUGIN}), false)
            .await?;
        let handle: HandleId = serde_json::from_value(reply["data"]["id"].clone())?;
        debug!(handle_id = %handle, "Plugin handle attached");
        Ok(handle)
    }

    async fn send(
        &self,
        handle: &HandleId,
        request: VideoRoomRequest,
        jsep: Option<SessionDescription>,
    ) -> Result<PluginReply> {
        let name = request.name();
        let mut message = json!({
            "janus": "message",
            "handle_id": handle,
            "body": request,
        });
        if let Some(jsep) = jsep {
            message["jsep"] = serde_json::to_value(jsep)?;
        }

        let reply = self.inner.request(message, false).await?;
        debug!(handle_id = %handle, request = name, "Plugin request completed");
        Ok(PluginReply {
            data: reply["plugindata"]["data"].clone(),
            jsep: jsep_of(&reply),
        })
    }

    async fn trickle(&self, handle: &HandleId, candidate: Option<IceCandidate>) -> Result<()> {
        let candidate = match candidate {
            Some(candidate) => serde_json::to_value(candidate)?,
            None => json!({"completed": true}),
        };
        self.inner
            .request(
                json!({"janus": "trickle", "handle_id": handle, "candidate": candidate}),
                true,
            )
            .await?;
        Ok(())
    }

    async fn detach(&self, handle: &HandleId) -> Result<()> {
        self.inner
            .request(json!({"janus": "detach", "handle_id": handle}), false)
            .await?;
        debug!(handle_id = %handle, "Plugin handle detached");
        Ok(())
    }

    async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.request(json!({"janus": "destroy"}), false).await {
            debug!(error = %e, "Session destroy failed");
        }
        self.inner.shutdown("closed locally");
        info!("Signaling channel closed");
    }
}

impl Drop for JanusChannel {
    fn drop(&mut self) {
        self.inner.abandon();
    }
}
