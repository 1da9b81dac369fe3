//! JSON-RPC protocol engine: request correlation with per-request
//! timeouts, the MCP initialize handshake, and notification dispatch.

use crate::error::McpError;
use crate::jsonrpc::{JsonRpcMessage, JsonRpcResponse, RequestId};
use crate::transport::{Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// MCP protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on the best-effort `shutdown` request, so a mute server
/// cannot stall disconnection.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

const CLOSE_CHANNEL_CAPACITY: usize = 16;

type PendingSender = oneshot::Sender<Result<Value, McpError>>;
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Identity this host reports in the `initialize` request.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "golem-mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server identity reported in the initialize result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// The server's answer to `initialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

struct EngineShared {
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    handlers: Mutex<HashMap<String, NotificationHandler>>,
    initialized: AtomicBool,
    close_tx: broadcast::Sender<Option<i32>>,
}

impl EngineShared {
    fn take_pending(&self, id: &RequestId) -> Option<PendingSender> {
        self.lock_pending().remove(id)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingSender>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject every pending request with a fresh error from `make_err`.
    fn drain_pending(&self, make_err: impl Fn() -> McpError) {
        let drained = std::mem::take(&mut *self.lock_pending());
        for (_id, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
    }
}

/// Correlates requests with responses over one transport.
///
/// Request ids are monotonically increasing; every pending request ends
/// in exactly one of: resolved, rejected, or cancelled by
/// timeout/close/shutdown.
pub struct ProtocolEngine {
    transport: Arc<dyn Transport>,
    shared: Arc<EngineShared>,
    next_id: AtomicI64,
    timeout_ms: u64,
    dispatch: tokio::task::JoinHandle<()>,
}

impl ProtocolEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_timeout(transport, DEFAULT_REQUEST_TIMEOUT_MS)
    }

    pub fn with_timeout(transport: Arc<dyn Transport>, timeout_ms: u64) -> Self {
        let (close_tx, _) = broadcast::channel(CLOSE_CHANNEL_CAPACITY);
        let shared = Arc::new(EngineShared {
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            close_tx,
        });

        // Subscribe before the transport starts so no event is missed.
        let mut events = transport.subscribe();
        let dispatch_shared = Arc::clone(&shared);
        let dispatch = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Message(message)) => {
                        dispatch_message(&dispatch_shared, message);
                    }
                    Ok(TransportEvent::Error(detail)) => {
                        tracing::debug!("transport error: {detail}");
                    }
                    Ok(TransportEvent::Close(code)) => {
                        dispatch_shared.initialized.store(false, Ordering::SeqCst);
                        dispatch_shared.drain_pending(|| McpError::TransportClosed {
                            exit_code: code,
                        });
                        let _ = dispatch_shared.close_tx.send(code);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("protocol engine dropped {n} transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            transport,
            shared,
            next_id: AtomicI64::new(1),
            timeout_ms,
            dispatch,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Completion of the underlying transport, with its exit code.
    pub fn subscribe_close(&self) -> broadcast::Receiver<Option<i32>> {
        self.shared.close_tx.subscribe()
    }

    /// Send a request and wait for whichever comes first: its response,
    /// the timeout, or transport close.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id_num = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::from(id_num);

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(id.clone(), tx);

        let message = JsonRpcMessage::request(id.clone(), method, params);
        if let Err(err) = self.transport.send(&message).await {
            self.shared.take_pending(&id);
            return Err(err);
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Protocol(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                // Remove the entry first so a late response finds nothing
                // and is dropped.
                self.shared.take_pending(&id);
                Err(McpError::RequestTimeout {
                    method: method.to_string(),
                    id: id_num,
                    timeout_ms: self.timeout_ms,
                })
            }
        }
    }

    /// Send a notification; never waits for a response.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.transport
            .send(&JsonRpcMessage::notification(method, params))
            .await
    }

    /// Run the MCP handshake: `initialize`, then the `initialized`
    /// notification. Only after this may other requests be issued.
    pub async fn initialize(
        &self,
        client_info: &ClientInfo,
        capabilities: Value,
    ) -> Result<InitializeResult, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "clientInfo": client_info,
        });
        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid initialize result: {e}")))?;

        self.notify("notifications/initialized", None).await?;
        self.shared.initialized.store(true, Ordering::SeqCst);
        Ok(init)
    }

    /// Best-effort `shutdown` request, then reject everything pending.
    pub async fn shutdown(&self) {
        if self.shared.initialized.swap(false, Ordering::SeqCst) {
            let _ = tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, self.request("shutdown", None))
                .await;
        }
        self.shared.drain_pending(|| McpError::ShuttingDown);
    }

    /// Register a handler for server-initiated notifications of
    /// `method`. Registering again for the same method replaces the
    /// previous handler.
    pub fn on_notification(&self, method: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(method.to_string(), Arc::new(handler));
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.dispatch.abort();
        self.shared.drain_pending(|| McpError::ShuttingDown);
    }
}

fn dispatch_message(shared: &EngineShared, message: JsonRpcMessage) {
    match message {
        JsonRpcMessage::Response(response) => dispatch_response(shared, response),
        JsonRpcMessage::Notification(notification) => {
            let handler = shared
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&notification.method)
                .cloned();
            if let Some(handler) = handler {
                handler(notification.params.unwrap_or_else(|| json!({})));
            }
        }
        JsonRpcMessage::Request(request) => {
            // Server-initiated requests are not part of this layer.
            tracing::debug!("ignoring server request '{}'", request.method);
        }
    }
}

fn dispatch_response(shared: &EngineShared, response: JsonRpcResponse) {
    let Some(id) = response.id else {
        return;
    };
    let Some(tx) = shared.take_pending(&id) else {
        // Unknown or already-timed-out id; drop silently.
        tracing::debug!("dropping response for unknown id {id}");
        return;
    };

    let outcome = match response.error {
        Some(error) => Err(McpError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcError, JsonRpcRequest};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// In-memory transport double: records sends, lets tests inject
    /// inbound events.
    struct FakeTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<JsonRpcMessage>>,
        events: broadcast::Sender<TransportEvent>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(64);
            Arc::new(Self {
                connected: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
                events,
            })
        }

        fn inject(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }

        fn respond_ok(&self, id: i64, result: Value) {
            self.inject(TransportEvent::Message(JsonRpcMessage::Response(
                JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: Some(RequestId::Num(id)),
                    result: Some(result),
                    error: None,
                },
            )));
        }

        fn respond_err(&self, id: i64, code: i64, message: &str) {
            self.inject(TransportEvent::Message(JsonRpcMessage::Response(
                JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: Some(RequestId::Num(id)),
                    result: None,
                    error: Some(JsonRpcError {
                        code,
                        message: message.to_string(),
                        data: None,
                    }),
                },
            )));
        }

        fn sent_requests(&self) -> Vec<JsonRpcRequest> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    JsonRpcMessage::Request(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| match m {
                    JsonRpcMessage::Request(r) => r.method.clone(),
                    JsonRpcMessage::Notification(n) => n.method.clone(),
                    JsonRpcMessage::Response(_) => "<response>".to_string(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn start(&self) -> Result<(), McpError> {
            Ok(())
        }

        async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
            if !self.is_connected() {
                return Err(McpError::NotConnected);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    /// Wait for the fake to have seen `count` outbound messages.
    async fn wait_for_sends(fake: &FakeTransport, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fake.sent.lock().unwrap().len() >= count {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("outbound messages never arrived");
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_by_id() {
        let fake = FakeTransport::new();
        let engine = Arc::new(ProtocolEngine::new(fake.clone() as Arc<dyn Transport>));

        let a = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.request("alpha", None).await })
        };
        let b = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.request("beta", None).await })
        };
        wait_for_sends(&fake, 2).await;

        let requests = fake.sent_requests();
        let alpha_id = requests.iter().find(|r| r.method == "alpha").unwrap().id.clone();
        let beta_id = requests.iter().find(|r| r.method == "beta").unwrap().id.clone();
        let (RequestId::Num(alpha_id), RequestId::Num(beta_id)) = (alpha_id, beta_id) else {
            panic!("expected numeric ids");
        };
        assert_ne!(alpha_id, beta_id);

        // Respond out of order.
        fake.respond_ok(beta_id, json!({"who": "beta"}));
        fake.respond_ok(alpha_id, json!({"who": "alpha"}));

        assert_eq!(a.await.unwrap().unwrap()["who"], "alpha");
        assert_eq!(b.await.unwrap().unwrap()["who"], "beta");
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let fake = FakeTransport::new();
        let engine = ProtocolEngine::new(fake.clone() as Arc<dyn Transport>);

        let first = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_sends(&fake, 1).await;
                fake.respond_ok(1, json!(null));
                wait_for_sends(&fake, 2).await;
                fake.respond_ok(2, json!(null));
            }
        });
        engine.request("one", None).await.unwrap();
        engine.request("two", None).await.unwrap();
        first.await.unwrap();

        let ids: Vec<RequestId> = fake.sent_requests().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RequestId::Num(1), RequestId::Num(2)]);
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_response_is_dropped() {
        let fake = FakeTransport::new();
        let engine = ProtocolEngine::with_timeout(fake.clone() as Arc<dyn Transport>, 50);

        let err = engine.request("slow/method", None).await.unwrap_err();
        match &err {
            McpError::RequestTimeout { method, id, .. } => {
                assert_eq!(method, "slow/method");
                assert_eq!(*id, 1);
            }
            other => panic!("expected timeout, got: {other:?}"),
        }
        assert!(err.to_string().contains("timed out"));

        // A response arriving after the timer fired is ignored.
        fake.respond_ok(1, json!({"late": true}));
        tokio::task::yield_now().await;
        assert!(engine.shared.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn error_response_rejects_with_rpc_error() {
        let fake = FakeTransport::new();
        let engine = Arc::new(ProtocolEngine::new(fake.clone() as Arc<dyn Transport>));

        let req = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.request("boom", None).await })
        };
        wait_for_sends(&fake, 1).await;
        fake.respond_err(1, -32601, "Method not found");

        match req.await.unwrap() {
            Err(McpError::Rpc { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected rpc error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_failure_removes_pending() {
        let fake = FakeTransport::new();
        let engine = ProtocolEngine::new(fake.clone() as Arc<dyn Transport>);
        fake.close().await;

        let err = engine.request("anything", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
        assert!(engine.shared.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn transport_close_rejects_pending_and_marks_uninitialized() {
        let fake = FakeTransport::new();
        let engine = Arc::new(ProtocolEngine::new(fake.clone() as Arc<dyn Transport>));
        let mut close_rx = engine.subscribe_close();

        let req = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.request("pending", None).await })
        };
        wait_for_sends(&fake, 1).await;
        fake.inject(TransportEvent::Close(Some(1)));

        match req.await.unwrap() {
            Err(McpError::TransportClosed { exit_code }) => assert_eq!(exit_code, Some(1)),
            other => panic!("expected transport closed, got: {other:?}"),
        }
        assert!(!engine.is_initialized());
        let code = tokio::time::timeout(Duration::from_secs(1), close_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(1));
    }

    #[tokio::test]
    async fn handshake_marks_initialized_and_sends_initialized_notification() {
        let fake = FakeTransport::new();
        let engine = Arc::new(ProtocolEngine::new(fake.clone() as Arc<dyn Transport>));

        let responder = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_sends(&fake, 1).await;
                fake.respond_ok(
                    1,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "test-server", "version": "1.0.0"}
                    }),
                );
            }
        });

        let info = ClientInfo::default();
        let init = engine.initialize(&info, json!({})).await.unwrap();
        responder.await.unwrap();

        assert!(engine.is_initialized());
        assert_eq!(init.server_info.name, "test-server");
        assert_eq!(init.protocol_version, "2024-11-05");
        assert_eq!(
            fake.sent_methods(),
            vec!["initialize", "notifications/initialized"]
        );

        let requests = fake.sent_requests();
        let params = requests[0].params.as_ref().unwrap();
        assert_eq!(params["protocolVersion"], "2024-11-05");
        assert_eq!(params["clientInfo"]["name"], "golem-mcp");
    }

    #[tokio::test]
    async fn notifications_dispatch_to_registered_handler() {
        let fake = FakeTransport::new();
        let engine = ProtocolEngine::new(fake.clone() as Arc<dyn Transport>);

        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_notification("notifications/message", move |params| {
            sink.lock().unwrap().push(params);
        });

        fake.inject(TransportEvent::Message(JsonRpcMessage::notification(
            "notifications/message",
            Some(json!({"level": "info"})),
        )));
        fake.inject(TransportEvent::Message(JsonRpcMessage::notification(
            "notifications/other",
            None,
        )));
        fake.inject(TransportEvent::Message(JsonRpcMessage::notification(
            "notifications/message",
            None,
        )));

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if seen.lock().unwrap().len() >= 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["level"], "info");
        // Missing params arrive as an empty mapping.
        assert_eq!(seen[1], json!({}));
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_with_shutting_down() {
        let fake = FakeTransport::new();
        let engine = Arc::new(ProtocolEngine::new(fake.clone() as Arc<dyn Transport>));

        let req = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.request("hang", None).await })
        };
        wait_for_sends(&fake, 1).await;

        engine.shutdown().await;
        match req.await.unwrap() {
            Err(McpError::ShuttingDown) => {}
            other => panic!("expected shutting down, got: {other:?}"),
        }
        assert!(!engine.is_initialized());
    }

    #[tokio::test]
    async fn unknown_id_response_is_ignored() {
        let fake = FakeTransport::new();
        let engine = ProtocolEngine::new(fake.clone() as Arc<dyn Transport>);
        fake.respond_ok(99, json!({}));
        tokio::task::yield_now().await;
        assert!(engine.shared.lock_pending().is_empty());
        assert!(!engine.is_initialized());
    }
}
