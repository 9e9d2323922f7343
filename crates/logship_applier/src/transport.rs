//! Transport layer abstraction for talking to a source.

use crate::error::{ApplierError, ApplierResult};
use logship_protocol::{decode_response, encode_request, Request, Response};
use logship_source::ReplicationServer;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Carries requests to one source and brings back its answers.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (in-process loopback, sockets, mocks for testing).
/// Implementations report unreachable sources as retryable
/// [`ApplierError::Transport`] errors.
pub trait ReplicationTransport: Send + Sync {
    /// Sends a request and waits for the answer.
    fn request(&self, request: &Request) -> ApplierResult<Response>;
}

/// Opens transports to endpoints.
pub trait Connector: Send + Sync {
    /// Returns a transport to `endpoint`.
    fn connect(&self, endpoint: &str) -> ApplierResult<Arc<dyn ReplicationTransport>>;
}

/// A source reachable through encoded frames.
pub trait FrameHandler: Send + Sync {
    /// Handles one encoded request and returns the encoded response.
    fn handle_frame(&self, frame: &[u8]) -> Result<Vec<u8>, String>;
}

impl FrameHandler for ReplicationServer {
    fn handle_frame(&self, frame: &[u8]) -> Result<Vec<u8>, String> {
        self.handle_bytes(frame).map_err(|e| e.to_string())
    }
}

/// Transport that hands encoded frames to an in-process source.
///
/// Every request goes through the same CBOR encoding a network transport
/// would use.
pub struct LoopbackTransport {
    server: Arc<dyn FrameHandler>,
}

impl LoopbackTransport {
    /// Creates a transport to `server`.
    pub fn new(server: Arc<dyn FrameHandler>) -> Self {
        Self { server }
    }
}

impl ReplicationTransport for LoopbackTransport {
    fn request(&self, request: &Request) -> ApplierResult<Response> {
        let frame = encode_request(request)?;
        let reply = self
            .server
            .handle_frame(&frame)
            .map_err(ApplierError::transport_fatal)?;
        Ok(decode_response(&reply)?)
    }
}

/// Connects endpoint names to in-process sources.
#[derive(Default)]
pub struct LoopbackConnector {
    servers: RwLock<HashMap<String, Arc<dyn FrameHandler>>>,
}

impl LoopbackConnector {
    /// Creates a connector with no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `server` reachable under `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, server: Arc<dyn FrameHandler>) {
        self.servers.write().insert(endpoint.into(), server);
    }

    /// Makes `endpoint` unreachable. Returns false if it was not registered.
    pub fn unregister(&self, endpoint: &str) -> bool {
        self.servers.write().remove(endpoint).is_some()
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, endpoint: &str) -> ApplierResult<Arc<dyn ReplicationTransport>> {
        let server = self
            .servers
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| {
                ApplierError::transport_retryable(format!("connection refused: {endpoint}"))
            })?;
        Ok(Arc::new(LoopbackTransport::new(server)))
    }
}

/// A mock transport for testing.
///
/// Answers come from a script, in order; once it runs dry the fallback
/// answer is repeated. Every request is recorded.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    script: Mutex<VecDeque<ApplierResult<Response>>>,
    fallback: Mutex<Option<Response>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues an answer.
    pub fn push_response(&self, response: Response) {
        self.script.lock().push_back(Ok(response));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: ApplierError) {
        self.script.lock().push_back(Err(error));
    }

    /// Sets the answer used once the script is exhausted.
    pub fn set_fallback(&self, response: Response) {
        *self.fallback.lock() = Some(response);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

impl ReplicationTransport for MockTransport {
    fn request(&self, request: &Request) -> ApplierResult<Response> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ApplierError::transport_retryable("not connected"));
        }
        self.requests.lock().push(request.clone());
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        self.fallback
            .lock()
            .clone()
            .ok_or_else(|| ApplierError::transport_fatal("no mock response set"))
    }
}

impl Connector for Arc<MockTransport> {
    fn connect(&self, _endpoint: &str) -> ApplierResult<Arc<dyn ReplicationTransport>> {
        Ok(Arc::clone(self) as Arc<dyn ReplicationTransport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::{Database, ErrorCode};
    use logship_protocol::{LoginRequest, RequestBody};
    use logship_source::SourceConfig;

    fn login_request() -> Request {
        Request::anonymous(RequestBody::Login(LoginRequest::new("root", "pw")))
    }

    #[test]
    fn loopback_round_trip() {
        let server = ReplicationServer::new(Arc::new(Database::open_in_memory()), SourceConfig::default());
        server.add_user("root", "pw");
        let connector = LoopbackConnector::new();
        connector.register("loop://source", Arc::new(server));

        let transport = connector.connect("loop://source").unwrap();
        assert!(matches!(transport.request(&login_request()).unwrap(), Response::Login(_)));
    }

    #[test]
    fn unknown_endpoint_is_retryable() {
        let connector = LoopbackConnector::new();
        let err = connector.connect("loop://nowhere").err().unwrap();
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::REPLICATION_NO_RESPONSE);
        assert!(!connector.unregister("loop://nowhere"));
    }

    #[test]
    fn mock_follows_script_then_fallback() {
        let mock = MockTransport::new();
        mock.push_error(ApplierError::Timeout);
        mock.set_fallback(Response::Released);

        assert!(matches!(mock.request(&login_request()), Err(ApplierError::Timeout)));
        assert!(matches!(mock.request(&login_request()), Ok(Response::Released)));
        assert!(matches!(mock.request(&login_request()), Ok(Response::Released)));
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn mock_disconnected() {
        let mock = MockTransport::new();
        mock.set_fallback(Response::Released);
        mock.set_connected(false);
        assert!(mock.request(&login_request()).unwrap_err().is_retryable());
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn mock_without_answers_fails() {
        let mock = MockTransport::new();
        assert!(!mock.request(&login_request()).unwrap_err().is_retryable());
    }
}
