//! Session-aware client for one source.

use crate::config::ApplierConfig;
use crate::error::{ApplierError, ApplierResult};
use crate::transport::{Connector, ReplicationTransport};
use logship_core::{CollectionId, ErrorCode, LoggerState, ServerId, Tick};
use logship_protocol::{
    Chunk, DumpRequest, DumpResponse, FilterConfig, FollowRequest, InventoryRequest,
    InventoryResponse, LoginRequest, LoginResponse, Request, RequestBody, Response, SnapshotId,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Session {
    token: String,
    server_id: ServerId,
}

/// Client bound to a source endpoint and a set of credentials.
///
/// The client logs in lazily and keeps the session token. When the source
/// rejects a token (for example because it expired) the client logs in again
/// once and repeats the request; a rejected login is returned as is.
pub struct ReplicationClient {
    endpoint: String,
    username: String,
    password: String,
    transport: Arc<dyn ReplicationTransport>,
    session: RwLock<Option<Session>>,
    requests: AtomicU64,
}

impl ReplicationClient {
    /// Creates a client over an open transport.
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            transport,
            session: RwLock::new(None),
            requests: AtomicU64::new(0),
        }
    }

    /// Connects to the endpoint named in `config`.
    pub fn connect(connector: &dyn Connector, config: &ApplierConfig) -> ApplierResult<Self> {
        let transport = connector.connect(&config.endpoint)?;
        Ok(Self::new(
            config.endpoint.clone(),
            config.username.clone(),
            config.password.clone(),
            transport,
        ))
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity of the source, known after the first login.
    pub fn server_id(&self) -> Option<ServerId> {
        self.session.read().as_ref().map(|s| s.server_id)
    }

    /// Number of requests sent, logins included.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Logs in and stores the session token.
    pub fn login(&self) -> ApplierResult<LoginResponse> {
        let request = Request::anonymous(RequestBody::Login(LoginRequest::new(
            self.username.clone(),
            self.password.clone(),
        )));
        match self.send(&request)? {
            Response::Login(login) => {
                *self.session.write() = Some(Session {
                    token: login.token.clone(),
                    server_id: login.server_id,
                });
                tracing::debug!(endpoint = %self.endpoint, server = %login.server_id, "logged in");
                Ok(login)
            }
            other => Err(unexpected("login", other)),
        }
    }

    /// The source's log position.
    pub fn logger_state(&self) -> ApplierResult<LoggerState> {
        match self.call(RequestBody::LoggerState)? {
            Response::LoggerState(state) => Ok(state),
            other => Err(unexpected("logger-state", other)),
        }
    }

    /// Captures a snapshot of the collections selected by `filter`.
    pub fn inventory(&self, filter: &FilterConfig) -> ApplierResult<InventoryResponse> {
        match self.call(RequestBody::Inventory(InventoryRequest::new(filter.clone())))? {
            Response::Inventory(inventory) => Ok(inventory),
            other => Err(unexpected("inventory", other)),
        }
    }

    /// Fetches one page of a captured collection.
    pub fn dump(
        &self,
        snapshot: &SnapshotId,
        collection: CollectionId,
        offset: u64,
        batch_size: u64,
    ) -> ApplierResult<DumpResponse> {
        let request = DumpRequest::new(snapshot.clone(), collection, offset, batch_size);
        match self.call(RequestBody::Dump(request))? {
            Response::Dump(page) => Ok(page),
            other => Err(unexpected("dump", other)),
        }
    }

    /// Frees a snapshot on the source.
    pub fn release(&self, snapshot: &SnapshotId) -> ApplierResult<()> {
        match self.call(RequestBody::Release(snapshot.clone()))? {
            Response::Released => Ok(()),
            other => Err(unexpected("release", other)),
        }
    }

    /// Fetches the log entries after `from_tick`.
    pub fn follow(&self, from_tick: &Tick, chunk_size: u64) -> ApplierResult<Chunk> {
        let request = FollowRequest::new(from_tick.clone(), chunk_size);
        match self.call(RequestBody::Follow(request))? {
            Response::Chunk(chunk) => Ok(chunk),
            other => Err(unexpected("follow", other)),
        }
    }

    fn call(&self, body: RequestBody) -> ApplierResult<Response> {
        let token = self.token()?;
        let response = self.send(&Request::with_token(token, body.clone()))?;
        match response {
            Response::Error(err) if err.code == ErrorCode::UNAUTHORIZED => {
                tracing::debug!(endpoint = %self.endpoint, "session rejected, logging in again");
                *self.session.write() = None;
                let token = self.token()?;
                self.send(&Request::with_token(token, body))
            }
            other => Ok(other),
        }
    }

    fn token(&self) -> ApplierResult<String> {
        if let Some(session) = self.session.read().as_ref() {
            return Ok(session.token.clone());
        }
        Ok(self.login()?.token)
    }

    fn send(&self, request: &Request) -> ApplierResult<Response> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.transport.request(request)
    }
}

fn unexpected(expected: &str, response: Response) -> ApplierError {
    match response {
        Response::Error(err) => ApplierError::remote(err),
        other => ApplierError::InvalidResponse(format!(
            "expected {expected} response, got {}",
            other.name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn login_response() -> Response {
        Response::Login(LoginResponse {
            token: "t1".into(),
            server_id: ServerId::generate(),
            state: LoggerState {
                last_log_tick: Tick::from(3),
                first_tick: Some(Tick::from(1)),
                total_events: 3,
            },
        })
    }

    fn client(mock: &Arc<MockTransport>) -> ReplicationClient {
        ReplicationClient::new("mock://", "root", "pw", Arc::clone(mock) as Arc<dyn ReplicationTransport>)
    }

    #[test]
    fn logs_in_lazily_once() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(login_response());
        mock.set_fallback(Response::Released);

        let client = client(&mock);
        assert!(client.server_id().is_none());
        client.release(&SnapshotId::new("s")).unwrap();
        client.release(&SnapshotId::new("s")).unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].token.is_none());
        assert_eq!(requests[1].token.as_deref(), Some("t1"));
        assert!(client.server_id().is_some());
        assert_eq!(client.request_count(), 3);
    }

    #[test]
    fn rejected_login_is_unauthorized() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(Response::error(ErrorCode::UNAUTHORIZED, "bad credentials"));
        let err = client(&mock).logger_state().unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[test]
    fn expired_session_logs_in_again() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(login_response());
        mock.push_response(Response::error(ErrorCode::UNAUTHORIZED, "token expired"));
        mock.push_response(login_response());
        mock.push_response(Response::Released);

        client(&mock).release(&SnapshotId::new("s")).unwrap();
        assert_eq!(mock.requests().len(), 4);
    }

    #[test]
    fn wrong_variant_is_invalid_response() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(login_response());
        mock.push_response(Response::Released);
        let err = client(&mock).follow(&Tick::zero(), 512).unwrap_err();
        assert!(matches!(err, ApplierError::InvalidResponse(_)));
        assert_eq!(err.code(), ErrorCode::REPLICATION_INVALID_RESPONSE);
    }

    #[test]
    fn source_errors_keep_their_code() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(login_response());
        mock.push_response(Response::error(ErrorCode::NOT_FOUND, "snapshot not found"));
        let err = client(&mock)
            .dump(&SnapshotId::new("gone"), CollectionId::new(1), 0, 10)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NOT_FOUND);
    }
}
