//! Replication source facade.

use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::handler::{HandlerContext, RequestHandler};
use logship_core::{Database, LoggerState};
use logship_protocol::{decode_request, encode_response, Request, Response};
use std::sync::Arc;

/// The replication source.
///
/// Wraps a [`Database`] and answers replica requests: login, logger state,
/// snapshot inventory and dumps, and log following. Requests arrive either
/// as values through [`ReplicationServer::handle`] or as CBOR frames through
/// [`ReplicationServer::handle_bytes`].
///
/// # Example
///
/// ```
/// use logship_core::Database;
/// use logship_protocol::{LoginRequest, Request, RequestBody, Response};
/// use logship_source::{ReplicationServer, SourceConfig};
/// use std::sync::Arc;
///
/// let server = ReplicationServer::new(Arc::new(Database::open_in_memory()), SourceConfig::default());
/// server.add_user("replicator", "secret");
///
/// let login = Request::anonymous(RequestBody::Login(LoginRequest::new("replicator", "secret")));
/// assert!(matches!(server.handle(&login), Response::Login(_)));
/// ```
pub struct ReplicationServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl ReplicationServer {
    /// Creates a source serving `db`.
    pub fn new(db: Arc<Database>, config: SourceConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config, db));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Adds a user allowed to replicate.
    pub fn add_user(&self, username: impl Into<String>, password: &str) {
        self.context.users.add_user(username, password);
    }

    /// Removes a user.
    pub fn remove_user(&self, username: &str) -> bool {
        self.context.users.remove_user(username)
    }

    /// Handles a request.
    pub fn handle(&self, request: &Request) -> Response {
        self.handler.handle(request)
    }

    /// Handles a CBOR-encoded request and returns the encoded response.
    ///
    /// Frames that do not decode are answered with an error response.
    pub fn handle_bytes(&self, bytes: &[u8]) -> SourceResult<Vec<u8>> {
        let response = match decode_request(bytes) {
            Ok(request) => self.handle(&request),
            Err(err) => {
                tracing::warn!(error = %err, "undecodable request");
                Response::Error(SourceError::from(err).to_response())
            }
        };
        Ok(encode_response(&response)?)
    }

    /// The database being served.
    pub fn database(&self) -> &Arc<Database> {
        &self.context.db
    }

    /// Current position of the replication log.
    pub fn logger_state(&self) -> LoggerState {
        self.context.db.log().state()
    }

    /// Number of snapshots currently held open.
    pub fn open_snapshots(&self) -> usize {
        self.context.snapshots().registry().len()
    }

    /// Source configuration.
    pub fn config(&self) -> &SourceConfig {
        &self.context.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::{CollectionProperties, ErrorCode, Tick};
    use logship_protocol::{
        decode_response, encode_request, FilterConfig, FollowRequest, InventoryRequest,
        LoginRequest, RequestBody,
    };
    use serde_json::json;

    fn server() -> ReplicationServer {
        let db = Arc::new(Database::open_in_memory());
        db.create_collection("c", CollectionProperties::default()).unwrap();
        for i in 0..3 {
            db.insert("c", json!({"_key": format!("{i}")})).unwrap();
        }
        let server = ReplicationServer::new(db, SourceConfig::default());
        server.add_user("root", "pw");
        server
    }

    fn roundtrip(server: &ReplicationServer, request: &Request) -> Response {
        let bytes = server.handle_bytes(&encode_request(request).unwrap()).unwrap();
        decode_response(&bytes).unwrap()
    }

    #[test]
    fn full_replication_flow() {
        let server = server();

        // 1. Login
        let token = match roundtrip(
            &server,
            &Request::anonymous(RequestBody::Login(LoginRequest::new("root", "pw"))),
        ) {
            Response::Login(login) => login.token,
            other => panic!("unexpected response {other:?}"),
        };

        // 2. Inventory
        let inventory = match roundtrip(
            &server,
            &Request::with_token(
                token.clone(),
                RequestBody::Inventory(InventoryRequest::new(FilterConfig::default())),
            ),
        ) {
            Response::Inventory(inventory) => inventory,
            other => panic!("unexpected response {other:?}"),
        };
        assert_eq!(inventory.last_log_tick, Tick::from(4));
        assert_eq!(server.open_snapshots(), 1);

        // 3. Follow from the boundary: nothing new yet
        let chunk = match roundtrip(
            &server,
            &Request::with_token(
                token,
                RequestBody::Follow(FollowRequest::new(inventory.last_log_tick.clone(), 0)),
            ),
        ) {
            Response::Chunk(chunk) => chunk,
            other => panic!("unexpected response {other:?}"),
        };
        assert!(chunk.is_empty());
        assert_eq!(chunk.available_tick, inventory.last_log_tick);
    }

    #[test]
    fn garbage_frames_get_an_error() {
        let server = server();
        let bytes = server.handle_bytes(&[0x00, 0x01]).unwrap();
        match decode_response(&bytes).unwrap() {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::BAD_PARAMETER),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn removed_user_cannot_login() {
        let server = server();
        assert!(server.remove_user("root"));
        let response =
            server.handle(&Request::anonymous(RequestBody::Login(LoginRequest::new("root", "pw"))));
        assert!(matches!(response, Response::Error(e) if e.code == ErrorCode::UNAUTHORIZED));
    }

    #[test]
    fn logger_state_tracks_writes() {
        let server = server();
        let before = server.logger_state();
        server.database().insert("c", json!({})).unwrap();
        let after = server.logger_state();
        assert!(after.last_log_tick > before.last_log_tick);
        assert_eq!(after.total_events, before.total_events + 1);
    }
}
