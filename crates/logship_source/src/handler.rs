//! Request dispatch for the replication source.

use crate::auth::{SessionTokens, UserStore};
use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::snapshot::SnapshotProvider;
use crate::tailer::LogTailer;
use logship_core::Database;
use logship_protocol::{LoginRequest, LoginResponse, Request, RequestBody, Response};
use std::sync::Arc;

/// Shared state for request handling.
pub struct HandlerContext {
    /// Source configuration.
    pub config: SourceConfig,
    /// The database being replicated.
    pub db: Arc<Database>,
    /// Users allowed to log in.
    pub users: UserStore,
    tokens: SessionTokens,
    snapshots: SnapshotProvider,
    tailer: LogTailer,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(config: SourceConfig, db: Arc<Database>) -> Self {
        let tokens = match &config.auth_secret {
            Some(secret) => SessionTokens::new(secret.clone(), config.token_expiry),
            None => SessionTokens::random(config.token_expiry),
        };
        let snapshots =
            SnapshotProvider::new(Arc::clone(&db), config.snapshot_ttl, config.dump_batch_size);
        let tailer = LogTailer::new(Arc::clone(&db), config.clone());
        Self {
            config,
            db,
            users: UserStore::new(),
            tokens,
            snapshots,
            tailer,
        }
    }

    /// The snapshot provider.
    pub fn snapshots(&self) -> &SnapshotProvider {
        &self.snapshots
    }

    /// The log tailer.
    pub fn tailer(&self) -> &LogTailer {
        &self.tailer
    }
}

/// Handler for replication requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a request. Failures become [`Response::Error`].
    pub fn handle(&self, request: &Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                if err.is_client_error() {
                    tracing::debug!(request = request.body.name(), error = %err, "request rejected");
                } else {
                    tracing::error!(request = request.body.name(), error = %err, "request failed");
                }
                Response::Error(err.to_response())
            }
        }
    }

    fn dispatch(&self, request: &Request) -> SourceResult<Response> {
        if !matches!(request.body, RequestBody::Login(_)) {
            self.authorize(request.token.as_deref())?;
        }

        let ctx = &self.context;
        match &request.body {
            RequestBody::Login(login) => self.handle_login(login).map(Response::Login),
            RequestBody::LoggerState => Ok(Response::LoggerState(ctx.db.log().state())),
            RequestBody::Inventory(inventory) => {
                Ok(Response::Inventory(ctx.snapshots.inventory(&inventory.filter)))
            }
            RequestBody::Dump(dump) => ctx.snapshots.dump(dump).map(Response::Dump),
            RequestBody::Release(id) => {
                ctx.snapshots.release(id);
                Ok(Response::Released)
            }
            RequestBody::Follow(follow) => ctx.tailer.follow(follow).map(Response::Chunk),
        }
    }

    /// Checks credentials and issues a session token.
    pub fn handle_login(&self, login: &LoginRequest) -> SourceResult<LoginResponse> {
        let ctx = &self.context;
        if !ctx.users.authenticate(&login.username, &login.password) {
            tracing::warn!(user = %login.username, "login rejected");
            return Err(SourceError::Unauthorized(format!(
                "invalid credentials for user '{}'",
                login.username
            )));
        }
        let token = ctx.tokens.issue(&login.username)?;
        tracing::debug!(user = %login.username, "login accepted");
        Ok(LoginResponse {
            token,
            server_id: ctx.db.server_id(),
            state: ctx.db.log().state(),
        })
    }

    fn authorize(&self, token: Option<&str>) -> SourceResult<()> {
        if !self.context.config.require_authentication {
            return Ok(());
        }
        let token = token.ok_or_else(|| SourceError::Unauthorized("missing token".into()))?;
        self.context.tokens.validate(token).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::{CollectionProperties, ErrorCode, Tick};
    use logship_protocol::{FilterConfig, FollowRequest, InventoryRequest};
    use serde_json::json;

    fn create_handler() -> RequestHandler {
        let db = Arc::new(Database::open_in_memory());
        db.create_collection("c", CollectionProperties::default()).unwrap();
        db.insert("c", json!({"_key": "a"})).unwrap();
        let context = Arc::new(HandlerContext::new(SourceConfig::default(), db));
        context.users.add_user("root", "pw");
        RequestHandler::new(context)
    }

    fn login(handler: &RequestHandler) -> String {
        match handler.handle(&Request::anonymous(RequestBody::Login(LoginRequest::new("root", "pw")))) {
            Response::Login(login) => login.token,
            other => panic!("unexpected response {other:?}"),
        }
    }

    fn error_code(response: Response) -> ErrorCode {
        match response {
            Response::Error(err) => err.code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn login_success() {
        let handler = create_handler();
        let response = handler.handle_login(&LoginRequest::new("root", "pw")).unwrap();
        assert_eq!(response.state.last_log_tick, Tick::from(2));
        assert!(!response.token.is_empty());
    }

    #[test]
    fn bad_credentials_are_401() {
        let handler = create_handler();
        let response =
            handler.handle(&Request::anonymous(RequestBody::Login(LoginRequest::new("root", "nope"))));
        assert_eq!(error_code(response), ErrorCode::UNAUTHORIZED);
    }

    #[test]
    fn requests_need_a_token() {
        let handler = create_handler();
        assert_eq!(
            error_code(handler.handle(&Request::anonymous(RequestBody::LoggerState))),
            ErrorCode::UNAUTHORIZED
        );
        assert_eq!(
            error_code(handler.handle(&Request::with_token("forged", RequestBody::LoggerState))),
            ErrorCode::UNAUTHORIZED
        );

        let token = login(&handler);
        assert!(matches!(
            handler.handle(&Request::with_token(token, RequestBody::LoggerState)),
            Response::LoggerState(_)
        ));
    }

    #[test]
    fn open_source_skips_token_checks() {
        let db = Arc::new(Database::open_in_memory());
        let context = Arc::new(HandlerContext::new(
            SourceConfig::default().with_authentication(false),
            db,
        ));
        let handler = RequestHandler::new(context);
        assert!(matches!(
            handler.handle(&Request::anonymous(RequestBody::LoggerState)),
            Response::LoggerState(_)
        ));
    }

    #[test]
    fn inventory_and_follow() {
        let handler = create_handler();
        let token = login(&handler);

        let inventory = match handler.handle(&Request::with_token(
            token.clone(),
            RequestBody::Inventory(InventoryRequest::new(FilterConfig::default())),
        )) {
            Response::Inventory(inventory) => inventory,
            other => panic!("unexpected response {other:?}"),
        };
        assert_eq!(inventory.collections.len(), 1);

        let response = handler.handle(&Request::with_token(
            token.clone(),
            RequestBody::Follow(FollowRequest::new(Tick::zero(), 0)),
        ));
        match response {
            Response::Chunk(chunk) => assert_eq!(chunk.entries.len(), 2),
            other => panic!("unexpected response {other:?}"),
        }

        let released = handler.handle(&Request::with_token(
            token,
            RequestBody::Release(inventory.snapshot_id),
        ));
        assert!(matches!(released, Response::Released));
    }
}
