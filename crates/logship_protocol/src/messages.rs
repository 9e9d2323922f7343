//! Request and response messages exchanged between a replica and a source.

use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::FilterConfig;
use logship_core::{
    CollectionId, CollectionInfo, Document, ErrorCode, IndexDefinition, LogEntry, LoggerState,
    ServerId, Tick,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a consistent snapshot held open by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    /// Creates a snapshot id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials exchanged for a session token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// User name.
    pub username: String,
    /// Clear-text password.
    pub password: String,
}

impl LoginRequest {
    /// Creates a login request.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Answer to a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Session token to send with every following request.
    pub token: String,
    /// Identity of the source.
    pub server_id: ServerId,
    /// Position of the source's log at login time.
    pub state: LoggerState,
}

/// Asks the source to capture a snapshot of the in-scope collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRequest {
    /// Which collections to capture.
    pub filter: FilterConfig,
}

impl InventoryRequest {
    /// Creates an inventory request.
    pub fn new(filter: FilterConfig) -> Self {
        Self { filter }
    }
}

/// One captured collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInventory {
    /// Identity and properties.
    pub info: CollectionInfo,
    /// Every index including the primary one.
    pub indexes: Vec<IndexDefinition>,
    /// Number of documents in the snapshot.
    pub count: u64,
}

/// The captured snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    /// Handle for dump and release requests.
    pub snapshot_id: SnapshotId,
    /// Every log entry up to this tick is reflected in the snapshot.
    pub last_log_tick: Tick,
    /// Captured collections in id order.
    pub collections: Vec<CollectionInventory>,
}

/// Pages documents out of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRequest {
    /// Snapshot to read from.
    pub snapshot_id: SnapshotId,
    /// Collection to page through.
    pub collection: CollectionId,
    /// Number of documents already transferred.
    pub offset: u64,
    /// Maximum number of documents to return.
    pub batch_size: u64,
}

impl DumpRequest {
    /// Creates a dump request.
    pub fn new(snapshot_id: SnapshotId, collection: CollectionId, offset: u64, batch_size: u64) -> Self {
        Self {
            snapshot_id,
            collection,
            offset,
            batch_size,
        }
    }
}

/// One page of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpResponse {
    /// Documents in insertion order.
    pub documents: Vec<Document>,
    /// Offset to ask for next.
    pub next_offset: u64,
    /// Whether more documents follow.
    pub has_more: bool,
}

/// Asks for log entries after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRequest {
    /// Only entries with a greater tick are returned.
    pub from_tick: Tick,
    /// Upper bound on the encoded size of the returned entries, in bytes.
    pub chunk_size: u64,
}

impl FollowRequest {
    /// Creates a follow request.
    pub fn new(from_tick: Tick, chunk_size: u64) -> Self {
        Self {
            from_tick,
            chunk_size,
        }
    }
}

/// A bounded batch of log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Entries in tick order, all greater than the requested tick.
    pub entries: Vec<LogEntry>,
    /// Tick of the last entry, `None` if the chunk is empty.
    pub last_included_tick: Option<Tick>,
    /// Highest tick known to the source.
    pub available_tick: Tick,
    /// Whether the source holds entries beyond this chunk.
    pub check_more: bool,
    /// False if entries right after the requested tick were already pruned.
    pub from_present: bool,
}

impl Chunk {
    /// Creates a chunk, deriving `last_included_tick` and `check_more`.
    pub fn new(entries: Vec<LogEntry>, available_tick: Tick, from_present: bool) -> Self {
        let last_included_tick = entries.last().map(|e| e.tick.clone());
        let check_more = last_included_tick
            .as_ref()
            .is_some_and(|last| last < &available_tick);
        Self {
            entries,
            last_included_tick,
            available_tick,
            check_more,
            from_present,
        }
    }

    /// Returns true if the chunk carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that the chunk is a well-formed answer to a follow request
    /// starting after `from_tick`.
    pub fn validate(&self, from_tick: &Tick) -> ProtocolResult<()> {
        let mut previous = from_tick;
        for entry in &self.entries {
            if &entry.tick <= previous {
                return Err(ProtocolError::malformed(format!(
                    "entry tick {} does not follow {}",
                    entry.tick, previous
                )));
            }
            if entry.kind().is_marker() && entry.transaction_id.is_none() {
                return Err(ProtocolError::malformed(format!(
                    "{} marker at tick {} without transaction id",
                    entry.kind(),
                    entry.tick
                )));
            }
            if !entry.kind().is_marker() && entry.collection.is_none() {
                return Err(ProtocolError::malformed(format!(
                    "{} entry at tick {} without collection",
                    entry.kind(),
                    entry.tick
                )));
            }
            previous = &entry.tick;
        }
        if self.last_included_tick.as_ref() != self.entries.last().map(|e| &e.tick) {
            return Err(ProtocolError::malformed("last included tick does not match entries"));
        }
        if &self.available_tick < previous {
            return Err(ProtocolError::malformed(format!(
                "available tick {} behind tick {}",
                self.available_tick, previous
            )));
        }
        if self.check_more && self.entries.is_empty() {
            return Err(ProtocolError::malformed("empty chunk announces more entries"));
        }
        Ok(())
    }
}

/// Error answer carrying a numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The operation a request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestBody {
    /// Exchange credentials for a token.
    Login(LoginRequest),
    /// Report the source's log position.
    LoggerState,
    /// Capture a snapshot.
    Inventory(InventoryRequest),
    /// Page documents out of a snapshot.
    Dump(DumpRequest),
    /// Free a snapshot.
    Release(SnapshotId),
    /// Fetch log entries.
    Follow(FollowRequest),
}

impl RequestBody {
    /// Operation name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::LoggerState => "logger-state",
            Self::Inventory(_) => "inventory",
            Self::Dump(_) => "dump",
            Self::Release(_) => "release",
            Self::Follow(_) => "follow",
        }
    }

    /// Numeric message type.
    #[must_use]
    pub const fn type_code(&self) -> u8 {
        match self {
            Self::Login(_) => 1,
            Self::LoggerState => 2,
            Self::Inventory(_) => 3,
            Self::Dump(_) => 4,
            Self::Release(_) => 5,
            Self::Follow(_) => 6,
        }
    }
}

/// A request with its session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Session token from a previous login; absent for login itself.
    pub token: Option<String>,
    /// What is asked for.
    pub body: RequestBody,
}

impl Request {
    /// Creates a request without a token.
    pub fn anonymous(body: RequestBody) -> Self {
        Self { token: None, body }
    }

    /// Creates a request carrying `token`.
    pub fn with_token(token: impl Into<String>, body: RequestBody) -> Self {
        Self {
            token: Some(token.into()),
            body,
        }
    }
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Response {
    /// Answer to a login.
    Login(LoginResponse),
    /// Answer to a logger-state request.
    LoggerState(LoggerState),
    /// Answer to an inventory request.
    Inventory(InventoryResponse),
    /// Answer to a dump request.
    Dump(DumpResponse),
    /// Answer to a release request.
    Released,
    /// Answer to a follow request.
    Chunk(Chunk),
    /// The request failed.
    Error(ErrorResponse),
}

impl Response {
    /// Response name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::LoggerState(_) => "logger-state",
            Self::Inventory(_) => "inventory",
            Self::Dump(_) => "dump",
            Self::Released => "released",
            Self::Chunk(_) => "chunk",
            Self::Error(_) => "error",
        }
    }

    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::{CollectionRef, LogOperation, TransactionId};
    use serde_json::Map;

    fn insert(tick: u64) -> LogEntry {
        LogEntry {
            tick: Tick::from(tick),
            collection: Some(CollectionRef::new(CollectionId::new(1), "c")),
            transaction_id: None,
            operation: LogOperation::Insert {
                document: Document::new(format!("k{tick}"), Tick::from(tick), Map::new()),
            },
        }
    }

    fn marker(tick: u64, operation: LogOperation) -> LogEntry {
        LogEntry {
            tick: Tick::from(tick),
            collection: None,
            transaction_id: Some(TransactionId::new(7)),
            operation,
        }
    }

    #[test]
    fn chunk_derives_bounds() {
        let chunk = Chunk::new(vec![insert(3), insert(4)], Tick::from(9), true);
        assert_eq!(chunk.last_included_tick, Some(Tick::from(4)));
        assert!(chunk.check_more);
        assert!(chunk.validate(&Tick::from(2)).is_ok());

        let caught_up = Chunk::new(vec![], Tick::from(4), true);
        assert!(!caught_up.check_more);
        assert!(caught_up.is_empty());
        assert!(caught_up.validate(&Tick::from(4)).is_ok());
    }

    #[test]
    fn rejects_out_of_order_entries() {
        let chunk = Chunk::new(vec![insert(5), insert(4)], Tick::from(5), true);
        assert!(matches!(chunk.validate(&Tick::zero()), Err(ProtocolError::Malformed(_))));

        let chunk = Chunk::new(vec![insert(3)], Tick::from(3), true);
        assert!(chunk.validate(&Tick::from(3)).is_err());
    }

    #[test]
    fn rejects_inconsistent_metadata() {
        let mut chunk = Chunk::new(vec![insert(3)], Tick::from(3), true);
        chunk.available_tick = Tick::from(2);
        assert!(chunk.validate(&Tick::zero()).is_err());

        let mut chunk = Chunk::new(vec![insert(3)], Tick::from(3), true);
        chunk.last_included_tick = Some(Tick::from(8));
        assert!(chunk.validate(&Tick::zero()).is_err());

        let mut chunk = Chunk::new(vec![], Tick::from(3), true);
        chunk.check_more = true;
        assert!(chunk.validate(&Tick::from(3)).is_err());
    }

    #[test]
    fn rejects_markers_without_transaction() {
        let mut begin = marker(2, LogOperation::TransactionBegin);
        assert!(Chunk::new(vec![begin.clone()], Tick::from(2), true)
            .validate(&Tick::zero())
            .is_ok());
        begin.transaction_id = None;
        assert!(Chunk::new(vec![begin], Tick::from(2), true)
            .validate(&Tick::zero())
            .is_err());

        let mut orphan = insert(2);
        orphan.collection = None;
        assert!(Chunk::new(vec![orphan], Tick::from(2), true)
            .validate(&Tick::zero())
            .is_err());
    }

    #[test]
    fn login_debug_hides_password() {
        let login = LoginRequest::new("root", "secret");
        let rendered = format!("{login:?}");
        assert!(rendered.contains("root"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(RequestBody::LoggerState.type_code(), 2);
        assert_eq!(RequestBody::Release(SnapshotId::new("s")).name(), "release");
        assert_eq!(Response::error(ErrorCode::UNAUTHORIZED, "no").name(), "error");
    }
}
