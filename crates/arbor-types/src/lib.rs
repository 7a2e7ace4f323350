//! # Arbor types
//!
//! Core identifier and error types shared across the arbor workspace:
//! - [`ObjectId`] - 128-bit object identifier encoding the native cell tag
//!   and an object kind discriminator
//! - [`CellTag`] - identifier of a master cell inside a multicell cluster
//! - [`ObjectKind`] - kind discriminator embedded in every object id
//! - [`ArborError`] / [`ErrorCode`] - the structured error surface carrying a
//!   stable numeric code, a message, attribute payloads, and an optional
//!   chained inner error
//!
//! ## Serialization
//!
//! Ids serialize as their canonical dashed-hex form (`hi1-hi0-lo1-lo0`) so
//! they roundtrip through JSON, config files, and archive rows. Durations in
//! dependent config types use the helpers at the bottom of this crate and
//! accept both humantime strings and millisecond integers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A commit/prepare timestamp issued by the timestamp provider.
pub type Timestamp = u64;

/// The null timestamp; ordered before every real timestamp.
pub const NULL_TIMESTAMP: Timestamp = 0;

/// Identifier of a master cell. Cell tag `0` is reserved and never assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CellTag(pub u16);

impl fmt::Display for CellTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object kind discriminator embedded in the id bits.
///
/// The discriminant values are part of the persisted format; append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ObjectKind {
    Null = 0,
    MapNode = 1,
    ListNode = 2,
    StringNode = 3,
    Int64Node = 4,
    Uint64Node = 5,
    DoubleNode = 6,
    BooleanNode = 7,
    EntityNode = 8,
    DocumentNode = 9,
    LinkNode = 10,
    TableNode = 11,
    FileNode = 12,
    JournalNode = 13,
    Transaction = 100,
    NestedTransaction = 101,
    UploadTransaction = 102,
    UploadNestedTransaction = 103,
    ExternalizedTransaction = 104,
    ExternalizedNestedTransaction = 105,
    Lock = 200,
    Operation = 300,
    Job = 301,
}

impl ObjectKind {
    fn from_discriminant(value: u16) -> Option<Self> {
        use ObjectKind::*;
        Some(match value {
            0 => Null,
            1 => MapNode,
            2 => ListNode,
            3 => StringNode,
            4 => Int64Node,
            5 => Uint64Node,
            6 => DoubleNode,
            7 => BooleanNode,
            8 => EntityNode,
            9 => DocumentNode,
            10 => LinkNode,
            11 => TableNode,
            12 => FileNode,
            13 => JournalNode,
            100 => Transaction,
            101 => NestedTransaction,
            102 => UploadTransaction,
            103 => UploadNestedTransaction,
            104 => ExternalizedTransaction,
            105 => ExternalizedNestedTransaction,
            200 => Lock,
            300 => Operation,
            301 => Job,
            _ => return None,
        })
    }

    /// Whether ids of this kind denote transactions (of any flavor).
    pub fn is_transaction(self) -> bool {
        use ObjectKind::*;
        matches!(
            self,
            Transaction
                | NestedTransaction
                | UploadTransaction
                | UploadNestedTransaction
                | ExternalizedTransaction
                | ExternalizedNestedTransaction
        )
    }

    /// Whether ids of this kind denote upload transactions.
    pub fn is_upload_transaction(self) -> bool {
        matches!(
            self,
            ObjectKind::UploadTransaction | ObjectKind::UploadNestedTransaction
        )
    }

    /// Whether ids of this kind denote externalized transactions.
    pub fn is_externalized_transaction(self) -> bool {
        matches!(
            self,
            ObjectKind::ExternalizedTransaction | ObjectKind::ExternalizedNestedTransaction
        )
    }

    /// Whether ids of this kind denote tree nodes.
    pub fn is_node(self) -> bool {
        use ObjectKind::*;
        matches!(
            self,
            MapNode
                | ListNode
                | StringNode
                | Int64Node
                | Uint64Node
                | DoubleNode
                | BooleanNode
                | EntityNode
                | DocumentNode
                | LinkNode
                | TableNode
                | FileNode
                | JournalNode
        )
    }
}

/// A 128-bit object identifier.
///
/// Layout of the high word: bits 48..64 carry the native cell tag, bits
/// 32..48 the [`ObjectKind`] discriminant, bits 0..32 a per-cell sequence
/// counter. The low word is entropy, fixed at generation time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

pub type TransactionId = ObjectId;
pub type NodeId = ObjectId;
pub type LockId = ObjectId;
pub type OperationId = ObjectId;

impl ObjectId {
    pub const NULL: ObjectId = ObjectId { hi: 0, lo: 0 };

    pub fn new(kind: ObjectKind, cell_tag: CellTag, counter: u32, entropy: u64) -> Self {
        let hi = ((cell_tag.0 as u64) << 48) | ((kind as u16 as u64) << 32) | (counter as u64);
        ObjectId { hi, lo: entropy }
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn cell_tag(self) -> CellTag {
        CellTag((self.hi >> 48) as u16)
    }

    pub fn kind(self) -> ObjectKind {
        ObjectKind::from_discriminant((self.hi >> 32) as u16).unwrap_or(ObjectKind::Null)
    }

    pub fn counter(self) -> u32 {
        self.hi as u32
    }

    /// Rewrites the kind discriminator, preserving cell tag, counter and
    /// entropy.
    pub fn with_kind(self, kind: ObjectKind) -> Self {
        let hi = (self.hi & !(0xffff_u64 << 32)) | ((kind as u16 as u64) << 32);
        ObjectId { hi, lo: self.lo }
    }

    /// Rewrites the cell tag bits, preserving everything else.
    pub fn with_cell_tag(self, cell_tag: CellTag) -> Self {
        let hi = (self.hi & !(0xffff_u64 << 48)) | ((cell_tag.0 as u64) << 48);
        ObjectId { hi, lo: self.lo }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x}-{:x}-{:x}",
            self.hi >> 32,
            self.hi & 0xffff_ffff,
            self.lo >> 32,
            self.lo & 0xffff_ffff
        )
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error produced by [`ObjectId::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed object id: {0}")]
pub struct ParseIdError(String);

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(ParseIdError(s.to_string()));
        }
        let mut words = [0u64; 4];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 8 {
                return Err(ParseIdError(s.to_string()));
            }
            words[i] = u64::from_str_radix(part, 16).map_err(|_| ParseIdError(s.to_string()))?;
        }
        Ok(ObjectId {
            hi: (words[0] << 32) | words[1],
            lo: (words[2] << 32) | words[3],
        })
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derives the externalized mirror id for a transaction: the kind moves to
/// its externalized flavor and the cell bits are stamped with the
/// coordinating cell. Counter and entropy are preserved so distinct source
/// transactions stay distinct after externalization.
pub fn externalize_transaction_id(id: TransactionId, coordinating_cell: CellTag) -> TransactionId {
    let kind = match id.kind() {
        ObjectKind::Transaction | ObjectKind::ExternalizedTransaction => {
            ObjectKind::ExternalizedTransaction
        }
        ObjectKind::NestedTransaction | ObjectKind::ExternalizedNestedTransaction => {
            ObjectKind::ExternalizedNestedTransaction
        }
        other => other,
    };
    id.with_kind(kind).with_cell_tag(coordinating_cell)
}

/// Sequential id generator for one cell.
///
/// The counter survives snapshots; entropy is redrawn per id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdGenerator {
    cell_tag: CellTag,
    counter: u32,
}

impl IdGenerator {
    pub fn new(cell_tag: CellTag) -> Self {
        IdGenerator {
            cell_tag,
            counter: 0,
        }
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub fn generate(&mut self, kind: ObjectKind) -> ObjectId {
        self.counter = self.counter.wrapping_add(1);
        ObjectId::new(kind, self.cell_tag, self.counter, rand::random::<u64>())
    }
}

/// Stable numeric error codes; part of the public error surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ErrorCode {
    Generic = 1,
    Cancelled = 105,
    ResolveError = 500,
    AlreadyExists = 501,
    MaxSizeViolated = 502,
    AuthorizationError = 901,
    PrerequisiteCheckFailed = 1000,
    ConcurrentTransactionLockConflict = 402,
    NoSuchTransaction = 11000,
    InvalidTransactionState = 11001,
    TransactionDepthLimitReached = 11002,
    ForeignParentTransaction = 11003,
    ForeignPrerequisiteTransaction = 11004,
    UploadTransactionCannotHaveNested = 11005,
    ArchiveError = 12000,
    ArchiveValueWeightViolated = 12001,
    ArchiveQueueOverflow = 12002,
}

/// The structured error used across the public surface: a stable code, a
/// message, attribute payloads (paths, ids, offending keys), and an optional
/// chained inner error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ArborError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ArborError>>,
}

impl ArborError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ArborError {
            code,
            message: message.into(),
            attributes: BTreeMap::new(),
            inner: None,
        }
    }

    /// Attaches an attribute; values that fail to serialize are recorded as
    /// their `Display` rendering.
    pub fn with_attr(mut self, key: &str, value: impl Serialize + fmt::Display) -> Self {
        let json = serde_json::to_value(&value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        self.attributes.insert(key.to_string(), json);
        self
    }

    pub fn with_inner(mut self, inner: ArborError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

pub type ArborResult<T> = Result<T, ArborError>;

pub fn resolve_error(path: &str, message: impl Into<String>) -> ArborError {
    ArborError::new(ErrorCode::ResolveError, message).with_attr("path", path)
}

pub fn already_exists(path: &str) -> ArborError {
    ArborError::new(ErrorCode::AlreadyExists, format!("node {path} already exists"))
        .with_attr("path", path)
}

pub fn authorization_error(
    subject: &str,
    permission: &str,
    path: &str,
) -> ArborError {
    ArborError::new(
        ErrorCode::AuthorizationError,
        format!("access denied for user {subject:?}: {permission} permission is not granted"),
    )
    .with_attr("subject", subject)
    .with_attr("permission", permission)
    .with_attr("path", path)
}

pub fn lock_conflict(
    node_id: NodeId,
    holder: TransactionId,
    holder_mode: &str,
) -> ArborError {
    ArborError::new(
        ErrorCode::ConcurrentTransactionLockConflict,
        format!("cannot take lock since {holder_mode} lock is taken by concurrent transaction {holder}"),
    )
    .with_attr("node_id", node_id)
    .with_attr("conflicting_transaction_id", holder)
    .with_attr("conflicting_lock_mode", holder_mode)
}

pub fn no_such_transaction(id: TransactionId) -> ArborError {
    ArborError::new(
        ErrorCode::NoSuchTransaction,
        format!("no such transaction {id}"),
    )
    .with_attr("transaction_id", id)
}

pub fn invalid_transaction_state(id: TransactionId, state: &str) -> ArborError {
    ArborError::new(
        ErrorCode::InvalidTransactionState,
        format!("transaction {id} is in {state:?} state"),
    )
    .with_attr("transaction_id", id)
    .with_attr("state", state)
}

pub fn prerequisite_check_failed(id: TransactionId, reason: &str) -> ArborError {
    ArborError::new(
        ErrorCode::PrerequisiteCheckFailed,
        format!("prerequisite check failed: transaction {id} {reason}"),
    )
    .with_attr("prerequisite_transaction_id", id)
}

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Same helpers in `#[serde(with = ...)]` module form.
pub mod duration_millis {
    pub use super::deserialize_duration as deserialize;
    pub use super::serialize_duration as serialize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_encoding_roundtrip() {
        let id = ObjectId::new(ObjectKind::MapNode, CellTag(17), 42, 0xdead_beef_cafe_f00d);
        assert_eq!(id.cell_tag(), CellTag(17));
        assert_eq!(id.kind(), ObjectKind::MapNode);
        assert_eq!(id.counter(), 42);
        assert_eq!(id.lo, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_id_display_parse_roundtrip() {
        let id = ObjectId::new(ObjectKind::Transaction, CellTag(3), 7, 0x0123_4567_89ab_cdef);
        let text = id.to_string();
        let parsed: ObjectId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        assert!("".parse::<ObjectId>().is_err());
        assert!("1-2-3".parse::<ObjectId>().is_err());
        assert!("1-2-3-zz".parse::<ObjectId>().is_err());
        assert!("1-2-3-4-5".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_id_json_roundtrip() {
        let id = ObjectId::new(ObjectKind::Operation, CellTag(1), 1, 99);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_externalize_transaction_id() {
        let id = ObjectId::new(ObjectKind::Transaction, CellTag(1), 5, 123);
        let ext = externalize_transaction_id(id, CellTag(9));
        assert_eq!(ext.kind(), ObjectKind::ExternalizedTransaction);
        assert_eq!(ext.cell_tag(), CellTag(9));
        assert_eq!(ext.counter(), id.counter());
        assert_eq!(ext.lo, id.lo);

        let nested = ObjectId::new(ObjectKind::NestedTransaction, CellTag(1), 6, 124);
        assert_eq!(
            externalize_transaction_id(nested, CellTag(9)).kind(),
            ObjectKind::ExternalizedNestedTransaction
        );
    }

    #[test]
    fn test_externalize_is_idempotent_on_kind() {
        let id = ObjectId::new(ObjectKind::Transaction, CellTag(1), 5, 123);
        let once = externalize_transaction_id(id, CellTag(9));
        let twice = externalize_transaction_id(once, CellTag(9));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_generator_embeds_cell_and_kind() {
        let mut generator = IdGenerator::new(CellTag(5));
        let a = generator.generate(ObjectKind::Transaction);
        let b = generator.generate(ObjectKind::Transaction);
        assert_ne!(a, b);
        assert_eq!(a.cell_tag(), CellTag(5));
        assert_eq!(a.kind(), ObjectKind::Transaction);
        assert_eq!(b.counter(), a.counter() + 1);
    }

    #[test]
    fn test_error_attributes_and_inner() {
        let inner = no_such_transaction(ObjectId::new(
            ObjectKind::Transaction,
            CellTag(2),
            1,
            0,
        ));
        let err = ArborError::new(ErrorCode::ArchiveError, "failed to archive operations")
            .with_attr("pending_count", 12u32)
            .with_inner(inner.clone());
        assert_eq!(err.code, ErrorCode::ArchiveError);
        assert_eq!(
            err.attribute("pending_count"),
            Some(&serde_json::json!(12))
        );
        assert_eq!(err.inner.as_deref(), Some(&inner));
    }

    #[test]
    fn test_error_json_roundtrip() {
        let err = lock_conflict(
            ObjectId::new(ObjectKind::MapNode, CellTag(1), 4, 9),
            ObjectId::new(ObjectKind::Transaction, CellTag(1), 5, 10),
            "exclusive",
        );
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ArborError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ObjectKind::UploadNestedTransaction.is_transaction());
        assert!(ObjectKind::UploadNestedTransaction.is_upload_transaction());
        assert!(!ObjectKind::Transaction.is_upload_transaction());
        assert!(ObjectKind::ExternalizedTransaction.is_externalized_transaction());
        assert!(ObjectKind::DocumentNode.is_node());
        assert!(!ObjectKind::Lock.is_node());
    }
}
