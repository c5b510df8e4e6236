//! Memory record data structures.
//!
//! A [`MemoryRecord`] is the unit every [`Store`](crate::storage::traits::Store)
//! holds: either a structured [`MemoryItem`] or an embedded [`MemoryVector`].
//! Both carry a stable `id` that identifies the same logical record across
//! every backend that holds a copy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key under which the EDRR phase tag is stored.
pub const EDRR_PHASE_KEY: &str = "edrr_phase";

/// Current wall-clock time as epoch millis.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Kind of memory held by an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ShortTerm,
    Working,
    LongTerm,
    Episodic,
    Semantic,
    Context,
    Conversation,
    TaskHistory,
    ErrorLog,
    Knowledge,
    Documentation,
    Code,
    Requirement,
    Solution,
    Relationship,
    TeamState,
    /// Caller-defined tag not covered above
    Other(String),
}

impl MemoryType {
    /// Stable string form (matches the serialized tag).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ShortTerm => "short_term",
            Self::Working => "working",
            Self::LongTerm => "long_term",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Context => "context",
            Self::Conversation => "conversation",
            Self::TaskHistory => "task_history",
            Self::ErrorLog => "error_log",
            Self::Knowledge => "knowledge",
            Self::Documentation => "documentation",
            Self::Code => "code",
            Self::Requirement => "requirement",
            Self::Solution => "solution",
            Self::Relationship => "relationship",
            Self::TeamState => "team_state",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the Expand/Differentiate/Refine/Retrospect cycle an item was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdrrPhase {
    Expand,
    Differentiate,
    Refine,
    Retrospect,
}

impl EdrrPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expand => "EXPAND",
            Self::Differentiate => "DIFFERENTIATE",
            Self::Refine => "REFINE",
            Self::Retrospect => "RETROSPECT",
        }
    }
}

impl fmt::Display for EdrrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured memory item.
///
/// # Example
///
/// ```
/// use memory_sync::{MemoryItem, MemoryType};
/// use serde_json::json;
///
/// let item = MemoryItem::new("", json!({"task": "refactor"}), MemoryType::Context)
///     .with_metadata("owner", json!("planner"));
///
/// assert!(item.id.is_empty()); // assigned on first write
/// assert_eq!(item.metadata["owner"], "planner");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Stable identifier, assigned on first write when empty
    pub id: String,
    /// The actual payload
    pub content: Value,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Last update timestamp (epoch millis), used for newest-wins conflict resolution
    #[serde(default)]
    pub updated_at: i64,
}

impl MemoryItem {
    pub fn new(id: impl Into<String>, content: Value, memory_type: MemoryType) -> Self {
        Self {
            id: id.into(),
            content,
            memory_type,
            metadata: Map::new(),
            updated_at: now_millis(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// EDRR phase tag, if the item carries a recognised one.
    #[must_use]
    pub fn edrr_phase(&self) -> Option<EdrrPhase> {
        self.metadata
            .get(EDRR_PHASE_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Whether two versions of the same item disagree on content or metadata.
    #[must_use]
    pub fn conflicts_with(&self, other: &MemoryItem) -> bool {
        self.content != other.content || self.metadata != other.metadata
    }

    /// Flattened text used for substring matching.
    pub(crate) fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// An embedded memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryVector {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryVector {
    pub fn new(id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Number of embedding components.
    #[must_use]
    #[inline]
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// Discriminant of a [`MemoryRecord`], used for store routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Item,
    Vector,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item => write!(f, "item"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

/// Value type held by every store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryRecord {
    Item(MemoryItem),
    Vector(MemoryVector),
}

impl MemoryRecord {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Item(item) => &item.id,
            Self::Vector(vector) => &vector.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            Self::Item(item) => item.id = id,
            Self::Vector(vector) => vector.id = id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Item(_) => RecordKind::Item,
            Self::Vector(_) => RecordKind::Vector,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        match self {
            Self::Item(item) => &item.metadata,
            Self::Vector(vector) => &vector.metadata,
        }
    }

    #[must_use]
    pub fn as_item(&self) -> Option<&MemoryItem> {
        match self {
            Self::Item(item) => Some(item),
            Self::Vector(_) => None,
        }
    }

    #[must_use]
    pub fn as_vector(&self) -> Option<&MemoryVector> {
        match self {
            Self::Vector(vector) => Some(vector),
            Self::Item(_) => None,
        }
    }

    #[must_use]
    pub fn into_item(self) -> Option<MemoryItem> {
        match self {
            Self::Item(item) => Some(item),
            Self::Vector(_) => None,
        }
    }
}

impl From<MemoryItem> for MemoryRecord {
    fn from(item: MemoryItem) -> Self {
        Self::Item(item)
    }
}

impl From<MemoryVector> for MemoryRecord {
    fn from(vector: MemoryVector) -> Self {
        Self::Vector(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_item_defaults() {
        let item = MemoryItem::new("item-1", json!("hello"), MemoryType::Knowledge);

        assert_eq!(item.id, "item-1");
        assert_eq!(item.memory_type, MemoryType::Knowledge);
        assert!(item.metadata.is_empty());
        assert!(item.updated_at > 0);
    }

    #[test]
    fn test_edrr_phase_roundtrip_through_metadata() {
        let item = MemoryItem::new("x", json!({}), MemoryType::Solution)
            .with_metadata(EDRR_PHASE_KEY, json!(EdrrPhase::Refine.as_str()));

        assert_eq!(item.edrr_phase(), Some(EdrrPhase::Refine));
    }

    #[test]
    fn test_edrr_phase_ignores_unknown_tag() {
        let item = MemoryItem::new("x", json!({}), MemoryType::Solution)
            .with_metadata(EDRR_PHASE_KEY, json!("SOMETHING_ELSE"));

        assert_eq!(item.edrr_phase(), None);
    }

    #[test]
    fn test_conflict_detection() {
        let a = MemoryItem::new("x", json!({"v": 1}), MemoryType::Code);
        let mut b = a.clone();
        assert!(!a.conflicts_with(&b));

        b.content = json!({"v": 2});
        assert!(a.conflicts_with(&b));

        let c = a.clone().with_metadata("tag", json!("new"));
        assert!(a.conflicts_with(&c));
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let record = MemoryRecord::from(MemoryVector::new("v1", "text", vec![0.1, 0.2]));
        let json_str = serde_json::to_string(&record).unwrap();

        assert!(json_str.contains("\"kind\":\"vector\""));

        let back: MemoryRecord = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.kind(), RecordKind::Vector);
    }

    #[test]
    fn test_other_memory_type_keeps_tag() {
        let ty = MemoryType::Other("peer_review".into());
        assert_eq!(ty.as_str(), "peer_review");
        assert_eq!(ty.to_string(), "peer_review");
    }

    #[test]
    fn test_set_id_applies_to_both_kinds() {
        let mut item = MemoryRecord::from(MemoryItem::new("", json!(1), MemoryType::Working));
        item.set_id("a".into());
        assert_eq!(item.id(), "a");

        let mut vector = MemoryRecord::from(MemoryVector::new("", "t", vec![]));
        vector.set_id("b".into());
        assert_eq!(vector.id(), "b");
    }
}
