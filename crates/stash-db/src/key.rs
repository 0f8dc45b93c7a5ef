//! Keys, key ranges, queries and key paths.
//!
//! Every record in a collection is addressed by a [`Key`]. Keys are totally
//! ordered: integers sort before text, text before bytes, bytes before
//! arrays, and arrays compare element-wise. Range scans, cursors and index
//! orderings all follow this order.

use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest integral `f64` that converts to an `i64` without loss.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// A primary or index key.
///
/// The derived ordering is the storage ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Key {
    /// Integer key (also used for generated keys).
    Int(i64),
    /// Text key.
    Text(String),
    /// Binary key.
    Bytes(Vec<u8>),
    /// Compound key, compared element-wise.
    Array(Vec<Key>),
}

impl Key {
    /// Derive a key from a JSON value.
    ///
    /// Returns `None` for values that cannot act as keys: objects, booleans,
    /// `null`, non-integral numbers, and arrays containing any of those.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?)).map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Self::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Self::Array),
            _ => None,
        }
    }

    /// Render the key as a JSON value.
    ///
    /// Byte keys render as arrays of numbers.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Text(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_value).collect()),
        }
    }

    /// The integer payload, if this is an integer key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn integral(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER).then_some(f as i64)
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            },
        }
    }
}

// ---------------------------------------------------------------------------
// KeyRange
// ---------------------------------------------------------------------------

/// A contiguous range of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    /// The range containing exactly `key`.
    #[must_use]
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// All keys above `key` (excluding it when `open`).
    #[must_use]
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    /// All keys below `key` (excluding it when `open`).
    #[must_use]
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    /// Keys between `lower` and `upper`.
    #[must_use]
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: bound(lower.into(), lower_open),
            upper: bound(upper.into(), upper_open),
        }
    }

    /// The range containing every key.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Lower bound of the range.
    #[must_use]
    pub fn lower(&self) -> Bound<&Key> {
        self.lower.as_ref()
    }

    /// Upper bound of the range.
    #[must_use]
    pub fn upper(&self) -> Bound<&Key> {
        self.upper.as_ref()
    }

    /// Both bounds, in the shape `BTreeMap::range` accepts.
    #[must_use]
    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower(), self.upper())
    }

    /// Whether `key` falls inside the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Whether no key can fall inside the range.
    ///
    /// `BTreeMap::range` panics on such ranges, so scans check this first.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
            _ => false,
        }
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// What a read, count, delete or cursor operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Query {
    /// Every record.
    #[default]
    All,
    /// The record with exactly this key.
    Key(Key),
    /// Every record whose key falls in the range.
    Range(KeyRange),
}

impl Query {
    /// Shorthand for [`Query::All`].
    #[must_use]
    pub fn all() -> Self {
        Self::All
    }

    /// The query as a key range.
    #[must_use]
    pub fn to_range(&self) -> KeyRange {
        match self {
            Self::All => KeyRange::unbounded(),
            Self::Key(key) => KeyRange::only(key.clone()),
            Self::Range(range) => range.clone(),
        }
    }

    /// Whether `key` is selected by the query.
    #[must_use]
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Self::All => true,
            Self::Key(k) => k == key,
            Self::Range(range) => range.contains(key),
        }
    }
}

impl From<Key> for Query {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}

impl From<KeyRange> for Query {
    fn from(range: KeyRange) -> Self {
        Self::Range(range)
    }
}

impl From<std::ops::RangeFull> for Query {
    fn from(_: std::ops::RangeFull) -> Self {
        Self::All
    }
}

impl From<i64> for Query {
    fn from(n: i64) -> Self {
        Self::Key(Key::Int(n))
    }
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Self::Key(Key::from(s))
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Self::Key(Key::Text(s))
    }
}

// ---------------------------------------------------------------------------
// KeyPath
// ---------------------------------------------------------------------------

/// Where inside a value its key lives.
///
/// A path is a dotted property chain (`"profile.email"`); the empty path
/// selects the value itself. A compound path yields an array key built from
/// each member path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// A single dotted property path.
    Path(String),
    /// Several paths combined into an array key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Extract the key this path selects from `value`.
    #[must_use]
    pub fn extract(&self, value: &Value) -> Option<Key> {
        match self {
            Self::Path(path) => Key::from_value(lookup(value, path)?),
            Self::Compound(paths) => paths
                .iter()
                .map(|path| lookup(value, path).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Write `key` into `value` at this path, creating intermediate objects.
    ///
    /// Returns `false` when the path cannot hold a key: compound and empty
    /// paths, or a parent that is not an object.
    pub fn inject(&self, value: &mut Value, key: &Key) -> bool {
        let Self::Path(path) = self else {
            return false;
        };
        if path.is_empty() {
            return false;
        }
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path.as_str()),
        };

        let mut current = value;
        for segment in parents.into_iter().flat_map(|p| p.split('.')) {
            let Some(object) = current.as_object_mut() else {
                return false;
            };
            current = object
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()));
        }
        match current.as_object_mut() {
            Some(object) => {
                object.insert(leaf.to_owned(), key.to_value());
                true
            },
            None => false,
        }
    }

    /// Whether this is a compound path.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self, Self::Compound(_))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self::Path(path.to_owned())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Cursor iteration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending, every record.
    #[default]
    Next,
    /// Ascending, first record per distinct key.
    NextUnique,
    /// Descending, every record.
    Prev,
    /// Descending, first record per distinct key.
    PrevUnique,
}

impl Direction {
    /// Whether the cursor walks keys in descending order.
    #[must_use]
    pub fn is_reverse(self) -> bool {
        matches!(self, Self::Prev | Self::PrevUnique)
    }

    /// Whether duplicate keys are skipped.
    #[must_use]
    pub fn is_unique(self) -> bool {
        matches!(self, Self::NextUnique | Self::PrevUnique)
    }
}
