use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, DefaultHasher, Hash, Hasher, RandomState};

/// A value that can cross a perch channel.
///
/// This is the complete set of shapes the standard codec understands. Custom
/// classes and enums carry the discriminant assigned by the codec's schema;
/// proxy instances carry the identifier under which the object is registered
/// with an instance manager.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Any integer. Encoded as int32 when it fits, int64 otherwise.
    Int(i64),
    Float(f64),
    String(String),
    /// Opaque byte buffer.
    Bytes(Vec<u8>),
    Int32List(Vec<i32>),
    Int64List(Vec<i64>),
    Float32List(Vec<f32>),
    Float64List(Vec<f64>),
    List(Vec<Value>),
    Map(ValueMap),
    /// Enum variant: schema discriminant and ordinal.
    Enum { type_id: u8, ordinal: i64 },
    /// Custom class: schema discriminant and fields in declaration order.
    Custom { type_id: u8, fields: Vec<Value> },
    /// Reference to a proxy object by its instance-manager identifier.
    Instance(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<i64> {
        match self {
            Value::Instance(id) => Some(*id),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Int32List(_) => "int32 list",
            Value::Int64List(_) => "int64 list",
            Value::Float32List(_) => "float32 list",
            Value::Float64List(_) => "float64 list",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Enum { .. } => "enum",
            Value::Custom { .. } => "class",
            Value::Instance(_) => "instance",
        }
    }
}

/// Equality is structural. Floats compare by bit pattern so that every
/// value, NaN included, equals its own round trip. Maps compare as sets of
/// key/value pairs.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Int32List(a), Int32List(b)) => a == b,
            (Int64List(a), Int64List(b)) => a == b,
            (Float32List(a), Float32List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Float64List(a), Float64List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (
                Enum {
                    type_id: ta,
                    ordinal: oa,
                },
                Enum {
                    type_id: tb,
                    ordinal: ob,
                },
            ) => ta == tb && oa == ob,
            (
                Custom {
                    type_id: ta,
                    fields: fa,
                },
                Custom {
                    type_id: tb,
                    fields: fb,
                },
            ) => ta == tb && fa == fb,
            (Instance(a), Instance(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Consistent with equality: floats hash by bit pattern, maps independently
/// of entry order.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Int32List(l) => l.hash(state),
            Value::Int64List(l) => l.hash(state),
            Value::Float32List(l) => {
                l.len().hash(state);
                l.iter().for_each(|x| x.to_bits().hash(state));
            }
            Value::Float64List(l) => {
                l.len().hash(state);
                l.iter().for_each(|x| x.to_bits().hash(state));
            }
            Value::List(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Enum { type_id, ordinal } => {
                type_id.hash(state);
                ordinal.hash(state);
            }
            Value::Custom { type_id, fields } => {
                type_id.hash(state);
                fields.hash(state);
            }
            Value::Instance(id) => id.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Int32List(l) => write!(f, "{l:?}"),
            Value::Int64List(l) => write!(f, "{l:?}"),
            Value::Float32List(l) => write!(f, "{l:?}"),
            Value::Float64List(l) => write!(f, "{l:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Enum { type_id, ordinal } => write!(f, "enum#{type_id}({ordinal})"),
            Value::Custom { type_id, fields } => {
                write!(f, "class#{type_id}{}", Value::List(fields.clone()))
            }
            Value::Instance(id) => write!(f, "instance#{id}"),
        }
    }
}

// ============================================================================
// Map
// ============================================================================

/// Map of values to values with unique keys.
///
/// Keys are arbitrary values (including `null`). Entries are kept in
/// insertion order next to an index from key hash to position, so lookups
/// and inserts don't scan. Insertion replaces the value of an existing equal
/// key. Equality ignores order.
#[derive(Clone, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
    /// Positions in `entries`, by key hash.
    index: HashMap<u64, Vec<usize>>,
    hasher: RandomState,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hasher: RandomState::new(),
        }
    }

    fn position(&self, key: &Value) -> Option<usize> {
        let hash = self.hasher.hash_one(key);
        self.index
            .get(&hash)?
            .iter()
            .copied()
            .find(|&i| self.entries[i].0 == *key)
    }

    /// Insert a pair, returning the previous value for an equal key.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some(i) = self.position(&key) {
            return Some(std::mem::replace(&mut self.entries[i].1, value));
        }
        let hash = self.hasher.hash_one(&key);
        self.index.entry(hash).or_default().push(self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    /// Remove the entry for `key`. Keeps the order of the rest, at the cost
    /// of reindexing.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let pos = self.position(key)?;
        let (_, value) = self.entries.remove(pos);
        self.index.clear();
        for (i, (k, _)) in self.entries.iter().enumerate() {
            self.index.entry(self.hasher.hash_one(k)).or_default().push(i);
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

impl Eq for ValueMap {}

impl Hash for ValueMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // entries are summed with a fixed hasher so that order doesn't matter
        let mut sum = 0u64;
        for (k, v) in self.iter() {
            let mut entry = DefaultHasher::new();
            k.hash(&mut entry);
            v.hash(&mut entry);
            sum = sum.wrapping_add(entry.finish());
        }
        self.len().hash(state);
        sum.hash(state);
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
