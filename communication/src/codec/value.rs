//! Values carried by operations.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A value carried by an operation.
///
/// Doubles compare and hash by bit pattern, so every value can serve as a key. Values order
/// first by variant, in declaration order, then by contents; doubles use their total order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// The absence of a value, used for unmatched join sides.
    Empty,
    /// A 32-bit signed integer.
    Integer(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 16-bit signed integer.
    Short(i16),
    /// A 64-bit float.
    Double(f64),
    /// A single byte.
    Byte(u8),
    /// UTF-8 text.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// 32-bit integers.
    IntegerArray(Vec<i32>),
    /// 64-bit integers.
    LongArray(Vec<i64>),
    /// 64-bit floats.
    DoubleArray(Vec<f64>),
    /// A sequence of values.
    List(Vec<Value>),
    /// A key and a value.
    Tuple(Box<Value>, Box<Value>),
}

impl Value {
    /// Pairs a key with a value.
    pub fn tuple<K: Into<Value>, V: Into<Value>>(key: K, value: V) -> Self {
        Value::Tuple(Box::new(key.into()), Box::new(value.into()))
    }

    /// Borrows the key and value of a tuple.
    pub fn as_pair(&self) -> Option<(&Value, &Value)> {
        match self {
            Value::Tuple(key, value) => Some((key, value)),
            _ => None,
        }
    }

    /// Splits a tuple into its key and value.
    pub fn into_pair(self) -> Option<(Value, Value)> {
        match self {
            Value::Tuple(key, value) => Some((*key, *value)),
            _ => None,
        }
    }

    /// The integer, if this is an `Integer`.
    pub fn as_integer(&self) -> Option<i32> {
        match self { Value::Integer(x) => Some(*x), _ => None }
    }

    /// The long, if this is a `Long`.
    pub fn as_long(&self) -> Option<i64> {
        match self { Value::Long(x) => Some(*x), _ => None }
    }

    /// The text, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(x) => Some(x), _ => None }
    }

    /// The bytes, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Value::Bytes(x) => Some(x), _ => None }
    }

    /// A short name for the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Integer(_) => "integer",
            Value::Long(_) => "long",
            Value::Short(_) => "short",
            Value::Double(_) => "double",
            Value::Byte(_) => "byte",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::IntegerArray(_) => "integer array",
            Value::LongArray(_) => "long array",
            Value::DoubleArray(_) => "double array",
            Value::List(_) => "list",
            Value::Tuple(_, _) => "tuple",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::IntegerArray(a), Value::IntegerArray(b)) => a == b,
            (Value::LongArray(a), Value::LongArray(b)) => a == b,
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            },
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(ak, av), Value::Tuple(bk, bv)) => ak == bk && av == bv,
            _ => false,
        }
    }
}

impl Eq for Value { }

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Empty => { },
            Value::Integer(x) => x.hash(state),
            Value::Long(x) => x.hash(state),
            Value::Short(x) => x.hash(state),
            Value::Double(x) => x.to_bits().hash(state),
            Value::Byte(x) => x.hash(state),
            Value::String(x) => x.hash(state),
            Value::Bytes(x) => x.hash(state),
            Value::IntegerArray(x) => x.hash(state),
            Value::LongArray(x) => x.hash(state),
            Value::DoubleArray(x) => {
                x.len().hash(state);
                for element in x.iter() { element.to_bits().hash(state); }
            },
            Value::List(x) => x.hash(state),
            Value::Tuple(key, value) => { key.hash(state); value.hash(state); },
        }
    }
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Empty => 0,
            Value::Integer(_) => 1,
            Value::Long(_) => 2,
            Value::Short(_) => 3,
            Value::Double(_) => 4,
            Value::Byte(_) => 5,
            Value::String(_) => 6,
            Value::Bytes(_) => 7,
            Value::IntegerArray(_) => 8,
            Value::LongArray(_) => 9,
            Value::DoubleArray(_) => 10,
            Value::List(_) => 11,
            Value::Tuple(..) => 12,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Short(a), Value::Short(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Byte(a), Value::Byte(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::IntegerArray(a), Value::IntegerArray(b)) => a.cmp(b),
            (Value::LongArray(a), Value::LongArray(b)) => a.cmp(b),
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                a.iter().zip(b.iter())
                    .map(|(x, y)| x.total_cmp(y))
                    .find(|order| *order != Ordering::Equal)
                    .unwrap_or_else(|| a.len().cmp(&b.len()))
            },
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Tuple(ak, av), Value::Tuple(bk, bv)) => ak.cmp(bk).then_with(|| av.cmp(bv)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl From<i32> for Value { fn from(x: i32) -> Self { Value::Integer(x) } }
impl From<i64> for Value { fn from(x: i64) -> Self { Value::Long(x) } }
impl From<i16> for Value { fn from(x: i16) -> Self { Value::Short(x) } }
impl From<f64> for Value { fn from(x: f64) -> Self { Value::Double(x) } }
impl From<u8> for Value { fn from(x: u8) -> Self { Value::Byte(x) } }
impl From<String> for Value { fn from(x: String) -> Self { Value::String(x) } }
impl From<&str> for Value { fn from(x: &str) -> Self { Value::String(x.to_owned()) } }
impl From<Vec<u8>> for Value { fn from(x: Vec<u8>) -> Self { Value::Bytes(x) } }
impl From<Vec<i32>> for Value { fn from(x: Vec<i32>) -> Self { Value::IntegerArray(x) } }
impl From<Vec<i64>> for Value { fn from(x: Vec<i64>) -> Self { Value::LongArray(x) } }
impl From<Vec<f64>> for Value { fn from(x: Vec<f64>) -> Self { Value::DoubleArray(x) } }
impl From<Vec<Value>> for Value { fn from(x: Vec<Value>) -> Self { Value::List(x) } }

#[cfg(test)]
mod test {

    use std::collections::HashMap;
    use super::Value;

    #[test]
    fn ordering_agrees_with_equality() {
        let mut values = vec![
            Value::from("b"), Value::Integer(3), Value::Double(-0.0), Value::Empty,
            Value::Double(0.0), Value::from("a"), Value::Integer(-1), Value::tuple(1, "x"),
        ];
        values.sort();
        assert_eq!(values, vec![
            Value::Empty, Value::Integer(-1), Value::Integer(3), Value::Double(-0.0),
            Value::Double(0.0), Value::from("a"), Value::from("b"), Value::tuple(1, "x"),
        ]);
        assert_ne!(Value::Double(-0.0).cmp(&Value::Double(0.0)), std::cmp::Ordering::Equal);
        assert!(Value::DoubleArray(vec![1.0]) < Value::DoubleArray(vec![1.0, 0.5]));
    }

    #[test]
    fn doubles_are_usable_as_keys() {
        let mut counts = HashMap::new();
        for key in [1.5f64, 1.5, -0.0, 0.0] {
            *counts.entry(Value::Double(key)).or_insert(0) += 1;
        }
        assert_eq!(counts[&Value::Double(1.5)], 2);
        // distinct bit patterns are distinct keys.
        assert_eq!(counts[&Value::Double(0.0)], 1);
        assert_eq!(counts[&Value::Double(-0.0)], 1);
    }

    #[test]
    fn tuples_split() {
        let pair = Value::tuple("a", 1);
        assert_eq!(pair.as_pair(), Some((&Value::from("a"), &Value::Integer(1))));
        assert_eq!(pair.into_pair(), Some((Value::from("a"), Value::Integer(1))));
        assert_eq!(Value::Integer(3).into_pair(), None);
    }
}
