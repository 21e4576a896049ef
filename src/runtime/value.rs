use crate::language::ast::{BinaryOp, FunctionDef};
use crate::runtime::error::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Arc<str>),
    Array(ArrayValue),
    Object(ObjectValue),
    Function(Arc<FunctionDef>),
    Namespace(Namespace),
}

/// Coarse type classes used by register type locking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Undefined,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
    Namespace,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
            ValueKind::Namespace => "namespace",
        };
        f.write_str(name)
    }
}

/// Builtin API objects reachable by name from every script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Console,
    Math,
    Message,
    Engine,
    Content,
    Globals,
}

impl Namespace {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Console" => Some(Namespace::Console),
            "Math" => Some(Namespace::Math),
            "Message" => Some(Namespace::Message),
            "Engine" => Some(Namespace::Engine),
            "Content" => Some(Namespace::Content),
            "Globals" => Some(Namespace::Globals),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Namespace::Console => "Console",
            Namespace::Math => "Math",
            Namespace::Message => "Message",
            Namespace::Engine => "Engine",
            Namespace::Content => "Content",
            Namespace::Globals => "Globals",
        }
    }
}

impl Value {
    pub fn string(text: impl Into<Arc<str>>) -> Self {
        Value::String(text.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(ArrayValue::from_vec(items))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Namespace(_) => true,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Undefined => ValueKind::Undefined,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) | Value::Double(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
            Value::Namespace(_) => ValueKind::Namespace,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Namespace(_) => "namespace",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Integer view used by bitwise operators and indexing; doubles truncate.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) => Some(*d as i64),
            _ => None,
        }
    }

    /// Loose equality: numbers compare by value across int/double, composites by identity.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(&a.items, &b.items),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(&a.entries, &b.entries),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Namespace(a), Value::Namespace(b)) => a == b,
            (left, right) => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Arc::from(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => {
                if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::String(v) => write!(f, "{v}"),
            Value::Array(_) | Value::Object(_) => write_container(f, self, &mut Vec::new()),
            Value::Function(def) => write!(f, "function {}()", def.name),
            Value::Namespace(ns) => write!(f, "{}", ns.name()),
        }
    }
}

/// Writes arrays and objects from snapshots so no container lock is held while
/// children format. A container already on `path` prints as `[...]`/`{...}`.
fn write_container(
    f: &mut fmt::Formatter<'_>,
    value: &Value,
    path: &mut Vec<*const ()>,
) -> fmt::Result {
    match value {
        Value::Array(array) => {
            let id = Arc::as_ptr(&array.items) as *const ();
            if path.contains(&id) {
                return write!(f, "[...]");
            }
            path.push(id);
            write!(f, "[")?;
            for (idx, item) in array.snapshot().iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write_container(f, item, path)?;
            }
            path.pop();
            write!(f, "]")
        }
        Value::Object(object) => {
            let id = Arc::as_ptr(&object.entries) as *const ();
            if path.contains(&id) {
                return write!(f, "{{...}}");
            }
            path.push(id);
            write!(f, "{{")?;
            for (idx, (key, item)) in object.snapshot().iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}: ")?;
                write_container(f, item, path)?;
            }
            path.pop();
            write!(f, "}}")
        }
        other => write!(f, "{other}"),
    }
}

/// Largest length an array may grow to through an indexed write.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

#[derive(Clone, Debug, Default)]
pub struct ArrayValue {
    pub items: Arc<Mutex<Vec<Value>>>,
}

impl ArrayValue {
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.lock().get(index).cloned()
    }

    /// Writes past the end grow the array, padding with `undefined`, up to
    /// [`MAX_ARRAY_LEN`] elements.
    pub fn set(&self, index: usize, value: Value) -> RuntimeResult<()> {
        let mut items = self.items.lock();
        if index >= items.len() {
            let len = index
                .checked_add(1)
                .filter(|len| *len <= MAX_ARRAY_LEN)
                .ok_or(RuntimeError::IndexOutOfRange { index })?;
            items.resize(len, Value::Undefined);
        }
        items[index] = value;
        Ok(())
    }

    pub fn push(&self, value: Value) -> usize {
        let mut items = self.items.lock();
        items.push(value);
        items.len()
    }

    pub fn pop(&self) -> Option<Value> {
        self.items.lock().pop()
    }

    pub fn index_of(&self, needle: &Value) -> Option<usize> {
        self.items
            .lock()
            .iter()
            .position(|item| item.loosely_equals(needle))
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.lock().clone()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObjectValue {
    pub entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl ObjectValue {
    pub fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: Value) {
        self.entries.lock().insert(key, value);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Applies a non-logical binary operator with explicit numeric promotion.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left.loosely_equals(right))),
        BinaryOp::NotEq => Ok(Value::Bool(!left.loosely_equals(right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => compare(op, left, right),
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
            bitwise(op, left, right)
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Ok(Value::string(format!("{a}{b}"))),
            (a, Value::String(b)) => Ok(Value::string(format!("{a}{b}"))),
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, left, right)
        }
    }
}

fn operand_error(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        message: format!(
            "operator `{}` cannot be applied to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(op, *a, *b),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(operand_error(op, left, right)),
            };
            let value = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => return Err(operand_error(op, left, right)),
            };
            Ok(Value::Double(value))
        }
        _ => Err(operand_error(op, left, right)),
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> RuntimeResult<Value> {
    let value = match op {
        BinaryOp::Add => Value::Int(a.wrapping_add(b)),
        BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b != 0 && a.wrapping_rem(b) == 0 {
                Value::Int(a.wrapping_div(b))
            } else {
                Value::Double(a as f64 / b as f64)
            }
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Value::Int(a.wrapping_rem(b))
        }
        _ => {
            return Err(RuntimeError::Unsupported {
                message: format!("`{}` is not an arithmetic operator", op.symbol()),
            })
        }
    };
    Ok(value)
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(operand_error(op, left, right)),
        },
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::GtEq => ordering.is_ge(),
        _ => return Err(operand_error(op, left, right)),
    };
    Ok(Value::Bool(result))
}

fn bitwise(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) else {
        return Err(operand_error(op, left, right));
    };
    let value = match op {
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => a.wrapping_shr(b as u32),
        _ => return Err(operand_error(op, left, right)),
    };
    Ok(Value::Int(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_division_stays_integral_only_when_exact() {
        let exact = apply_binary(BinaryOp::Div, &Value::Int(8), &Value::Int(2)).unwrap();
        assert!(matches!(exact, Value::Int(4)));
        let inexact = apply_binary(BinaryOp::Div, &Value::Int(7), &Value::Int(2)).unwrap();
        assert!(matches!(inexact, Value::Double(d) if d == 3.5));
    }

    #[test]
    fn mixed_operands_promote_to_double() {
        let sum = apply_binary(BinaryOp::Add, &Value::Int(1), &Value::Double(0.5)).unwrap();
        assert!(matches!(sum, Value::Double(d) if d == 1.5));
    }

    #[test]
    fn string_concatenation_formats_numbers() {
        let joined = apply_binary(BinaryOp::Add, &Value::from("n="), &Value::Int(3)).unwrap();
        assert_eq!(joined.to_string(), "n=3");
    }

    #[test]
    fn arithmetic_on_composites_is_a_type_error() {
        let a = Value::array(vec![]);
        let b = Value::array(vec![]);
        let err = apply_binary(BinaryOp::Mul, &a, &b).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }

    #[test]
    fn integer_remainder_by_zero_fails() {
        let err = apply_binary(BinaryOp::Rem, &Value::Int(3), &Value::Int(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::DivisionByZero));
    }

    #[test]
    fn composite_equality_is_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let same = a.clone();
        let other = Value::array(vec![Value::Int(1)]);
        assert!(a.loosely_equals(&same));
        assert!(!a.loosely_equals(&other));
        assert!(Value::Int(2).loosely_equals(&Value::Double(2.0)));
    }

    #[test]
    fn bitwise_truncates_doubles() {
        let value = apply_binary(BinaryOp::BitOr, &Value::Double(4.9), &Value::Int(1)).unwrap();
        assert!(matches!(value, Value::Int(5)));
    }

    #[test]
    fn min_int_divided_by_minus_one_wraps() {
        let quotient = apply_binary(BinaryOp::Div, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap();
        assert!(matches!(quotient, Value::Int(i64::MIN)));
        let rest = apply_binary(BinaryOp::Rem, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap();
        assert!(matches!(rest, Value::Int(0)));
    }

    #[test]
    fn self_referential_containers_print_placeholders() {
        let array = ArrayValue::from_vec(vec![Value::Int(1)]);
        array.push(Value::Array(array.clone()));
        assert_eq!(Value::Array(array.clone()).to_string(), "[1, [...]]");

        let object = ObjectValue::default();
        object.insert("self".into(), Value::Object(object.clone()));
        object.insert("list".into(), Value::Array(array));
        assert_eq!(
            Value::Object(object).to_string(),
            "{list: [1, [...]], self: {...}}"
        );
    }

    #[test]
    fn shared_children_are_not_cycles() {
        let child = Value::array(vec![Value::Int(2)]);
        let parent = Value::array(vec![child.clone(), child]);
        assert_eq!(parent.to_string(), "[[2], [2]]");
    }

    #[test]
    fn writes_past_the_length_limit_fail() {
        let array = ArrayValue::default();
        array.set(3, Value::Int(1)).unwrap();
        assert_eq!(array.len(), 4);

        let err = array.set(MAX_ARRAY_LEN, Value::Int(1)).unwrap_err();
        assert!(matches!(err, RuntimeError::IndexOutOfRange { index } if index == MAX_ARRAY_LEN));
        assert!(array.set(usize::MAX, Value::Int(1)).is_err());
        assert_eq!(array.len(), 4);
    }
}
