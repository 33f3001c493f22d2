//! Property values and object identity.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::observable::Observable;

/// Identity of a business object: the address of its shared allocation.
///
/// Two handles to the same `Arc` have the same id. The reference graph only
/// holds weak handles, which keep the allocation (and therefore the id)
/// reserved for as long as a node refers to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// The identity of `object`.
    ///
    /// Inside an [`Observable`] implementation, `ObjectId::of(self)` equals the
    /// id of every `BeanRef` pointing at that object.
    pub fn of<T: ?Sized>(object: &T) -> Self {
        ObjectId(object as *const T as *const () as usize)
    }
}

/// A shared, identity-compared handle to a business object.
#[derive(Clone)]
pub struct BeanRef(Arc<dyn Observable>);

impl BeanRef {
    /// Wrap a shared observable.
    pub fn new(object: Arc<dyn Observable>) -> Self {
        BeanRef(object)
    }

    /// Identity of the referenced object.
    pub fn id(&self) -> ObjectId {
        ObjectId::of(&*self.0)
    }

    /// A weak handle that does not keep the object alive.
    pub fn downgrade(&self) -> WeakBean {
        WeakBean {
            id: self.id(),
            object: Arc::downgrade(&self.0),
        }
    }

    /// The underlying shared object.
    pub fn as_arc(&self) -> &Arc<dyn Observable> {
        &self.0
    }
}

impl<T: Observable> From<Arc<T>> for BeanRef {
    fn from(object: Arc<T>) -> Self {
        BeanRef(object)
    }
}

impl Deref for BeanRef {
    type Target = dyn Observable;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for BeanRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for BeanRef {}

impl fmt::Debug for BeanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.0.bean_type(), self.id().0)
    }
}

/// A weak [`BeanRef`] that remembers the identity of its target.
#[derive(Clone)]
pub struct WeakBean {
    id: ObjectId,
    object: Weak<dyn Observable>,
}

impl WeakBean {
    /// Identity of the referenced object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Upgrade to a strong handle if the object is still alive.
    pub fn upgrade(&self) -> Option<BeanRef> {
        self.object.upgrade().map(BeanRef)
    }
}

impl fmt::Debug for WeakBean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakBean({:x})", self.id.0)
    }
}

/// The value of a property, or of a path resolved from a root.
///
/// Objects compare by identity; scalars by value. `NotReady` is distinct from
/// `Null`: it means the value exists but has not been loaded yet.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// The value is still being loaded.
    NotReady,
    /// A boolean.
    Bool(bool),
    /// A 64-bit integer.
    Integer(i64),
    /// A floating-point number.
    Decimal(f64),
    /// A string.
    Text(Arc<str>),
    /// A reference to another business object.
    Object(BeanRef),
}

impl Value {
    /// Returns false only for [`Value::NotReady`].
    pub fn is_ready(&self) -> bool {
        !matches!(self, Value::NotReady)
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The referenced object, if this is an object value.
    pub fn as_object(&self) -> Option<&BeanRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// The text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Numeric view of integers and decimals.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::NotReady => "not-ready",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::NotReady, Value::NotReady) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::NotReady => f.write_str("<not ready>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(t) => f.write_str(t),
            Value::Object(o) => write!(f, "{o:?}"),
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
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Decimal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(Arc::from(value))
    }
}

impl From<BeanRef> for Value {
    fn from(value: BeanRef) -> Self {
        Value::Object(value)
    }
}

impl<T: Observable> From<Arc<T>> for Value {
    fn from(value: Arc<T>) -> Self {
        Value::Object(BeanRef::from(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
