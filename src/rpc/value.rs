//! Payload model for RPC arguments and results.
//!
//! [`Value`] mirrors JSON, with two differences needed on an RPC wire:
//!
//! - arrays and objects live in shared [`Node`]s, so one node may be referenced from
//!   several places, including from inside itself
//! - [`Value::Error`] carries an error whose message, stack and custom fields must
//!   survive the trip to the other side

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value as Json};

use super::error::CodecError;
use crate::Result;

/// Key carrying the error type name in an encoded error.
pub const ERROR_TYPE_KEY: &str = "__errorType";
/// Key carrying the error message in an encoded error.
pub const ERROR_MESSAGE_KEY: &str = "errorMessage";
/// Key carrying the error stack in an encoded error.
pub const ERROR_STACK_KEY: &str = "errorStack";

/// Object fields of a [`Value`].
pub type Map = BTreeMap<String, Value>;

/// Deepest container nesting [`Value::to_json`] converts.
pub const MAX_JSON_DEPTH: usize = 128;

/// A shared, mutable container node.
///
/// Cloning a `Node` clones the handle, not the contents. Two handles are the same
/// node when [`Node::ptr_eq`] holds, which is what the codec uses to preserve
/// sharing and cycles.
///
/// # Ownership
///
/// A handle is either strong or weak. Handles made with [`Node::new`] are strong and
/// keep the contents alive. [`deserialize`](super::deserialize) keeps decoded graphs
/// free of strong cycles: the first reference to each node is strong and every later
/// reference to it, back-references included, is weak. The decoded root therefore owns
/// the whole graph, and dropping it frees every node even when the payload was cyclic.
///
/// A weak handle whose node has been freed is [dangling](Node::is_dangling) and reads
/// as empty contents. Strong cycles built by hand are not collected; break them with
/// [`Node::with_mut`] before dropping the last handle.
pub struct Node<T> {
    link: Link<T>,
}

enum Link<T> {
    Strong(Arc<Mutex<T>>),
    Weak(Weak<Mutex<T>>),
}

impl<T> Node<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            link: Link::Strong(Arc::new(Mutex::new(value))),
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.as_ptr(), other.as_ptr())
    }

    /// Whether this handle does not keep the node alive.
    #[must_use]
    pub const fn is_weak(&self) -> bool {
        matches!(self.link, Link::Weak(_))
    }

    /// Whether the node behind this handle has been freed.
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.upgrade().is_none()
    }

    /// A weak handle to the same node.
    #[must_use]
    pub fn downgrade(&self) -> Self {
        let weak = match &self.link {
            Link::Strong(strong) => Arc::downgrade(strong),
            Link::Weak(weak) => weak.clone(),
        };
        Self {
            link: Link::Weak(weak),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.as_ptr().cast::<()>().addr()
    }

    fn as_ptr(&self) -> *const Mutex<T> {
        match &self.link {
            Link::Strong(strong) => Arc::as_ptr(strong),
            Link::Weak(weak) => weak.as_ptr(),
        }
    }

    fn upgrade(&self) -> Option<Arc<Mutex<T>>> {
        match &self.link {
            Link::Strong(strong) => Some(Arc::clone(strong)),
            Link::Weak(weak) => weak.upgrade(),
        }
    }
}

impl<T: Default> Node<T> {
    /// Run `f` with shared access to the contents.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> R {
        match self.upgrade() {
            Some(inner) => f(&inner.lock().unwrap_or_else(PoisonError::into_inner)),
            None => f(&T::default()),
        }
    }

    /// Run `f` with exclusive access to the contents.
    ///
    /// Changes made through a dangling handle are discarded.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        match self.upgrade() {
            Some(inner) => f(&mut inner.lock().unwrap_or_else(PoisonError::into_inner)),
            None => f(&mut T::default()),
        }
    }

    /// Move the contents out if this is the last strong handle.
    fn take_if_last(&self) -> Option<T> {
        match &self.link {
            Link::Strong(strong) if Arc::strong_count(strong) == 1 => Some(std::mem::take(
                &mut *strong.lock().unwrap_or_else(PoisonError::into_inner),
            )),
            _ => None,
        }
    }
}

impl<T: Clone + Default> Node<T> {
    /// Copy of the contents. Nested nodes are shared with the original.
    #[must_use]
    pub fn snapshot(&self) -> T {
        self.with(T::clone)
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        let link = match &self.link {
            Link::Strong(strong) => Link::Strong(Arc::clone(strong)),
            Link::Weak(weak) => Link::Weak(weak.clone()),
        };
        Self { link }
    }
}

// Contents are not printed: a node may contain itself.
impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_weak() {
            write!(f, "Node(weak {:#x})", self.id())
        } else {
            write!(f, "Node({:#x})", self.id())
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Node<Vec<Value>>),
    Object(Node<Map>),
    Error(ErrorValue),
}

impl Value {
    #[must_use]
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Node::new(items))
    }

    #[must_use]
    pub fn object(fields: Map) -> Self {
        Self::Object(Node::new(fields))
    }

    /// Build an object from `(key, value)` pairs.
    pub fn object_from<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::object(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Convert any serializable type into a value.
    pub fn from_serialize<T: Serialize + ?Sized>(data: &T) -> Result<Self> {
        Ok(serde_json::to_value(data)?.into())
    }

    /// Deserialize the value into `T`. Fails on cyclic values.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    /// Convert to plain JSON.
    ///
    /// Shared nodes are duplicated; errors become their encoded object form. Fails
    /// with [`CodecError::Cyclic`] when a node contains itself, and with
    /// [`CodecError::TooDeep`] past [`MAX_JSON_DEPTH`] nested containers.
    pub fn to_json(&self) -> Result<Json> {
        let mut path = Vec::new();
        self.to_json_inner(&mut path)
    }

    fn to_json_inner(&self, path: &mut Vec<usize>) -> Result<Json> {
        match self {
            Self::Null => Ok(Json::Null),
            Self::Bool(b) => Ok(Json::Bool(*b)),
            Self::Number(n) => Ok(Json::Number(n.clone())),
            Self::String(s) => Ok(Json::String(s.clone())),
            Self::Array(node) => {
                enter(path, node.id())?;
                let items = node
                    .snapshot()
                    .iter()
                    .map(|item| item.to_json_inner(path))
                    .collect::<Result<Vec<_>>>()?;
                path.pop();
                Ok(Json::Array(items))
            }
            Self::Object(node) => {
                enter(path, node.id())?;
                let fields = fields_to_json(&node.snapshot(), path)?;
                path.pop();
                Ok(Json::Object(fields))
            }
            Self::Error(error) => Ok(Json::Object(fields_to_json(&error.to_object(), path)?)),
        }
    }

    /// Same value with weak node handles. Other variants are cloned.
    pub(crate) fn downgrade(&self) -> Self {
        match self {
            Self::Array(node) => Self::Array(node.downgrade()),
            Self::Object(node) => Self::Object(node.downgrade()),
            other => other.clone(),
        }
    }

    /// Field `key` of an object value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Self::Object(node) => node.with(|fields| fields.get(key).cloned()),
            _ => None,
        }
    }

    /// Element `index` of an array value.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<Value> {
        match self {
            Self::Array(node) => node.with(|items| items.get(index).cloned()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

fn enter(path: &mut Vec<usize>, id: usize) -> Result<()> {
    if path.contains(&id) {
        return Err(CodecError::Cyclic.into());
    }
    if path.len() >= MAX_JSON_DEPTH {
        return Err(CodecError::TooDeep(MAX_JSON_DEPTH).into());
    }
    path.push(id);
    Ok(())
}

fn fields_to_json(fields: &Map, path: &mut Vec<usize>) -> Result<serde_json::Map<String, Json>> {
    fields
        .iter()
        .map(|(key, value)| -> Result<(String, Json)> {
            Ok((key.clone(), value.to_json_inner(path)?))
        })
        .collect()
}

// Children of uniquely owned nodes are moved onto a heap stack before their parent
// goes away, so dropping a deeply nested value does not recurse.
impl Drop for Value {
    fn drop(&mut self) {
        let mut orphans = Vec::new();
        detach_children(self, &mut orphans);
        while let Some(mut orphan) = orphans.pop() {
            detach_children(&mut orphan, &mut orphans);
        }
    }
}

fn detach_children(value: &mut Value, orphans: &mut Vec<Value>) {
    match value {
        Value::Array(node) => {
            if let Some(items) = node.take_if_last() {
                orphans.extend(items);
            }
        }
        Value::Object(node) => {
            if let Some(fields) = node.take_if_last() {
                orphans.extend(fields.into_values());
            }
        }
        Value::Error(error) => orphans.extend(std::mem::take(&mut error.fields).into_values()),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => Self::Number(n),
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::array(items.into_iter().map(Value::from).collect()),
            Json::Object(fields) => Self::object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

/// Non-finite floats have no JSON form and become [`Value::Null`].
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::array(items)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Self::Error(error)
    }
}

/// An error travelling as RPC payload.
///
/// Encoded as an object with [`ERROR_TYPE_KEY`], [`ERROR_MESSAGE_KEY`],
/// [`ERROR_STACK_KEY`] and every entry of `fields`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ErrorValue {
    /// Short type name of the error, e.g. `ParseIntError`
    pub error_type: String,
    /// Display message
    pub message: String,
    /// Human readable trace: the error line followed by its source chain
    pub stack: String,
    /// Custom fields attached by application code
    pub fields: Map,
}

impl ErrorValue {
    pub fn new<T: Into<String>, M: Into<String>>(error_type: T, message: M) -> Self {
        let error_type = error_type.into();
        let message = message.into();
        let stack = format!("{error_type}: {message}");
        Self {
            error_type,
            message,
            stack,
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = stack.into();
        self
    }

    #[must_use]
    pub fn with_field<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Capture a Rust error: its type name, message and source chain.
    pub fn from_error<E: StdError + 'static>(error: &E) -> Self {
        let error_type = short_type_name(std::any::type_name::<E>());
        let message = error.to_string();

        let mut stack = format!("{error_type}: {message}");
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::new(error_type, message).with_stack(stack)
    }

    /// Recognize an encoded error, e.g. a value returned by
    /// [`deserialize`](super::deserialize).
    ///
    /// Returns `None` unless `value` is an object with a string [`ERROR_TYPE_KEY`].
    #[must_use]
    pub fn from_encoded(value: &Value) -> Option<Self> {
        let Value::Object(node) = value else {
            return None;
        };
        let mut fields = node.snapshot();

        let error_type = take_string(&mut fields, ERROR_TYPE_KEY)?;
        let message = take_string(&mut fields, ERROR_MESSAGE_KEY).unwrap_or_default();
        let stack = take_string(&mut fields, ERROR_STACK_KEY)
            .unwrap_or_else(|| format!("{error_type}: {message}"));

        Some(Self {
            error_type,
            message,
            stack,
            fields,
        })
    }

    /// Encoded object form. Custom fields are applied last and win on key clashes.
    #[must_use]
    pub fn to_object(&self) -> Map {
        let mut object = Map::new();
        object.insert(
            ERROR_TYPE_KEY.to_owned(),
            Value::String(self.error_type.clone()),
        );
        object.insert(
            ERROR_MESSAGE_KEY.to_owned(),
            Value::String(self.message.clone()),
        );
        object.insert(ERROR_STACK_KEY.to_owned(), Value::String(self.stack.clone()));
        object.extend(
            self.fields
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        object
    }
}

impl From<&crate::error::Error> for ErrorValue {
    fn from(error: &crate::error::Error) -> Self {
        Self::from_error(error).with_field("kind", format!("{:?}", error.kind()))
    }
}

fn take_string(fields: &mut Map, key: &str) -> Option<String> {
    fields.remove(key)?.as_str().map(str::to_owned)
}

/// `alloc::vec::Vec<u8>` -> `Vec`, `core::num::error::ParseIntError` -> `ParseIntError`
fn short_type_name(full: &str) -> String {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_owned()
}
