//! Cycle-safe text codec for RPC payloads.
//!
//! The wire form is a JSON array used as a reference table:
//!
//! - element `0` is the root value
//! - every array, object and string is stored once in the table; wherever it occurs
//!   inside a container it is replaced by its table index, written as a string
//! - numbers, booleans and null are written inline
//!
//! ```text
//! {"a": 1, "b": "x", "self": <cycle>}  =>  [{"a":1,"b":"1","self":"0"},"x"]
//! ```
//!
//! Containers are identified by [`Node`] identity, so shared nodes are written once
//! and cycles become back-references. Strings are deduplicated by content. The format
//! is compatible with the `flatted` JavaScript library.
//!
//! [`Value::Error`] payloads are written as plain objects (see [`ErrorValue::to_object`]);
//! decoding never turns them back into [`Value::Error`].
//!
//! [`ErrorValue::to_object`]: super::ErrorValue::to_object

use std::collections::{HashMap, VecDeque};

use serde_json::Value as Json;

use super::error::CodecError;
use super::value::{Map, Node, Value};
use crate::Result;

/// Encode `data` into its transmissible text form.
///
/// Never fails on cyclic values.
pub fn serialize(data: &Value) -> Result<String> {
    let table = Encoder::default().encode(data);
    serde_json::to_string(&table).map_err(|e| CodecError::Json(e).into())
}

/// Decode text produced by [`serialize`].
///
/// Shared nodes and cycles are rebuilt as shared [`Node`]s. The returned root owns the
/// graph: repeated references and back-references are weak handles (see [`Node`]).
/// Decoding is iterative, so nesting depth is bounded only by memory. Malformed input
/// fails with a [`Kind::Serialization`](crate::error::Kind::Serialization) error.
pub fn deserialize(text: &str) -> Result<Value> {
    let table: Vec<Json> = serde_json::from_str(text).map_err(CodecError::Json)?;
    let root = table.first().ok_or(CodecError::EmptyPayload)?;

    match root {
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Array(_) | Json::Object(_) => Decoder::new(&table).decode(),
        primitive => Ok(Value::from(primitive.clone())),
    }
}

/// Container contents waiting to be written into their reserved table slot.
enum Pending {
    Array(Vec<Value>),
    Object(Map),
}

#[derive(Default)]
struct Encoder {
    table: Vec<Json>,
    nodes: HashMap<usize, usize>,
    strings: HashMap<String, usize>,
    pending: VecDeque<(usize, Pending)>,
}

impl Encoder {
    fn encode(mut self, root: &Value) -> Vec<Json> {
        match root {
            Value::Null | Value::Bool(_) | Value::Number(_) => self.table.push(inline(root)),
            _ => {
                self.reference(root);
            }
        }

        while let Some((slot, pending)) = self.pending.pop_front() {
            let flattened = match pending {
                Pending::Array(items) => {
                    Json::Array(items.iter().map(|item| self.reference(item)).collect())
                }
                Pending::Object(fields) => Json::Object(
                    fields
                        .iter()
                        .map(|(key, value)| (key.clone(), self.reference(value)))
                        .collect(),
                ),
            };
            self.table[slot] = flattened;
        }

        self.table
    }

    /// Inline primitives, table index for everything else.
    fn reference(&mut self, value: &Value) -> Json {
        let slot = match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => return inline(value),
            Value::String(s) => self.intern_string(s),
            Value::Array(node) => self.intern_node(node, || Pending::Array(node.snapshot())),
            Value::Object(node) => self.intern_node(node, || Pending::Object(node.snapshot())),
            // Errors have no identity: each occurrence is its own object.
            Value::Error(error) => self.reserve(Pending::Object(error.to_object())),
        };
        Json::String(slot.to_string())
    }

    fn intern_string(&mut self, s: &str) -> usize {
        if let Some(&slot) = self.strings.get(s) {
            return slot;
        }
        let slot = self.table.len();
        self.table.push(Json::String(s.to_owned()));
        self.strings.insert(s.to_owned(), slot);
        slot
    }

    fn intern_node<T, F: FnOnce() -> Pending>(&mut self, node: &Node<T>, contents: F) -> usize {
        if let Some(&slot) = self.nodes.get(&node.id()) {
            return slot;
        }
        let slot = self.reserve(contents());
        self.nodes.insert(node.id(), slot);
        slot
    }

    fn reserve(&mut self, contents: Pending) -> usize {
        let slot = self.table.len();
        self.table.push(Json::Null);
        self.pending.push_back((slot, contents));
        slot
    }
}

fn inline(value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::Number(n.clone()),
        _ => Json::Null,
    }
}

/// Rebuilds the node graph from a reference table without recursion.
///
/// Every container slot gets its node when first referenced and is filled later from
/// the work queue. The first reference holds the node strongly; later references,
/// including back-references, are weak, so the result has no strong cycles.
struct Decoder<'table> {
    table: &'table [Json],
    nodes: HashMap<usize, Value>,
    pending: VecDeque<usize>,
}

impl<'table> Decoder<'table> {
    fn new(table: &'table [Json]) -> Self {
        Self {
            table,
            nodes: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    fn decode(mut self) -> Result<Value> {
        let root = self.resolve(0)?;

        let table = self.table;
        while let Some(slot) = self.pending.pop_front() {
            let Some(value) = self.nodes.get(&slot).cloned() else {
                continue;
            };
            match (&value, table.get(slot)) {
                (Value::Array(node), Some(Json::Array(items))) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(self.child(item)?);
                    }
                    node.with_mut(|contents| *contents = resolved);
                }
                (Value::Object(node), Some(Json::Object(fields))) => {
                    let mut resolved = Map::new();
                    for (key, field) in fields {
                        resolved.insert(key.clone(), self.child(field)?);
                    }
                    node.with_mut(|contents| *contents = resolved);
                }
                _ => {}
            }
        }

        Ok(root)
    }

    /// Value for table `slot`: a strong handle the first time a container is seen,
    /// a weak one afterwards.
    fn resolve(&mut self, slot: usize) -> Result<Value> {
        if let Some(value) = self.nodes.get(&slot) {
            return Ok(value.downgrade());
        }

        match self.table.get(slot).ok_or(CodecError::DanglingReference(slot))? {
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => {
                let value = Value::array(Vec::with_capacity(items.len()));
                Ok(self.allocate(slot, value))
            }
            Json::Object(_) => Ok(self.allocate(slot, Value::object(Map::new()))),
            primitive => Ok(Value::from(primitive.clone())),
        }
    }

    fn allocate(&mut self, slot: usize, value: Value) -> Value {
        self.nodes.insert(slot, value.clone());
        self.pending.push_back(slot);
        value
    }

    fn child(&mut self, json: &Json) -> Result<Value> {
        match json {
            Json::String(reference) => {
                let slot = reference
                    .parse::<usize>()
                    .map_err(|_e| CodecError::InvalidReference(reference.clone()))?;
                self.resolve(slot)
            }
            // Not produced by `serialize`; accepted as plain data.
            other => Ok(Value::from(other.clone())),
        }
    }
}
