//! Message codec: documents to wire frames and back.
//!
//! - **Text**: UTF-8 JSON, keys in insertion order.
//! - **Binary**: a 4-byte header followed by a bincode-encoded list of value
//!   nodes in pre-order. Every node carries its kind, so any document
//!   survives the trip, not just known message shapes. The list is flat and
//!   rebuilt without recursion, so nesting is bounded by `MAX_NESTING`
//!   rather than by the stack.
//!
//! The form is picked once from the connection's `Raw` feature bit.

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::features::Features;
use crate::framing::MAX_FRAME_SIZE;
use crate::message::ProtocolMessage;
use crate::transport::Frame;
use crate::value::Document;

/// Leading bytes of every binary document.
pub const BINARY_HEADER: [u8; 4] = *b"LNK\x01";

/// Deepest container nesting accepted in either wire form. Matches the
/// recursion limit `serde_json` applies to text documents.
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed text document: {0}")]
    Text(#[from] serde_json::Error),

    #[error("Malformed binary document: {0}")]
    Binary(#[from] bincode::Error),

    #[error("Binary document is missing its header")]
    MissingHeader,

    #[error("Document root is not an object")]
    NotAnObject,

    #[error("Document nests deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("Malformed binary document: {0}")]
    BrokenTree(&'static str),
}

/// Wire form of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Text,
    Binary,
}

/// Encodes and decodes documents in one fixed wire form.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    format: WireFormat,
}

impl Codec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Pick the form from the negotiated features.
    pub fn for_features(features: Features) -> Self {
        if features.contains(Features::RAW) {
            Self::new(WireFormat::Binary)
        } else {
            Self::new(WireFormat::Text)
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a message into a frame ready for the transport.
    pub fn encode(&self, message: &ProtocolMessage) -> Result<Frame, CodecError> {
        let document = message.to_document()?;
        self.encode_document(&document)
    }

    pub fn encode_document(&self, document: &Document) -> Result<Frame, CodecError> {
        match self.format {
            WireFormat::Text => Ok(Frame::Text(serde_json::to_string(document)?)),
            WireFormat::Binary => {
                let mut nodes = Vec::new();
                push_object(document, 1, &mut nodes)?;
                let mut bytes = BINARY_HEADER.to_vec();
                bytes.extend(binary_options().serialize(&nodes)?);
                Ok(Frame::Binary(bytes))
            }
        }
    }

    /// Decode a frame payload into a document.
    ///
    /// Fails without side effects; the caller decides what a bad document
    /// means for the connection.
    pub fn decode_document(&self, data: &[u8]) -> Result<Document, CodecError> {
        let value = match self.format {
            WireFormat::Text => serde_json::from_slice::<Value>(data)?,
            WireFormat::Binary => {
                let body = data
                    .strip_prefix(&BINARY_HEADER[..])
                    .ok_or(CodecError::MissingHeader)?;
                let nodes: Vec<BinaryNode> = binary_options().deserialize(body)?;
                rebuild(nodes)?
            }
        };
        match value {
            Value::Object(document) => Ok(document),
            _ => Err(CodecError::NotAnObject),
        }
    }
}

fn binary_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

/// One node of a document in its binary form.
///
/// Containers announce their size and their children follow them in the
/// node list. A map lists its keys up front; its values follow in the same
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum BinaryNode {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    List(u32),
    Map(Vec<String>),
}

fn push_object(
    document: &Document,
    depth: usize,
    nodes: &mut Vec<BinaryNode>,
) -> Result<(), CodecError> {
    if depth > MAX_NESTING {
        return Err(CodecError::TooDeep { limit: MAX_NESTING });
    }
    nodes.push(BinaryNode::Map(document.keys().cloned().collect()));
    for value in document.values() {
        push_value(value, depth + 1, nodes)?;
    }
    Ok(())
}

fn push_value(value: &Value, depth: usize, nodes: &mut Vec<BinaryNode>) -> Result<(), CodecError> {
    match value {
        Value::Null => nodes.push(BinaryNode::Null),
        Value::Bool(b) => nodes.push(BinaryNode::Bool(*b)),
        Value::Number(n) => nodes.push(if let Some(i) = n.as_i64() {
            BinaryNode::Int(i)
        } else if let Some(u) = n.as_u64() {
            BinaryNode::UInt(u)
        } else {
            BinaryNode::Double(n.as_f64().unwrap_or_default())
        }),
        Value::String(s) => nodes.push(BinaryNode::String(s.clone())),
        Value::Array(items) => {
            if depth > MAX_NESTING {
                return Err(CodecError::TooDeep { limit: MAX_NESTING });
            }
            let len = u32::try_from(items.len())
                .map_err(|_| CodecError::BrokenTree("list too long"))?;
            nodes.push(BinaryNode::List(len));
            for item in items {
                push_value(item, depth + 1, nodes)?;
            }
        }
        Value::Object(map) => push_object(map, depth, nodes)?,
    }
    Ok(())
}

/// A container whose children are still being read.
enum OpenContainer {
    List {
        items: Vec<Value>,
        remaining: u32,
    },
    Map {
        entries: Document,
        keys: std::vec::IntoIter<String>,
    },
}

impl OpenContainer {
    fn is_full(&self) -> bool {
        match self {
            OpenContainer::List { remaining, .. } => *remaining == 0,
            OpenContainer::Map { keys, .. } => keys.len() == 0,
        }
    }

    fn push(&mut self, value: Value) {
        match self {
            OpenContainer::List { items, remaining } => {
                items.push(value);
                *remaining -= 1;
            }
            OpenContainer::Map { entries, keys } => {
                if let Some(key) = keys.next() {
                    entries.insert(key, value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            OpenContainer::List { items, .. } => Value::Array(items),
            OpenContainer::Map { entries, .. } => Value::Object(entries),
        }
    }
}

/// Rebuild a value from its pre-order node list.
fn rebuild(nodes: Vec<BinaryNode>) -> Result<Value, CodecError> {
    let mut nodes = nodes.into_iter();
    let mut open: Vec<OpenContainer> = Vec::new();

    loop {
        let node = nodes
            .next()
            .ok_or(CodecError::BrokenTree("document ends inside a container"))?;
        let mut value = match node {
            BinaryNode::Null => Some(Value::Null),
            BinaryNode::Bool(b) => Some(Value::Bool(b)),
            BinaryNode::Int(i) => Some(Value::from(i)),
            BinaryNode::UInt(u) => Some(Value::from(u)),
            BinaryNode::Double(d) => Some(Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)),
            BinaryNode::String(s) => Some(Value::String(s)),
            BinaryNode::List(len) => {
                if open.len() >= MAX_NESTING {
                    return Err(CodecError::TooDeep { limit: MAX_NESTING });
                }
                open.push(OpenContainer::List {
                    items: Vec::new(),
                    remaining: len,
                });
                None
            }
            BinaryNode::Map(keys) => {
                if open.len() >= MAX_NESTING {
                    return Err(CodecError::TooDeep { limit: MAX_NESTING });
                }
                open.push(OpenContainer::Map {
                    entries: Document::new(),
                    keys: keys.into_iter(),
                });
                None
            }
        };

        // Hand the finished value to its parent, closing every container
        // that this completes.
        while let Some(top) = open.last_mut() {
            if let Some(child) = value.take() {
                top.push(child);
            }
            if !top.is_full() {
                break;
            }
            value = open.pop().map(OpenContainer::finish);
        }

        if open.is_empty() {
            if let Some(root) = value {
                if nodes.next().is_some() {
                    return Err(CodecError::BrokenTree("nodes after the document root"));
                }
                return Ok(root);
            }
        }
    }
}
