//! Binary protocol nodes (whatsmeow binary package).
//! WhatsApp uses a custom binary XML-like node format over the Noise socket.

use std::collections::HashMap;

pub mod consts;
mod decoder;
mod encoder;
mod token;

/// Attributes on a node (key-value; values can be string, int, etc. in Go; we use string for simplicity).
pub type Attrs = HashMap<String, String>;

/// Content of a node: either child nodes or raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

/// A single binary protocol node (mirrors waBinary.Node).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.attrs.insert(k.into(), v.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_content(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes.iter().find(|n| n.tag == tag),
            _ => None,
        }
    }

    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(n) => n,
            _ => &[],
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| s.as_str())
    }

    /// Insert an attribute only if `value` is `Some`.
    pub fn with_optional_attr(self, k: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with_attr(k, v),
            None => self,
        }
    }

    /// Encode to binary form: string tag, string attrs, content as bytes or
    /// child-node list (no dictionary tokens, see `token.rs`).
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        encoder::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode a single node from its binary form.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        decoder::decode(data)
    }
}


