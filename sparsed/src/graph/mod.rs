//! Static computation graphs.
//!
//! The graph is compiled once by a model builder, shipped to every
//! process as a serialized blob, and consulted for variable shapes,
//! initializers and target names. Node types are a tagged variant; the
//! per-operator kernels live with the op contexts, not here.

use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;
use thiserror::Error;

use crate::tensor::map::{
    decode_initializer, decode_shape, encode_initializer, encode_shape, get_str, get_u32, get_u8,
    put_str,
};
use crate::tensor::{Initializer, Shape};

/// Graph target conventions: train loss, offline prediction, online
/// inference, in that order.
pub const TARGET_TRAIN: usize = 0;
pub const TARGET_PREDICT: usize = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("graph has no target {0}")]
    MissingTarget(usize),

    #[error("unknown node kind: {0}")]
    UnknownKind(u8),

    #[error("malformed graph payload: {0}")]
    Payload(#[from] crate::tensor::Error),
}

/// Storage class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TensorKind {
    Tsr = 1,
    Srm = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Per-batch input slot fed by the instance reader.
    Instance { shape: Shape },
    /// Trainable parameter.
    Variable {
        kind: TensorKind,
        shape: Shape,
        initializer: Initializer,
    },
    Constant { shape: Shape, value: f64 },
    /// Computed node; `op` selects the kernel in the op context.
    Hidden { op: String, inputs: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    index: FnvHashMap<String, usize>,
    targets: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl ToString, kind: NodeKind) -> Result<(), Error> {
        let name = name.to_string();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicateNode(name));
        }
        if let NodeKind::Hidden { inputs, .. } = &kind {
            for input in inputs {
                if !self.index.contains_key(input) {
                    return Err(Error::UnknownNode(input.clone()));
                }
            }
        }
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(Node { name, kind });
        Ok(())
    }

    /// Fix the ordered target list. All names must resolve.
    pub fn compile(&mut self, targets: &[&str]) -> Result<(), Error> {
        for target in targets {
            if !self.index.contains_key(*target) {
                return Err(Error::UnknownNode((*target).into()));
            }
        }
        self.targets = targets.iter().map(|t| (*t).to_string()).collect();
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|i| &self.nodes[*i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn target(&self, i: usize) -> Result<&str, Error> {
        self.targets
            .get(i)
            .map(|t| t.as_str())
            .ok_or(Error::MissingTarget(i))
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Variable nodes, in insertion order.
    pub fn variables(&self) -> impl Iterator<Item = (&str, TensorKind, &Shape, &Initializer)> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            NodeKind::Variable {
                kind,
                shape,
                initializer,
            } => Some((node.name.as_str(), *kind, shape, initializer)),
            _ => None,
        })
    }

    pub fn has_srm(&self) -> bool {
        self.variables().any(|(_, kind, _, _)| kind == TensorKind::Srm)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.nodes.len() as u32);
        for node in &self.nodes {
            put_str(buf, &node.name);
            match &node.kind {
                NodeKind::Instance { shape } => {
                    buf.put_u8(0);
                    encode_shape(buf, shape);
                }
                NodeKind::Variable {
                    kind,
                    shape,
                    initializer,
                } => {
                    buf.put_u8(1);
                    buf.put_u8(*kind as u8);
                    encode_shape(buf, shape);
                    encode_initializer(buf, initializer);
                }
                NodeKind::Constant { shape, value } => {
                    buf.put_u8(2);
                    encode_shape(buf, shape);
                    buf.put_f64_le(*value);
                }
                NodeKind::Hidden { op, inputs } => {
                    buf.put_u8(3);
                    put_str(buf, op);
                    buf.put_u32_le(inputs.len() as u32);
                    for input in inputs {
                        put_str(buf, input);
                    }
                }
            }
        }
        buf.put_u32_le(self.targets.len() as u32);
        for target in &self.targets {
            put_str(buf, target);
        }
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        use crate::tensor::map::get_f64;

        let mut graph = Graph::new();
        let node_count = get_u32(bytes)?;
        for _ in 0..node_count {
            let name = get_str(bytes)?;
            let kind = match get_u8(bytes)? {
                0 => NodeKind::Instance {
                    shape: decode_shape(bytes)?,
                },
                1 => {
                    let kind = match get_u8(bytes)? {
                        1 => TensorKind::Tsr,
                        2 => TensorKind::Srm,
                        other => return Err(Error::UnknownKind(other)),
                    };
                    NodeKind::Variable {
                        kind,
                        shape: decode_shape(bytes)?,
                        initializer: decode_initializer(bytes)?,
                    }
                }
                2 => NodeKind::Constant {
                    shape: decode_shape(bytes)?,
                    value: get_f64(bytes)?,
                },
                3 => {
                    let op = get_str(bytes)?;
                    let input_count = get_u32(bytes)? as usize;
                    let mut inputs = Vec::with_capacity(input_count);
                    for _ in 0..input_count {
                        inputs.push(get_str(bytes)?);
                    }
                    NodeKind::Hidden { op, inputs }
                }
                other => return Err(Error::UnknownKind(other)),
            };
            graph.add_node(name, kind)?;
        }
        let target_count = get_u32(bytes)?;
        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            targets.push(get_str(bytes)?);
        }
        let refs: Vec<&str> = targets.iter().map(|t| t.as_str()).collect();
        graph.compile(&refs)?;
        Ok(graph)
    }
}
