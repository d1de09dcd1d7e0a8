//! Discovery of the gateway's capability tree
//!
//! Starting from a fixed list of well-known roots, every `refEnum`
//! capability is expanded depth first along its `references`, everything
//! else becomes a leaf. A forbidden path becomes a leaf instead of
//! aborting the crawl, a partially locked down device still yields a
//! complete tree.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value as Json;
use tracing::debug;

use crate::constants::{FIRMWARE_PATH, MAX_TREE_DEPTH, WELL_KNOWN_ROOTS};
use crate::device::KM200;
use crate::error::KM200Error;

/// Leaf types the gateway is known to declare.
const VALUE_TYPES: [&str; 7] = [
    "stringValue",
    "floatValue",
    "systeminfo",
    "arrayData",
    "switchProgram",
    "errorList",
    "yRecording",
];

/// One discovered capability of the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// A directory of child capabilities, in document order.
    RefEnum { path: String, children: Vec<Endpoint> },

    /// A terminal capability exposing a literal value and metadata flags.
    Value {
        path: String,
        value_type: String,
        value: String,
        allowed_values: Option<String>,
        writeable: bool,
        recordable: bool,
        body: String,
    },

    /// The device refused access to this path.
    Forbidden { path: String },

    /// A declared type this client does not know, kept with its raw body.
    Unknown {
        path: String,
        value_type: String,
        body: String,
    },
}

impl Endpoint {
    pub fn path(&self) -> &str {
        match self {
            Endpoint::RefEnum { path, .. } => path,
            Endpoint::Value { path, .. } => path,
            Endpoint::Forbidden { path } => path,
            Endpoint::Unknown { path, .. } => path,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::RefEnum { path, .. } => write!(f, "{path} [refEnum]"),
            Endpoint::Value {
                path,
                value_type,
                value,
                allowed_values,
                writeable,
                recordable,
                ..
            } => {
                let mut flags = String::new();
                if *writeable {
                    flags.push('w');
                }
                if *recordable {
                    flags.push('r');
                }
                write!(f, "{path} [{value_type}][{flags}]: {value}")?;
                if let Some(allowed) = allowed_values {
                    write!(f, " {allowed}")?;
                }
                Ok(())
            }
            Endpoint::Forbidden { path } => write!(f, "{path} [forbidden]"),
            Endpoint::Unknown { path, value_type, .. } => {
                write!(f, "{path} [unknown {value_type}]")
            }
        }
    }
}

/// The capability tree discovered by one crawl.
///
/// Produced fresh on every build, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointTree {
    pub roots: Vec<Endpoint>,
}

impl EndpointTree {
    /// Crawl the gateway starting from the well-known roots.
    ///
    /// Checks the client's cancellation token before every expansion.
    /// Forbidden paths become [`Endpoint::Forbidden`] leaves, every other
    /// failure aborts the whole crawl.
    pub async fn build(km200: &KM200) -> Result<Self, KM200Error> {
        let mut roots = Vec::with_capacity(WELL_KNOWN_ROOTS.len());
        for path in WELL_KNOWN_ROOTS {
            roots.push(traverse(km200, path.to_string(), 0).await?);
        }
        Ok(Self { roots })
    }

    /// All terminal nodes in document order.
    pub fn leaves(&self) -> Vec<&Endpoint> {
        let mut leaves = Vec::new();
        for root in &self.roots {
            collect_leaves(root, &mut leaves);
        }
        leaves
    }
}

fn collect_leaves<'a>(node: &'a Endpoint, leaves: &mut Vec<&'a Endpoint>) {
    match node {
        Endpoint::RefEnum { children, .. } => {
            for child in children {
                collect_leaves(child, leaves);
            }
        }
        leaf => leaves.push(leaf),
    }
}

// The protocol describes a finite acyclic graph, but a broken device must
// not send the crawler into unbounded recursion. The depth counter is the
// explicit guard, async recursion needs the boxing anyway.
fn traverse<'a>(
    km200: &'a KM200,
    path: String,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<Endpoint, KM200Error>> + Send + 'a>> {
    Box::pin(async move {
        if km200.is_cancelled() {
            return Err(KM200Error::Cancelled);
        }
        if depth > MAX_TREE_DEPTH {
            return Err(KM200Error::TreeDepthExceeded {
                path,
                limit: MAX_TREE_DEPTH,
            });
        }

        debug!("Expanding {path}");
        let body = match km200.query(&path).await {
            Ok(body) => body,
            Err(KM200Error::Forbidden { .. }) => return Ok(Endpoint::Forbidden { path }),
            Err(error) => return Err(error),
        };

        if path == FIRMWARE_PATH {
            return Ok(Endpoint::Value {
                path,
                value_type: "firmware".to_string(),
                value: "firmware".to_string(),
                allowed_values: None,
                writeable: false,
                recordable: false,
                body: "firmware".to_string(),
            });
        }

        let document: Json = serde_json::from_str(&body)?;
        let declared = document.get("type").and_then(Json::as_str).unwrap_or("");

        if declared == "refEnum" {
            let references = document
                .get("references")
                .and_then(Json::as_array)
                .ok_or_else(|| {
                    KM200Error::Protocol(format!("{path} declares refEnum without references"))
                })?;

            let mut children = Vec::with_capacity(references.len());
            for reference in references {
                let child = reference
                    .get("id")
                    .and_then(Json::as_str)
                    .ok_or_else(|| {
                        KM200Error::Protocol(format!("Reference below {path} has no id"))
                    })?;
                children.push(traverse(km200, child.to_string(), depth + 1).await?);
            }
            return Ok(Endpoint::RefEnum { path, children });
        }

        if VALUE_TYPES.contains(&declared) {
            let value = match (document.get("value"), document.get("values")) {
                (Some(Json::String(s)), _) => s.clone(),
                (Some(other), _) => other.to_string(),
                (None, Some(values)) => values.to_string(),
                (None, None) => document.to_string(),
            };
            let allowed_values = document.get("allowedValues").map(Json::to_string);

            return Ok(Endpoint::Value {
                path,
                value_type: declared.to_string(),
                value,
                allowed_values,
                writeable: flag(&document, "writeable"),
                recordable: flag(&document, "recordable"),
                body,
            });
        }

        Ok(Endpoint::Unknown {
            path,
            value_type: declared.to_string(),
            body,
        })
    })
}

/// Metadata flags arrive as JSON booleans or as 0/1 numbers.
fn flag(document: &Json, name: &str) -> bool {
    match document.get(name) {
        Some(Json::Bool(b)) => *b,
        Some(Json::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}
