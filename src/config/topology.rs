use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Property key prefix shared by every gateway setting.
pub const KEY_PREFIX: &str = "yfs.gateway.";

/// Identity and network address of one cluster participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub ip: String,
    pub socket_port: u16,
}

/// Validated cluster layout parsed from the flat properties map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Id of the node this process runs as.
    pub local: String,
    /// Absolute, or home-relative, base directory for cluster metadata.
    pub metadata_dir: String,
    /// All cluster nodes, in index order.
    pub nodes: Vec<NodeDescriptor>,
}

impl ClusterTopology {
    /// Parses the indexed-key schema into a typed topology. Every defect is
    /// fatal: index gaps, missing fields and coercion failures all refuse to
    /// produce a partial result.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let count = node_count(props)?;
        let local = get_string(props, "local")?;
        let metadata_dir = get_string(props, "metadataDir")?;

        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            nodes.push(NodeDescriptor {
                id: get_string(props, &format!("node[{i}].id"))?,
                ip: get_string(props, &format!("node[{i}].ip"))?,
                socket_port: get_port(props, &format!("node[{i}].socket_port"))?,
            });
        }

        Ok(Self {
            local,
            metadata_dir,
            nodes,
        })
    }

    /// All configured nodes in index order. Seeds initial discovery and
    /// includes the local node.
    pub fn bootstrap_nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    /// The descriptor whose id equals `local`. Zero or multiple matches is a
    /// configuration error, not a silently unset identity.
    pub fn local_node(&self) -> Result<&NodeDescriptor, ConfigError> {
        let matches: Vec<&NodeDescriptor> =
            self.nodes.iter().filter(|n| n.id == self.local).collect();
        match matches.as_slice() {
            [node] => Ok(*node),
            other => Err(ConfigError::LocalNodeUnresolved {
                local: self.local.clone(),
                matches: other.len(),
            }),
        }
    }

    /// Per-node metadata directory: `<metadataDir>/<local>` when the
    /// configured path is absolute, `<home>/<metadataDir>/<local>` otherwise.
    pub fn metadata_path(&self) -> PathBuf {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        self.metadata_path_from(&home)
    }

    pub fn metadata_path_from(&self, home: &Path) -> PathBuf {
        let dir = Path::new(&self.metadata_dir);
        if dir.is_absolute() {
            dir.join(&self.local)
        } else {
            home.join(dir).join(&self.local)
        }
    }
}

fn index_re() -> &'static Regex {
    static INDEX_RE: OnceLock<Regex> = OnceLock::new();
    INDEX_RE.get_or_init(|| Regex::new(r"\[(\d+)\]").unwrap())
}

/// Scans every key for `[<i>]` segments and validates that the indices cover
/// `0..count` without gaps. A gap means an operator skipped a slot and the
/// cluster would come up undersized.
fn node_count(props: &HashMap<String, String>) -> Result<usize, ConfigError> {
    let mut seen = BTreeSet::new();
    for key in props.keys() {
        if let Some(caps) = index_re().captures(key) {
            let idx: usize = caps[1].parse().map_err(|_| ConfigError::InvalidValue {
                key: key.clone(),
                value: caps[1].to_string(),
                expected: "node index",
            })?;
            seen.insert(idx);
        }
    }
    for i in 0..seen.len() {
        if !seen.contains(&i) {
            return Err(ConfigError::NonContiguousIndex { missing: i });
        }
    }
    Ok(seen.len())
}

fn get_string(props: &HashMap<String, String>, field: &str) -> Result<String, ConfigError> {
    let key = format!("{KEY_PREFIX}{field}");
    props
        .get(&key)
        .cloned()
        .ok_or(ConfigError::MissingField(key))
}

fn get_port(props: &HashMap<String, String>, field: &str) -> Result<u16, ConfigError> {
    let key = format!("{KEY_PREFIX}{field}");
    let value = props
        .get(&key)
        .ok_or_else(|| ConfigError::MissingField(key.clone()))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        expected: "port number",
    })
}
