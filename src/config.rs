use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, VmssError};
use crate::target::NodeTarget;
use crate::vmss::MachineCoordinate;

const CONFIG_DIR_NAME: &str = ".vmss-exec";
const CONFIG_FILENAME: &str = "config.yaml";

static EMPTY_ENTRY: NodeEntry = NodeEntry {
    node: None,
    id: None,
    subscription: None,
    node_resource_group: None,
    vmss: None,
    instance_id: None,
};

/// Node settings stored in the config file, either under `nodes.<name>` or
/// unscoped at the top level.
///
/// Entries written by this tool hold exactly one node form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmss: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_integer"
    )]
    pub instance_id: Option<String>,
}

/// Hand-written files often carry `instance-id: 0` unquoted.
fn string_or_integer<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(u64),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|value| match value {
        Scalar::Text(text) => text,
        Scalar::Integer(n) => n.to_string(),
    }))
}

impl NodeEntry {
    /// Cached coordinates, if this entry holds all four VMSS fields.
    pub fn coordinate(&self) -> Option<MachineCoordinate> {
        MachineCoordinate::new(
            self.subscription.clone()?,
            self.node_resource_group.clone()?,
            self.vmss.clone()?,
            self.instance_id.clone()?,
        )
        .ok()
    }

    pub fn is_empty(&self) -> bool {
        self == &EMPTY_ENTRY
    }
}

impl From<&NodeTarget> for NodeEntry {
    fn from(target: &NodeTarget) -> Self {
        match target {
            NodeTarget::Name(name) => NodeEntry {
                node: Some(name.clone()),
                ..Default::default()
            },
            NodeTarget::ResourceId(id) => NodeEntry {
                id: Some(id.clone()),
                ..Default::default()
            },
            NodeTarget::ScaleSet(vm) => NodeEntry::from(vm),
        }
    }
}

impl From<&MachineCoordinate> for NodeEntry {
    fn from(vm: &MachineCoordinate) -> Self {
        NodeEntry {
            subscription: Some(vm.subscription_id().to_string()),
            node_resource_group: Some(vm.resource_group().to_string()),
            vmss: Some(vm.scale_set().to_string()),
            instance_id: Some(vm.instance_id().to_string()),
            ..Default::default()
        }
    }
}

/// Immutable snapshot of the persisted configuration.
///
/// Mutations return a new snapshot; nothing is written until the snapshot is
/// handed to [`ConfigStore::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_node: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    nodes: BTreeMap<String, NodeEntry>,
    #[serde(flatten)]
    defaults: NodeEntry,
}

impl ConfigFile {
    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn node(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeEntry> {
        &self.nodes
    }

    /// Unscoped node settings at the top level of the file.
    pub fn defaults(&self) -> &NodeEntry {
        &self.defaults
    }

    /// Settings that apply when no flag or environment variable is given:
    /// the current node's entry when one is selected, the unscoped keys otherwise.
    pub fn active_scope(&self) -> &NodeEntry {
        match self.current_node.as_deref() {
            Some(current) => self.nodes.get(current).unwrap_or_else(|| {
                tracing::warn!(node = current, "current node has no entry in the config");
                &EMPTY_ENTRY
            }),
            None => &self.defaults,
        }
    }

    /// Replace the entry for `name`, dropping whatever form it held before.
    pub fn with_node(mut self, name: &str, entry: NodeEntry) -> Self {
        self.nodes.insert(name.to_string(), entry);
        self
    }

    /// Drop the entry for `name`, and the current-node selection if it
    /// pointed there.
    pub fn without_node(mut self, name: &str) -> Self {
        self.nodes.remove(name);
        if self.current_node.as_deref() == Some(name) {
            self.current_node = None;
        }
        self
    }

    /// Select `name` as the current node. The node must have an entry.
    pub fn with_current_node(mut self, name: &str) -> Result<Self> {
        if !self.nodes.contains_key(name) {
            return Err(VmssError::Config(format!("node {name:?} not found")));
        }
        self.current_node = Some(name.to_string());
        Ok(self)
    }

    pub fn without_current_node(mut self) -> Self {
        self.current_node = None;
        self
    }
}

/// Directory holding the config file: `~/.vmss-exec`, or `./.vmss-exec` when
/// the home directory cannot be determined.
pub fn config_dir() -> PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| {
        tracing::warn!("could not determine home directory, using current directory for config");
        PathBuf::from(".")
    });
    base.join(CONFIG_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILENAME)
}

/// YAML file backing [`ConfigFile`].
///
/// Writes go through a temporary file in the same directory followed by a
/// rename, so readers never observe a partial file. Concurrent writers are
/// last-writer-wins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. A missing or empty file is an empty config.
    pub fn load(&self) -> Result<ConfigFile> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ConfigFile::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(ConfigFile::default());
        }
        let cfg = serde_yaml::from_str(&content).map_err(|e| {
            VmssError::Config(format!("parsing {}: {e}", self.path.display()))
        })?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &ConfigFile) -> Result<()> {
        let body = serde_yaml::to_string(cfg)?;
        write_private_file(&self.path, body.as_bytes())?;
        tracing::debug!(path = %self.path.display(), "config written");
        Ok(())
    }

    /// Load, transform and persist in one step so unrelated keys survive.
    pub fn update<F>(&self, change: F) -> Result<ConfigFile>
    where
        F: FnOnce(ConfigFile) -> Result<ConfigFile>,
    {
        let updated = change(self.load()?)?;
        self.save(&updated)?;
        Ok(updated)
    }

    /// Raw file content, or an empty string when there is no file.
    pub fn raw(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the file. A missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replace `path` atomically with `contents`. The file is readable by its
/// owner only, and missing parent directories are created with mode 0700.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    create_private_dir(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    Ok(())
}
