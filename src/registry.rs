use std::collections::BTreeMap;

use crate::config::NodeParams;
use crate::worker::WorkerId;

/// Static connection parameters for the nodes a cluster should run on.
///
/// Blank fields of an added entry are filled from the registry's defaults, so
/// a cluster-wide user or exec root only has to be set once.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    defaults: NodeParams,
    params: BTreeMap<WorkerId, NodeParams>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: impl IntoIterator<Item = NodeParams>) -> Self {
        Self::with_defaults(NodeParams::default(), params)
    }

    /// Registry whose entries are completed from `defaults`.
    pub fn with_defaults(
        defaults: NodeParams,
        params: impl IntoIterator<Item = NodeParams>,
    ) -> Self {
        let mut registry = Self {
            defaults,
            params: BTreeMap::new(),
        };
        for p in params {
            registry.add(p);
        }
        registry
    }

    pub fn defaults(&self) -> &NodeParams {
        &self.defaults
    }

    pub fn defaults_mut(&mut self) -> &mut NodeParams {
        &mut self.defaults
    }

    pub fn set_defaults(&mut self, defaults: NodeParams) {
        self.defaults = defaults;
    }

    /// Add or replace an entry. Returns the previous entry for the same id.
    pub fn add(&mut self, mut params: NodeParams) -> Option<NodeParams> {
        let d = &self.defaults;
        if params.user.is_empty() {
            params.user = d.user.clone();
        }
        if params.shell.is_empty() {
            params.shell = d.shell.clone();
        }
        if params.exec_root.is_empty() {
            params.exec_root = d.exec_root.clone();
        }
        if params.file_root.is_empty() {
            params.file_root = d.file_root.clone();
        }
        if params.port == 0 {
            params.port = d.port;
        }
        if params.threads == 0 {
            params.threads = d.threads;
        }
        self.params.insert(params.id, params)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<NodeParams> {
        self.params.remove(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&NodeParams> {
        self.params.get(&id)
    }

    pub fn params(&self) -> impl Iterator<Item = &NodeParams> {
        self.params.values()
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
