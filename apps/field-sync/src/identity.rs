//! Identity collaborators: who is acting on this device, and how holders are
//! displayed to other volunteers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            display_name,
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Stable identifier of the signed-in volunteer, if any.
    fn current_actor(&self) -> Option<Actor>;
}

#[async_trait]
pub trait HolderDirectory: Send + Sync {
    /// Display names for the given holder ids. Unknown ids are omitted.
    async fn display_names(&self, holder_ids: &[String]) -> HashMap<String, String>;
}

/// Settable session identity for the device. Also remembers the display
/// names of every actor that signed in here.
#[derive(Default)]
pub struct SessionIdentity {
    current: RwLock<Option<Actor>>,
    known: RwLock<HashMap<String, String>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, actor: Actor) {
        if let Some(name) = &actor.display_name {
            self.remember(&actor.id, name);
        }
        *self.current.write() = Some(actor);
    }

    pub fn sign_out(&self) -> Option<Actor> {
        self.current.write().take()
    }

    pub fn remember(&self, holder_id: &str, display_name: &str) {
        self.known
            .write()
            .insert(holder_id.to_string(), display_name.to_string());
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_actor(&self) -> Option<Actor> {
        self.current
            .read()
            .clone()
            .filter(|actor| !actor.id.trim().is_empty())
    }
}

#[async_trait]
impl HolderDirectory for SessionIdentity {
    async fn display_names(&self, holder_ids: &[String]) -> HashMap<String, String> {
        let known = self.known.read();
        holder_ids
            .iter()
            .filter_map(|id| known.get(id).map(|name| (id.clone(), name.clone())))
            .collect()
    }
}

/// Fixed directory, handy when profiles are preloaded.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory(pub HashMap<String, String>);

#[async_trait]
impl HolderDirectory for StaticDirectory {
    async fn display_names(&self, holder_ids: &[String]) -> HashMap<String, String> {
        holder_ids
            .iter()
            .filter_map(|id| self.0.get(id).map(|name| (id.clone(), name.clone())))
            .collect()
    }
}

/// Asks each directory in turn, only for the ids still unnamed.
pub struct LayeredDirectory {
    layers: Vec<Arc<dyn HolderDirectory>>,
}

impl LayeredDirectory {
    pub fn new(layers: Vec<Arc<dyn HolderDirectory>>) -> Self {
        Self { layers }
    }
}

#[async_trait]
impl HolderDirectory for LayeredDirectory {
    async fn display_names(&self, holder_ids: &[String]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for layer in &self.layers {
            let missing: Vec<String> = holder_ids
                .iter()
                .filter(|id| !names.contains_key(*id))
                .cloned()
                .collect();
            if missing.is_empty() {
                break;
            }
            for (id, name) in layer.display_names(&missing).await {
                names.entry(id).or_insert(name);
            }
        }
        names
    }
}
