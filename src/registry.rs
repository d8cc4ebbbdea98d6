//! Host-wide capability catalog.
//!
//! The registry is an arena: every connected server gets a fresh opaque
//! `ServerId` that is never reused, so a server that disconnects and comes
//! back cannot be confused with its earlier incarnation. Lookups always key
//! on `(ServerId, kind, name)`; there is deliberately no bare-name lookup, so
//! a capability can never be resolved without first naming its owner.
//! Capability names only need to be unique within one server and kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque stable handle for one connected server. Assigned at connect time,
/// immutable, never inferred from capability names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "srv-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// One declared capability, as exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub kind: CapabilityKind,
    /// Unique within the owning server and kind, not globally.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema for tools and prompt templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Access handle for resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Default)]
struct ServerEntry {
    name: String,
    capabilities: HashMap<(CapabilityKind, String), Capability>,
}

/// Aggregated catalog of everything connected servers expose.
#[derive(Default)]
pub struct CapabilityRegistry {
    next_id: u64,
    servers: HashMap<ServerId, ServerEntry>,
    version: u64,
}

impl CapabilityRegistry {
    /// Admits a server and hands out its arena handle. Handles are monotonic
    /// and never reused, even for a server reconnecting under the same name.
    pub fn register_server(&mut self, name: &str) -> ServerId {
        let id = ServerId(self.next_id);
        self.next_id += 1;
        self.servers.insert(
            id,
            ServerEntry {
                name: name.to_string(),
                capabilities: HashMap::new(),
            },
        );
        self.version += 1;
        id
    }

    /// Replaces a server's declarations wholesale, as happens on negotiation
    /// and on an explicit change notification.
    pub fn replace_capabilities(&mut self, id: ServerId, declarations: Vec<Capability>) {
        if let Some(entry) = self.servers.get_mut(&id) {
            entry.capabilities = declarations
                .into_iter()
                .map(|capability| ((capability.kind, capability.name.clone()), capability))
                .collect();
            self.version += 1;
        }
    }

    /// Drops every entry owned by a server. Called on disconnect; no other
    /// server's entries are touched.
    pub fn remove_server(&mut self, id: ServerId) {
        if self.servers.remove(&id).is_some() {
            self.version += 1;
        }
    }

    pub fn server_name(&self, id: ServerId) -> Option<&str> {
        self.servers.get(&id).map(|entry| entry.name.as_str())
    }

    /// Resolves one capability of one server. The only lookup the registry
    /// offers; callers wanting discovery go through [`enumerate`].
    ///
    /// [`enumerate`]: CapabilityRegistry::enumerate
    pub fn lookup(&self, id: ServerId, kind: CapabilityKind, name: &str) -> Option<&Capability> {
        self.servers
            .get(&id)?
            .capabilities
            .get(&(kind, name.to_string()))
    }

    /// Finds the resource of a server addressed by its access handle.
    pub fn lookup_resource(&self, id: ServerId, uri: &str) -> Option<&Capability> {
        self.servers.get(&id)?.capabilities.values().find(
            |capability| matches!(capability.kind, CapabilityKind::Resource if capability.uri.as_deref() == Some(uri)),
        )
    }

    /// All capabilities of one kind across servers, tagged by owner so
    /// identically-named entries stay distinguishable.
    pub fn enumerate(&self, kind: CapabilityKind) -> Vec<(ServerId, &str, &Capability)> {
        let mut entries: Vec<(ServerId, &str, &Capability)> = self
            .servers
            .iter()
            .flat_map(|(id, entry)| {
                entry
                    .capabilities
                    .values()
                    .filter(move |capability| capability.kind == kind)
                    .map(move |capability| (*id, entry.name.as_str(), capability))
            })
            .collect();
        entries.sort_by(|a, b| (a.0, &a.2.name).cmp(&(b.0, &b.2.name)));
        entries
    }

    /// Snapshot counter; bumps on every mutation so dispatchers can detect a
    /// stale view cheaply.
    pub fn version(&self) -> u64 {
        self.version
    }
}
