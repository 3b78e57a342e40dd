use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a member in the database cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServerGroup {
    /// Quorum participant of the agency.
    Agents,
    /// Standalone server.
    Single,
    /// Data-server holding shards.
    DbServers,
    /// Stateless query coordinator.
    Coordinators,
}

impl ServerGroup {
    /// All groups, in the order members are inspected.
    pub const ALL: [ServerGroup; 4] = [
        ServerGroup::Agents,
        ServerGroup::Single,
        ServerGroup::DbServers,
        ServerGroup::Coordinators,
    ];

    /// Role name as used in pod labels.
    pub fn as_role(&self) -> &'static str {
        match self {
            ServerGroup::Agents => "agent",
            ServerGroup::Single => "single",
            ServerGroup::DbServers => "dbserver",
            ServerGroup::Coordinators => "coordinator",
        }
    }

    /// Parse a role label.
    pub fn from_role(role: &str) -> Option<Self> {
        match role {
            "agent" => Some(ServerGroup::Agents),
            "single" => Some(ServerGroup::Single),
            "dbserver" => Some(ServerGroup::DbServers),
            "coordinator" => Some(ServerGroup::Coordinators),
            _ => None,
        }
    }

    /// Prefix of generated member IDs.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ServerGroup::Agents => "AGNT",
            ServerGroup::Single => "SNGL",
            ServerGroup::DbServers => "PRMR",
            ServerGroup::Coordinators => "CRDN",
        }
    }

    /// Members of this group can be reclaimed when they vanish from the
    /// cluster health view.
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, ServerGroup::DbServers | ServerGroup::Coordinators)
    }

    /// A member of this group may be rebuilt from an empty volume.
    pub fn can_rebuild_from_empty_volume(&self) -> bool {
        matches!(self, ServerGroup::Agents)
    }
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_role())
    }
}
