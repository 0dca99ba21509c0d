use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::domain::policy::ApproverRule;
use crate::domain::{normalize_key, WorkspaceId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("hierarchy directory unavailable for workspace `{workspace_id}`: {reason}")]
    Unavailable { workspace_id: WorkspaceId, reason: String },
    #[error("unknown hierarchy level `{0}`")]
    UnknownLevel(String),
}

/// Read-only view of the organisational directory. Implementations are owned by the host
/// platform; the engine never writes through this port.
pub trait HierarchyResolver: Send + Sync {
    /// Users who may act for `rule` in `workspace_id`. Hierarchy rules include every member at
    /// the named level or above.
    fn resolve_approvers(
        &self,
        workspace_id: &WorkspaceId,
        rule: &ApproverRule,
    ) -> Result<BTreeSet<String>, HierarchyError>;

    fn parent_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<WorkspaceId>, HierarchyError>;
}

impl<T> HierarchyResolver for Arc<T>
where
    T: HierarchyResolver + ?Sized,
{
    fn resolve_approvers(
        &self,
        workspace_id: &WorkspaceId,
        rule: &ApproverRule,
    ) -> Result<BTreeSet<String>, HierarchyError> {
        (**self).resolve_approvers(workspace_id, rule)
    }

    fn parent_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<WorkspaceId>, HierarchyError> {
        (**self).parent_workspace(workspace_id)
    }
}

#[derive(Clone, Debug)]
struct Membership {
    user_id: String,
    level_rank: usize,
    roles: HashSet<String>,
}

/// Directory held in memory, used by tests and by single-node deployments that load the
/// organisation chart at startup.
#[derive(Clone, Debug, Default)]
pub struct InMemoryHierarchyDirectory {
    levels: Vec<String>,
    members: HashMap<String, Vec<Membership>>,
    parents: HashMap<String, WorkspaceId>,
    unavailable: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryHierarchyDirectory {
    /// `levels` is ordered from the most junior to the most senior.
    pub fn with_levels<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            levels: levels.into_iter().map(|level| normalize_key(level.as_ref())).collect(),
            ..Self::default()
        }
    }

    pub fn with_member<I, S>(
        mut self,
        workspace_id: &str,
        user_id: &str,
        level: &str,
        roles: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let level_key = normalize_key(level);
        let level_rank = self.levels.iter().position(|known| *known == level_key).unwrap_or(0);
        self.members.entry(normalize_key(workspace_id)).or_default().push(Membership {
            user_id: user_id.trim().to_string(),
            level_rank,
            roles: roles.into_iter().map(|role| normalize_key(role.as_ref())).collect(),
        });
        self
    }

    pub fn with_parent(mut self, workspace_id: &str, parent_workspace_id: &str) -> Self {
        self.parents.insert(
            normalize_key(workspace_id),
            WorkspaceId(parent_workspace_id.trim().to_string()),
        );
        self
    }

    pub fn set_unavailable(&self, workspace_id: &WorkspaceId, unavailable: bool) {
        let key = normalize_key(&workspace_id.0);
        let mut guard = match self.unavailable.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if unavailable {
            guard.insert(key);
        } else {
            guard.remove(&key);
        }
    }

    fn ensure_available(&self, workspace_id: &WorkspaceId) -> Result<(), HierarchyError> {
        let guard = match self.unavailable.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.contains(&normalize_key(&workspace_id.0)) {
            return Err(HierarchyError::Unavailable {
                workspace_id: workspace_id.clone(),
                reason: "directory marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl HierarchyResolver for InMemoryHierarchyDirectory {
    fn resolve_approvers(
        &self,
        workspace_id: &WorkspaceId,
        rule: &ApproverRule,
    ) -> Result<BTreeSet<String>, HierarchyError> {
        self.ensure_available(workspace_id)?;
        let members = self.members.get(&normalize_key(&workspace_id.0));
        let members = members.map(Vec::as_slice).unwrap_or_default();

        let resolved = match rule {
            ApproverRule::Role { required_role } => {
                let role = normalize_key(required_role);
                members
                    .iter()
                    .filter(|member| member.roles.contains(&role))
                    .map(|member| member.user_id.clone())
                    .collect()
            }
            ApproverRule::Hierarchy { hierarchy_level } => {
                let level = normalize_key(hierarchy_level);
                let Some(minimum_rank) = self.levels.iter().position(|known| *known == level)
                else {
                    return Err(HierarchyError::UnknownLevel(hierarchy_level.clone()));
                };
                members
                    .iter()
                    .filter(|member| member.level_rank >= minimum_rank)
                    .map(|member| member.user_id.clone())
                    .collect()
            }
        };

        Ok(resolved)
    }

    fn parent_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<WorkspaceId>, HierarchyError> {
        self.ensure_available(workspace_id)?;
        Ok(self.parents.get(&normalize_key(&workspace_id.0)).cloned())
    }
}
