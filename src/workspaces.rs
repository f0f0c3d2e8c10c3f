use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::{ProKnowError, Result},
    fields, is_id, lock,
    requestor::route,
    ProKnow,
};

/// Workspaces of the organization.
///
/// The workspace list is memoized after the first query and dropped whenever a workspace is
/// created or deleted through this client.
#[derive(Clone, Debug)]
pub struct Workspaces {
    pk: ProKnow,
}

impl Workspaces {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Workspaces { pk }
    }

    fn invalidate(&self) {
        *lock(&self.pk.inner.workspaces) = None;
    }

    pub async fn create(&self, slug: &str, name: &str, protected: bool) -> Result<WorkspaceItem> {
        let workspace: Value = self
            .pk
            .requestor()
            .post("/workspaces")
            .json(&json!({ "slug": slug, "name": name, "protected": protected }))
            .fetch()
            .await?;
        self.invalidate();
        WorkspaceItem::new(self.pk.clone(), workspace)
    }

    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("workspaces", workspace_id))
            .send()
            .await?;
        self.invalidate();
        Ok(())
    }

    /// Returns the first workspace matching `predicate`.
    pub async fn find<F>(&self, predicate: F) -> Result<Option<WorkspaceItem>>
    where
        F: Fn(&WorkspaceItem) -> bool,
    {
        Ok(self.cached().await?.into_iter().find(|item| predicate(item)))
    }

    /// Finds a workspace by id (32 hexadecimal characters) or else by name.
    pub async fn resolve(&self, workspace: &str) -> Result<WorkspaceItem> {
        if is_id(workspace) {
            self.resolve_by_id(workspace).await
        } else {
            self.resolve_by_name(workspace).await
        }
    }

    /// Finds a workspace by name, ignoring case.
    pub async fn resolve_by_name(&self, name: &str) -> Result<WorkspaceItem> {
        let normalized = name.to_lowercase();
        self.find(|item| item.name.to_lowercase() == normalized)
            .await?
            .ok_or_else(|| {
                ProKnowError::WorkspaceLookup(format!("Workspace with name `{}` not found.", name))
            })
    }

    pub async fn resolve_by_id(&self, workspace_id: &str) -> Result<WorkspaceItem> {
        self.find(|item| item.id == workspace_id)
            .await?
            .ok_or_else(|| {
                ProKnowError::WorkspaceLookup(format!(
                    "Workspace with id `{}` not found.",
                    workspace_id
                ))
            })
    }

    /// Queries the workspaces, refreshing the memoized list.
    pub async fn query(&self) -> Result<Vec<WorkspaceItem>> {
        let workspaces: Vec<Value> = self.pk.requestor().get("/workspaces").fetch().await?;
        debug!("Fetched {} workspaces", workspaces.len());
        *lock(&self.pk.inner.workspaces) = Some(workspaces.clone());
        self.items(workspaces)
    }

    async fn cached(&self) -> Result<Vec<WorkspaceItem>> {
        let cached = lock(&self.pk.inner.workspaces).clone();
        match cached {
            Some(workspaces) => self.items(workspaces),
            None => self.query().await,
        }
    }

    fn items(&self, workspaces: Vec<Value>) -> Result<Vec<WorkspaceItem>> {
        workspaces
            .into_iter()
            .map(|workspace| WorkspaceItem::new(self.pk.clone(), workspace))
            .collect()
    }
}

#[derive(Deserialize)]
struct WorkspaceFields {
    id: String,
    slug: String,
    name: String,
    #[serde(default)]
    protected: bool,
}

/// A workspace. `slug`, `name` and `protected` are written back by [WorkspaceItem::save].
#[derive(Clone, Debug)]
pub struct WorkspaceItem {
    pk: ProKnow,
    id: String,
    data: Value,
    pub slug: String,
    pub name: String,
    pub protected: bool,
}

impl WorkspaceItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let WorkspaceFields {
            id,
            slug,
            name,
            protected,
        } = fields(&data)?;
        Ok(WorkspaceItem {
            pk,
            id,
            data,
            slug,
            name,
            protected,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn delete(&self) -> Result<()> {
        Workspaces::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let workspace: Value = self
            .pk
            .requestor()
            .patch(route!("workspaces", self.id))
            .json(&json!({ "slug": self.slug, "name": self.name, "protected": self.protected }))
            .fetch()
            .await?;
        *self = WorkspaceItem::new(self.pk.clone(), workspace)?;
        Workspaces::new(self.pk.clone()).invalidate();
        Ok(())
    }

    /// Marks the given entities as updated or not.
    pub async fn update_entities(&self, updated: bool, entity_ids: &[&str]) -> Result<()> {
        self.pk
            .requestor()
            .patch(route!("workspaces", self.id, "entities"))
            .json(&json!({ "updated": updated, "entities": entity_ids }))
            .send()
            .await?;
        Ok(())
    }
}
