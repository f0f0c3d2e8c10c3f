use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::Result, fields, patients::PatientItem, requestor::route, scorecards::Scorecards,
    ProKnow,
};

/// Collections of patients, either scoped to one workspace or to the whole organization.
#[derive(Clone, Debug)]
pub struct Collections {
    pk: ProKnow,
}

impl Collections {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Collections { pk }
    }

    /// Creates a collection. `collection_type` is `"workspace"` or `"organization"`; a workspace
    /// collection takes exactly one workspace id.
    pub async fn create(
        &self,
        name: &str,
        description: &str,
        collection_type: &str,
        workspaces: &[&str],
    ) -> Result<CollectionItem> {
        let collection: Value = self
            .pk
            .requestor()
            .post("/collections")
            .json(&json!({
                "name": name,
                "description": description,
                "type": collection_type,
                "workspaces": workspaces,
            }))
            .fetch()
            .await?;
        CollectionItem::new(self.pk.clone(), collection)
    }

    pub async fn delete(&self, collection_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("collections", collection_id))
            .send()
            .await?;
        Ok(())
    }

    pub async fn find<F>(&self, workspace: Option<&str>, predicate: F) -> Result<Option<CollectionSummary>>
    where
        F: Fn(&CollectionSummary) -> bool,
    {
        Ok(self
            .query(workspace)
            .await?
            .into_iter()
            .find(|item| predicate(item)))
    }

    pub async fn get(&self, collection_id: &str, workspace_id: Option<&str>) -> Result<CollectionItem> {
        let mut request = self.pk.requestor().get(route!("collections", collection_id));
        if let Some(workspace_id) = workspace_id {
            request = request.query("workspace", workspace_id);
        }
        let collection: Value = request.fetch().await?;
        CollectionItem::new(self.pk.clone(), collection)
    }

    /// Lists the collections, or only those visible from `workspace` (an id or a name).
    pub async fn query(&self, workspace: Option<&str>) -> Result<Vec<CollectionSummary>> {
        let workspace_id = match workspace {
            Some(workspace) => Some(self.pk.workspaces().resolve(workspace).await?.id().to_string()),
            None => None,
        };
        let mut request = self.pk.requestor().get("/collections");
        if let Some(workspace_id) = &workspace_id {
            request = request.query("workspace", workspace_id);
        }
        let collections: Vec<Value> = request.fetch().await?;
        collections
            .into_iter()
            .map(|collection| CollectionSummary::new(self.pk.clone(), collection, workspace_id.clone()))
            .collect()
    }
}

#[derive(Deserialize)]
struct CollectionFields {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Clone, Debug)]
pub struct CollectionSummary {
    pk: ProKnow,
    id: String,
    name: String,
    description: String,
    data: Value,
    workspace_id: Option<String>,
}

impl CollectionSummary {
    fn new(pk: ProKnow, data: Value, workspace_id: Option<String>) -> Result<Self> {
        let CollectionFields {
            id,
            name,
            description,
        } = fields(&data)?;
        Ok(CollectionSummary {
            pk,
            id,
            name,
            description,
            data,
            workspace_id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<CollectionItem> {
        Collections::new(self.pk.clone())
            .get(&self.id, self.workspace_id.as_deref())
            .await
    }
}

#[derive(Clone, Debug)]
pub struct CollectionItem {
    pk: ProKnow,
    id: String,
    data: Value,
    pub name: String,
    pub description: String,
}

impl CollectionItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let CollectionFields {
            id,
            name,
            description,
        } = fields(&data)?;
        Ok(CollectionItem {
            pk,
            id,
            data,
            name,
            description,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn patients(&self) -> CollectionPatients {
        CollectionPatients {
            pk: self.pk.clone(),
            collection_id: self.id.clone(),
            data: self.data.clone(),
        }
    }

    pub fn scorecards(&self) -> Scorecards {
        Scorecards::new(self.pk.clone(), &route!("collections", self.id))
    }

    pub async fn delete(&self) -> Result<()> {
        Collections::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let collection: Value = self
            .pk
            .requestor()
            .put(route!("collections", self.id))
            .json(&json!({ "name": self.name, "description": self.description }))
            .fetch()
            .await?;
        *self = CollectionItem::new(self.pk.clone(), collection)?;
        Ok(())
    }
}

/// Patients of a collection.
#[derive(Clone, Debug)]
pub struct CollectionPatients {
    pk: ProKnow,
    collection_id: String,
    data: Value,
}

impl CollectionPatients {
    /// Adds patients of `workspace`. Each item is `{"patient": id, "entity": id | null}`.
    pub async fn add(&self, workspace: &str, items: &[Value]) -> Result<()> {
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        self.pk
            .requestor()
            .put(route!("collections", self.collection_id, "workspaces", workspace.id(), "patients"))
            .json(items)
            .send()
            .await?;
        Ok(())
    }

    pub async fn remove(&self, workspace: &str, items: &[Value]) -> Result<()> {
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        self.pk
            .requestor()
            .delete(route!("collections", self.collection_id, "workspaces", workspace.id(), "patients"))
            .json(items)
            .send()
            .await?;
        Ok(())
    }

    /// Lists every patient of the collection, following the server pagination.
    pub async fn query(&self) -> Result<Vec<CollectionPatientSummary>> {
        let mut query = Vec::new();
        if self.data["type"] != "organization" {
            if let Some(workspace_id) = self.data["workspaces"][0].as_str() {
                query.push(("workspace".to_string(), workspace_id.to_string()));
            }
        }

        let mut patients = Vec::new();
        loop {
            let response = self
                .pk
                .requestor()
                .get(route!("collections", self.collection_id, "patients"))
                .query_pairs(&query)
                .send()
                .await?;
            let page: Vec<Value> = response.json()?;
            patients.extend(page);
            match (response.header("proknow-has-more"), response.header("proknow-next")) {
                (Some("true"), Some(next)) => {
                    query.retain(|(key, _)| key != "next");
                    query.push(("next".to_string(), next.to_string()));
                }
                _ => break,
            }
        }

        patients
            .into_iter()
            .map(|patient| CollectionPatientSummary::new(self.pk.clone(), patient))
            .collect()
    }
}

#[derive(Deserialize)]
struct Reference {
    id: String,
}

#[derive(Deserialize)]
struct PatientEntryFields {
    patient: Reference,
    entity: Option<Reference>,
    workspace: Reference,
}

/// A patient of a collection, optionally narrowed to one of its entities.
#[derive(Clone, Debug)]
pub struct CollectionPatientSummary {
    pk: ProKnow,
    id: String,
    entity_id: Option<String>,
    workspace_id: String,
    data: Value,
}

impl CollectionPatientSummary {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let PatientEntryFields {
            patient,
            entity,
            workspace,
        } = fields(&data)?;
        Ok(CollectionPatientSummary {
            pk,
            id: patient.id,
            entity_id: entity.map(|entity| entity.id),
            workspace_id: workspace.id,
            data,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<PatientItem> {
        self.pk.patients().get(&self.workspace_id, &self.id).await
    }
}
