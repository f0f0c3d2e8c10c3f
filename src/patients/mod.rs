pub mod entities;
pub mod structure_sets;

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    error::{ProKnowError, Result},
    fields,
    requestor::route,
    scorecards::Scorecards,
    uploads::UploadBatch,
    ProKnow,
};
use entities::EntitySummary;

/// Patients of the workspaces.
#[derive(Clone, Debug)]
pub struct Patients {
    pk: ProKnow,
}

impl Patients {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Patients { pk }
    }

    /// Creates a patient in `workspace` (an id or a name). `birth_date` is `YYYY-MM-DD` and `sex`
    /// one of `M`, `F` or `O`.
    pub async fn create(
        &self,
        workspace: &str,
        mrn: &str,
        name: &str,
        birth_date: Option<&str>,
        sex: Option<&str>,
    ) -> Result<PatientItem> {
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        let patient: Value = self
            .pk
            .requestor()
            .post(route!("workspaces", workspace.id(), "patients"))
            .json(&json!({ "mrn": mrn, "name": name, "birth_date": birth_date, "sex": sex }))
            .fetch()
            .await?;
        PatientItem::new(self.pk.clone(), workspace.id(), patient)
    }

    pub async fn delete(&self, workspace_id: &str, patient_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("workspaces", workspace_id, "patients", patient_id))
            .send()
            .await?;
        Ok(())
    }

    pub async fn find<F>(&self, workspace: &str, predicate: F) -> Result<Option<PatientSummary>>
    where
        F: Fn(&PatientSummary) -> bool,
    {
        Ok(self
            .query(workspace, None)
            .await?
            .into_iter()
            .find(|item| predicate(item)))
    }

    pub async fn get(&self, workspace_id: &str, patient_id: &str) -> Result<PatientItem> {
        let patient: Value = self
            .pk
            .requestor()
            .get(route!("workspaces", workspace_id, "patients", patient_id))
            .fetch()
            .await?;
        PatientItem::new(self.pk.clone(), workspace_id, patient)
    }

    /// Looks up patients by MRN. The result has one entry per MRN, `None` when no patient has it.
    pub async fn lookup(&self, workspace: &str, mrns: &[&str]) -> Result<Vec<Option<PatientSummary>>> {
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        let patients: Vec<Option<Value>> = self
            .pk
            .requestor()
            .post(route!("workspaces", workspace.id(), "patients", "lookup"))
            .json(mrns)
            .fetch()
            .await?;
        patients
            .into_iter()
            .map(|patient| {
                patient
                    .map(|patient| PatientSummary::new(self.pk.clone(), workspace.id(), patient))
                    .transpose()
            })
            .collect()
    }

    /// Lists the patients of `workspace`, optionally filtered by a search string, following the
    /// server pagination.
    pub async fn query(&self, workspace: &str, search: Option<&str>) -> Result<Vec<PatientSummary>> {
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        let mut query = Vec::new();
        if let Some(search) = search {
            query.push(("search".to_string(), search.to_string()));
        }

        let mut patients = Vec::new();
        loop {
            let response = self
                .pk
                .requestor()
                .get(route!("workspaces", workspace.id(), "patients"))
                .query_pairs(&query)
                .send()
                .await?;
            let page: Vec<Value> = response.json()?;
            patients.extend(page);
            if response.header("proknow-has-more") != Some("true") {
                break;
            }
            let (Some(epoch), Some(next_page)) = (
                response.header("proknow-epoch"),
                response.header("proknow-next-page"),
            ) else {
                break;
            };
            query.retain(|(key, _)| key == "search");
            query.push(("page_epoch".to_string(), epoch.to_string()));
            query.push(("page_number".to_string(), next_page.to_string()));
        }
        debug!("Fetched {} patients of workspace {}", patients.len(), workspace.id());

        patients
            .into_iter()
            .map(|patient| PatientSummary::new(self.pk.clone(), workspace.id(), patient))
            .collect()
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    mrn: String,
    name: String,
    #[serde(default)]
    birth_date: Option<String>,
    #[serde(default)]
    sex: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PatientSummary {
    pk: ProKnow,
    workspace_id: String,
    id: String,
    mrn: String,
    name: String,
    birth_date: Option<String>,
    sex: Option<String>,
    data: Value,
}

impl PatientSummary {
    fn new(pk: ProKnow, workspace_id: &str, data: Value) -> Result<Self> {
        let SummaryFields {
            id,
            mrn,
            name,
            birth_date,
            sex,
        } = fields(&data)?;
        Ok(PatientSummary {
            pk,
            workspace_id: workspace_id.to_string(),
            id,
            mrn,
            name,
            birth_date,
            sex,
            data,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn mrn(&self) -> &str {
        &self.mrn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn birth_date(&self) -> Option<&str> {
        self.birth_date.as_deref()
    }

    pub fn sex(&self) -> Option<&str> {
        self.sex.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<PatientItem> {
        self.pk.patients().get(&self.workspace_id, &self.id).await
    }

    /// Uploads files, forcing the demographics of this patient onto them.
    pub async fn upload<I, P>(&self, paths: I) -> Result<UploadBatch>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let overrides = patient_overrides(&self.mrn, &self.name, &self.birth_date, &self.sex);
        self.pk
            .uploads()
            .upload_and_wait(&self.workspace_id, paths, Some(overrides), None)
            .await
    }
}

/// A study of a patient with its entity tree.
#[derive(Clone, Debug)]
pub struct StudySummary {
    id: String,
    data: Value,
    entities: Vec<EntitySummary>,
}

#[derive(Deserialize)]
struct StudyFields {
    id: String,
    #[serde(default)]
    entities: Vec<Value>,
}

impl StudySummary {
    fn new(pk: &ProKnow, workspace_id: &str, patient_id: &str, data: Value) -> Result<Self> {
        let StudyFields { id, entities } = fields(&data)?;
        let entities = entities
            .into_iter()
            .map(|entity| EntitySummary::new(pk.clone(), workspace_id, patient_id, entity))
            .collect::<Result<Vec<_>>>()?;
        Ok(StudySummary { id, data, entities })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn entities(&self) -> &[EntitySummary] {
        &self.entities
    }
}

#[derive(Deserialize)]
struct ItemFields {
    id: String,
    mrn: String,
    name: String,
    #[serde(default)]
    birth_date: Option<String>,
    #[serde(default)]
    sex: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    studies: Vec<Value>,
}

/// Reference an empty plan is created from, see [PatientItem::create_plan].
#[derive(Clone, Debug)]
pub enum PlanReference<'a> {
    ImageSet(&'a str),
    StructureSet(&'a str),
    Dose(&'a str),
}

/// A patient. `mrn`, `name`, `birth_date`, `sex` and `metadata` are written back by
/// [PatientItem::save].
#[derive(Clone, Debug)]
pub struct PatientItem {
    pk: ProKnow,
    workspace_id: String,
    id: String,
    data: Value,
    studies: Vec<StudySummary>,
    pub mrn: String,
    pub name: String,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
    pub metadata: Map<String, Value>,
}

impl PatientItem {
    fn new(pk: ProKnow, workspace_id: &str, data: Value) -> Result<Self> {
        let ItemFields {
            id,
            mrn,
            name,
            birth_date,
            sex,
            metadata,
            studies,
        } = fields(&data)?;
        let studies = studies
            .into_iter()
            .map(|study| StudySummary::new(&pk, workspace_id, &id, study))
            .collect::<Result<Vec<_>>>()?;
        Ok(PatientItem {
            pk,
            workspace_id: workspace_id.to_string(),
            id,
            data,
            studies,
            mrn,
            name,
            birth_date,
            sex,
            metadata,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn studies(&self) -> &[StudySummary] {
        &self.studies
    }

    pub fn scorecards(&self) -> Scorecards {
        Scorecards::new(
            self.pk.clone(),
            &route!("workspaces", self.workspace_id, "patients", self.id),
        )
    }

    /// Every entity of every study matching `predicate`, each parent before its children.
    pub fn find_entities<F>(&self, predicate: F) -> Vec<EntitySummary>
    where
        F: Fn(&EntitySummary) -> bool,
    {
        let mut found = Vec::new();
        for entity in self.studies.iter().flat_map(|study| study.entities.iter()) {
            entity.collect_matching(&predicate, &mut found);
        }
        found
    }

    pub async fn delete(&self) -> Result<()> {
        self.pk.patients().delete(&self.workspace_id, &self.id).await
    }

    pub async fn refresh(&mut self) -> Result<()> {
        let patient = self.pk.patients().get(&self.workspace_id, &self.id).await?;
        *self = patient;
        Ok(())
    }

    pub async fn save(&mut self) -> Result<()> {
        let patient: Value = self
            .pk
            .requestor()
            .put(route!("workspaces", self.workspace_id, "patients", self.id))
            .json(&json!({
                "mrn": self.mrn,
                "name": self.name,
                "birth_date": self.birth_date,
                "sex": self.sex,
                "metadata": self.metadata,
            }))
            .fetch()
            .await?;
        *self = PatientItem::new(self.pk.clone(), &self.workspace_id, patient)?;
        Ok(())
    }

    /// The metadata keyed by custom metric name.
    pub async fn get_metadata(&self) -> Result<Map<String, Value>> {
        decode_metadata(&self.pk, &self.metadata).await
    }

    /// Replaces the metadata from values keyed by custom metric name or id. Call
    /// [PatientItem::save] to persist it.
    pub async fn set_metadata(&mut self, metadata: &Map<String, Value>) -> Result<()> {
        self.metadata = encode_metadata(&self.pk, metadata).await?;
        Ok(())
    }

    /// Creates an empty structure set referencing `image_set_id` and returns its summary.
    pub async fn create_structure_set(&mut self, name: &str, image_set_id: &str) -> Result<EntitySummary> {
        let created: Value = self
            .pk
            .requestor()
            .post(route!("workspaces", self.workspace_id, "structuresets"))
            .json(&json!({ "name": name, "image_set_id": image_set_id }))
            .fetch()
            .await?;
        self.created_entity(&created, "structure set").await
    }

    /// Creates an empty plan referencing another entity and returns its summary.
    pub async fn create_plan(&mut self, name: &str, reference: PlanReference<'_>) -> Result<EntitySummary> {
        let body = match reference {
            PlanReference::ImageSet(id) => json!({ "name": name, "image_set_id": id }),
            PlanReference::StructureSet(id) => json!({ "name": name, "structure_set_id": id }),
            PlanReference::Dose(id) => json!({ "name": name, "dose_id": id }),
        };
        let created: Value = self
            .pk
            .requestor()
            .post(route!("workspaces", self.workspace_id, "plans"))
            .json(&body)
            .fetch()
            .await?;
        self.created_entity(&created, "plan").await
    }

    async fn created_entity(&mut self, created: &Value, what: &str) -> Result<EntitySummary> {
        let id = created["id"].as_str().unwrap_or_default().to_string();
        self.refresh().await?;
        let mut found = self.find_entities(|entity| entity.id() == id);
        match (found.pop(), found.is_empty()) {
            (Some(entity), true) => Ok(entity),
            _ => Err(ProKnowError::UnexpectedResponse(format!(
                "Problem finding created {}",
                what
            ))),
        }
    }

    /// Uploads files into this patient, forcing its demographics onto them.
    pub async fn upload<I, P>(&self, paths: I) -> Result<UploadBatch>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let overrides = patient_overrides(&self.mrn, &self.name, &self.birth_date, &self.sex);
        self.pk
            .uploads()
            .upload_and_wait(&self.workspace_id, paths, Some(overrides), Some(&self.id))
            .await
    }
}

fn patient_overrides(mrn: &str, name: &str, birth_date: &Option<String>, sex: &Option<String>) -> Value {
    json!({
        "patient": { "mrn": mrn, "name": name, "birth_date": birth_date, "sex": sex },
    })
}

/// Translates metadata keyed by custom metric id into metadata keyed by name.
pub(crate) async fn decode_metadata(
    pk: &ProKnow,
    metadata: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let custom_metrics = pk.custom_metrics();
    let mut decoded = Map::new();
    for (key, value) in metadata {
        let metric = custom_metrics.resolve(key).await?;
        decoded.insert(metric.name.clone(), value.clone());
    }
    Ok(decoded)
}

/// Translates metadata keyed by custom metric name (or id) into metadata keyed by id.
pub(crate) async fn encode_metadata(
    pk: &ProKnow,
    metadata: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let custom_metrics = pk.custom_metrics();
    let mut encoded = Map::new();
    for (key, value) in metadata {
        let metric = custom_metrics.resolve(key).await?;
        encoded.insert(metric.id().to_string(), value.clone());
    }
    Ok(encoded)
}
