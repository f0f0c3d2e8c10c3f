//! Patient entities: image sets, structure sets, plans and doses.
//!
//! A patient lists its entities as a tree of [EntitySummary] (a plan hangs below its structure
//! set which hangs below its image set). [EntitySummary::get] fetches the full representation and
//! returns the matching variant of [Entity].

use std::{
    fmt,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{decode_metadata, encode_metadata, structure_sets::StructureSetItem};
use crate::{
    error::{ProKnowError, Result},
    field_str, fields,
    requestor::route,
    scorecards::Scorecards,
    ProKnow,
};

const STATUS_POLL_DELAY: Duration = Duration::from_millis(200);
const STATUS_POLL_ATTEMPTS: u32 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ImageSet,
    StructureSet,
    Plan,
    Dose,
}

impl EntityType {
    /// The collection the entity type lives in, e.g. `/workspaces/{id}/imagesets`.
    pub fn route(self) -> &'static str {
        match self {
            EntityType::ImageSet => "imagesets",
            EntityType::StructureSet => "structuresets",
            EntityType::Plan => "plans",
            EntityType::Dose => "doses",
        }
    }

    /// The entity type named by a `type` tag, if it is one the client handles.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "image_set" => Some(EntityType::ImageSet),
            "structure_set" => Some(EntityType::StructureSet),
            "plan" => Some(EntityType::Plan),
            "dose" => Some(EntityType::Dose),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::ImageSet => "image_set",
            EntityType::StructureSet => "structure_set",
            EntityType::Plan => "plan",
            EntityType::Dose => "dose",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    #[serde(rename = "type")]
    type_tag: String,
    #[serde(default)]
    entities: Vec<Value>,
}

/// An entity as listed in a patient representation, with its child entities.
#[derive(Clone, Debug)]
pub struct EntitySummary {
    pk: ProKnow,
    workspace_id: String,
    patient_id: String,
    id: String,
    type_tag: String,
    data: Value,
    entities: Vec<EntitySummary>,
}

impl EntitySummary {
    pub(crate) fn new(pk: ProKnow, workspace_id: &str, patient_id: &str, data: Value) -> Result<Self> {
        let SummaryFields {
            id,
            type_tag,
            entities,
        } = fields(&data)?;
        let entities = entities
            .into_iter()
            .map(|child| EntitySummary::new(pk.clone(), workspace_id, patient_id, child))
            .collect::<Result<Vec<_>>>()?;
        Ok(EntitySummary {
            pk,
            workspace_id: workspace_id.to_string(),
            patient_id: patient_id.to_string(),
            id,
            type_tag,
            data,
            entities,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `None` for entity types the client does not handle. See [EntitySummary::type_tag].
    pub fn entity_type(&self) -> Option<EntityType> {
        EntityType::from_tag(&self.type_tag)
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Child entities, e.g. the structure sets referencing an image set.
    pub fn entities(&self) -> &[EntitySummary] {
        &self.entities
    }

    /// Fetches the full entity, waiting up to 5 seconds for it to finish processing.
    pub async fn get(&self) -> Result<Entity> {
        let entity_type = self.entity_type().ok_or_else(|| {
            ProKnowError::UnexpectedResponse(format!(
                "entity {} has unsupported type `{}`",
                self.id, self.type_tag
            ))
        })?;
        let route = route!("workspaces", self.workspace_id, entity_type.route(), self.id);
        let mut attempts = 0;
        let data = loop {
            let data: Value = self.pk.requestor().get(route.as_str()).fetch().await?;
            if matches!(data["status"].as_str(), Some("completed") | Some("abstract")) {
                break data;
            }
            if attempts >= STATUS_POLL_ATTEMPTS {
                return Err(ProKnowError::TimeoutExceeded(format!(
                    "Timeout exceeded while waiting for {} entity to reach completed status",
                    entity_type.as_str().replace('_', " ")
                )));
            }
            attempts += 1;
            sleep(STATUS_POLL_DELAY).await;
        };
        Entity::new(
            self.pk.clone(),
            &self.workspace_id,
            &self.patient_id,
            entity_type,
            data,
        )
    }

    pub async fn delete(&self) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("workspaces", self.workspace_id, "entities", self.id))
            .send()
            .await?;
        Ok(())
    }

    /// Pushes every entity of the tree rooted at `self` matching `predicate`, parents first.
    pub(crate) fn collect_matching<F>(&self, predicate: &F, found: &mut Vec<EntitySummary>)
    where
        F: Fn(&EntitySummary) -> bool,
    {
        if predicate(self) {
            found.push(self.clone());
        }
        for child in &self.entities {
            child.collect_matching(predicate, found);
        }
    }
}

/// A fully fetched entity.
#[derive(Debug)]
pub enum Entity {
    ImageSet(ImageSetItem),
    StructureSet(StructureSetItem),
    Plan(PlanItem),
    Dose(DoseItem),
}

impl Entity {
    pub(crate) fn new(
        pk: ProKnow,
        workspace_id: &str,
        patient_id: &str,
        entity_type: EntityType,
        data: Value,
    ) -> Result<Self> {
        let entity = EntityItem::new(pk, workspace_id, patient_id, entity_type, data)?;
        Ok(match entity_type {
            EntityType::ImageSet => Entity::ImageSet(ImageSetItem { entity }),
            EntityType::StructureSet => Entity::StructureSet(StructureSetItem::new(entity)?),
            EntityType::Plan => Entity::Plan(PlanItem { entity }),
            EntityType::Dose => Entity::Dose(DoseItem { entity }),
        })
    }

    pub fn item(&self) -> &EntityItem {
        match self {
            Entity::ImageSet(image_set) => &**image_set,
            Entity::StructureSet(structure_set) => &**structure_set,
            Entity::Plan(plan) => &**plan,
            Entity::Dose(dose) => &**dose,
        }
    }

    pub fn item_mut(&mut self) -> &mut EntityItem {
        match self {
            Entity::ImageSet(image_set) => &mut **image_set,
            Entity::StructureSet(structure_set) => &mut **structure_set,
            Entity::Plan(plan) => &mut **plan,
            Entity::Dose(dose) => &mut **dose,
        }
    }

    pub fn id(&self) -> &str {
        self.item().id()
    }

    pub fn entity_type(&self) -> EntityType {
        self.item().entity_type()
    }
}

#[derive(Deserialize)]
struct ItemFields {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// State and operations shared by every entity type.
///
/// `metadata` is keyed by custom metric id; [EntityItem::get_metadata] and
/// [EntityItem::set_metadata] translate from and to custom metric names.
#[derive(Clone, Debug)]
pub struct EntityItem {
    pk: ProKnow,
    workspace_id: String,
    patient_id: String,
    entity_type: EntityType,
    id: String,
    data: Value,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
}

impl EntityItem {
    pub(crate) fn new(
        pk: ProKnow,
        workspace_id: &str,
        patient_id: &str,
        entity_type: EntityType,
        data: Value,
    ) -> Result<Self> {
        let ItemFields {
            id,
            description,
            metadata,
        } = fields(&data)?;
        Ok(EntityItem {
            pk,
            workspace_id: workspace_id.to_string(),
            patient_id: patient_id.to_string(),
            entity_type,
            id,
            data,
            description,
            metadata,
        })
    }

    pub(crate) fn update(&mut self, data: Value) -> Result<()> {
        let ItemFields {
            id,
            description,
            metadata,
        } = fields(&data)?;
        self.id = id;
        self.description = description;
        self.metadata = metadata;
        self.data = data;
        Ok(())
    }

    pub(crate) fn pk(&self) -> &ProKnow {
        &self.pk
    }

    /// Route of the typed resource, e.g. `/workspaces/{w}/plans/{id}`.
    pub(crate) fn typed_route(&self) -> String {
        route!("workspaces", self.workspace_id, self.entity_type.route(), self.id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn scorecards(&self) -> Scorecards {
        Scorecards::new(
            self.pk.clone(),
            &route!("workspaces", self.workspace_id, "entities", self.id),
        )
    }

    pub async fn delete(&self) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("workspaces", self.workspace_id, "entities", self.id))
            .send()
            .await?;
        Ok(())
    }

    /// Writes `description` and `metadata` back.
    pub async fn save(&mut self) -> Result<()> {
        let entity: Value = self
            .pk
            .requestor()
            .put(route!("workspaces", self.workspace_id, "entities", self.id))
            .json(&json!({ "description": self.description, "metadata": self.metadata }))
            .fetch()
            .await?;
        self.update(entity)
    }

    pub async fn refresh(&mut self) -> Result<()> {
        let entity: Value = self.pk.requestor().get(self.typed_route()).fetch().await?;
        self.update(entity)
    }

    /// The metadata keyed by custom metric name.
    pub async fn get_metadata(&self) -> Result<Map<String, Value>> {
        decode_metadata(&self.pk, &self.metadata).await
    }

    /// Replaces the metadata from values keyed by custom metric name or id. Call
    /// [EntityItem::save] to persist it.
    pub async fn set_metadata(&mut self, metadata: &Map<String, Value>) -> Result<()> {
        self.metadata = encode_metadata(&self.pk, metadata).await?;
        Ok(())
    }

    pub async fn update_parent(&mut self, parent_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .put(route!("workspaces", self.workspace_id, "entities", self.id, "parent", parent_id))
            .send()
            .await?;
        self.refresh().await
    }

    /// Polls the entity until `ready` accepts its representation.
    async fn wait_until<F>(&mut self, what: &str, ready: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<bool>,
    {
        let start = Instant::now();
        let timeout = self.pk.config().entity_wait_timeout;
        while start.elapsed() < timeout {
            if ready(&self.data)? {
                return Ok(());
            }
            sleep(STATUS_POLL_DELAY).await;
            self.refresh().await?;
        }
        Err(ProKnowError::TimeoutExceeded(format!(
            "Timeout exceeded while waiting for {} to reach completed status",
            what
        )))
    }
}

/// Resolves where an entity is downloaded: inside `path` as `{prefix}.{uid}.dcm` when `path` is
/// a directory, else at `path` itself provided its directory exists.
pub(crate) fn download_path(path: &Path, prefix: &str, uid: &str) -> Result<PathBuf> {
    if path.is_dir() {
        return Ok(std::path::absolute(path)?.join(format!("{}.{}.dcm", prefix, uid)));
    }
    let absolute = std::path::absolute(path)?;
    match absolute.parent() {
        Some(directory) if directory.is_dir() => Ok(absolute),
        _ => Err(ProKnowError::InvalidPath(format!(
            "`{}` is invalid",
            path.display()
        ))),
    }
}

macro_rules! entity_deref {
    ($item:ty) => {
        impl Deref for $item {
            type Target = EntityItem;

            fn deref(&self) -> &EntityItem {
                &self.entity
            }
        }

        impl DerefMut for $item {
            fn deref_mut(&mut self) -> &mut EntityItem {
                &mut self.entity
            }
        }
    };
}

entity_deref!(ImageSetItem);
entity_deref!(PlanItem);
entity_deref!(DoseItem);

#[derive(Clone, Debug)]
pub struct ImageSetItem {
    entity: EntityItem,
}

impl ImageSetItem {
    /// Downloads every image into a new `{modality}.{uid}` directory created inside `directory`.
    pub async fn download(&self, directory: impl AsRef<Path>) -> Result<PathBuf> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Err(ProKnowError::InvalidPath(format!(
                "`{}` is invalid",
                directory.display()
            )));
        }
        let modality = field_str(self.data(), "/modality")?;
        let uid = field_str(self.data(), "/uid")?;
        let main_directory = std::path::absolute(directory)?.join(format!("{}.{}", modality, uid));
        tokio::fs::create_dir(&main_directory).await?;

        for image in self.images() {
            let image_id = field_str(image, "/id")?;
            let image_uid = field_str(image, "/uid")?;
            let image_path = main_directory.join(format!("{}.{}", modality, image_uid));
            self.pk()
                .requestor()
                .get(route!(
                    "workspaces",
                    self.workspace_id(),
                    "imagesets",
                    self.id(),
                    "images",
                    image_id,
                    "dicom"
                ))
                .stream_to(&image_path)
                .await?;
        }
        debug!("Downloaded image set {} to {}", self.id(), main_directory.display());
        Ok(main_directory)
    }

    /// The pixel data of the image at `index`.
    pub async fn get_image_data(&self, index: usize) -> Result<Bytes> {
        let image = self.images().get(index).ok_or_else(|| {
            ProKnowError::InvalidArgument(format!("no image at index {}", index))
        })?;
        self.pk()
            .requestor()
            .get(route!("imagesets", self.id(), "images", field_str(image, "/tag")?))
            .header("ProKnow-Key", field_str(self.data(), "/key")?)
            .bytes()
            .await
    }

    fn images(&self) -> &[Value] {
        self.data()["data"]["images"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct PlanItem {
    entity: EntityItem,
}

impl PlanItem {
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = download_path(path.as_ref(), "RP", field_str(self.data(), "/uid")?)?;
        self.pk()
            .requestor()
            .get(route!("workspaces", self.workspace_id(), "plans", self.id(), "dicom"))
            .stream_to(&resolved)
            .await?;
        Ok(resolved)
    }

    /// Waits for the plan to be processed and returns its delivery information.
    pub async fn get_delivery_information(&mut self) -> Result<Value> {
        self.entity
            .wait_until("delivery information", |data| {
                Ok(data["status"].as_str() == Some("completed"))
            })
            .await?;
        self.pk()
            .requestor()
            .get(route!(
                "plans",
                self.id(),
                "delivery",
                field_str(self.data(), "/data/delivery_tag")?
            ))
            .header("ProKnow-Key", field_str(self.data(), "/key")?)
            .fetch()
            .await
    }
}

#[derive(Clone, Debug)]
pub struct DoseItem {
    entity: EntityItem,
}

impl DoseItem {
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = download_path(path.as_ref(), "RD", field_str(self.data(), "/uid")?)?;
        self.pk()
            .requestor()
            .get(route!("workspaces", self.workspace_id(), "doses", self.id(), "dicom"))
            .stream_to(&resolved)
            .await?;
        Ok(resolved)
    }

    /// Waits for the dose analysis to be current and returns it.
    pub async fn get_analysis(&mut self) -> Result<Value> {
        self.entity
            .wait_until("dose analysis", |data| {
                match data["data"]["analysis"]["status"].as_str() {
                    Some("current") => Ok(true),
                    Some("failed") => Err(ProKnowError::InvalidOperation(
                        "Dose analysis failed".to_string(),
                    )),
                    Some("pending") => Err(ProKnowError::InvalidOperation(
                        "Dose analysis not possible".to_string(),
                    )),
                    _ => Ok(false),
                }
            })
            .await?;
        self.pk()
            .requestor()
            .get(route!(
                "doses",
                self.id(),
                "analysis",
                field_str(self.data(), "/data/analysis/tag")?
            ))
            .header("ProKnow-Key", field_str(self.data(), "/key")?)
            .fetch()
            .await
    }

    /// The dose grid of the slice at `index`.
    pub async fn get_slice_data(&self, index: usize) -> Result<Bytes> {
        let slice = self.data()["data"]["slices"]
            .get(index)
            .ok_or_else(|| ProKnowError::InvalidArgument(format!("no slice at index {}", index)))?;
        self.pk()
            .requestor()
            .get(route!("doses", self.id(), "slices", field_str(slice, "/tag")?))
            .header("ProKnow-Key", field_str(self.data(), "/key")?)
            .bytes()
            .await
    }

    pub fn metrics(&self) -> DoseMetrics {
        DoseMetrics {
            pk: self.pk().clone(),
            route: route!("workspaces", self.workspace_id(), "doses", self.id(), "metrics"),
        }
    }
}

/// Metrics computed on a dose.
#[derive(Clone, Debug)]
pub struct DoseMetrics {
    pk: ProKnow,
    route: String,
}

impl DoseMetrics {
    /// Lists the metrics. With `wait`, polls until each metric is `completed` or `failed`.
    pub async fn query(&self, wait: bool) -> Result<Vec<Value>> {
        let mut metrics: Vec<Value> = self.pk.requestor().get(self.route.as_str()).fetch().await?;
        if !wait {
            return Ok(metrics);
        }
        let start = Instant::now();
        while start.elapsed() < self.pk.config().entity_wait_timeout {
            let settled = metrics.iter().all(|metric| {
                matches!(metric["status"].as_str(), Some("completed") | Some("failed"))
            });
            if settled {
                return Ok(metrics);
            }
            sleep(STATUS_POLL_DELAY).await;
            metrics = self.pk.requestor().get(self.route.as_str()).fetch().await?;
        }
        Err(ProKnowError::TimeoutExceeded(
            "Timeout exceeded while waiting for dose metrics to reach completed status".to_string(),
        ))
    }

    /// Requests additional metrics to be computed.
    pub async fn add(&self, metrics: &[Value]) -> Result<()> {
        self.pk
            .requestor()
            .put(self.route.as_str())
            .json(metrics)
            .send()
            .await?;
        Ok(())
    }
}
