//! Structure sets and their draft workflow.
//!
//! A structure set is edited through a draft: [StructureSetItem::draft] checks out the draft and
//! its lock, ROI mutations carry the lock id in the `ProKnow-Lock` header, and the draft ends with
//! [StructureSetItem::approve], [StructureSetItem::discard] or [StructureSetItem::release_lock].
//!
//! Locks expire server side. A background renewer started with
//! [StructureSetItem::start_renewer] refreshes the lock shortly before it expires and re-arms
//! itself after every renewal. It must be stopped with [StructureSetItem::stop_renewer];
//! [StructureSetItem::edit_draft] does the whole sequence on every exit path.

use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info};

use super::entities::{download_path, EntityItem, EntityType};
use crate::{
    error::{ProKnowError, Result},
    field_str, fields, lock,
    requestor::route,
    ProKnow,
};

const VERSION_POLL_DELAY: Duration = Duration::from_millis(100);
const VERSION_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// A draft lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// How long to wait from `now` before renewing, `buffer` ahead of the expiry. Zero when the
    /// renewal is already due.
    pub fn renewal_delay(&self, now: DateTime<Utc>, buffer: Duration) -> Duration {
        (self.expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(buffer)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RoiRecord {
    id: String,
    tag: String,
    name: String,
    color: [u8; 3],
    #[serde(rename = "type")]
    roi_type: String,
}

#[derive(Debug, Default)]
struct DraftState {
    is_draft: bool,
    lock: Option<Lock>,
    renewal_error: Option<ProKnowError>,
}

/// State shared between a structure set, its ROIs and its lock renewer.
#[derive(Debug)]
struct Shared {
    pk: ProKnow,
    /// `/workspaces/{w}/structuresets/{id}`
    base: String,
    structure_set_id: String,
    key: String,
    state: Mutex<DraftState>,
    rois: Mutex<Vec<RoiRecord>>,
}

impl Shared {
    fn route(&self, tail: &str) -> String {
        format!("{}{}", self.base, tail)
    }

    fn is_editable(&self) -> bool {
        let state = lock(&self.state);
        state.is_draft && state.lock.is_some()
    }

    /// The id of the held lock. Fails with the last renewal error, if any, or when the draft
    /// is not editable.
    fn lock_id(&self) -> Result<String> {
        let mut state = lock(&self.state);
        if let Some(e) = state.renewal_error.take() {
            return Err(e);
        }
        match (&state.lock, state.is_draft) {
            (Some(held), true) => Ok(held.id.clone()),
            _ => Err(ProKnowError::not_editable()),
        }
    }

    fn roi_refs(&self) -> Vec<Value> {
        lock(&self.rois)
            .iter()
            .map(|roi| json!({ "id": roi.id, "tag": roi.tag }))
            .collect()
    }

    fn roi_tag(&self, roi_id: &str) -> Option<String> {
        lock(&self.rois)
            .iter()
            .find(|roi| roi.id == roi_id)
            .map(|roi| roi.tag.clone())
    }
}

/// One version of a structure set: the approved one, an archived one, or the draft.
#[derive(Debug)]
pub struct StructureSetItem {
    entity: EntityItem,
    shared: Arc<Shared>,
    renewer: Option<JoinHandle<()>>,
}

impl Deref for StructureSetItem {
    type Target = EntityItem;

    fn deref(&self) -> &EntityItem {
        &self.entity
    }
}

impl DerefMut for StructureSetItem {
    fn deref_mut(&mut self) -> &mut EntityItem {
        &mut self.entity
    }
}

/// A dropped item stops renewing its lock. The lock itself is kept until it expires.
impl Drop for StructureSetItem {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
    }
}

impl StructureSetItem {
    pub(crate) fn new(entity: EntityItem) -> Result<Self> {
        StructureSetItem::with_state(entity, false, None)
    }

    fn with_state(entity: EntityItem, is_draft: bool, held: Option<Lock>) -> Result<Self> {
        let rois = read_rois(entity.data())?;
        let shared = Shared {
            pk: entity.pk().clone(),
            base: entity.typed_route(),
            structure_set_id: entity.id().to_string(),
            key: entity.data()["key"].as_str().unwrap_or_default().to_string(),
            state: Mutex::new(DraftState {
                is_draft,
                lock: held,
                renewal_error: None,
            }),
            rois: Mutex::new(rois),
        };
        Ok(StructureSetItem {
            entity,
            shared: Arc::new(shared),
            renewer: None,
        })
    }

    pub fn is_draft(&self) -> bool {
        lock(&self.shared.state).is_draft
    }

    /// Whether ROIs can be mutated: the item is the draft and holds its lock.
    pub fn is_editable(&self) -> bool {
        self.shared.is_editable()
    }

    pub fn lock(&self) -> Option<Lock> {
        lock(&self.shared.state).lock.clone()
    }

    pub fn rois(&self) -> Vec<StructureSetRoiItem> {
        lock(&self.shared.rois)
            .iter()
            .map(|roi| StructureSetRoiItem {
                shared: Arc::clone(&self.shared),
                id: roi.id.clone(),
                name: roi.name.clone(),
                color: roi.color,
                roi_type: roi.roi_type.clone(),
            })
            .collect()
    }

    pub fn versions(&self) -> StructureSetVersions {
        StructureSetVersions {
            pk: self.pk().clone(),
            workspace_id: self.workspace_id().to_string(),
            patient_id: self.patient_id().to_string(),
            structure_set_id: self.id().to_string(),
        }
    }

    /// Checks out the draft of the structure set.
    ///
    /// When another session already holds the draft lock, the existing lock is fetched and used.
    pub async fn draft(&self) -> Result<StructureSetItem> {
        let requestor = self.shared.pk.requestor();
        let held: Lock = match requestor.post(self.shared.route("/draft")).fetch().await {
            Ok(held) => held,
            Err(e) if e.is_conflict() => {
                debug!("Draft of structure set {} already exists, reusing its lock", self.id());
                requestor
                    .get(self.shared.route("/draft/lock"))
                    .fetch()
                    .await?
            }
            Err(e) => return Err(e),
        };
        let data: Value = requestor
            .get(self.typed_route())
            .query("version", "draft")
            .fetch()
            .await?;
        info!("Checked out draft of structure set {}", self.id());
        let entity = EntityItem::new(
            self.pk().clone(),
            self.workspace_id(),
            self.patient_id(),
            EntityType::StructureSet,
            data,
        )?;
        StructureSetItem::with_state(entity, true, Some(held))
    }

    /// Starts renewing the lock in the background. Does nothing when the item is not editable or
    /// a renewer is already running. A renewer stopped by a failed renewal can be started again.
    pub fn start_renewer(&mut self) {
        let running = self.renewer.as_ref().is_some_and(|renewer| !renewer.is_finished());
        if !self.is_editable() || running {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let buffer = self.pk().config().lock_renewal_buffer;
        self.renewer = Some(tokio::spawn(renew(shared, buffer)));
    }

    /// Stops the renewer. Does nothing when no renewer is running.
    pub fn stop_renewer(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
    }

    /// Approves the draft and returns the newly approved version.
    pub async fn approve(
        &mut self,
        label: Option<&str>,
        message: Option<&str>,
    ) -> Result<StructureSetItem> {
        let lock_id = self.shared.lock_id()?;
        let body = json!({
            "version": self.data()["data"]["version"],
            "rois": self.shared.roi_refs(),
            "label": label,
            "message": message,
        });
        self.shared
            .pk
            .requestor()
            .post(self.shared.route("/draft/approve"))
            .header("ProKnow-Lock", lock_id)
            .json(&body)
            .send()
            .await?;
        self.stop_renewer();
        {
            let mut state = lock(&self.shared.state);
            state.lock = None;
            state.is_draft = false;
        }
        info!("Approved draft of structure set {}", self.id());
        self.versions().get("approved").await
    }

    /// Discards the draft without promoting its changes.
    pub async fn discard(&mut self) -> Result<()> {
        let lock_id = self.shared.lock_id()?;
        let body = json!({
            "version": self.data()["data"]["version"],
            "rois": self.shared.roi_refs(),
        });
        self.shared
            .pk
            .requestor()
            .post(self.shared.route("/draft/discard"))
            .header("ProKnow-Lock", lock_id)
            .json(&body)
            .send()
            .await?;
        self.stop_renewer();
        lock(&self.shared.state).lock = None;
        info!("Discarded draft of structure set {}", self.id());
        Ok(())
    }

    /// Releases the draft lock. Does nothing when the item is not editable.
    pub async fn release_lock(&mut self) -> Result<()> {
        let held = {
            let state = lock(&self.shared.state);
            match (&state.lock, state.is_draft) {
                (Some(held), true) => held.id.clone(),
                _ => return Ok(()),
            }
        };
        self.stop_renewer();
        self.shared
            .pk
            .requestor()
            .delete(self.shared.route(&route!("draft", "lock", held)))
            .send()
            .await?;
        lock(&self.shared.state).lock = None;
        debug!("Released lock of structure set {}", self.id());
        Ok(())
    }

    /// Checks out the draft, keeps its lock renewed while `f` runs, then releases the lock if the
    /// draft still holds it.
    ///
    /// ```rust no_run
    /// # async fn run(structure_set: proknow_rs::StructureSetItem) -> proknow_rs::Result<()> {
    /// structure_set
    ///     .edit_draft(|draft| {
    ///         Box::pin(async move {
    ///             for roi in draft.rois() {
    ///                 if roi.name == "BODY" {
    ///                     roi.delete().await?;
    ///                 }
    ///             }
    ///             draft.approve(Some("no body"), None).await
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn edit_draft<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut StructureSetItem) -> BoxFuture<'a, Result<T>>,
    {
        let mut draft = self.draft().await?;
        draft.start_renewer();
        let result = f(&mut draft).await;
        draft.stop_renewer();
        let released = draft.release_lock().await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Adds a ROI to the draft.
    pub async fn create_roi(
        &self,
        name: &str,
        color: [u8; 3],
        roi_type: &str,
    ) -> Result<StructureSetRoiItem> {
        let lock_id = self.shared.lock_id()?;
        let record: RoiRecord = self
            .shared
            .pk
            .requestor()
            .post(self.shared.route("/draft/rois"))
            .header("ProKnow-Lock", lock_id)
            .json(&json!({ "name": name, "color": color, "type": roi_type }))
            .fetch()
            .await?;
        debug!("Created ROI {} ({}) in structure set {}", record.name, record.id, self.id());
        let roi = StructureSetRoiItem {
            shared: Arc::clone(&self.shared),
            id: record.id.clone(),
            name: record.name.clone(),
            color: record.color,
            roi_type: record.roi_type.clone(),
        };
        lock(&self.shared.rois).push(record);
        Ok(roi)
    }

    /// Reloads the approved version. Drafts cannot be refreshed.
    pub async fn refresh(&mut self) -> Result<()> {
        if self.is_draft() {
            return Err(ProKnowError::InvalidOperation(
                "Draft versions of structure sets cannot be refreshed".to_string(),
            ));
        }
        let data: Value = self.pk().requestor().get(self.typed_route()).fetch().await?;
        let rois = read_rois(&data)?;
        self.entity.update(data)?;
        *lock(&self.shared.rois) = rois;
        Ok(())
    }

    /// Downloads the DICOM file of this version to `path`, a directory or a file path.
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        if self.is_draft() {
            return Err(ProKnowError::InvalidOperation(
                "Draft versions of structure sets cannot be downloaded".to_string(),
            ));
        }
        let resolved = download_path(path.as_ref(), "RS", field_str(self.data(), "/uid")?)?;
        let version = field_str(self.data(), "/data/version")?;
        self.pk()
            .requestor()
            .get(self.shared.route(&route!("versions", version, "dicom")))
            .stream_to(&resolved)
            .await?;
        Ok(resolved)
    }
}

fn read_rois(data: &Value) -> Result<Vec<RoiRecord>> {
    match data.pointer("/data/rois") {
        Some(rois) => fields(rois),
        None => Ok(Vec::new()),
    }
}

/// Renews the lock of `shared` until it is released or a renewal fails.
async fn renew(shared: Arc<Shared>, buffer: Duration) {
    loop {
        let Some(held) = lock(&shared.state).lock.clone() else {
            return;
        };
        sleep(held.renewal_delay(Utc::now(), buffer)).await;

        let lock_id = match &lock(&shared.state).lock {
            Some(current) => current.id.clone(),
            None => return,
        };
        let renewed = shared
            .pk
            .requestor()
            .put(shared.route(&route!("draft", "lock", lock_id)))
            .fetch::<Lock>()
            .await;
        let mut state = lock(&shared.state);
        match renewed {
            Ok(renewed) => {
                if state.lock.is_some() {
                    debug!(
                        "Renewed lock of structure set {} until {}",
                        shared.structure_set_id, renewed.expires_at
                    );
                    state.lock = Some(renewed);
                }
            }
            Err(e) => {
                error!("Failed to renew lock of structure set {}: {}", shared.structure_set_id, e);
                state.renewal_error = Some(e);
                return;
            }
        }
    }
}

/// A ROI of a structure set. Mutations require the parent draft to hold its lock.
#[derive(Clone, Debug)]
pub struct StructureSetRoiItem {
    shared: Arc<Shared>,
    id: String,
    pub name: String,
    pub color: [u8; 3],
    pub roi_type: String,
}

impl StructureSetRoiItem {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The tag of the current geometry. It changes whenever the geometry is saved.
    pub fn tag(&self) -> Option<String> {
        self.shared.roi_tag(&self.id)
    }

    pub fn is_editable(&self) -> bool {
        self.shared.is_editable()
    }

    /// Saves the name, color and type.
    pub async fn save(&self) -> Result<()> {
        let lock_id = self.shared.lock_id()?;
        self.shared
            .pk
            .requestor()
            .put(self.shared.route(&route!("draft", "rois", self.id)))
            .header("ProKnow-Lock", lock_id)
            .json(&json!({ "name": self.name, "color": self.color, "type": self.roi_type }))
            .send()
            .await?;
        if let Some(record) = lock(&self.shared.rois).iter_mut().find(|roi| roi.id == self.id) {
            record.name = self.name.clone();
            record.color = self.color;
            record.roi_type = self.roi_type.clone();
        }
        Ok(())
    }

    /// Deletes the ROI from the draft.
    pub async fn delete(&self) -> Result<()> {
        let lock_id = self.shared.lock_id()?;
        self.shared
            .pk
            .requestor()
            .delete(self.shared.route(&route!("draft", "rois", self.id)))
            .header("ProKnow-Lock", lock_id)
            .send()
            .await?;
        lock(&self.shared.rois).retain(|roi| roi.id != self.id);
        debug!("Deleted ROI {} from structure set {}", self.id, self.shared.structure_set_id);
        Ok(())
    }

    /// Fetches the contours, lines and points of the ROI.
    pub async fn get_data(&self) -> Result<StructureSetRoiData> {
        let tag = self.tag().ok_or_else(|| {
            ProKnowError::InvalidOperation(format!("ROI `{}` no longer exists", self.id))
        })?;
        let data: Value = self
            .shared
            .pk
            .requestor()
            .get(route!("structuresets", self.shared.structure_set_id, "rois", tag))
            .header("ProKnow-Key", self.shared.key.clone())
            .fetch()
            .await?;
        Ok(StructureSetRoiData {
            shared: Arc::clone(&self.shared),
            roi_id: self.id.clone(),
            contours: data["contours"].clone(),
            lines: data["lines"].clone(),
            points: data["points"].clone(),
        })
    }
}

/// Geometry of a ROI.
#[derive(Clone, Debug)]
pub struct StructureSetRoiData {
    shared: Arc<Shared>,
    roi_id: String,
    pub contours: Value,
    pub lines: Value,
    pub points: Value,
}

impl StructureSetRoiData {
    pub fn is_editable(&self) -> bool {
        self.shared.is_editable()
    }

    /// Saves the geometry to the draft. The ROI gets a new tag.
    pub async fn save(&self) -> Result<()> {
        let lock_id = self.shared.lock_id()?;

        #[derive(Deserialize)]
        struct Saved {
            tag: String,
        }

        let saved: Saved = self
            .shared
            .pk
            .requestor()
            .put(self.shared.route(&route!("draft", "rois", self.roi_id, "data")))
            .header("ProKnow-Lock", lock_id)
            .json(&json!({
                "version": 2,
                "contours": self.contours,
                "lines": self.lines,
                "points": self.points,
            }))
            .fetch()
            .await?;
        if let Some(record) = lock(&self.shared.rois).iter_mut().find(|roi| roi.id == self.roi_id) {
            record.tag = saved.tag;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Draft,
    Approved,
    Archived,
}

/// Version history of a structure set.
#[derive(Clone, Debug)]
pub struct StructureSetVersions {
    pk: ProKnow,
    workspace_id: String,
    patient_id: String,
    structure_set_id: String,
}

impl StructureSetVersions {
    fn route(&self, tail: &str) -> String {
        format!(
            "{}{}",
            route!("workspaces", self.workspace_id, "structuresets", self.structure_set_id),
            tail
        )
    }

    /// Lists the versions, newest first.
    pub async fn query(&self) -> Result<Vec<StructureSetVersionItem>> {
        let versions: Vec<Value> = self.pk.requestor().get(self.route("/versions")).fetch().await?;
        versions
            .into_iter()
            .map(|version| StructureSetVersionItem::new(self.clone(), version))
            .collect()
    }

    /// Gets the structure set at `version`: a version id, `"approved"` or `"draft"`.
    pub async fn get(&self, version: &str) -> Result<StructureSetItem> {
        let data: Value = self
            .pk
            .requestor()
            .get(self.route(""))
            .query("version", version)
            .fetch()
            .await?;
        let entity = EntityItem::new(
            self.pk.clone(),
            &self.workspace_id,
            &self.patient_id,
            EntityType::StructureSet,
            data,
        )?;
        StructureSetItem::with_state(entity, version == "draft", None)
    }

    pub async fn delete(&self, version_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(self.route(&route!("versions", version_id)))
            .send()
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct VersionFields {
    version: String,
    status: VersionStatus,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// An entry of the version history.
#[derive(Clone, Debug)]
pub struct StructureSetVersionItem {
    versions: StructureSetVersions,
    id: String,
    status: VersionStatus,
    data: Value,
    pub label: Option<String>,
    pub message: Option<String>,
}

impl StructureSetVersionItem {
    fn new(versions: StructureSetVersions, data: Value) -> Result<Self> {
        let VersionFields {
            version,
            status,
            label,
            message,
        } = fields(&data)?;
        Ok(StructureSetVersionItem {
            versions,
            id: version,
            status,
            data,
            label,
            message,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> VersionStatus {
        self.status
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    fn reject_draft(&self, action: &str) -> Result<()> {
        if self.status == VersionStatus::Draft {
            return Err(ProKnowError::InvalidOperation(format!(
                "Draft versions of structure sets cannot be {}",
                action
            )));
        }
        Ok(())
    }

    pub async fn get(&self) -> Result<StructureSetItem> {
        match self.status {
            VersionStatus::Draft => self.versions.get("draft").await,
            _ => self.versions.get(&self.id).await,
        }
    }

    pub async fn delete(&self) -> Result<()> {
        self.reject_draft("deleted")?;
        self.versions.delete(&self.id).await
    }

    /// Downloads the DICOM file of the version once the server has generated it.
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.reject_draft("downloaded")?;
        let resolved = download_path(path.as_ref(), "RS", &self.id)?;
        self.wait_until_ready().await?;
        self.versions
            .pk
            .requestor()
            .get(self.versions.route(&route!("versions", self.id, "dicom")))
            .stream_to(&resolved)
            .await?;
        Ok(resolved)
    }

    /// Makes this version the approved one. The previously approved version is archived.
    pub async fn revert(&self) -> Result<StructureSetItem> {
        self.reject_draft("reverted")?;
        self.versions
            .pk
            .requestor()
            .post(self.versions.route(&route!("approve", self.id)))
            .send()
            .await?;
        info!(
            "Reverted structure set {} to version {}",
            self.versions.structure_set_id, self.id
        );
        self.versions.get("approved").await
    }

    /// Saves the label and message.
    pub async fn save(&self) -> Result<()> {
        self.reject_draft("saved")?;
        self.versions
            .pk
            .requestor()
            .put(self.versions.route(&route!("versions", self.id)))
            .json(&json!({ "label": self.label, "message": self.message }))
            .send()
            .await?;
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let status: Value = self
                .versions
                .pk
                .requestor()
                .get(self.versions.route(&route!("versions", self.id, "status")))
                .fetch()
                .await?;
            if status["status"] == "ready" {
                return Ok(());
            }
            if start.elapsed() > VERSION_READY_TIMEOUT {
                return Err(ProKnowError::TimeoutExceeded(
                    "Timeout of 30 seconds elapsed while waiting for structure set version"
                        .to_string(),
                ));
            }
            sleep(VERSION_POLL_DELAY).await;
        }
    }
}
