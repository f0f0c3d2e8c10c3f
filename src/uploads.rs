//! DICOM uploads.
//!
//! An upload goes through four steps:
//! 1. the input paths are expanded into a list of files (directories recursively, empty files
//!    skipped);
//! 2. each file is hashed and registered, then its bytes are sent as a single chunk. Chunks are
//!    transmitted concurrently while the following files are registered;
//! 3. once every transmission is done, the upload listing of the workspace is polled until each
//!    upload reaches a terminal status;
//! 4. the completed uploads are gathered in an [UploadBatch] indexing patients and entities.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, Read},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    error::{ProKnowError, Result},
    fields,
    patients::{entities::Entity, PatientItem},
    requestor::{route, Requestor},
    ProKnow,
};

const CHECKSUM_BLOCK_SIZE: usize = 8192;
const MAX_POLL_DELAY: Duration = Duration::from_secs(1);
const MAX_EMPTY_PAGES: u32 = 3;

/// Options of [Uploads::upload_with].
#[derive(Clone, Debug)]
pub struct UploadOptions {
    /// Values forced onto the uploaded objects, e.g. `{"patient": {"mrn": ..., "name": ...}}`.
    pub overrides: Option<Value>,
    /// Id of the patient the uploaded objects must belong to.
    pub scope: Option<String>,
    /// Whether to wait for the uploads to be processed.
    pub wait: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            overrides: None,
            scope: None,
            wait: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl UploadStatus {
    /// Whether the server is done with the upload. `pending` uploads wait for a manual action and
    /// are considered terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Pending | UploadStatus::Failed
        )
    }
}

#[derive(Debug, Deserialize)]
struct Registration {
    id: String,
    key: String,
    identifier: String,
}

/// One file of an upload.
#[derive(Debug)]
struct UploadTask {
    path: PathBuf,
    registration: Registration,
    result: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct Uploads {
    pk: ProKnow,
}

impl Uploads {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Uploads { pk }
    }

    /// Uploads files or directories to `workspace` (an id or a name) and waits for the server to
    /// process them.
    pub async fn upload<I, P>(&self, workspace: &str, paths: I) -> Result<UploadBatch>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.upload_and_wait(workspace, paths, None, None).await
    }

    /// Same as [Uploads::upload] with options. Returns `None` when `options.wait` is false.
    pub async fn upload_with<I, P>(
        &self,
        workspace: &str,
        paths: I,
        options: UploadOptions,
    ) -> Result<Option<UploadBatch>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let UploadOptions {
            overrides,
            scope,
            wait,
        } = options;
        if wait {
            let batch = self
                .upload_and_wait(workspace, paths, overrides, scope.as_deref())
                .await?;
            return Ok(Some(batch));
        }
        self.start(workspace, paths, overrides, scope.as_deref())
            .await?;
        Ok(None)
    }

    pub(crate) async fn upload_and_wait<I, P>(
        &self,
        workspace: &str,
        paths: I,
        overrides: Option<Value>,
        scope: Option<&str>,
    ) -> Result<UploadBatch>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let (workspace_id, mut tasks) = self.start(workspace, paths, overrides, scope).await?;
        self.wait_for_terminal(&workspace_id, &mut tasks).await?;
        let files = tasks
            .into_iter()
            .filter_map(|task| task.result.map(|upload| (task.path, upload)))
            .collect();
        UploadBatch::new(self.pk.clone(), &workspace_id, files)
    }

    /// Registers and transmits every file, returning once all transmissions are done.
    async fn start<I, P>(
        &self,
        workspace: &str,
        paths: I,
        overrides: Option<Value>,
        scope: Option<&str>,
    ) -> Result<(String, Vec<UploadTask>)>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let files = discover(paths)?;
        let workspace = self.pk.workspaces().resolve(workspace).await?;
        let workspace_id = workspace.id().to_string();
        info!("Uploading {} files to workspace {}", files.len(), workspace.name);

        let permits = Arc::new(Semaphore::new(self.pk.config().upload_concurrency));
        let mut transmissions = Transmissions::default();
        let mut tasks = Vec::with_capacity(files.len());
        for path in files {
            let checksum_path = path.clone();
            let (checksum, size) =
                tokio::task::spawn_blocking(move || checksum(&checksum_path)).await??;

            let mut body = json!({
                "checksum": checksum,
                "name": path.to_string_lossy(),
                "size": size,
                "multipart": false,
            });
            if let Some(overrides) = &overrides {
                body["overrides"] = overrides.clone();
            }
            if let Some(scope) = scope {
                body["scope"] = json!(scope);
            }
            let registration: Registration = self
                .pk
                .requestor()
                .post(route!("workspaces", workspace_id, "uploads"))
                .json(&body)
                .fetch()
                .await?;
            debug!("Registered {} as upload {}", path.display(), registration.id);

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| ProKnowError::UnexpectedResponse(e.to_string()))?;
            let requestor = self.pk.requestor().clone();
            let chunk_path = path.clone();
            let key = registration.key.clone();
            let identifier = registration.identifier.clone();
            transmissions.push(tokio::spawn(async move {
                let result = transmit(&requestor, &chunk_path, size, &key, &identifier).await;
                drop(permit);
                result
            }));

            tasks.push(UploadTask {
                path,
                registration,
                result: None,
            });
        }

        transmissions.join().await?;
        debug!("Transmitted {} files", tasks.len());
        Ok((workspace_id, tasks))
    }

    /// Polls the upload listing until every task reaches a terminal status.
    ///
    /// The listing is read from a cursor set on the last upload seen. Fails when no upload
    /// resolves within the configured timeout.
    async fn wait_for_terminal(&self, workspace_id: &str, tasks: &mut [UploadTask]) -> Result<()> {
        let config = self.pk.config();
        let mut cursor: Vec<(String, String)> = Vec::new();
        let mut last_change = Instant::now();
        let mut delay = config.upload_poll_interval;
        let mut empty_pages = 0;

        loop {
            let uploads: Vec<Value> = self
                .pk
                .requestor()
                .get(route!("workspaces", workspace_id, "uploads"))
                .query_pairs(&cursor)
                .fetch()
                .await?;

            let mut resolved = 0;
            let mut done = true;
            for task in tasks.iter_mut().filter(|task| task.result.is_none()) {
                let terminal = uploads.iter().find(|upload| {
                    upload["id"].as_str() == Some(task.registration.id.as_str())
                        && status_of(upload).is_terminal()
                });
                match terminal {
                    Some(upload) => {
                        debug!("Upload of {} is {:?}", task.path.display(), status_of(upload));
                        task.result = Some(upload.clone());
                        resolved += 1;
                    }
                    None => done = false,
                }
            }

            if resolved > 0 {
                last_change = Instant::now();
                delay = config.upload_poll_interval;
            }
            if done {
                info!("Processed {} uploads", tasks.len());
                return Ok(());
            }
            if last_change.elapsed() > config.upload_timeout {
                return Err(ProKnowError::TimeoutExceeded(format!(
                    "Timeout of {} seconds elapsed while waiting for uploads to finish",
                    config.upload_timeout.as_secs()
                )));
            }

            match uploads.last() {
                Some(last) => {
                    cursor = vec![
                        ("updated".to_string(), text(&last["updated_at"])),
                        ("after".to_string(), text(&last["id"])),
                    ];
                    empty_pages = 0;
                    sleep(config.upload_poll_interval).await;
                }
                None => {
                    empty_pages += 1;
                    delay = (delay * 2).min(MAX_POLL_DELAY);
                    if empty_pages > MAX_EMPTY_PAGES {
                        cursor.clear();
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}

/// In-flight chunk transmissions. Those still running when dropped are aborted.
#[derive(Default)]
struct Transmissions {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Transmissions {
    fn push(&mut self, handle: JoinHandle<Result<()>>) {
        self.handles.push(handle);
    }

    /// Waits for every transmission, failing on the first error.
    async fn join(mut self) -> Result<()> {
        for handle in self.handles.iter_mut() {
            handle.await??;
        }
        Ok(())
    }
}

impl Drop for Transmissions {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn transmit(
    requestor: &Requestor,
    path: &Path,
    size: u64,
    key: &str,
    identifier: &str,
) -> Result<()> {
    let filename = path.to_string_lossy().into_owned();
    let size = size.to_string();
    let form = vec![
        ("flowChunkNumber".to_string(), "1".to_string()),
        ("flowChunkSize".to_string(), size.clone()),
        ("flowCurrentChunkSize".to_string(), size.clone()),
        ("flowTotalChunks".to_string(), "1".to_string()),
        ("flowTotalSize".to_string(), size),
        ("flowIdentifier".to_string(), identifier.to_string()),
        ("flowFilename".to_string(), filename),
        ("flowMultipart".to_string(), "false".to_string()),
    ];
    requestor
        .post("/uploads/chunks")
        .header("ProKnow-Key", key)
        .file(form, path)
        .send()
        .await?;
    Ok(())
}

/// Expands `paths` into absolute file paths. Directories are walked recursively and their empty
/// files skipped.
fn discover<I, P>(paths: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut files = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(io::Error::from)?;
                if entry.path().is_file() && entry.path().metadata()?.len() > 0 {
                    files.push(absolute_path(entry.path())?);
                }
            }
        } else if path.is_file() {
            files.push(absolute_path(path)?);
        } else {
            return Err(ProKnowError::InvalidPath(format!(
                "`{}` is invalid.",
                path.display()
            )));
        }
    }
    Ok(files)
}

/// `path` made absolute, with `.` and `..` components resolved lexically.
fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// MD5 of the file as lowercase hex, with the file size. The file is read block by block.
fn checksum(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0; CHECKSUM_BLOCK_SIZE];
    let mut size = 0;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

fn status_of(upload: &Value) -> UploadStatus {
    serde_json::from_value(upload["status"].clone()).unwrap_or(UploadStatus::Unknown)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct Reference {
    id: String,
}

#[derive(Deserialize)]
struct CompletedUpload {
    patient: Option<Value>,
    entity: Option<Value>,
}

/// Result of an upload: the status of every file and the patients and entities they produced.
#[derive(Debug)]
pub struct UploadBatch {
    uploads: HashMap<PathBuf, Value>,
    patients: Vec<UploadPatientSummary>,
    patient_index: HashMap<String, usize>,
    entity_index: HashMap<String, (usize, usize)>,
}

impl UploadBatch {
    /// Builds the batch from `(path, upload)` pairs. Patients and entities are de-duplicated by
    /// id, in the order they first appear.
    fn new(pk: ProKnow, workspace_id: &str, files: Vec<(PathBuf, Value)>) -> Result<Self> {
        let mut batch = UploadBatch {
            uploads: HashMap::new(),
            patients: Vec::new(),
            patient_index: HashMap::new(),
            entity_index: HashMap::new(),
        };
        for (path, upload) in files {
            if status_of(&upload) == UploadStatus::Completed {
                let CompletedUpload { patient, entity } = fields(&upload)?;
                let (Some(patient), Some(entity)) = (patient, entity) else {
                    return Err(ProKnowError::UnexpectedResponse(format!(
                        "completed upload of `{}` has no patient or entity",
                        path.display()
                    )));
                };
                let Reference { id: patient_id } = fields(&patient)?;
                let Reference { id: entity_id } = fields(&entity)?;

                let patient_position = match batch.patient_index.get(&patient_id) {
                    Some(position) => *position,
                    None => {
                        batch.patients.push(UploadPatientSummary {
                            pk: pk.clone(),
                            workspace_id: workspace_id.to_string(),
                            id: patient_id.clone(),
                            data: patient,
                            entities: Vec::new(),
                        });
                        batch.patient_index.insert(patient_id.clone(), batch.patients.len() - 1);
                        batch.patients.len() - 1
                    }
                };
                if !batch.entity_index.contains_key(&entity_id) {
                    let entities = &mut batch.patients[patient_position].entities;
                    entities.push(UploadEntitySummary {
                        pk: pk.clone(),
                        workspace_id: workspace_id.to_string(),
                        patient_id,
                        id: entity_id.clone(),
                        data: entity,
                    });
                    batch
                        .entity_index
                        .insert(entity_id, (patient_position, entities.len() - 1));
                }
            }
            batch.uploads.insert(path, upload);
        }
        Ok(batch)
    }

    pub fn patients(&self) -> &[UploadPatientSummary] {
        &self.patients
    }

    /// The upload record of `path`, as last seen while polling. Relative paths are resolved
    /// against the current directory.
    pub fn upload(&self, path: impl AsRef<Path>) -> Option<&Value> {
        let path = path.as_ref();
        let key = absolute_path(path).unwrap_or_else(|_| path.to_path_buf());
        self.uploads.get(&key)
    }

    pub fn status(&self, path: impl AsRef<Path>) -> Option<UploadStatus> {
        self.upload(path).map(status_of)
    }

    /// The patient the file at `path` was uploaded to.
    pub fn find_patient(&self, path: impl AsRef<Path>) -> Result<&UploadPatientSummary> {
        let upload = self.completed_upload(path.as_ref())?;
        self.patient_index
            .get(upload["patient"]["id"].as_str().unwrap_or_default())
            .map(|position| &self.patients[*position])
            .ok_or_else(|| ProKnowError::UnexpectedResponse("patient missing from batch".to_string()))
    }

    /// The entity the file at `path` was uploaded as.
    pub fn find_entity(&self, path: impl AsRef<Path>) -> Result<&UploadEntitySummary> {
        let upload = self.completed_upload(path.as_ref())?;
        self.entity_index
            .get(upload["entity"]["id"].as_str().unwrap_or_default())
            .map(|(patient, entity)| &self.patients[*patient].entities[*entity])
            .ok_or_else(|| ProKnowError::UnexpectedResponse("entity missing from batch".to_string()))
    }

    fn completed_upload(&self, path: &Path) -> Result<&Value> {
        let upload = self.upload(path).ok_or_else(|| {
            ProKnowError::InvalidPath(format!("`{}` not found in current batch", path.display()))
        })?;
        if status_of(upload) != UploadStatus::Completed {
            return Err(ProKnowError::InvalidOperation(
                "Upload is not complete".to_string(),
            ));
        }
        Ok(upload)
    }
}

/// A patient touched by an upload batch, with the entities the batch produced for it.
#[derive(Clone, Debug)]
pub struct UploadPatientSummary {
    pk: ProKnow,
    workspace_id: String,
    id: String,
    data: Value,
    entities: Vec<UploadEntitySummary>,
}

impl UploadPatientSummary {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn entities(&self) -> &[UploadEntitySummary] {
        &self.entities
    }

    pub async fn get(&self) -> Result<PatientItem> {
        self.pk.patients().get(&self.workspace_id, &self.id).await
    }
}

#[derive(Clone, Debug)]
pub struct UploadEntitySummary {
    pk: ProKnow,
    workspace_id: String,
    patient_id: String,
    id: String,
    data: Value,
}

impl UploadEntitySummary {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Fetches the full entity through the patient it belongs to.
    pub async fn get(&self) -> Result<Entity> {
        let patient = self.pk.patients().get(&self.workspace_id, &self.patient_id).await?;
        let summary = patient
            .find_entities(|entity| entity.id() == self.id)
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProKnowError::UnexpectedResponse(format!(
                    "entity `{}` not found in patient `{}`",
                    self.id, self.patient_id
                ))
            })?;
        summary.get().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApiRequest, ApiResponse, Config, Credentials, Transport};
    use async_trait::async_trait;
    use std::io::Write;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn send(&self, _request: ApiRequest) -> Result<ApiResponse> {
            Ok(ApiResponse::new(503, ""))
        }

        async fn stream(&self, _request: ApiRequest, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn pk() -> ProKnow {
        let config = Config::new("https://example.proknow.com", Credentials::new("id", "secret"));
        ProKnow::with_transport(config, Arc::new(Offline))
    }

    fn completed(upload_id: &str, patient_id: &str, entity_id: &str) -> Value {
        json!({
            "id": upload_id,
            "status": "completed",
            "patient": { "id": patient_id, "mrn": "MRN" },
            "entity": { "id": entity_id, "type": "image_set" },
        })
    }

    #[test]
    fn checksum_matches_md5_of_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let (checksum, size) = checksum(file.path()).unwrap();
        assert_eq!(checksum, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(size, 11);
    }

    #[test]
    fn checksum_spans_several_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = vec![7u8; CHECKSUM_BLOCK_SIZE * 2 + 5];
        file.write_all(&content).unwrap();
        let (checksum, size) = checksum(file.path()).unwrap();
        assert_eq!(checksum, hex::encode(Md5::digest(&content)));
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn discover_walks_directories_and_skips_empty_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("series")).unwrap();
        std::fs::write(root.path().join("series").join("a.dcm"), b"a").unwrap();
        std::fs::write(root.path().join("series").join("b.dcm"), b"b").unwrap();
        std::fs::write(root.path().join("empty.dcm"), b"").unwrap();
        std::fs::write(root.path().join("plan.dcm"), b"p").unwrap();

        let files = discover([root.path()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|path| path.strip_prefix(root.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("plan.dcm"),
                PathBuf::from("series/a.dcm"),
                PathBuf::from("series/b.dcm"),
            ]
        );
        assert!(files.iter().all(|path| path.is_absolute()));
    }

    #[test]
    fn discover_resolves_parent_components() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("series")).unwrap();
        std::fs::write(root.path().join("series").join("a.dcm"), b"a").unwrap();
        let file = root.path().join("series").join("..").join("series").join(".").join("a.dcm");
        let directory = root.path().join("series").join("..").join("series");

        let files = discover([&file, &directory]).unwrap();
        let expected = std::path::absolute(root.path().join("series").join("a.dcm")).unwrap();
        assert_eq!(files, vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn batch_lookups_resolve_parent_components() {
        let files = vec![(PathBuf::from("/a/1.dcm"), completed("u1", "p1", "e1"))];
        let batch = UploadBatch::new(pk(), "w1", files).unwrap();

        assert_eq!(batch.find_entity("/a/b/../1.dcm").unwrap().id(), "e1");
        assert_eq!(batch.status("/a/./1.dcm"), Some(UploadStatus::Completed));
    }

    #[test]
    fn discover_rejects_missing_paths() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let err = discover([&missing]).unwrap_err();
        assert_eq!(err.to_string(), format!("`{}` is invalid.", missing.display()));
    }

    #[tokio::test]
    async fn batch_groups_entities_by_patient() {
        let files = vec![
            (PathBuf::from("/a/1.dcm"), completed("u1", "p1", "e1")),
            (PathBuf::from("/a/2.dcm"), completed("u2", "p1", "e1")),
            (PathBuf::from("/a/3.dcm"), completed("u3", "p1", "e2")),
            (PathBuf::from("/b/1.dcm"), completed("u4", "p2", "e3")),
            (
                PathBuf::from("/b/2.dcm"),
                json!({ "id": "u5", "status": "failed", "patient": null, "entity": null }),
            ),
        ];
        let batch = UploadBatch::new(pk(), "w1", files).unwrap();

        let patients: Vec<_> = batch.patients().iter().map(|p| p.id()).collect();
        assert_eq!(patients, vec!["p1", "p2"]);
        let entities: Vec<_> = batch.patients()[0].entities().iter().map(|e| e.id()).collect();
        assert_eq!(entities, vec!["e1", "e2"]);

        assert_eq!(batch.find_entity("/a/2.dcm").unwrap().id(), "e1");
        assert_eq!(batch.find_patient("/b/1.dcm").unwrap().id(), "p2");
        assert_eq!(batch.status("/b/2.dcm"), Some(UploadStatus::Failed));

        let err = batch.find_entity("/b/2.dcm").unwrap_err();
        assert!(matches!(err, ProKnowError::InvalidOperation(_)));
        let err = batch.find_patient("/c/1.dcm").unwrap_err();
        assert_eq!(err.to_string(), "`/c/1.dcm` not found in current batch");
    }

    #[tokio::test]
    async fn completed_upload_without_entity_is_rejected() {
        let files = vec![(
            PathBuf::from("/a/1.dcm"),
            json!({ "id": "u1", "status": "completed", "patient": { "id": "p1" }, "entity": null }),
        )];
        let err = UploadBatch::new(pk(), "w1", files).unwrap_err();
        assert!(matches!(err, ProKnowError::UnexpectedResponse(_)));
    }

    #[test]
    fn pending_uploads_are_terminal() {
        assert!(status_of(&json!({ "status": "pending" })).is_terminal());
        assert!(!status_of(&json!({ "status": "processing" })).is_terminal());
        assert_eq!(status_of(&json!({ "status": "queued" })), UploadStatus::Unknown);
    }
}
