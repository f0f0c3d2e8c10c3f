//! In-memory ProKnow server used by the integration tests.
//!
//! Uploaded files are small text fixtures (see [dicom]) naming the patient, entity and entity type
//! they stand for. The server assigns ids, builds the patient tree and models structure set drafts,
//! locks and versions.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use proknow_rs::{
    ApiRequest, ApiResponse, Config, Credentials, ProKnow, RequestBody, Result, Transport,
};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn config() -> Config {
    Config::new("https://fake.proknow.com", Credentials::new("id", "secret"))
        .upload_poll_interval(Duration::from_millis(10))
}

/// Writes an upload fixture at `dir/name`.
pub fn dicom(dir: &Path, name: &str, patient: &str, entity: &str, entity_type: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(
        &path,
        format!("patient={}\nentity={}\ntype={}\n", patient, entity, entity_type),
    )
    .unwrap();
    path
}

/// Writes a structure set fixture with the given ROI names.
pub fn rtstruct(dir: &Path, name: &str, patient: &str, rois: &[&str]) -> PathBuf {
    let path = dicom(dir, name, patient, "RTSTRUCT", "structure_set");
    let mut content = fs::read_to_string(&path).unwrap();
    content.push_str(&format!("rois={}\n", rois.join(",")));
    fs::write(&path, content).unwrap();
    path
}

#[derive(Clone)]
struct Registration {
    id: String,
    identifier: String,
    overrides: Option<Value>,
}

struct Patient {
    id: String,
    workspace_id: String,
    mrn: String,
    name: String,
    entities: Vec<EntityRecord>,
}

struct EntityRecord {
    id: String,
    name: String,
    entity_type: String,
    uid: String,
}

struct Version {
    id: String,
    status: &'static str,
    label: Option<String>,
    message: Option<String>,
    rois: Vec<Value>,
}

struct Draft {
    id: String,
    rois: Vec<Value>,
    lock: Option<Value>,
}

struct StructureSet {
    id: String,
    uid: String,
    key: String,
    /// Newest first, the approved version among them.
    versions: Vec<Version>,
    draft: Option<Draft>,
}

impl StructureSet {
    fn representation(&self, version: &str, rois: &[Value]) -> Value {
        json!({
            "id": self.id,
            "type": "structure_set",
            "uid": self.uid,
            "key": self.key,
            "status": "completed",
            "description": null,
            "metadata": {},
            "data": { "version": version, "rois": rois },
        })
    }
}

struct State {
    workspaces: Vec<Value>,
    registrations: HashMap<String, Registration>,
    uploads: Vec<Value>,
    patients: Vec<Patient>,
    structure_sets: HashMap<String, StructureSet>,
    requests: Vec<ApiRequest>,
    counter: u64,
    stall_uploads: bool,
    stalled_progress: bool,
    processing_step: Option<Duration>,
    last_completion: Option<Instant>,
    processing: Vec<(Instant, Value)>,
    fail_renewals: bool,
    lock_ttl: chrono::Duration,
    renewals: usize,
}

pub struct FakeProKnow {
    state: Mutex<State>,
}

impl FakeProKnow {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeProKnow {
            state: Mutex::new(State {
                workspaces: Vec::new(),
                registrations: HashMap::new(),
                uploads: Vec::new(),
                patients: Vec::new(),
                structure_sets: HashMap::new(),
                requests: Vec::new(),
                counter: 0,
                stall_uploads: false,
                stalled_progress: false,
                processing_step: None,
                last_completion: None,
                processing: Vec::new(),
                fail_renewals: false,
                lock_ttl: chrono::Duration::minutes(5),
                renewals: 0,
            }),
        })
    }

    pub fn client(self: &Arc<Self>, config: Config) -> ProKnow {
        ProKnow::with_transport(config, Arc::clone(self) as Arc<dyn Transport>)
    }

    pub fn add_workspace(&self, name: &str) -> String {
        let id = new_id();
        self.state.lock().unwrap().workspaces.push(json!({
            "id": id,
            "slug": name.to_lowercase(),
            "name": name,
            "protected": false,
        }));
        id
    }

    /// Uploads stay in `processing` forever.
    pub fn stall_uploads(&self) {
        self.state.lock().unwrap().stall_uploads = true;
    }

    /// Uploads stay in `processing` forever, and are listed again with a new `updated_at` on every
    /// listing.
    pub fn stall_uploads_with_progress(&self) {
        let mut state = self.state.lock().unwrap();
        state.stall_uploads = true;
        state.stalled_progress = true;
    }

    /// Uploads are listed as `processing` until they resolve, one after the other, `step` apart.
    pub fn process_uploads_in_turn(&self, step: Duration) {
        self.state.lock().unwrap().processing_step = Some(step);
    }

    pub fn fail_lock_renewals(&self) {
        self.state.lock().unwrap().fail_renewals = true;
    }

    pub fn allow_lock_renewals(&self) {
        self.state.lock().unwrap().fail_renewals = false;
    }

    pub fn set_lock_ttl(&self, ttl: Duration) {
        self.state.lock().unwrap().lock_ttl = chrono::Duration::from_std(ttl).unwrap();
    }

    pub fn renewals(&self) -> usize {
        self.state.lock().unwrap().renewals
    }

    pub fn lock_held(&self, structure_set_id: &str) -> bool {
        self.state.lock().unwrap().structure_sets[structure_set_id]
            .draft
            .as_ref()
            .map_or(false, |draft| draft.lock.is_some())
    }

    pub fn has_draft(&self, structure_set_id: &str) -> bool {
        self.state.lock().unwrap().structure_sets[structure_set_id]
            .draft
            .is_some()
    }

    /// Requests received so far, matching `method` and `route_suffix`.
    pub fn requests(&self, method: &str, route_suffix: &str) -> Vec<ApiRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|request| request.method.as_str() == method && request.route.ends_with(route_suffix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for FakeProKnow {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        Ok(state.handle(&request))
    }

    async fn stream(&self, request: ApiRequest, path: &Path) -> Result<()> {
        self.state.lock().unwrap().requests.push(request.clone());
        tokio::fs::write(path, b"DICM").await?;
        Ok(())
    }
}

fn ok(value: Value) -> ApiResponse {
    ApiResponse::json_value(200, &value)
}

fn error(status: u16, message: &str) -> ApiResponse {
    ApiResponse::json_value(status, &json!({ "message": message }))
}

fn expiry(ttl: chrono::Duration) -> String {
    (Utc::now() + ttl).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rejects draft mutations not carrying the id of the held lock.
fn check_lock(draft: Option<&Draft>, request: &ApiRequest) -> Option<ApiResponse> {
    let held = draft
        .and_then(|draft| draft.lock.as_ref())
        .and_then(|lock| lock["id"].as_str());
    match (held, request.header("ProKnow-Lock")) {
        (Some(held), Some(sent)) if held == sent => None,
        _ => Some(error(409, "lock required")),
    }
}

fn roi_ids(rois: &[Value]) -> Vec<String> {
    rois.iter()
        .filter_map(|roi| roi["id"].as_str().map(String::from))
        .collect()
}

impl State {
    fn handle(&mut self, request: &ApiRequest) -> ApiResponse {
        let route = request.route.clone();
        let segments: Vec<&str> = route.trim_start_matches('/').split('/').collect();
        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["workspaces"]) => ok(json!(self.workspaces)),
            ("POST", ["workspaces", _, "uploads"]) => self.register(request),
            ("GET", ["workspaces", _, "uploads"]) => {
                self.resolve_processed();
                self.touch_stalled();
                self.list_uploads(request)
            }
            ("POST", ["uploads", "chunks"]) => self.receive_chunk(request),
            ("GET", ["workspaces", _, "patients", patient_id]) => self.patient(patient_id),
            ("GET", ["workspaces", _, "structuresets", id]) => {
                self.structure_set(id, request.query_param("version"))
            }
            ("GET", ["workspaces", _, _, id]) => self.entity(id),
            (method, ["workspaces", _, "structuresets", id, rest @ ..]) => {
                self.structure_set_route(method, id, rest, request)
            }
            ("GET", ["structuresets", id, "rois", _]) => match self.structure_sets.get(*id) {
                Some(structure_set) if request.header("ProKnow-Key") == Some(structure_set.key.as_str()) => {
                    ok(json!({ "contours": [], "lines": [], "points": [] }))
                }
                Some(_) => error(401, "invalid key"),
                None => error(404, "not found"),
            },
            _ => error(404, "not found"),
        }
    }

    fn register(&mut self, request: &ApiRequest) -> ApiResponse {
        let body = request.json_body().cloned().unwrap_or(Value::Null);
        let registration = Registration {
            id: new_id(),
            identifier: new_id(),
            overrides: body.get("overrides").cloned(),
        };
        let key = new_id();
        let response = json!({
            "id": registration.id,
            "key": key,
            "identifier": registration.identifier,
        });
        self.registrations.insert(key, registration);
        ok(response)
    }

    fn next_updated_at(&mut self) -> String {
        self.counter += 1;
        format!("2024-01-01T00:00:00.{:06}Z", self.counter)
    }

    /// Moves `upload` to the end of the listing with a fresh `updated_at`.
    fn replace_upload(&mut self, mut upload: Value) {
        upload["updated_at"] = json!(self.next_updated_at());
        self.uploads.retain(|listed| listed["id"] != upload["id"]);
        self.uploads.push(upload);
    }

    /// Publishes the final state of an upload, or holds it back while it is processing.
    fn publish(&mut self, upload: Value) {
        let Some(step) = self.processing_step else {
            self.uploads.push(upload);
            return;
        };
        let now = Instant::now();
        let due = self.last_completion.map_or(now, |last| last.max(now)) + step;
        self.last_completion = Some(due);
        self.uploads.push(json!({
            "id": upload["id"],
            "status": "processing",
            "updated_at": upload["updated_at"],
        }));
        self.processing.push((due, upload));
    }

    fn resolve_processed(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processing)
            .into_iter()
            .partition(|(due, _)| *due <= now);
        self.processing = pending;
        for (_, upload) in due {
            self.replace_upload(upload);
        }
    }

    fn touch_stalled(&mut self) {
        if !self.stalled_progress {
            return;
        }
        let stalled: Vec<Value> = self
            .uploads
            .iter()
            .filter(|upload| upload["status"] == "processing")
            .cloned()
            .collect();
        for upload in stalled {
            self.replace_upload(upload);
        }
    }

    /// Uploads updated after the `(updated, after)` cursor, oldest first.
    fn list_uploads(&self, request: &ApiRequest) -> ApiResponse {
        let cursor = request.query_param("updated").zip(request.query_param("after"));
        let listed: Vec<&Value> = self
            .uploads
            .iter()
            .filter(|upload| {
                let key = (
                    upload["updated_at"].as_str().unwrap_or_default(),
                    upload["id"].as_str().unwrap_or_default(),
                );
                cursor.map_or(true, |cursor| key > cursor)
            })
            .collect();
        ok(json!(listed))
    }

    fn receive_chunk(&mut self, request: &ApiRequest) -> ApiResponse {
        let Some(registration) = request
            .header("ProKnow-Key")
            .and_then(|key| self.registrations.get(key))
            .cloned()
        else {
            return error(401, "invalid key");
        };
        let RequestBody::File { fields, path } = &request.body else {
            return error(400, "file expected");
        };
        let identifier = fields
            .iter()
            .find(|(name, _)| name == "flowIdentifier")
            .map(|(_, value)| value.as_str());
        if identifier != Some(registration.identifier.as_str()) {
            return error(400, "identifier mismatch");
        }
        let Ok(content) = fs::read_to_string(path) else {
            return error(400, "unreadable file");
        };
        let declared: HashMap<&str, &str> = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .collect();

        let updated_at = self.next_updated_at();
        if self.stall_uploads {
            self.uploads.push(json!({
                "id": registration.id,
                "status": "processing",
                "updated_at": updated_at,
            }));
            return ok(json!({}));
        }
        if declared.get("status") == Some(&"failed") {
            self.publish(json!({
                "id": registration.id,
                "status": "failed",
                "updated_at": updated_at,
                "patient": null,
                "entity": null,
            }));
            return ok(json!({}));
        }

        let workspace_id = self.workspaces[0]["id"].as_str().unwrap_or_default().to_string();
        let mrn = registration
            .overrides
            .as_ref()
            .and_then(|overrides| overrides.pointer("/patient/mrn"))
            .and_then(Value::as_str)
            .unwrap_or(declared["patient"])
            .to_string();
        let position = match self.patients.iter().position(|patient| patient.mrn == mrn) {
            Some(position) => position,
            None => {
                self.patients.push(Patient {
                    id: new_id(),
                    workspace_id,
                    name: format!("Patient {}", mrn),
                    mrn,
                    entities: Vec::new(),
                });
                self.patients.len() - 1
            }
        };
        let patient = &mut self.patients[position];
        let entity_name = declared["entity"];
        let entity_type = declared.get("type").copied().unwrap_or("image_set");
        let entity_position = match patient.entities.iter().position(|entity| entity.name == entity_name) {
            Some(position) => position,
            None => {
                let entity = EntityRecord {
                    id: new_id(),
                    name: entity_name.to_string(),
                    entity_type: entity_type.to_string(),
                    uid: format!("1.2.826.0.1.{}", self.counter),
                };
                if entity_type == "structure_set" {
                    let rois = declared
                        .get("rois")
                        .map(|names| {
                            names
                                .split(',')
                                .map(|name| {
                                    json!({
                                        "id": new_id(),
                                        "tag": new_id(),
                                        "name": name,
                                        "color": [255, 255, 0],
                                        "type": "ORGAN",
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    self.structure_sets.insert(
                        entity.id.clone(),
                        StructureSet {
                            id: entity.id.clone(),
                            uid: entity.uid.clone(),
                            key: new_id(),
                            versions: vec![Version {
                                id: new_id(),
                                status: "approved",
                                label: None,
                                message: None,
                                rois,
                            }],
                            draft: None,
                        },
                    );
                }
                patient.entities.push(entity);
                patient.entities.len() - 1
            }
        };
        let entity = &patient.entities[entity_position];
        let upload = json!({
            "id": registration.id,
            "status": "completed",
            "updated_at": updated_at,
            "patient": { "id": patient.id, "mrn": patient.mrn, "name": patient.name },
            "entity": { "id": entity.id, "type": entity.entity_type, "uid": entity.uid },
        });
        self.publish(upload);
        ok(json!({}))
    }

    fn patient(&self, patient_id: &str) -> ApiResponse {
        let Some(patient) = self.patients.iter().find(|patient| patient.id == patient_id) else {
            return error(404, "patient not found");
        };
        let entities: Vec<Value> = patient
            .entities
            .iter()
            .map(|entity| {
                json!({
                    "id": entity.id,
                    "type": entity.entity_type,
                    "uid": entity.uid,
                    "status": "completed",
                    "entities": [],
                })
            })
            .collect();
        ok(json!({
            "id": patient.id,
            "workspace": patient.workspace_id,
            "mrn": patient.mrn,
            "name": patient.name,
            "birth_date": null,
            "sex": null,
            "metadata": {},
            "studies": [{ "id": format!("study-{}", patient.id), "entities": entities }],
        }))
    }

    fn entity(&self, entity_id: &str) -> ApiResponse {
        let found = self
            .patients
            .iter()
            .flat_map(|patient| patient.entities.iter())
            .find(|entity| entity.id == entity_id);
        match found {
            Some(entity) => ok(json!({
                "id": entity.id,
                "type": entity.entity_type,
                "uid": entity.uid,
                "status": "completed",
                "description": null,
                "metadata": {},
                "data": {},
            })),
            None => error(404, "entity not found"),
        }
    }

    fn structure_set(&self, id: &str, version: Option<&str>) -> ApiResponse {
        let Some(structure_set) = self.structure_sets.get(id) else {
            return error(404, "structure set not found");
        };
        match version {
            Some("draft") => match &structure_set.draft {
                Some(draft) => ok(structure_set.representation(&draft.id, &draft.rois)),
                None => error(404, "no draft"),
            },
            Some("approved") | None => {
                match structure_set.versions.iter().find(|version| version.status == "approved") {
                    Some(approved) => ok(structure_set.representation(&approved.id, &approved.rois)),
                    None => error(404, "no approved version"),
                }
            }
            Some(version_id) => {
                match structure_set.versions.iter().find(|version| version.id == version_id) {
                    Some(found) => ok(structure_set.representation(&found.id, &found.rois)),
                    None => error(404, "version not found"),
                }
            }
        }
    }

    fn structure_set_route(
        &mut self,
        method: &str,
        id: &str,
        rest: &[&str],
        request: &ApiRequest,
    ) -> ApiResponse {
        let ttl = self.lock_ttl;
        let fail_renewals = self.fail_renewals;
        let Some(structure_set) = self.structure_sets.get_mut(id) else {
            return error(404, "structure set not found");
        };
        let body = request.json_body().cloned().unwrap_or(Value::Null);

        match (method, rest) {
            ("POST", ["draft"]) => {
                if structure_set.draft.as_ref().map_or(false, |draft| draft.lock.is_some()) {
                    return error(409, "draft lock is held");
                }
                let lock = json!({ "id": new_id(), "expires_at": expiry(ttl) });
                match structure_set.draft.as_mut() {
                    Some(draft) => draft.lock = Some(lock.clone()),
                    None => {
                        let rois = structure_set
                            .versions
                            .iter()
                            .find(|version| version.status == "approved")
                            .map(|version| version.rois.clone())
                            .unwrap_or_default();
                        structure_set.draft = Some(Draft {
                            id: new_id(),
                            rois,
                            lock: Some(lock.clone()),
                        });
                    }
                }
                ok(lock)
            }
            ("GET", ["draft", "lock"]) => {
                match structure_set.draft.as_ref().and_then(|draft| draft.lock.clone()) {
                    Some(lock) => ok(lock),
                    None => error(404, "no lock"),
                }
            }
            ("PUT", ["draft", "lock", lock_id]) => {
                if fail_renewals {
                    return error(409, "lock expired");
                }
                match structure_set.draft.as_mut().and_then(|draft| draft.lock.as_mut()) {
                    Some(lock) if lock["id"] == *lock_id => {
                        *lock = json!({ "id": lock_id, "expires_at": expiry(ttl) });
                        let renewed = lock.clone();
                        self.renewals += 1;
                        ok(renewed)
                    }
                    _ => error(404, "no lock"),
                }
            }
            ("DELETE", ["draft", "lock", lock_id]) => {
                match structure_set.draft.as_mut() {
                    Some(draft) if draft.lock.as_ref().map_or(false, |lock| lock["id"] == *lock_id) => {
                        draft.lock = None;
                        ok(json!({}))
                    }
                    _ => error(404, "no lock"),
                }
            }
            ("POST", ["draft", "approve"]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                let Some(draft) = structure_set.draft.take() else {
                    return error(404, "no draft");
                };
                let submitted = body["rois"].as_array().map(|rois| roi_ids(rois)).unwrap_or_default();
                if submitted != roi_ids(&draft.rois) || body["version"] != draft.id.as_str() {
                    structure_set.draft = Some(draft);
                    return error(400, "draft changed");
                }
                for version in structure_set.versions.iter_mut() {
                    if version.status == "approved" {
                        version.status = "archived";
                    }
                }
                structure_set.versions.insert(
                    0,
                    Version {
                        id: new_id(),
                        status: "approved",
                        label: body["label"].as_str().map(String::from),
                        message: body["message"].as_str().map(String::from),
                        rois: draft.rois,
                    },
                );
                ok(json!({}))
            }
            ("POST", ["draft", "discard"]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                structure_set.draft = None;
                ok(json!({}))
            }
            ("POST", ["draft", "rois"]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                let roi = json!({
                    "id": new_id(),
                    "tag": new_id(),
                    "name": body["name"],
                    "color": body["color"],
                    "type": body["type"],
                });
                if let Some(draft) = structure_set.draft.as_mut() {
                    draft.rois.push(roi.clone());
                }
                ok(roi)
            }
            ("PUT", ["draft", "rois", roi_id]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                let roi = structure_set
                    .draft
                    .as_mut()
                    .and_then(|draft| draft.rois.iter_mut().find(|roi| roi["id"] == *roi_id));
                match roi {
                    Some(roi) => {
                        for field in ["name", "color", "type"] {
                            roi[field] = body[field].clone();
                        }
                        ok(roi.clone())
                    }
                    None => error(404, "roi not found"),
                }
            }
            ("DELETE", ["draft", "rois", roi_id]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                if let Some(draft) = structure_set.draft.as_mut() {
                    draft.rois.retain(|roi| roi["id"] != *roi_id);
                }
                ok(json!({}))
            }
            ("PUT", ["draft", "rois", roi_id, "data"]) => {
                if let Some(rejected) = check_lock(structure_set.draft.as_ref(), request) {
                    return rejected;
                }
                if body["version"] != 2 {
                    return error(400, "unsupported geometry version");
                }
                let roi = structure_set
                    .draft
                    .as_mut()
                    .and_then(|draft| draft.rois.iter_mut().find(|roi| roi["id"] == *roi_id));
                match roi {
                    Some(roi) => {
                        let tag = new_id();
                        roi["tag"] = json!(tag);
                        ok(json!({ "tag": tag }))
                    }
                    None => error(404, "roi not found"),
                }
            }
            ("GET", ["versions"]) => {
                let mut versions = Vec::new();
                if let Some(draft) = &structure_set.draft {
                    versions.push(json!({
                        "version": draft.id,
                        "status": "draft",
                        "label": null,
                        "message": null,
                    }));
                }
                versions.extend(structure_set.versions.iter().map(|version| {
                    json!({
                        "version": version.id,
                        "status": version.status,
                        "label": version.label,
                        "message": version.message,
                    })
                }));
                ok(json!(versions))
            }
            ("GET", ["versions", _, "status"]) => ok(json!({ "status": "ready" })),
            ("PUT", ["versions", version_id]) => {
                match structure_set.versions.iter_mut().find(|version| version.id == *version_id) {
                    Some(version) => {
                        version.label = body["label"].as_str().map(String::from);
                        version.message = body["message"].as_str().map(String::from);
                        ok(json!({}))
                    }
                    None => error(404, "version not found"),
                }
            }
            ("DELETE", ["versions", version_id]) => {
                structure_set.versions.retain(|version| version.id != *version_id);
                ok(json!({}))
            }
            ("POST", ["approve", version_id]) => {
                let Some(position) = structure_set
                    .versions
                    .iter()
                    .position(|version| version.id == *version_id)
                else {
                    return error(404, "version not found");
                };
                for version in structure_set.versions.iter_mut() {
                    if version.status == "approved" {
                        version.status = "archived";
                    }
                }
                let mut reverted = structure_set.versions.remove(position);
                reverted.status = "approved";
                structure_set.versions.insert(0, reverted);
                ok(json!({}))
            }
            _ => error(404, "not found"),
        }
    }
}
