//! # proknow_rs
//! ## Before you begin
//! This library is intended to be used with the ProKnow API. To use this library, you must have the URL of your ProKnow
//! organization (e.g. `https://example.proknow.com`) and an API key. The API key is created from the ProKnow user
//! interface and comes as a JSON credentials file holding an `id` and a `secret`.
//!
//! Both values may be read from the environment, more details in the [Config] documentation.
//!
//! ## Description
//! **proknow_rs** is a client library in Rust for the ProKnow API, a radiation oncology data management service.
//! It provides typed wrappers for the resources of an organization: workspaces, patients and their entities (image
//! sets, structure sets, plans and doses), scorecards, custom metrics, collections, users, roles and audit logs.
//!
//! Two workflows do more than a single request:
//!
//! 1. Uploading DICOM files with [Uploads::upload]: files are hashed, registered and streamed concurrently, then the
//!    upload listing is polled until every file is resolved to a patient and an entity, see [UploadBatch].
//! 2. Editing a structure set with [StructureSetItem::draft]: the draft lock is checked out, renewed in the
//!    background, and released when the draft is approved, discarded or given up, see [StructureSetItem::edit_draft].
//!
//! Every request goes through a [Transport]. [ProKnow::new] uses the reqwest backed [HttpTransport] while
//! [ProKnow::with_transport] accepts any implementation.
//!
//! ## Example
//! The following example uploads a directory of DICOM files and approves a new version of the structure set.
//! ```rust no_run
//! use proknow_rs::{Config, Credentials, Entity, ProKnow};
//!
//! #[tokio::main]
//! pub async fn main() -> Result<(), proknow_rs::ProKnowError> {
//!     let credentials = Credentials::from_file("./credentials.json")?;
//!     let pk = ProKnow::new(Config::new("https://example.proknow.com", credentials))?;
//!
//!     let batch = pk.uploads().upload("Clinical", ["./DICOM"]).await?;
//!     for patient in batch.patients() {
//!         println!("Patient {} has {} new entities", patient.id(), patient.entities().len());
//!     }
//!
//!     let path = std::path::absolute("./DICOM/structures.dcm")?;
//!     if let Entity::StructureSet(structure_set) = batch.find_entity(&path)?.get().await? {
//!         structure_set
//!             .edit_draft(|draft| {
//!                 Box::pin(async move {
//!                     draft.create_roi("PTV", [255, 0, 0], "PTV").await?;
//!                     draft.approve(Some("v2"), None).await
//!                 })
//!             })
//!             .await?;
//!     }
//!     Ok(())
//! }
//! ```

mod audit;
mod collections;
mod config;
mod custom_metrics;
mod error;
mod patients;
mod requestor;
mod roles;
mod scorecard_templates;
mod scorecards;
mod transport;
mod uploads;
mod users;
mod workspaces;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use audit::{Audit, AuditQuery, AuditResultsPage};
pub use collections::{
    CollectionItem, CollectionPatientSummary, CollectionPatients, CollectionSummary, Collections,
};
pub use config::{Config, Credentials};
pub use custom_metrics::{CustomMetricItem, CustomMetrics};
pub use error::{ProKnowError, Result};
pub use patients::{
    entities::{
        DoseItem, DoseMetrics, Entity, EntityItem, EntitySummary, EntityType, ImageSetItem,
        PlanItem,
    },
    structure_sets::{
        Lock, StructureSetItem, StructureSetRoiData, StructureSetRoiItem, StructureSetVersionItem,
        StructureSetVersions, VersionStatus,
    },
    PatientItem, PatientSummary, Patients, PlanReference, StudySummary,
};
pub use requestor::{
    ApiRequest, ApiResponse, RequestBody, RequestBuilder, Requestor, Transport,
};
pub use roles::{RoleItem, RoleSummary, Roles};
pub use scorecard_templates::{ScorecardTemplateItem, ScorecardTemplateSummary, ScorecardTemplates};
pub use scorecards::{ScorecardItem, ScorecardSummary, Scorecards};
pub use transport::HttpTransport;
pub use uploads::{
    UploadBatch, UploadEntitySummary, UploadOptions, UploadPatientSummary, UploadStatus, Uploads,
};
pub use users::{UserItem, UserSummary, Users};
pub use workspaces::{WorkspaceItem, Workspaces};

/// Entry point of the library.
///
/// `ProKnow` is a cheap handle: clones share the same transport, configuration and memoized
/// lookups (workspaces, custom metrics and scorecard templates).
#[derive(Clone)]
pub struct ProKnow {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    requestor: Requestor,
    workspaces: Mutex<Option<Vec<Value>>>,
    custom_metrics: Mutex<Option<Vec<Value>>>,
    scorecard_templates: Mutex<Option<Vec<Value>>>,
}

impl ProKnow {
    /// Creates a client talking to the organization at `config.base_url`.
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(ProKnow::with_transport(config, Arc::new(transport)))
    }

    /// Creates a client sending its requests through `transport`.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        ProKnow {
            inner: Arc::new(Inner {
                config,
                requestor: Requestor::new(transport),
                workspaces: Mutex::new(None),
                custom_metrics: Mutex::new(None),
                scorecard_templates: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn requestor(&self) -> &Requestor {
        &self.inner.requestor
    }

    pub fn workspaces(&self) -> Workspaces {
        Workspaces::new(self.clone())
    }

    pub fn custom_metrics(&self) -> CustomMetrics {
        CustomMetrics::new(self.clone())
    }

    pub fn scorecard_templates(&self) -> ScorecardTemplates {
        ScorecardTemplates::new(self.clone())
    }

    pub fn roles(&self) -> Roles {
        Roles::new(self.clone())
    }

    pub fn users(&self) -> Users {
        Users::new(self.clone())
    }

    pub fn audit(&self) -> Audit {
        Audit::new(self.clone())
    }

    pub fn uploads(&self) -> Uploads {
        Uploads::new(self.clone())
    }

    pub fn patients(&self) -> Patients {
        Patients::new(self.clone())
    }

    pub fn collections(&self) -> Collections {
        Collections::new(self.clone())
    }

    /// Gets the session of the user the API key belongs to.
    pub async fn session(&self) -> Result<Value> {
        self.requestor().get("/user").fetch().await
    }
}

impl fmt::Debug for ProKnow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProKnow")
            .field("base_url", &self.inner.config.base_url)
            .finish()
    }
}

/// Locks a mutex, ignoring poisoning: the guarded values stay consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `value` looks like a ProKnow id rather than a name.
pub(crate) fn is_id(value: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9a-f]{32}$").expect("valid id pattern"))
        .is_match(value)
}

/// Reads the typed view of a raw API representation.
pub(crate) fn fields<T: DeserializeOwned>(data: &Value) -> Result<T> {
    Ok(serde_json::from_value(data.clone())?)
}

/// Reads the string at `pointer` (e.g. `/data/version`) of a raw API representation.
pub(crate) fn field_str<'a>(data: &'a Value, pointer: &str) -> Result<&'a str> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| ProKnowError::UnexpectedResponse(format!("missing `{}`", pointer)))
}
