//! Audit log search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, ProKnow};

#[derive(Clone, Debug)]
pub struct Audit {
    pk: ProKnow,
}

/// Filters of an audit search. Unset filters are left out of the request.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_mrn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    /// Upper-cased when the query is sent, e.g. `HTTP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    /// Upper-cased when the query is sent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub status_codes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub text: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchResults {
    total: u64,
    #[serde(default)]
    items: Vec<Value>,
}

impl Audit {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Audit { pk }
    }

    /// Searches the audit log, returning the first page of results.
    pub async fn query(&self, mut query: AuditQuery) -> Result<AuditResultsPage> {
        query.classification = query.classification.map(|c| c.to_uppercase());
        query.methods = query.methods.iter().map(|m| m.to_uppercase()).collect();
        let SearchResults { total, items } = self
            .pk
            .requestor()
            .post("/audit/events/search")
            .json(&query)
            .fetch()
            .await?;
        Ok(AuditResultsPage::new(self.clone(), query, total, items))
    }
}

/// One page of audit events.
#[derive(Clone, Debug)]
pub struct AuditResultsPage {
    audit: Audit,
    query: AuditQuery,
    pub total: u64,
    pub items: Vec<Value>,
}

impl AuditResultsPage {
    fn new(audit: Audit, mut query: AuditQuery, total: u64, items: Vec<Value>) -> Self {
        query.page_number.get_or_insert(0);
        if query.first_id.is_none() {
            // Pins the result set so later pages are not shifted by newer events.
            query.first_id = items
                .first()
                .and_then(|item| item["id"].as_str())
                .map(str::to_string);
        }
        AuditResultsPage {
            audit,
            query,
            total,
            items,
        }
    }

    pub fn page_number(&self) -> u32 {
        self.query.page_number.unwrap_or(0)
    }

    /// Fetches the page following this one.
    pub async fn next(&self) -> Result<AuditResultsPage> {
        let mut query = self.query.clone();
        query.page_number = Some(self.page_number() + 1);
        self.audit.query(query).await
    }
}
