//! Scorecards attached to a patient, an entity or a collection.
//!
//! The three flavours only differ by the route they live under, so one [Scorecards] type serves
//! them all.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::Result, fields, ProKnow};

#[derive(Clone, Debug)]
pub struct Scorecards {
    pk: ProKnow,
    base: String,
}

impl Scorecards {
    /// `owner` is the route of the resource owning the scorecards, e.g. `/collections/{id}`.
    pub(crate) fn new(pk: ProKnow, owner: &str) -> Self {
        Scorecards {
            pk,
            base: format!("{}/metrics/sets", owner),
        }
    }

    /// Creates a scorecard from computed metric definitions and custom metric references.
    pub async fn create(
        &self,
        name: &str,
        computed: Vec<Value>,
        custom: Vec<Value>,
    ) -> Result<ScorecardItem> {
        let scorecard: Value = self
            .pk
            .requestor()
            .post(self.base.clone())
            .json(&json!({ "name": name, "computed": computed, "custom": custom }))
            .fetch()
            .await?;
        ScorecardItem::new(self.clone(), scorecard)
    }

    pub async fn delete(&self, scorecard_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(format!("{}/{}", self.base, scorecard_id))
            .send()
            .await?;
        Ok(())
    }

    pub async fn find<F>(&self, predicate: F) -> Result<Option<ScorecardSummary>>
    where
        F: Fn(&ScorecardSummary) -> bool,
    {
        Ok(self.query().await?.into_iter().find(|item| predicate(item)))
    }

    pub async fn get(&self, scorecard_id: &str) -> Result<ScorecardItem> {
        let scorecard: Value = self
            .pk
            .requestor()
            .get(format!("{}/{}", self.base, scorecard_id))
            .fetch()
            .await?;
        ScorecardItem::new(self.clone(), scorecard)
    }

    pub async fn query(&self) -> Result<Vec<ScorecardSummary>> {
        let scorecards: Vec<Value> = self.pk.requestor().get(self.base.clone()).fetch().await?;
        scorecards
            .into_iter()
            .map(|scorecard| ScorecardSummary::new(self.clone(), scorecard))
            .collect()
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    name: String,
}

#[derive(Clone, Debug)]
pub struct ScorecardSummary {
    scorecards: Scorecards,
    id: String,
    name: String,
    data: Value,
}

impl ScorecardSummary {
    fn new(scorecards: Scorecards, data: Value) -> Result<Self> {
        let SummaryFields { id, name } = fields(&data)?;
        Ok(ScorecardSummary {
            scorecards,
            id,
            name,
            data,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<ScorecardItem> {
        self.scorecards.get(&self.id).await
    }
}

#[derive(Deserialize)]
struct ItemFields {
    id: String,
    name: String,
    #[serde(default)]
    computed: Vec<Value>,
    #[serde(default)]
    custom: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct ScorecardItem {
    scorecards: Scorecards,
    id: String,
    data: Value,
    pub name: String,
    pub computed: Vec<Value>,
    pub custom: Vec<Value>,
}

impl ScorecardItem {
    fn new(scorecards: Scorecards, data: Value) -> Result<Self> {
        let ItemFields {
            id,
            name,
            computed,
            custom,
        } = fields(&data)?;
        Ok(ScorecardItem {
            scorecards,
            id,
            data,
            name,
            computed,
            custom,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn delete(&self) -> Result<()> {
        self.scorecards.delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let scorecard: Value = self
            .scorecards
            .pk
            .requestor()
            .put(format!("{}/{}", self.scorecards.base, self.id))
            .json(&json!({ "name": self.name, "computed": self.computed, "custom": self.custom }))
            .fetch()
            .await?;
        *self = ScorecardItem::new(self.scorecards.clone(), scorecard)?;
        Ok(())
    }
}
