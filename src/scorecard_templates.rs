use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ProKnowError, Result},
    fields, is_id, lock,
    requestor::route,
    ProKnow,
};

/// Scorecard templates of the organization. The template list is memoized.
#[derive(Clone, Debug)]
pub struct ScorecardTemplates {
    pk: ProKnow,
}

impl ScorecardTemplates {
    pub(crate) fn new(pk: ProKnow) -> Self {
        ScorecardTemplates { pk }
    }

    fn invalidate(&self) {
        *lock(&self.pk.inner.scorecard_templates) = None;
    }

    pub async fn create(
        &self,
        name: &str,
        computed: Vec<Value>,
        custom: Vec<Value>,
    ) -> Result<ScorecardTemplateItem> {
        let template: Value = self
            .pk
            .requestor()
            .post("/metrics/templates")
            .json(&json!({ "name": name, "computed": computed, "custom": custom }))
            .fetch()
            .await?;
        self.invalidate();
        ScorecardTemplateItem::new(self.pk.clone(), template)
    }

    pub async fn delete(&self, template_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("metrics", "templates", template_id))
            .send()
            .await?;
        self.invalidate();
        Ok(())
    }

    pub async fn find<F>(&self, predicate: F) -> Result<Option<ScorecardTemplateSummary>>
    where
        F: Fn(&ScorecardTemplateSummary) -> bool,
    {
        Ok(self.cached().await?.into_iter().find(|item| predicate(item)))
    }

    pub async fn get(&self, template_id: &str) -> Result<ScorecardTemplateItem> {
        let template: Value = self
            .pk
            .requestor()
            .get(route!("metrics", "templates", template_id))
            .fetch()
            .await?;
        ScorecardTemplateItem::new(self.pk.clone(), template)
    }

    pub async fn resolve(&self, template: &str) -> Result<ScorecardTemplateSummary> {
        if is_id(template) {
            self.resolve_by_id(template).await
        } else {
            self.resolve_by_name(template).await
        }
    }

    pub async fn resolve_by_name(&self, name: &str) -> Result<ScorecardTemplateSummary> {
        let normalized = name.to_lowercase();
        self.find(|item| item.name.to_lowercase() == normalized)
            .await?
            .ok_or_else(|| {
                ProKnowError::ScorecardTemplateLookup(format!(
                    "Scorecard template with name `{}` not found.",
                    name
                ))
            })
    }

    pub async fn resolve_by_id(&self, template_id: &str) -> Result<ScorecardTemplateSummary> {
        self.find(|item| item.id == template_id)
            .await?
            .ok_or_else(|| {
                ProKnowError::ScorecardTemplateLookup(format!(
                    "Scorecard template with id `{}` not found.",
                    template_id
                ))
            })
    }

    pub async fn query(&self) -> Result<Vec<ScorecardTemplateSummary>> {
        let templates: Vec<Value> = self.pk.requestor().get("/metrics/templates").fetch().await?;
        *lock(&self.pk.inner.scorecard_templates) = Some(templates.clone());
        self.summaries(templates)
    }

    async fn cached(&self) -> Result<Vec<ScorecardTemplateSummary>> {
        let cached = lock(&self.pk.inner.scorecard_templates).clone();
        match cached {
            Some(templates) => self.summaries(templates),
            None => self.query().await,
        }
    }

    fn summaries(&self, templates: Vec<Value>) -> Result<Vec<ScorecardTemplateSummary>> {
        templates
            .into_iter()
            .map(|template| ScorecardTemplateSummary::new(self.pk.clone(), template))
            .collect()
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    name: String,
}

#[derive(Clone, Debug)]
pub struct ScorecardTemplateSummary {
    pk: ProKnow,
    id: String,
    name: String,
    data: Value,
}

impl ScorecardTemplateSummary {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let SummaryFields { id, name } = fields(&data)?;
        Ok(ScorecardTemplateSummary { pk, id, name, data })
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

    pub async fn get(&self) -> Result<ScorecardTemplateItem> {
        ScorecardTemplates::new(self.pk.clone()).get(&self.id).await
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
pub struct ScorecardTemplateItem {
    pk: ProKnow,
    id: String,
    data: Value,
    pub name: String,
    pub computed: Vec<Value>,
    pub custom: Vec<Value>,
}

impl ScorecardTemplateItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let ItemFields {
            id,
            name,
            computed,
            custom,
        } = fields(&data)?;
        Ok(ScorecardTemplateItem {
            pk,
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
        ScorecardTemplates::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let template: Value = self
            .pk
            .requestor()
            .put(route!("metrics", "templates", self.id))
            .json(&json!({ "name": self.name, "computed": self.computed, "custom": self.custom }))
            .fetch()
            .await?;
        *self = ScorecardTemplateItem::new(self.pk.clone(), template)?;
        ScorecardTemplates::new(self.pk.clone()).invalidate();
        Ok(())
    }
}
