use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ProKnowError, Result},
    fields, is_id, lock,
    requestor::route,
    ProKnow,
};

/// Custom metrics of the organization. Queries are memoized like [Workspaces](crate::Workspaces).
#[derive(Clone, Debug)]
pub struct CustomMetrics {
    pk: ProKnow,
}

impl CustomMetrics {
    pub(crate) fn new(pk: ProKnow) -> Self {
        CustomMetrics { pk }
    }

    fn invalidate(&self) {
        *lock(&self.pk.inner.custom_metrics) = None;
    }

    /// Creates a custom metric. `metric_type` is the type descriptor, e.g.
    /// `{"enum": {"values": ["one", "two"]}}` or `{"number": {}}`.
    pub async fn create(
        &self,
        name: &str,
        context: &str,
        metric_type: Value,
    ) -> Result<CustomMetricItem> {
        let metric: Value = self
            .pk
            .requestor()
            .post("/metrics/custom")
            .json(&json!({ "name": name, "context": context, "type": metric_type }))
            .fetch()
            .await?;
        self.invalidate();
        CustomMetricItem::new(self.pk.clone(), metric)
    }

    pub async fn delete(&self, custom_metric_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("metrics", "custom", custom_metric_id))
            .send()
            .await?;
        self.invalidate();
        Ok(())
    }

    pub async fn find<F>(&self, predicate: F) -> Result<Option<CustomMetricItem>>
    where
        F: Fn(&CustomMetricItem) -> bool,
    {
        Ok(self.cached().await?.into_iter().find(|item| predicate(item)))
    }

    pub async fn resolve(&self, custom_metric: &str) -> Result<CustomMetricItem> {
        if is_id(custom_metric) {
            self.resolve_by_id(custom_metric).await
        } else {
            self.resolve_by_name(custom_metric).await
        }
    }

    pub async fn resolve_by_name(&self, name: &str) -> Result<CustomMetricItem> {
        let normalized = name.to_lowercase();
        self.find(|item| item.name.to_lowercase() == normalized)
            .await?
            .ok_or_else(|| {
                ProKnowError::CustomMetricLookup(format!(
                    "Custom metric with name `{}` not found.",
                    name
                ))
            })
    }

    pub async fn resolve_by_id(&self, custom_metric_id: &str) -> Result<CustomMetricItem> {
        self.find(|item| item.id == custom_metric_id)
            .await?
            .ok_or_else(|| {
                ProKnowError::CustomMetricLookup(format!(
                    "Custom metric with id `{}` not found.",
                    custom_metric_id
                ))
            })
    }

    pub async fn query(&self) -> Result<Vec<CustomMetricItem>> {
        let metrics: Vec<Value> = self.pk.requestor().get("/metrics/custom").fetch().await?;
        *lock(&self.pk.inner.custom_metrics) = Some(metrics.clone());
        self.items(metrics)
    }

    async fn cached(&self) -> Result<Vec<CustomMetricItem>> {
        let cached = lock(&self.pk.inner.custom_metrics).clone();
        match cached {
            Some(metrics) => self.items(metrics),
            None => self.query().await,
        }
    }

    fn items(&self, metrics: Vec<Value>) -> Result<Vec<CustomMetricItem>> {
        metrics
            .into_iter()
            .map(|metric| CustomMetricItem::new(self.pk.clone(), metric))
            .collect()
    }
}

#[derive(Deserialize)]
struct CustomMetricFields {
    id: String,
    name: String,
    context: String,
    #[serde(rename = "type")]
    metric_type: Value,
}

#[derive(Clone, Debug)]
pub struct CustomMetricItem {
    pk: ProKnow,
    id: String,
    data: Value,
    metric_type: Value,
    pub name: String,
    pub context: String,
}

impl CustomMetricItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let CustomMetricFields {
            id,
            name,
            context,
            metric_type,
        } = fields(&data)?;
        Ok(CustomMetricItem {
            pk,
            id,
            data,
            metric_type,
            name,
            context,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The type descriptor. It cannot be changed once the metric exists.
    pub fn metric_type(&self) -> &Value {
        &self.metric_type
    }

    pub async fn delete(&self) -> Result<()> {
        CustomMetrics::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let metric: Value = self
            .pk
            .requestor()
            .put(route!("metrics", "custom", self.id))
            .json(&json!({ "name": self.name, "context": self.context }))
            .fetch()
            .await?;
        *self = CustomMetricItem::new(self.pk.clone(), metric)?;
        CustomMetrics::new(self.pk.clone()).invalidate();
        Ok(())
    }
}
