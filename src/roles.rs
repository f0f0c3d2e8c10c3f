use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{error::Result, fields, requestor::route, ProKnow};

/// Roles of the organization.
///
/// Permissions are kept as the raw JSON object since the set of flags depends on the version of
/// the ProKnow server.
#[derive(Clone, Debug)]
pub struct Roles {
    pk: ProKnow,
}

impl Roles {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Roles { pk }
    }

    pub async fn create(
        &self,
        name: &str,
        description: &str,
        permissions: Map<String, Value>,
    ) -> Result<RoleItem> {
        let role: Value = self
            .pk
            .requestor()
            .post("/roles")
            .json(&json!({ "permissions": permissions, "name": name, "description": description }))
            .fetch()
            .await?;
        RoleItem::new(self.pk.clone(), role)
    }

    pub async fn delete(&self, role_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("roles", role_id))
            .send()
            .await?;
        Ok(())
    }

    pub async fn find<F>(&self, predicate: F) -> Result<Option<RoleSummary>>
    where
        F: Fn(&RoleSummary) -> bool,
    {
        Ok(self.query().await?.into_iter().find(|item| predicate(item)))
    }

    pub async fn get(&self, role_id: &str) -> Result<RoleItem> {
        let role: Value = self.pk.requestor().get(route!("roles", role_id)).fetch().await?;
        RoleItem::new(self.pk.clone(), role)
    }

    pub async fn query(&self) -> Result<Vec<RoleSummary>> {
        let roles: Vec<Value> = self.pk.requestor().get("/roles").fetch().await?;
        roles
            .into_iter()
            .map(|role| RoleSummary::new(self.pk.clone(), role))
            .collect()
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Clone, Debug)]
pub struct RoleSummary {
    pk: ProKnow,
    id: String,
    name: String,
    description: String,
    data: Value,
}

impl RoleSummary {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let SummaryFields {
            id,
            name,
            description,
        } = fields(&data)?;
        Ok(RoleSummary {
            pk,
            id,
            name,
            description,
            data,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<RoleItem> {
        Roles::new(self.pk.clone()).get(&self.id).await
    }
}

#[derive(Deserialize)]
struct ItemFields {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    permissions: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct RoleItem {
    pk: ProKnow,
    id: String,
    data: Value,
    system: bool,
    pub name: String,
    pub description: String,
    pub permissions: Map<String, Value>,
}

impl RoleItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let ItemFields {
            id,
            name,
            description,
            system,
            permissions,
        } = fields(&data)?;
        Ok(RoleItem {
            pk,
            id,
            data,
            system,
            name,
            description,
            permissions,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Whether the role is one of the built-in roles of the organization.
    pub fn system(&self) -> bool {
        self.system
    }

    pub async fn delete(&self) -> Result<()> {
        Roles::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let role: Value = self
            .pk
            .requestor()
            .patch(route!("roles", self.id))
            .json(&json!({
                "permissions": self.permissions,
                "name": self.name,
                "description": self.description,
            }))
            .fetch()
            .await?;
        *self = RoleItem::new(self.pk.clone(), role)?;
        Ok(())
    }
}
