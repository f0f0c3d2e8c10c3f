use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::Result, fields, requestor::route, ProKnow};

/// Users of the organization.
#[derive(Clone, Debug)]
pub struct Users {
    pk: ProKnow,
}

impl Users {
    pub(crate) fn new(pk: ProKnow) -> Self {
        Users { pk }
    }

    pub async fn create(&self, email: &str, name: &str, password: Option<&str>) -> Result<UserItem> {
        let mut body = json!({ "email": email, "name": name });
        if let Some(password) = password {
            body["password"] = json!(password);
        }
        let user: Value = self.pk.requestor().post("/users").json(&body).fetch().await?;
        UserItem::new(self.pk.clone(), user)
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        self.pk
            .requestor()
            .delete(route!("users", user_id))
            .send()
            .await?;
        Ok(())
    }

    pub async fn find<F>(&self, predicate: F) -> Result<Option<UserSummary>>
    where
        F: Fn(&UserSummary) -> bool,
    {
        Ok(self.query().await?.into_iter().find(|item| predicate(item)))
    }

    pub async fn get(&self, user_id: &str) -> Result<UserItem> {
        let user: Value = self.pk.requestor().get(route!("users", user_id)).fetch().await?;
        UserItem::new(self.pk.clone(), user)
    }

    pub async fn query(&self) -> Result<Vec<UserSummary>> {
        let users: Vec<Value> = self.pk.requestor().get("/users").fetch().await?;
        users
            .into_iter()
            .map(|user| UserSummary::new(self.pk.clone(), user))
            .collect()
    }
}

#[derive(Deserialize)]
struct SummaryFields {
    id: String,
    email: String,
    name: String,
}

#[derive(Clone, Debug)]
pub struct UserSummary {
    pk: ProKnow,
    id: String,
    email: String,
    name: String,
    data: Value,
}

impl UserSummary {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let SummaryFields { id, email, name } = fields(&data)?;
        Ok(UserSummary {
            pk,
            id,
            email,
            name,
            data,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn get(&self) -> Result<UserItem> {
        Users::new(self.pk.clone()).get(&self.id).await
    }
}

#[derive(Deserialize)]
struct ItemFields {
    id: String,
    email: String,
    name: String,
    #[serde(default)]
    active: bool,
}

/// A user. `email`, `name` and `active` are written back by [UserItem::save].
#[derive(Clone, Debug)]
pub struct UserItem {
    pk: ProKnow,
    id: String,
    data: Value,
    pub email: String,
    pub name: String,
    pub active: bool,
}

impl UserItem {
    fn new(pk: ProKnow, data: Value) -> Result<Self> {
        let ItemFields {
            id,
            email,
            name,
            active,
        } = fields(&data)?;
        Ok(UserItem {
            pk,
            id,
            data,
            email,
            name,
            active,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub async fn delete(&self) -> Result<()> {
        Users::new(self.pk.clone()).delete(&self.id).await
    }

    pub async fn save(&mut self) -> Result<()> {
        let user: Value = self
            .pk
            .requestor()
            .put(route!("users", self.id))
            .json(&json!({ "email": self.email, "name": self.name, "active": self.active }))
            .fetch()
            .await?;
        *self = UserItem::new(self.pk.clone(), user)?;
        Ok(())
    }
}
