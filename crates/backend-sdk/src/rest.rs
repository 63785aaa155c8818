use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::gateway::{AccountGateway, DirectoryGateway, MessageGateway};
use crate::model::{
    Agent, ConversationId, ConversationLookup, ConversationSummary, Message, OrderingKey,
    Profile, Session,
};
use crate::GatewayError;

const CONVERSATION_COLUMNS: &str =
    "contact_id,updated_at,last_message_time,contact_name,contact_nickname,user_id,active_agent_id";

/// REST + RPC client for the hosted backend.
///
/// Every request carries the project's anon key; the bearer is the signed-in
/// user's access token when one is set, otherwise the anon key itself.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    access_token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: Url, anon_key: impl Into<String>) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            http: Client::new(),
            base_url,
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn set_access_token(&mut self, token: Option<String>) {
        self.access_token = token;
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, GatewayError> {
        let url = self.base_url.join(path)?;
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        Ok(self
            .http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer))
    }

    pub async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        args: Value,
    ) -> Result<T, GatewayError> {
        let res = self
            .request(Method::POST, &format!("rest/v1/rpc/{function}"))?
            .json(&args)
            .send()
            .await?;
        decode(res).await
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GatewayError> {
        let res = self
            .request(Method::GET, &format!("rest/v1/{table}"))?
            .query(query)
            .send()
            .await?;
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, GatewayError> {
    if res.status().is_success() {
        let bytes = res.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| GatewayError::Decode(err.to_string()))
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(GatewayError::UnexpectedStatus { status, body })
    }
}

#[async_trait]
impl MessageGateway for RestClient {
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        before: Option<OrderingKey>,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        let rows: Option<Vec<Message>> = self
            .rpc(
                "fetch_messages",
                json!({
                    "p_contact_id": conversation.as_str(),
                    "p_before_ts": before.map(|key| key.timestamp.to_rfc3339()),
                    "p_before_id": before.map(|key| key.id),
                    "p_limit": limit,
                }),
            )
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn fetch_earliest_message(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<Message>, GatewayError> {
        let rows: Vec<Message> = self
            .select(
                "messages",
                &[
                    ("select", "id,contact_id,sender,text,timestamp".into()),
                    ("contact_id", format!("eq.{conversation}")),
                    ("order", "timestamp.asc,id.asc".into()),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl DirectoryGateway for RestClient {
    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let rows: Option<Vec<ConversationSummary>> = self
            .rpc("conversations_enriched_list", json!({ "p_limit": limit }))
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let rows: Option<Vec<ConversationSummary>> = self
            .rpc(
                "search_conversations",
                json!({ "q": query, "page_limit": limit, "page_offset": offset }),
            )
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn find_conversation(
        &self,
        lookup: ConversationLookup,
        value: &str,
    ) -> Result<Option<ConversationSummary>, GatewayError> {
        let rows: Vec<ConversationSummary> = self
            .select(
                "conversations_enriched",
                &[
                    ("select", CONVERSATION_COLUMNS.into()),
                    (lookup.column(), format!("eq.{value}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_active_agents(&self) -> Result<Vec<Agent>, GatewayError> {
        self.select(
            "agents",
            &[
                ("select", "id,display_name,is_active".into()),
                ("is_active", "eq.true".into()),
                ("order", "display_name.asc".into()),
            ],
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRpc {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermissionRow {
    perm_key: String,
}

#[derive(Debug, Deserialize)]
struct ConfigRow {
    #[serde(default)]
    value: Option<Value>,
}

#[async_trait]
impl AccountGateway for RestClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        let res = self
            .request(Method::POST, "auth/v1/token")?
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        match res.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(GatewayError::Unauthenticated),
            _ => decode(res).await,
        }
    }

    async fn profile_for(&self, user_id: &str) -> Result<Option<Profile>, GatewayError> {
        match self
            .rpc::<ProfileRpc>("get_profile_by_user_id", json!({ "p_user_id": user_id }))
            .await
        {
            Ok(rpc) if rpc.success => {
                return Ok(Some(Profile {
                    user_id: rpc.user_id.unwrap_or_else(|| user_id.to_string()),
                    email: rpc.email,
                    role: rpc.role,
                    name: rpc.name,
                }));
            }
            Ok(_) => debug!(target: "backend::rest", user_id, "profile rpc reported no profile"),
            Err(err) => debug!(target: "backend::rest", user_id, error = %err, "profile rpc failed"),
        }
        let rows: Vec<Profile> = self
            .select(
                "profiles",
                &[
                    ("select", "user_id,email,role".into()),
                    ("user_id", format!("eq.{user_id}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn permissions_for(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        match self
            .rpc::<Vec<String>>("get_permissions_by_user_id", json!({ "p_user_id": user_id }))
            .await
        {
            Ok(perms) => return Ok(perms),
            Err(err) => debug!(target: "backend::rest", user_id, error = %err, "permissions rpc failed"),
        }
        match self.rpc::<Vec<String>>("get_my_permissions", json!({})).await {
            Ok(perms) => return Ok(perms),
            Err(err) => debug!(target: "backend::rest", error = %err, "own permissions rpc failed"),
        }
        let rows: Vec<PermissionRow> = self
            .select(
                "user_permissions",
                &[
                    ("select", "perm_key".into()),
                    ("user_id", format!("eq.{user_id}")),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.perm_key).collect())
    }

    async fn theme_overrides(&self) -> Result<Option<Value>, GatewayError> {
        let rows: Vec<ConfigRow> = self
            .select(
                "frontconfig",
                &[
                    ("select", "value".into()),
                    ("key", "eq.theme".into()),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.value)
            .filter(|value| !value.is_null()))
    }
}
