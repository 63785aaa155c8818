//! Row shapes shared by every gateway implementation.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of a livechat conversation (the contact's id on the backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for ConversationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        flexible::string(deserializer).map(ConversationId)
    }
}

/// Canonical sort and cursor key: timestamp first, id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderingKey {
    pub timestamp: DateTime<Utc>,
    pub id: i64,
}

impl OrderingKey {
    pub fn new(timestamp: DateTime<Utc>, id: i64) -> Self {
        Self { timestamp, id }
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.timestamp.to_rfc3339(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub contact_id: ConversationId,
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(with = "flexible::timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn key(&self) -> OrderingKey {
        OrderingKey::new(self.timestamp, self.id)
    }

    pub fn is_from_contact(&self) -> bool {
        self.sender == "user"
    }
}

/// Sorts ascending by ordering key; the gateway gives no ordering guarantee.
pub fn sort_by_key(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.key().cmp(&b.key()));
}

/// Row of the enriched conversation listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub contact_id: ConversationId,
    #[serde(default, with = "flexible::optional_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible::optional_timestamp")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_nickname: Option<String>,
    #[serde(default, deserialize_with = "flexible::optional_string")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "flexible::optional_string")]
    pub active_agent_id: Option<String>,
}

impl ConversationSummary {
    pub fn new(contact_id: impl Into<ConversationId>) -> Self {
        Self {
            contact_id: contact_id.into(),
            updated_at: None,
            last_message_time: None,
            contact_name: None,
            contact_nickname: None,
            user_id: None,
            active_agent_id: None,
        }
    }

    /// Contact name unless blank or `-`, then nickname, then the raw id.
    pub fn display_name(&self) -> String {
        let name = self.contact_name.as_deref().unwrap_or("").trim();
        if !name.is_empty() && name != "-" {
            return name.to_string();
        }
        let nick = self.contact_nickname.as_deref().unwrap_or("").trim();
        if !nick.is_empty() {
            return nick.to_string();
        }
        if !self.contact_id.as_str().is_empty() {
            return self.contact_id.to_string();
        }
        "Conversation".to_string()
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message_time.or(self.updated_at)
    }
}

/// Field used for direct conversation lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationLookup {
    ContactId,
    UserId,
}

impl ConversationLookup {
    pub fn column(self) -> &'static str {
        match self {
            ConversationLookup::ContactId => "contact_id",
            ConversationLookup::UserId => "user_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(deserialize_with = "flexible::string")]
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Session issued by the backend's auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: AuthUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub(crate) mod flexible {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Text(String),
        Int(i64),
        Float(f64),
    }

    impl From<StringOrNumber> for String {
        fn from(value: StringOrNumber) -> Self {
            match value {
                StringOrNumber::Text(text) => text,
                StringOrNumber::Int(n) => n.to_string(),
                StringOrNumber::Float(n) => n.to_string(),
            }
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        StringOrNumber::deserialize(deserializer).map(String::from)
    }

    pub fn optional_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<StringOrNumber>::deserialize(deserializer)?.map(String::from))
    }

    /// Accepts RFC 3339 as well as the Postgres text form (`2024-05-01 10:00:00.12+00`).
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
            if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        None
    }

    pub mod timestamp {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: serde::Serializer>(
            value: &DateTime<Utc>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&value.to_rfc3339())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<DateTime<Utc>, D::Error> {
            let raw = String::deserialize(deserializer)?;
            parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
        }
    }

    pub mod optional_timestamp {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: serde::Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => parse(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}"))),
                None => Ok(None),
            }
        }
    }
}
