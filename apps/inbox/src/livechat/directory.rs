//! Conversation list, search and deep-link resolution.

use std::sync::Arc;

use backend_sdk::{Agent, ConversationLookup, ConversationSummary, DirectoryGateway};
use chrono::Local;
use tracing::{debug, warn};

pub const DIRECTORY_PAGE: usize = 50;

pub struct ConversationDirectory {
    gateway: Arc<dyn DirectoryGateway>,
    conversations: Vec<ConversationSummary>,
    agents: Vec<Agent>,
}

impl ConversationDirectory {
    pub fn new(gateway: Arc<dyn DirectoryGateway>) -> Self {
        Self {
            gateway,
            conversations: Vec::new(),
            agents: Vec::new(),
        }
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Reloads the list. A search term or agent filter goes through the
    /// search RPC; otherwise the most recent conversations are listed.
    /// Failures leave an empty list.
    pub async fn load(&mut self, term: Option<&str>, agent: Option<&str>) -> &[ConversationSummary] {
        let term = term.map(str::trim).unwrap_or("");
        let agent = agent.map(str::trim).filter(|a| !a.is_empty());
        let result = if !term.is_empty() || agent.is_some() {
            self.gateway
                .search_conversations(term, DIRECTORY_PAGE, 0)
                .await
                .map(|rows| match agent {
                    Some(agent) => rows
                        .into_iter()
                        .filter(|c| c.active_agent_id.as_deref() == Some(agent))
                        .collect(),
                    None => rows,
                })
        } else {
            self.gateway.list_conversations(DIRECTORY_PAGE).await
        };
        self.conversations = match result {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target: "inbox::directory", error = %err, term, ?agent, "failed to load conversations");
                Vec::new()
            }
        };
        debug!(target: "inbox::directory", count = self.conversations.len(), "conversations loaded");
        &self.conversations
    }

    pub async fn load_agents(&mut self) -> &[Agent] {
        match self.gateway.list_active_agents().await {
            Ok(agents) => self.agents = agents,
            Err(err) => warn!(target: "inbox::directory", error = %err, "failed to load agents"),
        }
        &self.agents
    }

    pub fn agent_name(&self, id: &str) -> Option<&str> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.display_name.as_str())
    }

    /// Finds a conversation by contact id or user id, first in the loaded
    /// list and then on the backend. A backend hit joins the front of the list.
    pub async fn resolve(&mut self, reference: &str) -> Option<ConversationSummary> {
        let found = self
            .conversations
            .iter()
            .find(|c| c.contact_id.as_str() == reference)
            .or_else(|| {
                self.conversations
                    .iter()
                    .find(|c| c.user_id.as_deref() == Some(reference))
            });
        if let Some(found) = found {
            return Some(found.clone());
        }

        for lookup in [ConversationLookup::ContactId, ConversationLookup::UserId] {
            match self.gateway.find_conversation(lookup, reference).await {
                Ok(Some(row)) => {
                    debug!(target: "inbox::directory", reference, column = lookup.column(), "resolved conversation on the backend");
                    self.conversations.insert(0, row.clone());
                    return Some(row);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "inbox::directory", reference, column = lookup.column(), error = %err, "conversation lookup failed");
                }
            }
        }
        None
    }
}

/// `Last message: <local time>` or `No messages`.
pub fn subtitle(conversation: &ConversationSummary) -> String {
    match conversation.last_activity() {
        Some(at) => format!(
            "Last message: {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ),
        None => "No messages".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend_sdk::InMemoryBackend;
    use chrono::{TimeZone, Utc};

    fn conversation(contact: &str, user: &str, agent: Option<&str>, hour: u32) -> ConversationSummary {
        let mut row = ConversationSummary::new(contact);
        row.user_id = Some(user.to_string());
        row.contact_name = Some(format!("Contact {contact}"));
        row.active_agent_id = agent.map(str::to_string);
        row.last_message_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap());
        row
    }

    async fn seeded() -> Arc<InMemoryBackend> {
        let backend = InMemoryBackend::new();
        backend.upsert_conversation(conversation("c-1", "u-1", Some("a-1"), 9)).await;
        backend.upsert_conversation(conversation("c-2", "u-2", Some("a-2"), 11)).await;
        backend.upsert_conversation(conversation("c-3", "u-3", Some("a-1"), 10)).await;
        backend
    }

    #[tokio::test]
    async fn lists_recent_conversations_and_filters_by_agent() {
        let mut directory = ConversationDirectory::new(seeded().await);
        let ids: Vec<String> = directory
            .load(None, None)
            .await
            .iter()
            .map(|c| c.contact_id.to_string())
            .collect();
        assert_eq!(ids, vec!["c-2", "c-3", "c-1"]);

        let filtered = directory.load(Some("  "), Some("a-1")).await;
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|c| c.active_agent_id.as_deref() == Some("a-1")));

        let searched = directory.load(Some("c-2"), None).await;
        assert_eq!(searched.len(), 1);
    }

    #[tokio::test]
    async fn resolves_deep_links_by_contact_or_user() {
        let backend = seeded().await;
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.load(Some("c-1"), None).await;

        let by_user = directory.resolve("u-1").await.expect("loaded by user id");
        assert_eq!(by_user.contact_id.as_str(), "c-1");

        let remote = directory.resolve("u-3").await.expect("backend by user id");
        assert_eq!(remote.contact_id.as_str(), "c-3");
        assert_eq!(directory.conversations()[0].contact_id.as_str(), "c-3");

        assert!(directory.resolve("missing").await.is_none());
    }

    #[test]
    fn subtitle_uses_last_activity() {
        assert_eq!(subtitle(&ConversationSummary::new("c-9")), "No messages");
        let row = conversation("c-1", "u-1", None, 9);
        assert!(subtitle(&row).starts_with("Last message: 2024-"));
    }
}
