use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::model::{
    Agent, AuthUser, ConversationId, ConversationLookup, ConversationSummary, Message,
    OrderingKey, Profile, Session,
};
use crate::subscriber::LiveSubscription;
use crate::{FeedError, GatewayError};

/// Keyset-paginated access to a conversation's messages.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Up to `limit` messages strictly older than `before`, or the newest
    /// `limit` messages when `before` is `None`. Order is unspecified.
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        before: Option<OrderingKey>,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError>;

    async fn fetch_earliest_message(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<Message>, GatewayError>;
}

#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError>;

    async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError>;

    async fn find_conversation(
        &self,
        lookup: ConversationLookup,
        value: &str,
    ) -> Result<Option<ConversationSummary>, GatewayError>;

    async fn list_active_agents(&self) -> Result<Vec<Agent>, GatewayError>;
}

#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError>;

    async fn profile_for(&self, user_id: &str) -> Result<Option<Profile>, GatewayError>;

    async fn permissions_for(&self, user_id: &str) -> Result<Vec<String>, GatewayError>;

    /// Raw theme document stored by the console, if any.
    async fn theme_overrides(&self) -> Result<Option<serde_json::Value>, GatewayError>;
}

/// Push stream of newly inserted messages, one conversation per subscription.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    async fn subscribe(&self, conversation: &ConversationId)
        -> Result<LiveSubscription, FeedError>;
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    user: AuthUser,
}

/// In-memory backend for tests and offline wiring. Implements every gateway
/// with the same keyset semantics as the hosted RPCs.
pub struct InMemoryBackend {
    messages: Mutex<Vec<Message>>,
    conversations: Mutex<Vec<ConversationSummary>>,
    agents: Mutex<Vec<Agent>>,
    accounts: Mutex<HashMap<String, Account>>,
    profiles: Mutex<HashMap<String, Profile>>,
    permissions: Mutex<HashMap<String, Vec<String>>>,
    theme: Mutex<Option<serde_json::Value>>,
    page_failures: AtomicUsize,
    earliest_failures: AtomicUsize,
    page_calls: AtomicUsize,
    earliest_calls: AtomicUsize,
    held: watch::Sender<bool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            agents: Mutex::new(Vec::new()),
            accounts: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            permissions: Mutex::new(HashMap::new()),
            theme: Mutex::new(None),
            page_failures: AtomicUsize::new(0),
            earliest_failures: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            earliest_calls: AtomicUsize::new(0),
            held: watch::channel(false).0,
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_message(&self, message: Message) {
        self.messages.lock().await.push(message);
    }

    pub async fn insert_messages(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.lock().await.extend(messages);
    }

    pub async fn upsert_conversation(&self, conversation: ConversationSummary) {
        let mut guard = self.conversations.lock().await;
        if let Some(existing) = guard
            .iter_mut()
            .find(|c| c.contact_id == conversation.contact_id)
        {
            *existing = conversation;
        } else {
            guard.push(conversation);
        }
    }

    pub async fn add_agent(&self, agent: Agent) {
        self.agents.lock().await.push(agent);
    }

    pub async fn add_account(
        &self,
        email: &str,
        password: &str,
        user_id: &str,
        profile: Option<Profile>,
        permissions: Vec<String>,
    ) {
        self.accounts.lock().await.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: AuthUser {
                    id: user_id.to_string(),
                    email: Some(email.to_string()),
                },
            },
        );
        if let Some(profile) = profile {
            self.profiles
                .lock()
                .await
                .insert(user_id.to_string(), profile);
        }
        self.permissions
            .lock()
            .await
            .insert(user_id.to_string(), permissions);
    }

    pub async fn set_theme(&self, theme: serde_json::Value) {
        *self.theme.lock().await = Some(theme);
    }

    /// Makes the next `count` page fetches fail.
    pub fn fail_next_pages(&self, count: usize) {
        self.page_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_earliest(&self, count: usize) {
        self.earliest_failures.store(count, Ordering::SeqCst);
    }

    /// While held, page and earliest fetches park until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn earliest_calls(&self) -> usize {
        self.earliest_calls.load(Ordering::SeqCst)
    }

    async fn wait_released(&self) {
        let mut rx = self.held.subscribe();
        // The sender lives in `self`, so the wait only ends on release.
        let _ = rx.wait_for(|held| !*held).await;
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageGateway for InMemoryBackend {
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        before: Option<OrderingKey>,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_released().await;
        if Self::take_failure(&self.page_failures) {
            return Err(GatewayError::Backend("injected page failure".into()));
        }
        let guard = self.messages.lock().await;
        let mut rows: Vec<Message> = guard
            .iter()
            .filter(|m| &m.contact_id == conversation)
            .filter(|m| before.map_or(true, |cursor| m.key() < cursor))
            .cloned()
            .collect();
        // Newest first, like `order by timestamp desc, id desc limit n`.
        rows.sort_by(|a, b| b.key().cmp(&a.key()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn fetch_earliest_message(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<Message>, GatewayError> {
        self.earliest_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_released().await;
        if Self::take_failure(&self.earliest_failures) {
            return Err(GatewayError::Backend("injected earliest failure".into()));
        }
        let guard = self.messages.lock().await;
        Ok(guard
            .iter()
            .filter(|m| &m.contact_id == conversation)
            .min_by_key(|m| m.key())
            .cloned())
    }
}

#[async_trait]
impl DirectoryGateway for InMemoryBackend {
    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let mut rows = self.conversations.lock().await.clone();
        rows.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let needle = query.trim().to_lowercase();
        let mut rows: Vec<ConversationSummary> = self
            .conversations
            .lock()
            .await
            .iter()
            .filter(|c| {
                needle.is_empty()
                    || c.display_name().to_lowercase().contains(&needle)
                    || c.contact_id.as_str().to_lowercase().contains(&needle)
                    || c.user_id
                        .as_deref()
                        .is_some_and(|id| id.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_conversation(
        &self,
        lookup: ConversationLookup,
        value: &str,
    ) -> Result<Option<ConversationSummary>, GatewayError> {
        let guard = self.conversations.lock().await;
        Ok(guard
            .iter()
            .find(|c| match lookup {
                ConversationLookup::ContactId => c.contact_id.as_str() == value,
                ConversationLookup::UserId => c.user_id.as_deref() == Some(value),
            })
            .cloned())
    }

    async fn list_active_agents(&self) -> Result<Vec<Agent>, GatewayError> {
        let mut agents: Vec<Agent> = self
            .agents
            .lock()
            .await
            .iter()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(agents)
    }
}

#[async_trait]
impl AccountGateway for InMemoryBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        let guard = self.accounts.lock().await;
        match guard.get(email) {
            Some(account) if account.password == password => Ok(Session {
                access_token: format!("token-{}", account.user.id),
                refresh_token: None,
                expires_in: Some(3600),
                user: account.user.clone(),
            }),
            _ => Err(GatewayError::Unauthenticated),
        }
    }

    async fn profile_for(&self, user_id: &str) -> Result<Option<Profile>, GatewayError> {
        Ok(self.profiles.lock().await.get(user_id).cloned())
    }

    async fn permissions_for(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .permissions
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn theme_overrides(&self) -> Result<Option<serde_json::Value>, GatewayError> {
        Ok(self.theme.lock().await.clone())
    }
}
