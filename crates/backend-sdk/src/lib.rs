//! Asynchronous client for the hosted backend behind the inbox console.
//!
//! The console never talks to storage directly: message pages, conversation
//! listings, accounts and realtime inserts all go through the traits in
//! [`gateway`]. [`RestClient`] and [`RealtimeClient`] speak to the hosted
//! service; [`InMemoryBackend`] and [`BusFeed`] stand in for it in tests.

pub mod gateway;
pub mod model;
pub mod publisher;
pub mod realtime;
pub mod rest;
pub mod subscriber;

use thiserror::Error;

pub use gateway::{AccountGateway, DirectoryGateway, InMemoryBackend, LiveFeed, MessageGateway};
pub use model::{
    Agent, AuthUser, ConversationId, ConversationLookup, ConversationSummary, Message,
    OrderingKey, Profile, Session,
};
pub use publisher::{conversation_topic, ChangePublisher};
pub use realtime::RealtimeClient;
pub use rest::RestClient;
pub use subscriber::{BusFeed, InsertHandler, LiveSubscription, SubscriptionHandle};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("not authenticated")]
    Unauthenticated,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("realtime connection failed: {0}")]
    Connect(String),
    #[error("realtime connection closed")]
    Closed,
    #[error("invalid change payload: {0}")]
    Payload(String),
}
