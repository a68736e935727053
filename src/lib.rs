//! DingTalk stream-mode chatbot backed by Amazon Bedrock.
//!
//! Inbound messages arrive over the DingTalk stream gateway, model output is
//! streamed into an interactive card, and each conversation's history is kept
//! in a DynamoDB table (or a local SQLite/in-memory table for development).

pub mod aws;
pub mod channels;
pub mod config;
pub mod handler;
pub mod history;
pub mod model;
pub mod provision;
pub mod reply;
pub mod runtime;

pub use config::Config;
