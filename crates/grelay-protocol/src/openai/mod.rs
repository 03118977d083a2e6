pub mod chat;
pub mod embeddings;
pub mod error;
pub mod models;
