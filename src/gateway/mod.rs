pub mod auth;
pub mod chat;
pub mod common;
pub mod openai;
