pub mod arbiter;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod extract;
pub mod llm;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tools;
