pub mod bot;
pub mod collaborators;
pub mod config;
pub mod database;
pub mod error;
pub mod gmail;
pub mod http_client;
pub mod ingest;
pub mod llm_client;
pub mod locks;
pub mod models;
pub mod renewal;
pub mod reply;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod subscription;
pub mod sync_engine;
pub mod telegram;

#[cfg(test)]
pub(crate) mod test_support;
