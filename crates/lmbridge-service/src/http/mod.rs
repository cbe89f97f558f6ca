pub mod chat_endpoint;
pub mod relay_endpoint;
pub mod server;
