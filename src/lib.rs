//! Gated TCP Relay
//!
//! Forwards one listening port to a fixed target port for clients on a
//! persisted IP allow-list. Everyone else gets a static HTML page, unless
//! they request the secret enrollment path, which adds their IP to the list.

pub mod allowlist;
pub mod auth;
pub mod config;
pub mod http;
pub mod page;
pub mod proxy;
pub mod security;
pub mod server;

// Re-export commonly used types and functions
pub use allowlist::AllowList;
pub use auth::AuthHandler;
pub use config::{FileConfig, Overrides, ProxyConfig, load_config};
pub use http::{RequestKind, build_response, classify};
pub use page::StaticPage;
pub use proxy::{BUFFER_SIZE, Gate, handle_connection, relay};
pub use security::client_ip;
pub use server::{serve, start_server};
