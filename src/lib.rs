// Request credential extraction (Bearer header, query token)
pub mod auth;

// Encrypted secret storage
pub mod vault;

// Identity and credential persistence
pub mod store;

// Opaque account handle registry
pub mod handles;

// Per-connection session state
pub mod session;

// OAuth flow: provider endpoints, signed state, code exchange
pub mod oauth;

// Ordered request-to-identity resolution
pub mod resolver;

// Capability boundary handed to tool logic
pub mod client;

// HTTP surface
pub mod api;

// TOML configuration
pub mod config;
