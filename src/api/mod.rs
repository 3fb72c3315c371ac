// HTTP surface: browser-facing OAuth pages plus JSON account endpoints.

pub mod auth;
pub mod health;

pub use auth::{create_auth_router, AuthAppState};
pub use health::create_health_router;
