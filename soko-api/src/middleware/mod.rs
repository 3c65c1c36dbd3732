pub mod auth;

pub use auth::webhook_secret_middleware;
