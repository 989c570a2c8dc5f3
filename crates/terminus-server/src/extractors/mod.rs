mod auth;

pub use auth::{bearer_user, AuthError};
