pub mod chat;
pub mod connection;
pub mod error;
pub mod groups;
pub mod notify;
pub mod presence;
pub mod presence_redis;
pub mod session;

pub use error::GatewayError;
pub use session::{Gateway, Grant, Identity, Session};
