//! Authentication
//! Mission: Validate bearer session tokens issued by the external session
//! service, for the websocket upgrade handshake.

pub mod jwt;
pub mod models;

pub use jwt::JwtHandler;
pub use models::Claims;
