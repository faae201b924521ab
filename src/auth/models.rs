//! Authentication Models
//! Mission: Minimal claims carried by a session token issued upstream.
//!
//! Token *issuance* is an out-of-scope collaborator (the session/HTTP layer
//! mints these); this crate only validates bearer tokens and binds the
//! carried user id to a gateway connection/room.

use serde::{Deserialize, Serialize};

/// JWT claims as minted by the external session service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the authenticated user id.
    pub sub: String,
    /// Expiration timestamp (seconds since epoch).
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_round_trip_through_json() {
        let claims = Claims {
            sub: "u1".to_string(),
            exp: 9_999_999_999,
        };
        let json = serde_json::to_string(&claims).unwrap();
        let back: Claims = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sub, "u1");
    }
}
