//! Stable error taxonomy surfaced to clients.
//!
//! One enum, one `StatusCode` + wire code mapping, an `IntoResponse` impl
//! reused for REST and for the `bet:rejected` / `error` websocket
//! envelopes alike.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// The closed set of stable codes from spec §7, surfaced verbatim to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoActiveRound,
    BettingClosed,
    TargetTimePassed,
    InvalidAmount,
    MaxBetsReached,
    RateLimited,
    InsufficientBalance,
    DuplicateBet,
    UserNotFound,
    UserBanned,
    UserSilenced,
    RoundNotFound,
    PriceUnavailable,
    InternalError,
    InvalidRequest,
    Unauthorized,
}

/// Errors raised by the engine's admission/refund/lifecycle pipelines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no active round")]
    NoActiveRound,
    #[error("betting is closed for this round")]
    BettingClosed,
    #[error("target time has already passed")]
    TargetTimePassed,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("engine has reached its active bet capacity")]
    MaxBetsReached,
    #[error("rate limited")]
    RateLimited,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("duplicate bet")]
    DuplicateBet,
    #[error("user not found")]
    UserNotFound,
    #[error("user is banned")]
    UserBanned,
    #[error("user is silenced")]
    UserSilenced,
    #[error("round not found")]
    RoundNotFound,
    #[error("price unavailable")]
    PriceUnavailable,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NoActiveRound => ErrorCode::NoActiveRound,
            EngineError::BettingClosed => ErrorCode::BettingClosed,
            EngineError::TargetTimePassed => ErrorCode::TargetTimePassed,
            EngineError::InvalidAmount(_) => ErrorCode::InvalidAmount,
            EngineError::MaxBetsReached => ErrorCode::MaxBetsReached,
            EngineError::RateLimited => ErrorCode::RateLimited,
            EngineError::InsufficientBalance => ErrorCode::InsufficientBalance,
            EngineError::DuplicateBet => ErrorCode::DuplicateBet,
            EngineError::UserNotFound => ErrorCode::UserNotFound,
            EngineError::UserBanned => ErrorCode::UserBanned,
            EngineError::UserSilenced => ErrorCode::UserSilenced,
            EngineError::RoundNotFound => ErrorCode::RoundNotFound,
            EngineError::PriceUnavailable => ErrorCode::PriceUnavailable,
            EngineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            EngineError::Unauthorized => ErrorCode::Unauthorized,
            EngineError::Internal(_) => ErrorCode::InternalError,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::NoActiveRound
            | EngineError::BettingClosed
            | EngineError::TargetTimePassed
            | EngineError::RoundNotFound
            | EngineError::PriceUnavailable => StatusCode::CONFLICT,
            EngineError::InvalidAmount(_) | EngineError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::MaxBetsReached | EngineError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            EngineError::DuplicateBet => StatusCode::CONFLICT,
            EngineError::UserNotFound => StatusCode::NOT_FOUND,
            EngineError::UserBanned | EngineError::UserSilenced | EngineError::Unauthorized => {
                StatusCode::FORBIDDEN
            }
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
