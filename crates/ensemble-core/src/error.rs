//! Core error type for the Ensemble platform.
//!
//! `ServerError` is used throughout the core domain (stores, orchestration,
//! triggers). When the `axum` feature is enabled, it also implements
//! `IntoResponse` so it can be used directly as an axum handler error type.
//!
//! Variants mirror the user-visible error surface: session-layer errors
//! (`AdapterUnavailable`, `AdapterDead`, `SessionNotFound`,
//! `ColdStartImpossible`), orchestrator errors (`DelegationDepthExceeded`,
//! `UnknownSpecialist`, `TaskNotFound`, `SpawnFailed`), trigger errors
//! (`SignatureInvalid`, `RateLimited`, `Upstream`), and store errors
//! (`VersionConflict`, `Database`). Every variant renders to a single-line
//! message; structured causes go to the tracing log at the site.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("No adapter available for provider: {0}")]
    AdapterUnavailable(String),

    #[error("Adapter process is dead: {0}")]
    AdapterDead(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Cannot recover session {0}: provider cannot be reconstructed")]
    ColdStartImpossible(String),

    #[error("{0}")]
    DelegationDepthExceeded(String),

    #[error("Unknown specialist: {0}")]
    UnknownSpecialist(String),

    #[error("{0}")]
    TaskNotFound(String),

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("GitHub rate limit exceeded")]
    RateLimited,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Version conflict on {0}: expected version {1}")]
    VersionConflict(String, i64),
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            ServerError::Database(_) | ServerError::Internal(_) | ServerError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServerError::NotFound(_)
            | ServerError::SessionNotFound(_)
            | ServerError::TaskNotFound(_)
            | ServerError::UnknownSpecialist(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) | ServerError::DelegationDepthExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Conflict(_) | ServerError::VersionConflict(_, _) => StatusCode::CONFLICT,
            ServerError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::AdapterUnavailable(_)
            | ServerError::AdapterDead(_)
            | ServerError::ColdStartImpossible(_)
            | ServerError::SpawnFailed(_) => StatusCode::BAD_GATEWAY,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
