pub mod acp_routes;
pub mod agents;
pub mod background_tasks;
pub mod notes;
pub mod polling;
pub mod sessions;
pub mod specialists;
pub mod tasks;
pub mod tools;
pub mod webhooks;
pub mod workflows;
pub mod workspaces;

use axum::Router;

use ensemble_core::state::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/agents", agents::router())
        .nest("/api/notes", notes::router())
        .nest("/api/tasks", tasks::router())
        .nest("/api/workspaces", workspaces::router())
        .nest("/api/sessions", sessions::router())
        .nest("/api/acp", acp_routes::router())
        .nest("/api/tools", tools::router())
        .nest("/api/background-tasks", background_tasks::router())
        .nest("/api/workflows", workflows::router())
        .nest("/api/webhooks", webhooks::router())
        .nest("/api/polling", polling::router())
        .nest("/api/specialists", specialists::router())
}
