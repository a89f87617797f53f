//! HTTP routes the shell relies on: `/health` and `/login`.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/login", get(login))
}

/// GET /health - 503 while warming up, then 200.
async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// GET /login - placeholder sign-in page.
async fn login() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Secure Sign-In</title></head>\
         <body><h1>Secure Sign-In</h1><form method=\"post\" action=\"/login\">\
         <input name=\"username\"><input name=\"password\" type=\"password\">\
         <button type=\"submit\">Sign in</button></form></body></html>",
    )
}
