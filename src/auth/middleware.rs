//! Session extraction and admin gating for the router.
//!
//! Unauthenticated page loads bounce to `/login` with a 303. A partial
//! request (the `X-Partial-Request` header the frontend sets on fetch-based
//! navigation) instead gets an empty 200 carrying a redirect-hint header,
//! because browsers follow fetch redirects transparently and the script
//! must perform the navigation itself. Plain API calls get a JSON 401.

use axum::extract::{Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::auth::{session, AuthContext};
use crate::error::AppError;
use crate::state::AppState;

pub const PARTIAL_REQUEST_HEADER: &str = "x-partial-request";
/// Set on the 200 handed to an unauthenticated partial request; the
/// frontend reads it and navigates.
pub const REDIRECT_HINT_HEADER: &str = "x-redirect-location";

fn unauthenticated_response(req: &Request) -> Response {
    if req.headers().contains_key(PARTIAL_REQUEST_HEADER) {
        (
            StatusCode::OK,
            [(HeaderName::from_static(REDIRECT_HINT_HEADER), "/login")],
        )
            .into_response()
    } else if req.uri().path().starts_with("/api/") {
        AppError::unauthenticated().into_response()
    } else {
        (StatusCode::SEE_OTHER, [(LOCATION, "/login")]).into_response()
    }
}

/// Attach an [`AuthContext`] to the request or reject it.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let token = jar
        .get(session::SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();
    let pool = state.pool_clone().await;
    match session::authenticate(&pool, &token).await {
        Ok(Some(ctx)) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Ok(None) => unauthenticated_response(&req),
        Err(err) => err.into_response(),
    }
}

/// Layered after [`require_session`] on admin-only routes.
pub async fn require_admin(req: Request, next: Next) -> Response {
    match req.extensions().get::<AuthContext>() {
        Some(ctx) if ctx.is_admin() => next.run(req).await,
        Some(_) => AppError::unauthorized().into_response(),
        None => AppError::unauthenticated().into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(path: &str, partial: bool) -> Request {
        let mut builder = Request::builder().uri(path);
        if partial {
            builder = builder.header(PARTIAL_REQUEST_HEADER, "true");
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn partial_request_gets_ok_with_redirect_hint() {
        let resp = unauthenticated_response(&request("/api/chores", true));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(REDIRECT_HINT_HEADER).unwrap(),
            "/login"
        );
    }

    #[test]
    fn api_request_gets_json_401() {
        let resp = unauthenticated_response(&request("/api/chores", false));
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().get(REDIRECT_HINT_HEADER).is_none());
    }

    #[test]
    fn page_load_bounces_to_login() {
        let resp = unauthenticated_response(&request("/chores", false));
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers().get(LOCATION).unwrap(), "/login");
    }
}
