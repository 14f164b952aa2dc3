//! Login, registration, and invite flows: email codes in, session cookie out.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, Query, State};
use axum::http::header::LOCATION;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::auth::codes::{self, VerifyOutcome};
use crate::auth::{session, AuthContext};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::household::{self, User};

/// Every unauthenticated code-issuing endpoint answers with this, whether
/// or not the address has an account.
fn check_your_email() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "message": "Check your email for a code." }))
}

#[derive(Deserialize)]
pub struct RegisterBody {
    pub household_name: String,
    pub email: String,
    pub name: String,
}

/// Create a household and mail a register code that confirms it. A known
/// address gets a plain login code instead; the response never reveals
/// which branch ran.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RegisterBody>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.rate_limiter.check(addr.ip()) {
        return Err(AppError::rate_limited());
    }
    let pool = state.pool_clone().await;
    if let Some(user) = household::user_by_email(&pool, &body.email).await? {
        let code = codes::issue(&pool, &user.email, codes::PURPOSE_LOGIN, None).await?;
        state.mailer.send_login_code(&user.email, &code).await;
        return Ok(check_your_email());
    }

    let (hh, user) = household::create_household_with_admin(
        &pool,
        &body.household_name,
        &body.email,
        &body.name,
    )
    .await?;
    info!(target: "gamwich", household_id = hh.id, "household_registered");
    let code = codes::issue(&pool, &user.email, codes::PURPOSE_REGISTER, Some(hh.id)).await?;
    state
        .mailer
        .send(
            &user.email,
            "Confirm your Gamwich household",
            &format!("Your confirmation code is {code}. It expires in 15 minutes."),
        )
        .await;
    Ok(check_your_email())
}

#[derive(Deserialize)]
pub struct RequestCodeBody {
    pub email: String,
}

/// Issue a login code. The response is identical whether or not the address
/// has an account.
pub async fn request_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RequestCodeBody>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.rate_limiter.check(addr.ip()) {
        return Err(AppError::rate_limited());
    }
    let pool = state.pool_clone().await;
    if let Some((user, code)) = codes::request(&pool, &body.email).await? {
        state.mailer.send_login_code(&user.email, &code).await;
    }
    Ok(check_your_email())
}

#[derive(Deserialize)]
pub struct VerifyBody {
    pub email: String,
    pub code: String,
}

pub async fn verify(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Json(body): Json<VerifyBody>,
) -> AppResult<(CookieJar, Json<serde_json::Value>)> {
    if !state.rate_limiter.check(addr.ip()) {
        return Err(AppError::rate_limited());
    }
    let pool = state.pool_clone().await;
    let outcome = codes::verify(&pool, &body.email, &body.code).await?;
    let (user, household_id) = settle(&pool, outcome).await?;
    let token = session::create(&pool, user.id, household_id).await?;
    info!(target: "gamwich", user_id = user.id, "login");

    let jar = jar.add(session::build_cookie(token, state.config.base_url_is_https()));
    Ok((jar, Json(serde_json::json!({ "user": user }))))
}

/// Turn a verify outcome into the user and the household the new session
/// points at. Register and invite codes carry their household; a login
/// code lands in the user's first membership.
async fn settle(pool: &SqlitePool, outcome: VerifyOutcome) -> AppResult<(User, i64)> {
    let (email, purpose, carried) = match outcome {
        VerifyOutcome::Verified {
            email,
            purpose,
            household_id,
        } => (email, purpose, household_id),
        VerifyOutcome::Expired => {
            return Err(AppError::new(
                "AUTH/CODE_EXPIRED",
                "That code has expired; request a new one",
            ));
        }
        VerifyOutcome::TooManyAttempts => {
            return Err(AppError::new(
                "AUTH/TOO_MANY_ATTEMPTS",
                "Too many attempts; request a new code",
            ));
        }
        VerifyOutcome::IncorrectCode => {
            return Err(AppError::new("AUTH/BAD_CODE", "That code did not work"));
        }
    };

    let user = match household::user_by_email(pool, &email).await? {
        Some(user) => user,
        None if purpose == codes::PURPOSE_INVITE => {
            let name = email.split('@').next().unwrap_or(&email).to_string();
            household::get_or_create_user(pool, &email, &name).await?
        }
        None => return Err(AppError::new("AUTH/BAD_CODE", "That code did not work")),
    };

    let household_id = match carried {
        Some(household_id) => {
            if purpose == codes::PURPOSE_INVITE {
                household::ensure_membership(pool, user.id, household_id, "member").await?;
            }
            household_id
        }
        None => household::households_for_user(pool, user.id)
            .await?
            .first()
            .map(|h| h.id)
            .ok_or_else(|| AppError::new("AUTH/NO_HOUSEHOLD", "Account has no household"))?,
    };
    Ok((user, household_id))
}

#[derive(Deserialize)]
pub struct AcceptQuery {
    pub email: String,
    pub code: String,
}

/// Invite link target. Consumes the invite code, ensures the account and
/// membership exist, and lands the fresh session on the home page.
pub async fn invite_accept(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Query(query): Query<AcceptQuery>,
) -> AppResult<(CookieJar, Response)> {
    if !state.rate_limiter.check(addr.ip()) {
        return Err(AppError::rate_limited());
    }
    let pool = state.pool_clone().await;
    let outcome = codes::verify(&pool, &query.email, &query.code).await?;
    if let VerifyOutcome::Verified { ref purpose, .. } = outcome {
        if purpose != codes::PURPOSE_INVITE {
            return Err(AppError::new("AUTH/BAD_CODE", "That code did not work"));
        }
    }
    let (user, household_id) = settle(&pool, outcome).await?;
    let token = session::create(&pool, user.id, household_id).await?;
    info!(target: "gamwich", user_id = user.id, household_id, "invite_accepted");

    let jar = jar.add(session::build_cookie(token, state.config.base_url_is_https()));
    Ok((
        jar,
        (StatusCode::SEE_OTHER, [(LOCATION, "/")]).into_response(),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<serde_json::Value>)> {
    if let Some(cookie) = jar.get(session::SESSION_COOKIE) {
        session::logout(&state.pool_clone().await, cookie.value()).await?;
    }
    let jar = jar.add(session::removal_cookie(state.config.base_url_is_https()));
    Ok((jar, Json(serde_json::json!({ "ok": true }))))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let user = household::user_by_id(&pool, ctx.user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    let households = household::households_for_user(&pool, ctx.user_id).await?;
    Ok(Json(serde_json::json!({
        "user": user,
        "household_id": ctx.household_id,
        "role": ctx.role,
        "households": households,
    })))
}

#[derive(Deserialize)]
pub struct SwitchBody {
    pub household_id: i64,
}

pub async fn switch(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<SwitchBody>,
) -> AppResult<Json<serde_json::Value>> {
    let token = jar
        .get(session::SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(AppError::unauthenticated)?;
    session::switch_household(&state.pool_clone().await, &token, body.household_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct InviteBody {
    pub email: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

/// Admin invites a family member: the account and membership are created up
/// front, and the invite code mailed out turns into their first session at
/// `/invite/accept`.
pub async fn invite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<InviteBody>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let user =
        household::invite_member(&pool, ctx.household_id, &body.email, &body.name, &body.role)
            .await?;
    let code = codes::issue(&pool, &user.email, codes::PURPOSE_INVITE, Some(ctx.household_id))
        .await?;
    info!(target: "gamwich", household_id = ctx.household_id, invited = user.id, "member_invited");

    let accept_url = format!(
        "{}/invite/accept?email={}&code={}",
        state.config.base_url,
        user.email.replace('+', "%2B"),
        code
    );
    state
        .mailer
        .send(
            &user.email,
            "You have been added to a Gamwich household",
            &format!("Open {accept_url} to join. The link expires in 15 minutes."),
        )
        .await;
    Ok(Json(serde_json::json!({ "user": user })))
}

pub async fn members(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<household::Member>>> {
    let pool = state.pool_clone().await;
    Ok(Json(household::list_members(&pool, ctx.household_id).await?))
}
