use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    extract::{
        rejection::JsonRejection, MatchedPath, Path, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{
    auth, chat,
    conf::{self, Conf},
    data::{self, Storage},
    types::{Account, ChatReply, Profile, UserStats, UserSummary},
};


#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub llm: chat::Llm,
    pub conf: Arc<Conf>,
}

impl AppState {
    pub async fn new(conf: Arc<Conf>) -> anyhow::Result<Self> {
        let busy_timeout = Duration::from_secs_f32(conf.sqlite_busy_timeout);
        let storage = Storage::connect(&conf.db_path, busy_timeout).await?;
        let llm = chat::Llm::new(&conf.llm)?;
        Ok(Self { storage, llm, conf })
    }
}

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    success: bool,
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self(
            status,
            Json(ErrorResponse {
                success: false,
                error: error.into(),
            }),
        )
    }

    /// Details go to the log, never to the client.
    fn internal(error: &anyhow::Error) -> Self {
        tracing::error!(?error, "Request failed.");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(&error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(?rejection, "Rejected request body.");
        Self::new(StatusCode::BAD_REQUEST, "Invalid request body")
    }
}

impl From<auth::Error> for ApiError {
    fn from(error: auth::Error) -> Self {
        use auth::Error as E;
        let status = match &error {
            E::MissingCredentials | E::InvalidEmail | E::PasswordTooShort => {
                StatusCode::BAD_REQUEST
            }
            E::EmailTaken => StatusCode::CONFLICT,
            E::InvalidCredentials => StatusCode::UNAUTHORIZED,
            E::Internal(e) => return Self::internal(e),
        };
        Self::new(status, error.to_string())
    }
}

impl From<chat::Error> for ApiError {
    fn from(error: chat::Error) -> Self {
        use chat::Error as E;
        let status = match &error {
            E::EmptyMessage => StatusCode::BAD_REQUEST,
            E::UserNotFound => StatusCode::NOT_FOUND,
            E::Internal(e) => return Self::internal(e),
        };
        Self::new(status, error.to_string())
    }
}

impl From<data::Error> for ApiError {
    fn from(error: data::Error) -> Self {
        match error {
            data::Error::EmailTaken => auth::Error::EmailTaken.into(),
            data::Error::Db(e) => Self::internal(&e.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

#[tracing::instrument(name = "server", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    let dir = env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));
    let state = AppState::new(conf.clone()).await?;
    let service =
        router(state).into_make_service_with_connect_info::<SocketAddr>();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            let handle = axum_server::Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                async move {
                    shutdown_signal().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(10)));
                }
            });
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(service)
                .await?;
        }
    }

    tracing::info!("Stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "Failed to listen for Ctrl-C.");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "Failed to listen for SIGTERM.");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received.");
}

/// The whole API, mounted under `/api/v1` and, for older clients, `/api`.
pub fn router(state: AppState) -> axum::Router {
    let api = api_routes(&state);
    axum::Router::new()
        .route("/api/health", get(health_check))
        .nest("/api/v1", api.clone())
        .nest("/api", api)
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn({
            |req, next: Next| REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .with_state(state)
}

fn api_routes(state: &AppState) -> axum::Router<AppState> {
    let authenticated = middleware::from_fn_with_state(state.clone(), auth_layer);
    let tracked = middleware::from_fn_with_state(state.clone(), usage_layer);

    let auth = axum::Router::new()
        .route("/register", post(register))
        .route("/login", post(login));

    let user = axum::Router::new()
        .route(
            "/profile",
            get(profile).merge(
                put(profile_update).route_layer(tracked.clone()),
            ),
        )
        .route("/endpoint-usage", get(endpoint_usage))
        .route_layer(authenticated.clone());

    let chat = axum::Router::new()
        .route("/send", post(chat_send))
        .route("/history", get(chat_history))
        .route_layer(tracked.clone())
        .route_layer(authenticated.clone());

    let admin_tracked = axum::Router::new()
        .route("/users", get(admin_users))
        .route("/users/:user_id", delete(admin_user_delete))
        .route("/chat-history/:user_id", get(admin_chat_history))
        .route_layer(tracked);
    let admin = axum::Router::new()
        .route("/stats/endpoints", get(admin_endpoint_stats))
        .route("/stats/users", get(admin_user_stats))
        .merge(admin_tracked)
        .route_layer(middleware::from_fn(admin_layer))
        .route_layer(authenticated);

    axum::Router::new()
        .nest("/auth", auth)
        .nest("/user", user)
        .nest("/chat", chat)
        .nest("/admin", admin)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Endpoint not found")
}

#[derive(serde::Deserialize, Default)]
struct CredentialsReq {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProfileUpdateReq {
    #[serde(default)]
    email: Option<String>,
}

#[derive(serde::Deserialize)]
struct ChatReq {
    #[serde(default)]
    message: Option<String>,
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsReq>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = payload?;
    let session = auth::register(
        &state.storage,
        &state.conf.jwt,
        req.email.as_deref().unwrap_or_default(),
        req.password.as_deref().unwrap_or_default(),
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "user": Account::from(&session.user),
            "token": session.token,
        })),
    ))
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsReq>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    let session = auth::login(
        &state.storage,
        &state.conf.jwt,
        req.email.as_deref().unwrap_or_default(),
        req.password.as_deref().unwrap_or_default(),
    )
    .await?;
    tracing::info!(uid = session.user.id, "Logged in.");
    Ok(Json(json!({
        "success": true,
        "user": Account::from(&session.user),
        "token": session.token,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn profile(State(state): State<AppState>) -> ApiResult {
    let found = caller(&state).await?;
    Ok(Json(json!({
        "success": true,
        "user": Profile::new(&found, state.conf.free_calls_limit),
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn profile_update(
    State(state): State<AppState>,
    payload: Result<Json<ProfileUpdateReq>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    let user = USER.get();
    let email = req.email.as_deref().unwrap_or_default();
    if email.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Email is required"));
    }
    let email = auth::normalize_email(email);
    if !auth::is_valid_email(&email) {
        return Err(auth::Error::InvalidEmail.into());
    }
    let updated = state
        .storage
        .user_update_email(user.uid, &email)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "User not found"))?;
    let token = auth::issue(&updated, &state.conf.jwt)?;
    tracing::info!(email = %updated.email, "Email changed.");
    Ok(Json(json!({
        "success": true,
        "message": "Profile updated successfully",
        "user": Profile::new(&updated, state.conf.free_calls_limit),
        "token": token,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn endpoint_usage(State(state): State<AppState>) -> ApiResult {
    let user = caller(&state).await?;
    let usage = state.storage.user_endpoint_usage(user.id).await?;
    let total_requests: i64 = usage.iter().map(|u| u.request_count).sum();
    Ok(Json(json!({
        "success": true,
        "total_requests": total_requests,
        "usage": usage,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn chat_send(
    State(state): State<AppState>,
    payload: Result<Json<ChatReq>, JsonRejection>,
) -> ApiResult<Json<ChatReply>> {
    let Json(req) = payload?;
    let user = USER.get();
    let limits = chat::Limits {
        free_calls: state.conf.free_calls_limit,
        max_message_chars: state.conf.max_message_chars,
    };
    let reply = chat::send(
        &state.storage,
        &state.llm,
        &limits,
        user.uid,
        req.message.as_deref().unwrap_or_default(),
    )
    .await?;
    Ok(Json(reply))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn chat_history(State(state): State<AppState>) -> ApiResult {
    let user = caller(&state).await?;
    let history = state
        .storage
        .history(user.id, state.conf.history_limit)
        .await?;
    Ok(Json(json!({
        "success": true,
        "history": history,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn admin_users(State(state): State<AppState>) -> ApiResult {
    let users = state.storage.users_all().await?;
    let users: Vec<UserSummary> = users.iter().map(UserSummary::from).collect();
    Ok(Json(json!({
        "success": true,
        "users": users,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn admin_chat_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let user_id = parse_user_id(&user_id)?;
    let history = state
        .storage
        .history(user_id, state.conf.history_limit)
        .await?;
    Ok(Json(json!({
        "success": true,
        "userId": user_id,
        "history": history,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn admin_user_delete(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let admin = USER.get();
    let user_id = parse_user_id(&user_id)?;
    if user_id == admin.uid {
        tracing::warn!("Admin attempted to delete their own account.");
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Cannot delete your own account",
        ));
    }
    if !state.storage.user_delete(user_id).await? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "User not found"));
    }
    tracing::info!(deleted = user_id, "User deleted.");
    Ok(Json(json!({
        "success": true,
        "message": "User deleted successfully",
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn admin_endpoint_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.storage.endpoint_stats().await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
    })))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, uid = USER.get().uid)
)]
async fn admin_user_stats(State(state): State<AppState>) -> ApiResult {
    let users = state.storage.users_all().await?;
    let mut stats = Vec::with_capacity(users.len());
    for user in &users {
        let breakdown = state.storage.user_endpoint_usage(user.id).await?;
        stats.push(UserStats::new(user, breakdown));
    }
    Ok(Json(json!({
        "success": true,
        "users": stats,
    })))
}

/// The token's account. A token outlives a deleted account, so it may be gone.
async fn caller(state: &AppState) -> Result<data::User, ApiError> {
    state
        .storage
        .user_by_id(USER.get().uid)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "User not found"))
}

fn parse_user_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid user ID"))
}

#[derive(Debug, Clone)]
pub struct User {
    pub uid: i64,
    pub email: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    pub static USER: User;
    static REQ_ID: ReqId;
}

async fn auth_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            tracing::warn!("Missing Authorization header");
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "No authorization header provided",
            )
        })?;
    let invalid =
        || ApiError::new(StatusCode::UNAUTHORIZED, "Invalid or expired token");
    let auth_token = auth_header.to_str().map_err(|e| {
        tracing::warn!(error = ?e, "Invalid Authorization header encoding");
        invalid()
    })?;
    let auth_token = auth_token
        .strip_prefix("Bearer ")
        .unwrap_or(auth_token)
        .trim();

    match authorize(auth_token, &state.conf.jwt) {
        Some(user) => {
            tracing::debug!(
                uid = user.uid,
                is_admin = user.is_admin,
                "User authenticated."
            );
            Ok(USER.scope(user, next.run(req)).await)
        }
        None => Err(invalid()),
    }
}

fn authorize(auth_token: &str, jwt_conf: &conf::ConfJwt) -> Option<User> {
    let claims = auth::Claims::from_str(auth_token, jwt_conf)
        .inspect_err(|error| {
            tracing::warn!(
                ?error,
                token_prefix = ?auth_token.get(..10).unwrap_or(""),
                "JWT validation failed"
            );
        })
        .ok()?;
    let Some(uid) = claims.uid() else {
        tracing::warn!(sub = %claims.sub, "JWT subject is not a user id");
        return None;
    };
    Some(User {
        uid,
        email: claims.email,
        is_admin: claims.admin,
    })
}

/// Must run inside [`auth_layer`].
async fn admin_layer(req: Request, next: Next) -> Result<Response, ApiError> {
    let user = USER.get();
    if !user.is_admin {
        tracing::warn!(
            uid = user.uid,
            email = %user.email,
            "Non-admin attempted admin route."
        );
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "Admin access required",
        ));
    }
    Ok(next.run(req).await)
}

/// Counts successful calls toward the caller's usage, in the background.
/// Must run inside [`auth_layer`].
async fn usage_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_string(), |p| versioned(p.as_str()));
    let response = next.run(req).await;
    if response.status().is_success() {
        let user = USER.get();
        state.storage.spawn_record_usage(user.uid, method, endpoint);
    }
    response
}

/// Legacy `/api/...` aliases count as their `/api/v1/...` counterparts.
fn versioned(path: &str) -> String {
    match path.strip_prefix("/api/") {
        Some(rest) if !rest.starts_with("v1/") => format!("/api/v1/{rest}"),
        _ => path.to_string(),
    }
}
