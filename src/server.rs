//! HTTP surface of the portal.
//!
//! JSON endpoints for the clinician sign-in / OAuth flow, the appointment
//! listing and the walk-in intake. Requests carry the session token in the
//! `X-Session-Token` header; the OAuth callback is matched to its session
//! through the `state` value instead.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::appointments::{AppointmentMerger, AppointmentSelectors};
use crate::clock;
use crate::config::Config;
use crate::error::{PortalError, PortalResult};
use crate::intake::{DemographicForm, IdentityForm, IntakeFlow, IntakeState};
use crate::logging;
use crate::mirror::PatientMirror;
use crate::oauth::OAuthExchange;
use crate::records_api::RecordsApi;
use crate::session::{ClinicianContext, SessionManager};
use crate::store::Store;
use crate::token_store::TokenStore;

pub const SESSION_HEADER: &str = "x-session-token";

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub tokens: TokenStore,
    pub oauth: OAuthExchange,
    pub mirror: PatientMirror,
    pub merger: AppointmentMerger,
    pub intake: IntakeFlow,
}

impl AppState {
    pub fn new(config: &Config, api: Arc<dyn RecordsApi>, store: Arc<Store>) -> PortalResult<Self> {
        let tz = config.timezone().map_err(PortalError::Config)?;
        let tokens = TokenStore::new(store.clone());
        Ok(Self {
            sessions: SessionManager::new(),
            oauth: OAuthExchange::new(config, api.clone(), tokens.clone()),
            mirror: PatientMirror::new(api.clone(), store.clone()),
            merger: AppointmentMerger::new(config, tz, api, store.clone()),
            intake: IntakeFlow::new(store, tz),
            tokens,
        })
    }

    fn clinician(&self, headers: &HeaderMap) -> PortalResult<ClinicianContext> {
        let token = session_token(headers).ok_or(PortalError::InvalidSession)?;
        self.sessions.identity(&token)
    }
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_endpoint))
        .route("/signin", post(sign_in))
        .route("/authorize", get(authorize))
        .route("/login", get(oauth_callback))
        .route("/home", get(home))
        .route("/check-in", post(start_check_in))
        .route("/check-in/identity", post(submit_identity))
        .route("/check-in/demographics", post(submit_demographics))
        .route("/appointments", get(appointments))
        .route("/logout", post(logout))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health_endpoint() -> Json<Value> {
    Json(json!({
        "healthy": true,
        "timestamp": Utc::now().to_rfc3339()
    }))
}

// =====================
// Clinician sign-in and OAuth
// =====================

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignInResponse {
    pub session_token: String,
    pub user_ref: String,
}

async fn sign_in(
    State(state): State<AppState>,
    Json(req): Json<SignInRequest>,
) -> PortalResult<Json<SignInResponse>> {
    let session_token = state.sessions.sign_in(&req.username)?;
    let ctx = state.sessions.identity(&session_token)?;
    logging::log_auth_event("sign_in", Some(&ctx.user_ref), true, None);
    Ok(Json(SignInResponse {
        session_token,
        user_ref: ctx.user_ref,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeParams {
    /// Session token for browsers that cannot set the header on a navigation
    pub session: Option<String>,
}

async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> PortalResult<Redirect> {
    let token = session_token(&headers)
        .or(params.session)
        .ok_or(PortalError::InvalidSession)?;
    let oauth_state = state.sessions.begin_authorization(&token)?;
    Ok(Redirect::to(&state.oauth.authorize_url(&oauth_state)))
}

/// Longest accepted OAuth callback parameter
const MAX_OAUTH_PARAM_LENGTH: usize = 2048;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> PortalResult<Json<Value>> {
    if let Some(error) = params.error {
        logging::log_auth_event("callback", None, false, Some(&error));
        return Err(PortalError::NotAuthenticated);
    }

    let code = params.code.unwrap_or_default();
    let oauth_state = params.state.unwrap_or_default();
    if code.is_empty() || oauth_state.is_empty() {
        return Err(PortalError::Validation(
            "OAuth code and state parameters are required".to_string(),
        ));
    }
    if code.len() > MAX_OAUTH_PARAM_LENGTH || oauth_state.len() > MAX_OAUTH_PARAM_LENGTH {
        return Err(PortalError::Validation(
            "OAuth parameter exceeds maximum length".to_string(),
        ));
    }

    let clinician = state.sessions.complete_authorization(&oauth_state)?;
    match state.oauth.exchange(&clinician, &code, Utc::now()).await {
        Ok(account) => {
            logging::log_auth_event("login_complete", Some(&clinician.user_ref), true, None);
            Ok(Json(json!({ "clinician": account })))
        }
        Err(e) => {
            logging::log_auth_event(
                "login_complete",
                Some(&clinician.user_ref),
                false,
                Some(&e.to_string()),
            );
            Err(e)
        }
    }
}

async fn home(State(state): State<AppState>, headers: HeaderMap) -> PortalResult<Json<Value>> {
    let clinician = state.clinician(&headers)?;
    let account = state.tokens.get(&clinician.user_ref)?;
    let stale = state.tokens.is_stale(&clinician.user_ref, Utc::now())?;
    Ok(Json(json!({
        "user_ref": clinician.user_ref,
        "display_name": account.as_ref().map(|a| a.display_name.clone()),
        "authorized": account.is_some(),
        "token_fresh": !stale,
    })))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let signed_out = session_token(&headers)
        .map(|token| state.sessions.sign_out(&token))
        .unwrap_or(false);
    if signed_out {
        logging::log_auth_event("logout", None, true, None);
    }
    Json(json!({ "signed_out": signed_out }))
}

// =====================
// Appointments
// =====================

async fn appointments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(selectors): Query<AppointmentSelectors>,
) -> PortalResult<Json<Value>> {
    let clinician = state.clinician(&headers)?;
    let now = Utc::now();
    let token = state.oauth.bearer_token(&clinician, now).await?;
    let date = state.merger.query_for(now, &selectors).date;
    let listing = state.merger.today(&token, now, &selectors).await?;
    Ok(Json(json!({
        "date": date,
        "count": listing.len(),
        "appointments": listing,
    })))
}

// =====================
// Intake
// =====================

/// Intake step result, with the form to show next and any inline error
#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub intake: IntakeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrived_time: Option<String>,
}

impl IntakeResponse {
    fn with_form(intake: IntakeState, form: impl Serialize) -> PortalResult<Self> {
        Ok(Self {
            intake,
            form: Some(serde_json::to_value(form)?),
            error: None,
            arrived_time: None,
        })
    }

    /// Re-show a form with an inline error; nothing changed server side
    fn rejected(intake: IntakeState, form: impl Serialize, message: String) -> Response {
        let body = Self {
            intake,
            form: serde_json::to_value(form).ok(),
            error: Some(message),
            arrived_time: None,
        };
        (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
    }
}

async fn start_check_in(State(state): State<AppState>, headers: HeaderMap) -> PortalResult<Json<Value>> {
    let clinician = state.clinician(&headers)?;
    let token = state.oauth.bearer_token(&clinician, Utc::now()).await?;
    let report = state.mirror.sync(&token).await?;
    logging::log_intake_event("anonymous_start", None);

    let response = IntakeResponse::with_form(IntakeState::AnonymousStart, IdentityForm::default())?;
    Ok(Json(json!({ "mirror": report, "check_in": response })))
}

async fn submit_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(form): Json<IdentityForm>,
) -> Result<Response, PortalError> {
    state.clinician(&headers)?;

    match state.intake.submit_identity(&form, Utc::now()) {
        Ok(shown) => {
            let form = match &shown {
                IntakeState::DemographicShown { patient, .. } => {
                    logging::log_intake_event("demographic_shown", Some(patient.id));
                    DemographicForm::from_record(patient)
                }
                _ => DemographicForm::default(),
            };
            Ok(Json(IntakeResponse::with_form(shown, form)?).into_response())
        }
        Err(PortalError::Validation(message)) => Ok(IntakeResponse::rejected(
            IntakeState::AnonymousStart,
            form,
            message,
        )),
        Err(e) => Err(e),
    }
}

async fn submit_demographics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(form): Json<DemographicForm>,
) -> Result<Response, PortalError> {
    state.clinician(&headers)?;

    match state.intake.submit_demographics(&form, Utc::now()) {
        Ok(arrived) => {
            let arrived_time = match &arrived {
                IntakeState::Arrived { patient } => {
                    logging::log_intake_event("arrived", Some(patient.id));
                    patient.arrival_clock()
                }
                _ => None,
            };
            let body = IntakeResponse {
                intake: arrived,
                form: None,
                error: None,
                arrived_time,
            };
            Ok(Json(body).into_response())
        }
        Err(PortalError::Validation(message)) => {
            let shown = match state.intake.patient(form.patient_id)? {
                Some(patient) => IntakeState::DemographicShown {
                    patient,
                    created: false,
                },
                None => return Err(PortalError::PatientNotFound(form.patient_id)),
            };
            Ok(IntakeResponse::rejected(shown, form, message))
        }
        Err(e) => Err(e),
    }
}

/// Bind and serve until Ctrl+C
pub async fn serve(config: &Config, state: AppState) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    let tz = config.timezone().map_err(anyhow::Error::msg)?;
    info!(
        addr = %config.bind_address,
        clinic_timezone = %config.clinic_timezone,
        clinic_date = %clock::api_date(clock::clinic_date(Utc::now(), tz)),
        "Check-in portal listening"
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote_patient, FakeRecordsApi};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Harness {
        state: AppState,
        api: Arc<FakeRecordsApi>,
        store: Arc<Store>,
    }

    impl Harness {
        fn new() -> Self {
            let api = Arc::new(FakeRecordsApi::with_grant("access-1", "refresh-1", 3600));
            let store = Arc::new(Store::open_in_memory().unwrap());
            let config = Config {
                client_id: "portal".to_string(),
                ..Config::default()
            };
            let state = AppState::new(&config, api.clone(), store.clone()).unwrap();
            Self { state, api, store }
        }

        fn router(&self) -> Router {
            build_router(self.state.clone())
        }

        /// Signed-in session whose OAuth exchange has completed
        async fn authorized_session(&self) -> String {
            let token = self.state.sessions.sign_in("drjones").unwrap();
            let oauth_state = self.state.sessions.begin_authorization(&token).unwrap();
            let (status, _) = send(
                &self.router(),
                get(&format!("/login?code=abc&state={}", oauth_state), None),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            token
        }
    }

    fn get(uri: &str, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(token) = session {
            builder = builder.header(SESSION_HEADER, token);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, session: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = session {
            builder = builder.header(SESSION_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let harness = Harness::new();
        let (status, body) = send(&harness.router(), get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }

    #[tokio::test]
    async fn test_sign_in_rejects_blank_username() {
        let harness = Harness::new();
        let (status, body) = send(
            &harness.router(),
            post("/signin", None, json!({"username": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "Please enter a username.");
    }

    #[tokio::test]
    async fn test_authorize_redirects_to_provider() {
        let harness = Harness::new();
        let (_, body) = send(
            &harness.router(),
            post("/signin", None, json!({"username": "drjones"})),
        )
        .await;
        let token = body["session_token"].as_str().unwrap().to_string();

        let response = harness
            .router()
            .oneshot(get(&format!("/authorize?session={}", token), None))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://drchrono.com/o/authorize/?"));
        assert!(location.contains("client_id=portal"));
        assert!(location.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_callback_stores_token_for_bound_clinician() {
        let harness = Harness::new();
        let token = harness.authorized_session().await;

        assert_eq!(harness.api.codes_exchanged(), vec!["abc"]);
        let account = harness.state.tokens.get("drjones").unwrap().unwrap();
        assert_eq!(account.access_token, "access-1");

        let (status, body) = send(&harness.router(), get("/home", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], true);
        assert_eq!(body["token_fresh"], true);
    }

    #[tokio::test]
    async fn test_callback_with_out_of_range_lifetime() {
        let api = Arc::new(FakeRecordsApi::with_grant("access-1", "refresh-1", i64::MAX));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let state = AppState::new(&Config::default(), api, store).unwrap();
        let token = state.sessions.sign_in("drjones").unwrap();
        let oauth_state = state.sessions.begin_authorization(&token).unwrap();

        let (status, _) = send(
            &build_router(state.clone()),
            get(&format!("/login?code=abc&state={}", oauth_state), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(state.tokens.get("drjones").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state() {
        let harness = Harness::new();
        let (status, _) = send(&harness.router(), get("/login?code=abc&state=forged", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(harness.api.codes_exchanged().is_empty());
    }

    #[tokio::test]
    async fn test_callback_provider_denial() {
        let harness = Harness::new();
        let (status, _) = send(&harness.router(), get("/login?error=access_denied", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_check_in_requires_session() {
        let harness = Harness::new();
        let (status, _) = send(&harness.router(), post("/check-in", None, json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_check_in_without_oauth_is_unauthorized() {
        let harness = Harness::new();
        let token = harness.state.sessions.sign_in("drjones").unwrap();
        let (status, _) = send(&harness.router(), post("/check-in", Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_walk_in_intake_end_to_end() {
        let harness = Harness::new();
        harness.api.set_patients(vec![remote_patient(7, "Ann", "Lee")]);
        let token = harness.authorized_session().await;
        let app = harness.router();

        let (status, body) = send(&app, post("/check-in", Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mirror"]["inserted"], 1);
        assert_eq!(body["check_in"]["intake"]["state"], "anonymous_start");

        let identity = json!({
            "first_name": "Jane",
            "last_name": "Doe",
            "date_of_birth": "1990-01-01"
        });
        let (status, body) = send(&app, post("/check-in/identity", Some(&token), identity)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intake"]["state"], "demographic_shown");
        assert_eq!(body["intake"]["created"], true);
        assert_eq!(body["form"]["date_of_birth"], "1990-01-01");
        let patient_id = body["form"]["patient_id"].as_i64().unwrap();

        let mut form = body["form"].clone();
        form["city"] = json!("Oakland");
        let (status, body) = send(&app, post("/check-in/demographics", Some(&token), form)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intake"]["state"], "arrived");
        assert_eq!(body["arrived_time"].as_str().unwrap().len(), 8);

        let stored = harness.store.patient_by_id(patient_id).unwrap().unwrap();
        assert!(stored.has_arrived());
        assert_eq!(stored.profile.city, "Oakland");
        assert_eq!(harness.store.patient_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_identity_echoes_form() {
        let harness = Harness::new();
        let token = harness.state.sessions.sign_in("drjones").unwrap();
        let identity = json!({"first_name": "Jane", "last_name": "", "date_of_birth": "1990-01-01"});

        let (status, body) = send(
            &harness.router(),
            post("/check-in/identity", Some(&token), identity),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["intake"]["state"], "anonymous_start");
        assert_eq!(body["error"], "Last name is required.");
        assert_eq!(body["form"]["first_name"], "Jane");
        assert_eq!(harness.store.patient_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_demographics_stay_on_form() {
        let harness = Harness::new();
        let token = harness.state.sessions.sign_in("drjones").unwrap();
        let app = harness.router();
        let identity = json!({"first_name": "Jane", "last_name": "Doe", "date_of_birth": "1990-01-01"});
        let (_, body) = send(&app, post("/check-in/identity", Some(&token), identity)).await;

        let mut form = body["form"].clone();
        form["email"] = json!("nope");
        let (status, body) = send(&app, post("/check-in/demographics", Some(&token), form)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["intake"]["state"], "demographic_shown");
        assert_eq!(body["form"]["email"], "nope");
    }

    #[tokio::test]
    async fn test_demographics_for_unknown_patient() {
        let harness = Harness::new();
        let token = harness.state.sessions.sign_in("drjones").unwrap();
        let form = json!({
            "patient_id": 999,
            "first_name": "Jane",
            "last_name": "Doe",
            "date_of_birth": "1990-01-01"
        });
        let (status, _) = send(
            &harness.router(),
            post("/check-in/demographics", Some(&token), form),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_appointments_listing() {
        let harness = Harness::new();
        harness.api.set_patients(vec![remote_patient(7, "Ann", "Lee")]);
        harness.api.set_appointments(vec![
            json!({"id": 1, "patient": 7, "status": "Confirmed"}),
            json!({"id": 2, "patient": 8}),
        ]);
        let token = harness.authorized_session().await;
        let app = harness.router();
        send(&app, post("/check-in", Some(&token), json!({}))).await;

        let (status, body) = send(&app, get("/appointments?exam_room=3", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["appointments"][0]["first_name"], "Ann");
        assert_eq!(body["appointments"][0]["status"], "Confirmed");
        assert_eq!(harness.api.appointment_queries()[0].exam_room, Some(3));
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let harness = Harness::new();
        let token = harness.state.sessions.sign_in("drjones").unwrap();
        let app = harness.router();

        let (_, body) = send(&app, post("/logout", Some(&token), json!({}))).await;
        assert_eq!(body["signed_out"], true);
        let (status, _) = send(&app, get("/home", Some(&token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
