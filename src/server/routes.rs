//! The JSON and HTML routes. Prediction requests are handed to the worker
//! pool through the `Manager`.

use super::protocol::{
    AllStatusResponse, HealthResponse, ModelNames, PredictRequest, PredictResponse,
    StatusResponse, TokenRequest, WorkerInfo,
};
use super::{json_error, WebError, FILE_TOO_LARGE};
use crate::auth::{AuthenticatedUser, IdentityVerifier, SessionManager};
use crate::config::VERSION;
use crate::manager::Manager;
use actix_web::http::header::{self, ContentType};
use actix_web::http::StatusCode;
use actix_web::{get, post, route, web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, WebError>;

const INDEX_HTML: &str = include_str!("../../templates/index.html");
const LOGIN_HTML: &str = include_str!("../../templates/login.html");

/// Renders the sign-in page
#[derive(Debug, Clone)]
pub struct LoginPage {
    api_key: String,
}

impl LoginPage {
    pub fn new(api_key: impl Into<String>) -> Self {
        LoginPage {
            api_key: api_key.into(),
        }
    }

    pub fn render(&self, status: StatusCode, error: Option<&str>) -> HttpResponse {
        let html = LOGIN_HTML
            .replace(
                "{{api_key}}",
                &html_escape::encode_double_quoted_attribute(&self.api_key),
            )
            .replace(
                "{{error}}",
                &html_escape::encode_text(error.unwrap_or_default()),
            );
        HttpResponse::build(status)
            .content_type(ContentType::html())
            .body(html)
    }
}

fn redirect(location: &str) -> actix_web::HttpResponseBuilder {
    let mut builder = HttpResponse::Found();
    builder.insert_header((header::LOCATION, location));
    builder
}

/// JSON body limits and error rendering for every JSON route
pub fn json_config(max_content_length: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_content_length)
        .error_handler(json_error)
}

pub fn form_config(max_content_length: usize) -> web::FormConfig {
    web::FormConfig::default()
        .limit(max_content_length)
        .error_handler(|err, req| {
            warn!("rejected form on {}: {err}", req.path());
            match err {
                actix_web::error::UrlencodedError::Overflow { .. } => {
                    WebError::new(StatusCode::PAYLOAD_TOO_LARGE, FILE_TOO_LARGE).into()
                }
                err => WebError::bad_request(format!("Invalid form: {err}")).into(),
            }
        })
}

/// Register every route
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(predict)
        .service(health)
        .service(login_page)
        .service(login)
        .service(session_login)
        .service(logout)
        .service(signup)
        .service(workers)
        .service(worker_status);
}

/// Fallback for unknown routes
pub async fn not_found() -> Result<HttpResponse> {
    Err(WebError::not_found())
}

#[get("/")]
pub async fn index(user: Option<AuthenticatedUser>) -> HttpResponse {
    match user {
        Some(AuthenticatedUser(session)) => {
            info!(uid = %session.uid, "index page");
            HttpResponse::Ok()
                .content_type(ContentType::html())
                .body(INDEX_HTML)
        }
        None => redirect("/auth/login").finish(),
    }
}

#[post("/predict")]
pub async fn predict(
    AuthenticatedUser(session): AuthenticatedUser,
    req: web::Json<PredictRequest>,
    manager: web::Data<Manager>,
) -> Result<impl Responder> {
    let image = req.into_inner().image.ok_or_else(|| {
        warn!(uid = %session.uid, "prediction request without an image");
        WebError::bad_request("No image provided in the request.")
    })?;

    info!(uid = %session.uid, "prediction request");
    let prediction = manager.run(image).await?;
    info!(uid = %session.uid, "prediction served: {}", prediction.label);

    Ok(web::Json(PredictResponse::from(prediction)))
}

#[get("/health")]
pub async fn health(manager: web::Data<Manager>) -> impl Responder {
    let pipeline = manager.pipeline();
    web::Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        version: VERSION,
        models: ModelNames {
            segmentation: pipeline.segmenter_name().to_string(),
            classifier: pipeline.classifier_name().to_string(),
        },
    })
}

#[get("/auth/login")]
pub async fn login_page(page: web::Data<LoginPage>) -> HttpResponse {
    page.render(StatusCode::OK, None)
}

/// Form sign-in; failures re-render the page with the reason
#[post("/auth/login")]
pub async fn login(
    form: web::Form<TokenRequest>,
    page: web::Data<LoginPage>,
    verifier: web::Data<dyn IdentityVerifier>,
    sessions: web::Data<SessionManager>,
) -> Result<HttpResponse> {
    let Some(token) = form.token() else {
        warn!("login attempt without an ID token");
        return Ok(page.render(StatusCode::BAD_REQUEST, Some("Missing ID token.")));
    };

    match verifier.verify(token).await {
        Ok(identity) => {
            let cookie = sessions.start(identity)?;
            Ok(redirect("/").cookie(cookie).finish())
        }
        Err(err) => {
            warn!("login failed: {err}");
            let err = WebError::from(err);
            Ok(page.render(err.status, Some(err.message())))
        }
    }
}

#[post("/auth/sessionLogin")]
pub async fn session_login(
    req: web::Json<TokenRequest>,
    verifier: web::Data<dyn IdentityVerifier>,
    sessions: web::Data<SessionManager>,
) -> Result<HttpResponse> {
    let token = req.token().ok_or_else(|| {
        warn!("session login attempt without an ID token");
        WebError::bad_request("ID token missing")
    })?;

    let identity = verifier.verify(token).await.map_err(|err| {
        warn!("session login failed: {err}");
        WebError::from(err)
    })?;
    let cookie = sessions.start(identity)?;

    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .json(StatusResponse { status: "success" }))
}

#[get("/auth/logout")]
pub async fn logout(req: HttpRequest, sessions: web::Data<SessionManager>) -> HttpResponse {
    if let Some(session) = sessions.read(&req) {
        info!(uid = %session.uid, "logged out");
    }
    redirect("/auth/login").cookie(sessions.end()).finish()
}

#[route("/auth/signup", method = "GET", method = "POST")]
pub async fn signup() -> Result<HttpResponse> {
    info!("signup attempt while signup is disabled");
    Err(WebError::forbidden("Signup is currently disabled."))
}

/// Every worker with its status
#[get("/workers")]
pub async fn workers(_user: AuthenticatedUser, manager: web::Data<Manager>) -> impl Responder {
    let workers: Vec<WorkerInfo> = manager
        .workers()
        .into_iter()
        .map(|(id, status)| WorkerInfo { id, status })
        .collect();
    web::Json(workers)
}

#[get("/workers/status")]
pub async fn worker_status(
    _user: AuthenticatedUser,
    manager: web::Data<Manager>,
) -> impl Responder {
    web::Json(AllStatusResponse(manager.all_status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SESSION_COOKIE;
    use crate::settings::{AuthSettings, PoolSettings};
    use crate::util::test::{self, MockVerifier, GOOD_TOKEN};
    use actix_web::cookie::{Cookie, Key};
    use actix_web::dev::ServiceResponse;
    use actix_web::{test as atest, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    macro_rules! app {
        ($probability:expr) => {{
            let manager = Manager::new(
                Arc::new(test::mock_pipeline($probability)),
                &PoolSettings {
                    workers: 2,
                    queue_capacity: 2,
                },
            );
            let verifier: Arc<dyn IdentityVerifier> = Arc::new(MockVerifier);

            atest::init_service(
                App::new()
                    .app_data(web::Data::new(manager))
                    .app_data(web::Data::from(verifier))
                    .app_data(web::Data::new(SessionManager::new(
                        Key::generate(),
                        &AuthSettings::default(),
                    )))
                    .app_data(web::Data::new(LoginPage::new("test-key")))
                    .app_data(json_config(1024 * 1024))
                    .app_data(form_config(1024 * 1024))
                    .configure(configure)
                    .default_service(web::to(not_found)),
            )
            .await
        }};
    }

    macro_rules! sign_in {
        ($app:expr) => {{
            let req = atest::TestRequest::post()
                .uri("/auth/sessionLogin")
                .set_json(json!({ "idToken": GOOD_TOKEN }))
                .to_request();
            let resp = atest::call_service($app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            session_cookie(&resp)
        }};
    }

    fn session_cookie(resp: &ServiceResponse) -> Cookie<'static> {
        resp.response()
            .cookies()
            .find(|c| c.name() == SESSION_COOKIE)
            .map(|c| c.into_owned())
            .unwrap()
    }

    async fn error_of(resp: ServiceResponse) -> String {
        let body: Value = atest::read_body_json(resp).await;
        body["error"].as_str().unwrap().to_string()
    }

    #[actix_web::test]
    async fn test_health() {
        let app = app!(0.1);
        let req = atest::TestRequest::get().uri("/health").to_request();
        let body: Value = atest::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], VERSION);
        assert_eq!(body["models"]["segmentation"], "mock-segmenter");
        assert!(body["timestamp"].as_str().is_some());
    }

    #[actix_web::test]
    async fn test_predict_success() {
        let app = app!(0.8);
        let cookie = sign_in!(&app);

        let req = atest::TestRequest::post()
            .uri("/predict")
            .cookie(cookie)
            .set_json(json!({ "image": test::png_data_uri(50, 50) }))
            .to_request();
        let body: Value = atest::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "success");
        assert_eq!(body["predicted_class"], "Milk+Oil");
        assert!(body["cropped_image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[actix_web::test]
    async fn test_predict_requires_session() {
        let app = app!(0.8);
        let req = atest::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "image": test::png_data_uri(8, 8) }))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_predict_bad_input() {
        let app = app!(0.8);
        let cookie = sign_in!(&app);

        let req = atest::TestRequest::post()
            .uri("/predict")
            .cookie(cookie.clone())
            .set_json(json!({ "image": "not-an-image" }))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_of(resp).await.starts_with("Validation error: "));

        let req = atest::TestRequest::post()
            .uri("/predict")
            .cookie(cookie.clone())
            .set_json(json!({}))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp).await, "No image provided in the request.");

        let req = atest::TestRequest::post()
            .uri("/predict")
            .cookie(cookie)
            .insert_header(ContentType::plaintext())
            .set_payload("image")
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_oversized_body() {
        let app = app!(0.8);
        let cookie = sign_in!(&app);

        let huge = "A".repeat(2 * 1024 * 1024);
        let req = atest::TestRequest::post()
            .uri("/predict")
            .cookie(cookie)
            .set_json(json!({ "image": format!("data:image/png;base64,{huge}") }))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error_of(resp).await, FILE_TOO_LARGE);
    }

    #[actix_web::test]
    async fn test_session_login_errors() {
        let app = app!(0.8);

        let req = atest::TestRequest::post()
            .uri("/auth/sessionLogin")
            .set_json(json!({}))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp).await, "ID token missing");

        let req = atest::TestRequest::post()
            .uri("/auth/sessionLogin")
            .set_json(json!({ "idToken": "forged" }))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_form_login_and_logout() {
        let app = app!(0.8);

        let req = atest::TestRequest::post()
            .uri("/auth/login")
            .set_form([("idToken", GOOD_TOKEN)])
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
        let cookie = session_cookie(&resp);

        let req = atest::TestRequest::get().uri("/").cookie(cookie.clone()).to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = atest::TestRequest::get()
            .uri("/auth/logout")
            .cookie(cookie)
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/auth/login"
        );
        let removal = resp
            .response()
            .cookies()
            .find(|c| c.name() == SESSION_COOKIE)
            .unwrap();
        assert_eq!(removal.value(), "");
    }

    #[actix_web::test]
    async fn test_form_login_failure_renders_page() {
        let app = app!(0.8);
        let req = atest::TestRequest::post()
            .uri("/auth/login")
            .set_form([("idToken", "<forged>")])
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = atest::read_body(resp).await;
        let html = std::str::from_utf8(&body).unwrap();
        assert!(html.contains("Invalid ID token"));
        assert!(html.contains("test-key"));
    }

    #[actix_web::test]
    async fn test_index_redirects_without_session() {
        let app = app!(0.8);
        let req = atest::TestRequest::get().uri("/").to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/auth/login"
        );
    }

    #[actix_web::test]
    async fn test_signup_disabled() {
        let app = app!(0.8);
        for req in [
            atest::TestRequest::get().uri("/auth/signup").to_request(),
            atest::TestRequest::post().uri("/auth/signup").to_request(),
        ] {
            let resp = atest::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(error_of(resp).await, "Signup is currently disabled.");
        }
    }

    #[actix_web::test]
    async fn test_unknown_route() {
        let app = app!(0.8);
        let req = atest::TestRequest::get().uri("/nope").to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_of(resp).await, "Not found");
    }

    #[actix_web::test]
    async fn test_worker_routes() {
        let app = app!(0.8);

        let req = atest::TestRequest::get().uri("/workers").to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let cookie = sign_in!(&app);
        let req = atest::TestRequest::get()
            .uri("/workers")
            .cookie(cookie.clone())
            .to_request();
        let body: Value = atest::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([{"id": 0, "status": "Idle"}, {"id": 1, "status": "Idle"}]));

        let req = atest::TestRequest::get()
            .uri("/workers/status")
            .cookie(cookie)
            .to_request();
        let body: Value = atest::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"0": "Idle", "1": "Idle"}));
    }

    #[actix_web::test]
    async fn test_login_page_escapes_its_slots() {
        let page = LoginPage::new(r#"key"</script>"#);
        let resp = page.render(StatusCode::UNAUTHORIZED, Some("<b>bad</b> & worse"));
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        let html = std::str::from_utf8(&body).unwrap();

        assert!(html.contains("&lt;b&gt;bad&lt;/b&gt; &amp; worse"));
        assert!(html.contains("key&quot;&lt;/script&gt;"));
        assert!(!html.contains("<b>bad</b>"));
    }
}
