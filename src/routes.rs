use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::ingest::{IngestError, Ingestor, ValidationError, FETCH_FAILED};
use crate::model::{FeedSnapshot, Tab};
use crate::session::{Notice, Session, SessionError};

pub struct AppState {
    pub session: Arc<Session>,
    pub ingestor: Arc<Ingestor>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/rss", post(api_rss))
        .route("/tabs", post(add_tab))
        .route("/tabs/:id/refresh", post(refresh_tab))
        .route("/tabs/:id/remove", post(remove_tab))
        .route("/tabs/:id/select", post(select_tab))
        .route("/clear", post(clear_all))
        .route("/health", get(health))
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub tabs: Vec<Tab>,
    pub selected_id: String,
    pub active: Option<Tab>,
    pub notice: Option<Notice>,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RssResponse {
    pub success: bool,
    #[serde(flatten)]
    pub snapshot: FeedSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Pull the `url` field out of an `/api/rss` body.
///
/// Absent, null, `false`, `0` and `""` all count as missing. Any other
/// non-string value is a malformed URL.
fn requested_url(body: &Value) -> Result<&str, ValidationError> {
    match body.get("url") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(""),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Ok(""),
        Some(Value::String(url)) => Ok(url.as_str()),
        Some(_) => Err(ValidationError::NotText),
    }
}

/// The body is read as JSON whatever its content type says.
pub async fn api_rss(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            error!("Unreadable /api/rss request: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, FETCH_FAILED);
        }
    };

    let result = match requested_url(&body) {
        Ok(url) => state.ingestor.fetch_feed(url).await,
        Err(e) => Err(IngestError::from(e)),
    };

    match result {
        Ok(snapshot) => Json(RssResponse {
            success: true,
            snapshot,
        })
        .into_response(),
        Err(e) if e.is_validation() => error_response(StatusCode::BAD_REQUEST, e.public_message()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.public_message()),
    }
}

#[derive(Deserialize)]
pub struct IndexQuery {
    pub tab: Option<String>,
}

pub async fn index(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> impl IntoResponse {
    if let Some(id) = query.tab {
        // Unknown ids just leave the selection alone
        let _ = state.session.select_tab(&id).await;
    }

    let view = state.session.view().await;
    let active = view.selected_tab().cloned();

    HtmlTemplate(IndexTemplate {
        selected_id: view.selected.unwrap_or_default(),
        tabs: view.tabs,
        active,
        notice: view.notice,
    })
}

#[derive(Deserialize)]
pub struct AddTabForm {
    #[serde(default)]
    pub url: String,
}

pub async fn add_tab(
    State(state): State<Arc<AppState>>,
    Form(form): Form<AddTabForm>,
) -> Redirect {
    let url = form.url.trim();
    if url.is_empty() {
        state.session.notify(Notice::error("URL is required")).await;
    } else {
        state.session.add_tab(url).await;
    }
    Redirect::to("/")
}

pub async fn refresh_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Redirect {
    match state.session.tab_url(&id).await {
        Some(url) => {
            if let Err(e) = state.session.refresh_tab(&id, &url).await {
                state.session.notify(Notice::error(e.to_string())).await;
            }
        }
        None => {
            let e = SessionError::UnknownTab(id);
            state.session.notify(Notice::error(e.to_string())).await;
        }
    }
    Redirect::to("/")
}

pub async fn remove_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Redirect {
    // The session records the rejection as a notice
    let _ = state.session.remove_tab(&id).await;
    Redirect::to("/")
}

pub async fn select_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Redirect {
    if let Err(e) = state.session.select_tab(&id).await {
        state.session.notify(Notice::error(e.to_string())).await;
    }
    Redirect::to("/")
}

pub async fn clear_all(State(state): State<Arc<AppState>>) -> Redirect {
    state.session.clear_all().await;
    Redirect::to("/")
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::db::Database;
    use crate::session::{Persister, SessionStore};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0">
            <channel>
                <title>Route Feed</title>
                <description>Feed for route tests</description>
                <item>
                    <title>Hello</title>
                    <link>https://example.com/hello</link>
                    <description>Greeting</description>
                    <author>someone@example.com</author>
                </item>
                <item>
                    <link>https://example.com/untitled</link>
                </item>
            </channel>
        </rss>
    "#;

    async fn create_test_app() -> (Router, Arc<Session>) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();

        let ingestor = Arc::new(Ingestor::new(&FetchConfig::default()).unwrap());
        let store = SessionStore::new(Persister::spawn(db));
        let session = Arc::new(Session::new(store, ingestor.clone()));
        let state = Arc::new(AppState {
            session: session.clone(),
            ingestor,
        });

        (router(state), session)
    }

    async fn feed_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TEST_RSS))
            .mount(&server)
            .await;
        server
    }

    fn json_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/rss")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn form_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let (app, _session) = create_test_app().await;

            let response = app
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_string(response).await, "OK");
        }
    }

    mod api_rss_tests {
        use super::*;

        #[tokio::test]
        async fn test_missing_url() {
            let (app, _session) = create_test_app().await;

            let response = app.oneshot(json_request("{}")).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["error"], "URL is required");
        }

        #[tokio::test]
        async fn test_empty_url() {
            let (app, _session) = create_test_app().await;

            let response = app.oneshot(json_request(r#"{"url": ""}"#)).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"], "URL is required");
        }

        #[tokio::test]
        async fn test_invalid_url() {
            let (app, _session) = create_test_app().await;

            let response = app
                .oneshot(json_request(r#"{"url": "not-a-url"}"#))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"], "Invalid URL format");
        }

        #[tokio::test]
        async fn test_unreadable_body() {
            let (app, _session) = create_test_app().await;

            let response = app.oneshot(json_request("{oops")).await.unwrap();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                body_json(response).await["error"],
                "Failed to fetch or parse RSS feed"
            );
        }

        #[tokio::test]
        async fn test_json_without_content_type() {
            let (app, _session) = create_test_app().await;

            let request = Request::builder()
                .method("POST")
                .uri("/api/rss")
                .body(Body::from(r#"{"url": "not-a-url"}"#))
                .unwrap();
            let response = app.oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"], "Invalid URL format");
        }

        #[tokio::test]
        async fn test_feed_fetched_without_content_type() {
            let server = feed_server().await;
            let (app, _session) = create_test_app().await;

            let request = Request::builder()
                .method("POST")
                .uri("/api/rss")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from(format!(r#"{{"url": "{}/feed.xml"}}"#, server.uri())))
                .unwrap();
            let response = app.oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await["feedTitle"], "Route Feed");
        }

        #[tokio::test]
        async fn test_non_string_url_is_invalid() {
            for body in [r#"{"url": 123}"#, r#"{"url": true}"#, r#"{"url": ["x"]}"#] {
                let (app, _session) = create_test_app().await;

                let response = app.oneshot(json_request(body)).await.unwrap();

                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
                assert_eq!(body_json(response).await["error"], "Invalid URL format");
            }
        }

        #[tokio::test]
        async fn test_falsy_url_is_missing() {
            for body in [r#"{"url": null}"#, r#"{"url": false}"#, r#"{"url": 0}"#] {
                let (app, _session) = create_test_app().await;

                let response = app.oneshot(json_request(body)).await.unwrap();

                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
                assert_eq!(body_json(response).await["error"], "URL is required");
            }
        }

        #[tokio::test]
        async fn test_unreachable_feed() {
            let (app, _session) = create_test_app().await;

            let response = app
                .oneshot(json_request(r#"{"url": "http://127.0.0.1:9/feed.xml"}"#))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                body_json(response).await["error"],
                "Failed to fetch or parse RSS feed"
            );
        }

        #[tokio::test]
        async fn test_success_shape() {
            let server = feed_server().await;
            let (app, _session) = create_test_app().await;

            let body = format!(r#"{{"url": "{}/feed.xml"}}"#, server.uri());
            let response = app.oneshot(json_request(&body)).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["success"], true);
            assert_eq!(body["feedTitle"], "Route Feed");
            assert_eq!(body["feedDescription"], "Feed for route tests");
            assert_eq!(body["faviconUrl"], "http://127.0.0.1/favicon.ico");

            let articles = body["articles"].as_array().unwrap();
            assert_eq!(articles.len(), 2);
            assert_eq!(articles[0]["title"], "Hello");
            assert_eq!(articles[0]["description"], "Greeting");
            assert_eq!(articles[1]["title"], "No title");
            assert_eq!(articles[1]["description"], "No description");
            assert_eq!(articles[1]["author"], "");
            assert_eq!(articles[1]["pubDate"], "");
        }
    }

    mod session_route_tests {
        use super::*;

        #[tokio::test]
        async fn test_index_empty_session() {
            let (app, _session) = create_test_app().await;

            let response = app
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert!(body_string(response).await.contains("Add a feed to get started"));
        }

        #[tokio::test]
        async fn test_add_tab_redirects_and_renders() {
            let server = feed_server().await;
            let (app, session) = create_test_app().await;

            let form = serde_urlencoded::to_string([("url", format!("{}/feed.xml", server.uri()))])
                .unwrap();
            let response = app
                .clone()
                .oneshot(form_request("/tabs", &form))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(response.headers()[header::LOCATION], "/");

            let response = app
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let html = body_string(response).await;
            assert!(html.contains("Route Feed"));
            assert!(html.contains("Hello"));
            assert!(html.contains("Feed loaded: 2 articles"));

            assert_eq!(session.view().await.tabs.len(), 1);
        }

        #[tokio::test]
        async fn test_script_links_are_not_clickable() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/trap.xml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<?xml version="1.0"?>
                    <rss version="2.0"><channel><title>Trap Feed</title>
                        <item><title>Trap</title><link>javascript:alert(1)</link></item>
                        <item><title>Safe</title><link>https://example.com/safe</link></item>
                    </channel></rss>"#,
                ))
                .mount(&server)
                .await;
            let (app, session) = create_test_app().await;
            session.add_tab(&format!("{}/trap.xml", server.uri())).await;

            let response = app
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let html = body_string(response).await;

            assert!(html.contains("Trap"));
            assert!(!html.contains("javascript:"));
            // Only the https article gets an anchor
            assert_eq!(html.matches("target=\"_blank\"").count(), 1);
        }

        #[tokio::test]
        async fn test_add_blank_url_adds_nothing() {
            let (app, session) = create_test_app().await;

            let response = app
                .oneshot(form_request("/tabs", "url=+++"))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            let view = session.view().await;
            assert!(view.tabs.is_empty());
            assert_eq!(view.notice, Some(Notice::error("URL is required")));
        }

        #[tokio::test]
        async fn test_remove_last_tab_is_rejected() {
            let (app, session) = create_test_app().await;
            let (id, _) = session.add_tab("not-a-url").await;

            let response = app
                .oneshot(form_request(&format!("/tabs/{}/remove", id), ""))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            let view = session.view().await;
            assert_eq!(view.tabs.len(), 1);
            assert_eq!(view.notice, Some(Notice::error("Cannot remove the last tab")));
        }

        #[tokio::test]
        async fn test_select_and_remove() {
            let (app, session) = create_test_app().await;
            let (first, _) = session.add_tab("not-a-url").await;
            let (second, _) = session.add_tab("also-not-a-url").await;

            app.clone()
                .oneshot(form_request(&format!("/tabs/{}/select", first), ""))
                .await
                .unwrap();
            assert_eq!(session.view().await.selected.as_deref(), Some(first.as_str()));

            app.oneshot(form_request(&format!("/tabs/{}/remove", first), ""))
                .await
                .unwrap();
            let view = session.view().await;
            assert_eq!(view.tabs.len(), 1);
            assert_eq!(view.selected.as_deref(), Some(second.as_str()));
        }

        #[tokio::test]
        async fn test_index_query_selects_tab() {
            let (app, session) = create_test_app().await;
            let (first, _) = session.add_tab("not-a-url").await;
            session.add_tab("also-not-a-url").await;

            let response = app
                .oneshot(
                    Request::builder()
                        .uri(format!("/?tab={}", first))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(session.view().await.selected.as_deref(), Some(first.as_str()));
        }

        #[tokio::test]
        async fn test_refresh_unknown_tab() {
            let (app, session) = create_test_app().await;

            let response = app
                .oneshot(form_request("/tabs/tab-missing/refresh", ""))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert!(session.view().await.notice.unwrap().is_error());
        }

        #[tokio::test]
        async fn test_refresh_tab_reloads() {
            let server = feed_server().await;
            let (app, session) = create_test_app().await;
            let (id, _) = session.add_tab(&format!("{}/feed.xml", server.uri())).await;
            session.view().await;

            app.oneshot(form_request(&format!("/tabs/{}/refresh", id), ""))
                .await
                .unwrap();

            let view = session.view().await;
            assert_eq!(view.selected_tab().unwrap().article_count(), 2);
            assert_eq!(view.notice, Some(Notice::success("Feed loaded: 2 articles")));
        }

        #[tokio::test]
        async fn test_clear_all() {
            let (app, session) = create_test_app().await;
            session.add_tab("not-a-url").await;
            session.add_tab("also-not-a-url").await;

            let response = app.oneshot(form_request("/clear", "")).await.unwrap();

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            let view = session.view().await;
            assert!(view.tabs.is_empty());
            assert!(view.selected.is_none());
        }
    }

    mod form_tests {
        use super::*;

        #[test]
        fn test_add_tab_form_default_url() {
            let form: AddTabForm = serde_urlencoded::from_str("").unwrap();
            assert_eq!(form.url, "");
        }

        #[test]
        fn test_add_tab_form_with_url() {
            let form: AddTabForm =
                serde_urlencoded::from_str("url=https%3A%2F%2Fexample.com%2Frss").unwrap();
            assert_eq!(form.url, "https://example.com/rss");
        }
    }
}
