use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::config::SessionSettings;
use crate::session::Session;

use super::AppState;

/// Where a request may carry its session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Cookie,
    Header,
    Query,
}

/// Sources are consulted in this order; the first one present wins, even
/// if its value turns out to be unknown.
pub const RESOLUTION_ORDER: [IdSource; 3] = [IdSource::Cookie, IdSource::Header, IdSource::Query];

/// The session resolved for the current request.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Arc<Session>);

/// Names under which the session identifier travels, and cookie attributes.
#[derive(Debug, Clone)]
pub struct SessionCarriage {
    pub cookie_name: String,
    pub header_name: String,
    pub query_param: String,
    pub max_age: Duration,
    pub secure: bool,
}

impl SessionCarriage {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            cookie_name: settings.cookie_name.clone(),
            header_name: settings.header_name.to_ascii_lowercase(),
            query_param: settings.query_param.clone(),
            max_age: settings.ttl(),
            secure: settings.secure_cookie,
        }
    }

    /// First identifier found in [`RESOLUTION_ORDER`].
    pub fn extract(&self, req: &Request) -> Option<(IdSource, String)> {
        RESOLUTION_ORDER.iter().find_map(|source| {
            let id = match source {
                IdSource::Cookie => self.cookie_id(req.headers()),
                IdSource::Header => self.header_id(req.headers()),
                IdSource::Query => self.query_id(req.uri().query()),
            };
            id.map(|id| (*source, id))
        })
    }

    fn cookie_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == self.cookie_name).then(|| value.trim_matches('"').to_string())
            })
            .filter(|v| !v.is_empty())
    }

    fn header_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn query_id(&self, query: Option<&str>) -> Option<String> {
        query?
            .split('&')
            .find_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                if name != self.query_param {
                    return None;
                }
                urlencoding::decode(value).ok().map(|v| v.into_owned())
            })
            .filter(|v| !v.is_empty())
    }

    /// `Set-Cookie` value binding the client to `session_id`.
    pub fn set_cookie(&self, session_id: &str) -> Option<HeaderValue> {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name,
            session_id,
            self.max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }
}

/// Middleware: resolve the caller's session and refresh its cookie.
///
/// Unknown identifiers are never adopted; the caller gets a fresh session
/// and the cookie points at it from then on.
pub async fn resolve_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let candidate = state.carriage.extract(&req);
    let resolved = state
        .sessions
        .resolve(candidate.as_ref().map(|(_, id)| id.as_str()));
    if resolved.created {
        if let Some((source, _)) = candidate {
            tracing::debug!(?source, session = %resolved.session.id(), "unknown session id replaced");
        }
    }

    let cookie = state.carriage.set_cookie(resolved.session.id());
    req.extensions_mut().insert(CurrentSession(resolved.session));

    let mut response = next.run(req).await;
    if let Some(cookie) = cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::job::{JobRunner, WorkerCommand};
    use crate::session::SessionRegistry;
    use axum::{body::Body, http::StatusCode, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn carriage() -> SessionCarriage {
        SessionCarriage::from_settings(&SessionSettings::default())
    }

    fn request(builder: axum::http::request::Builder) -> Request {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn extract_from_each_source() {
        let c = carriage();
        let req = request(axum::http::Request::builder().uri("/").header("cookie", "a=1; jobdeck_session=abc; b=2"));
        assert_eq!(c.extract(&req), Some((IdSource::Cookie, "abc".into())));

        let req = request(axum::http::Request::builder().uri("/").header("X-Session-Id", "def"));
        assert_eq!(c.extract(&req), Some((IdSource::Header, "def".into())));

        let req = request(axum::http::Request::builder().uri("/downloads/x?foo=1&session=g%20h"));
        assert_eq!(c.extract(&req), Some((IdSource::Query, "g h".into())));

        let req = request(axum::http::Request::builder().uri("/"));
        assert_eq!(c.extract(&req), None);
    }

    #[test]
    fn cookie_wins_over_header_and_query() {
        let c = carriage();
        let req = request(
            axum::http::Request::builder()
                .uri("/?session=q")
                .header("cookie", "jobdeck_session=c")
                .header("x-session-id", "h"),
        );
        assert_eq!(c.extract(&req), Some((IdSource::Cookie, "c".into())));

        let req = request(axum::http::Request::builder().uri("/?session=q").header("x-session-id", "h"));
        assert_eq!(c.extract(&req), Some((IdSource::Header, "h".into())));
    }

    #[test]
    fn empty_values_are_absent() {
        let c = carriage();
        let req = request(
            axum::http::Request::builder()
                .uri("/?session=")
                .header("cookie", "jobdeck_session=")
                .header("x-session-id", " "),
        );
        assert_eq!(c.extract(&req), None);
    }

    #[test]
    fn set_cookie_attributes() {
        let mut c = carriage();
        let value = c.set_cookie("abc").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "jobdeck_session=abc; Path=/; Max-Age=3600; HttpOnly; SameSite=Lax"
        );
        c.secure = true;
        assert!(c.set_cookie("abc").unwrap().to_str().unwrap().ends_with("; Secure"));
    }

    fn test_app() -> (Router, SessionRegistry) {
        let dir = std::env::temp_dir();
        let artifacts = ArtifactStore::new(dir.join("jobdeck-resolve-test"));
        let worker = WorkerCommand::from_argv(&["true".to_string()]).unwrap();
        let sessions = SessionRegistry::new();
        let state = AppState {
            sessions: sessions.clone(),
            artifacts: artifacts.clone(),
            runner: Arc::new(JobRunner::new(worker, artifacts, "", dir, Duration::from_secs(1))),
            carriage: Arc::new(carriage()),
        };
        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(CurrentSession(s)): Extension<CurrentSession>| async move {
                    s.id().to_string()
                }),
            )
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), resolve_session))
            .with_state(state);
        (app, sessions)
    }

    async fn whoami(app: &Router, req: Request) -> (String, String) {
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (String::from_utf8(body.to_vec()).unwrap(), cookie)
    }

    #[tokio::test]
    async fn new_client_gets_cookie_for_minted_session() {
        let (app, sessions) = test_app();
        let (id, cookie) = whoami(&app, request(axum::http::Request::builder().uri("/whoami"))).await;
        assert!(cookie.starts_with(&format!("jobdeck_session={id};")));
        assert!(sessions.get(&id).is_some());
    }

    #[tokio::test]
    async fn known_cookie_resolves_same_session() {
        let (app, sessions) = test_app();
        let (id, _) = whoami(&app, request(axum::http::Request::builder().uri("/whoami"))).await;
        let (again, _) = whoami(
            &app,
            request(axum::http::Request::builder().uri("/whoami").header("cookie", format!("jobdeck_session={id}"))),
        )
        .await;
        assert_eq!(again, id);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_adopted() {
        let (app, sessions) = test_app();
        let (id, cookie) = whoami(
            &app,
            request(axum::http::Request::builder().uri("/whoami").header("x-session-id", "attacker-chosen")),
        )
        .await;
        assert_ne!(id, "attacker-chosen");
        assert!(cookie.contains(&id));
        assert!(sessions.get("attacker-chosen").is_none());
    }

    #[tokio::test]
    async fn query_param_resolves_session() {
        let (app, _) = test_app();
        let (id, _) = whoami(&app, request(axum::http::Request::builder().uri("/whoami"))).await;
        let (again, _) = whoami(
            &app,
            request(axum::http::Request::builder().uri(format!("/whoami?session={id}"))),
        )
        .await;
        assert_eq!(again, id);
    }
}
