use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_util::io::ReaderStream;

use super::error::ApiError;
use super::resolve::CurrentSession;
use super::AppState;
use crate::artifacts::ArtifactFile;
use crate::job::JobEvent;
use crate::session::{ConfigUpdate, JobConfig};
use crate::stream::EventStream;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionInfo {
    session_id: String,
    running: bool,
}

pub(super) async fn session_info(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Json<SessionInfo> {
    Json(SessionInfo {
        session_id: session.id().to_string(),
        running: session.is_running(),
    })
}

pub(super) async fn config_get(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Json<JobConfig> {
    Json(session.config())
}

#[derive(Serialize)]
pub(super) struct ConfigSaved {
    success: bool,
    message: &'static str,
    config: JobConfig,
}

pub(super) async fn config_set(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Result<Json<ConfigSaved>, ApiError> {
    let Json(update) = payload?;
    let config = session.update_config(update);
    tracing::debug!(session = %session.id(), "config updated");
    Ok(Json(ConfigSaved {
        success: true,
        message: "Config updated!",
        config,
    }))
}

#[derive(Serialize, Deserialize)]
pub(super) struct StudentsBody {
    students: String,
}

pub(super) async fn students_get(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Json<StudentsBody> {
    Json(StudentsBody {
        students: session.targets(),
    })
}

#[derive(Deserialize)]
pub(super) struct StudentsUpdate {
    #[serde(default)]
    students: Option<String>,
}

#[derive(Serialize)]
pub(super) struct StudentsSaved {
    success: bool,
    message: String,
    count: usize,
}

pub(super) async fn students_set(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    payload: Result<Json<StudentsUpdate>, JsonRejection>,
) -> Result<Json<StudentsSaved>, ApiError> {
    let Json(update) = payload?;
    let count = session.set_targets(update.students.unwrap_or_default());
    tracing::debug!(session = %session.id(), count, "target list replaced");
    Ok(Json(StudentsSaved {
        success: true,
        message: format!("Saved {} students", count),
        count,
    }))
}

/// Start a job and stream its events.
///
/// Rejections (already running, incomplete config, empty list) arrive on
/// the stream as `error` then `done`, never as an HTTP error status.
pub(super) async fn run(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let handle = state.runner.start(&session);
    let events = EventStream::new(session.id(), handle).map(|event| Ok(sse_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn sse_event(event: &JobEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

#[derive(Serialize)]
pub(super) struct FileList {
    files: Vec<ArtifactFile>,
}

pub(super) async fn files_list(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Result<Json<FileList>, ApiError> {
    let files = state.artifacts.list(session.id()).await?;
    Ok(Json(FileList { files }))
}

#[derive(Serialize)]
pub(super) struct Deleted {
    success: bool,
}

pub(super) async fn files_delete(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    Path(name): Path<String>,
) -> Result<Json<Deleted>, ApiError> {
    state.artifacts.delete(session.id(), &name).await?;
    Ok(Json(Deleted { success: true }))
}

pub(super) async fn download(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.artifacts.resolve(session.id(), &name).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ApiError::FileNotFound(name.clone()),
        _ => ApiError::from(crate::artifacts::ArtifactError::Io(e)),
    })?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::from(crate::artifacts::ArtifactError::Io(e)))?
        .len();
    tracing::debug!(session = %session.id(), file = %name, size, "serving artifact");

    let mime = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&name)),
        ],
        body,
    )
        .into_response())
}

/// `attachment` disposition with an ASCII fallback and the UTF-8 name.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}
