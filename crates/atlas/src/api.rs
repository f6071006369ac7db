//! HTTP surface for documents, search and backups. Handlers are thin:
//! every call lands on a blocking thread and goes straight into `atlas_core`.

use atlas_core::backup::{BackupInfo, BackupListing};
use atlas_core::content_sync::SyncReport;
use atlas_core::document::DocStatus;
use atlas_core::documents::{CurrentUser, LoadedDocument, SavedDocument};
use atlas_core::error::{BackupError, DocumentError, RestoreError, StoreError};
use atlas_core::paths::ContentClass;
use atlas_core::restore::RestoreState;
use atlas_core::search_index::SearchResult;
use atlas_core::store::NavNode;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::server::AppState;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Header naming the acting user; an upstream proxy is expected to set it.
pub const USER_HEADER: &str = "x-atlas-user";
const DEFAULT_USER: &str = "owner";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sync", post(sync))
        .route(
            "/api/docs/:class/*slug",
            get(read_document).put(save_document).delete(delete_document),
        )
        .route("/api/backup", post(create_backup))
        .route("/api/backups", get(list_backups))
        .route(
            "/api/backup/upload",
            post(upload_backup).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/backup/restore", post(restore))
        .route("/api/nav", get(nav))
        .route("/api/search", get(search))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl ToString) -> Self {
        Self {
            status,
            code,
            message: message.to_string(),
        }
    }

    fn internal(message: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} ({})", self.message, self.code);
        }
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IndexUnavailable(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "index_unavailable", err)
            }
            StoreError::Busy => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "busy", err),
            other => Self::internal(other),
        }
    }
}

impl From<DocumentError> for ApiError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::Slug(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_slug", err),
            DocumentError::Metadata(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_front_matter", err)
            }
            DocumentError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", err),
            DocumentError::SlugTaken(_) => Self::new(StatusCode::CONFLICT, "slug_taken", err),
            DocumentError::Store(inner) => inner.into(),
            DocumentError::Io(_) => Self::internal(err),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::InvalidFileName(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_file_name", err)
            }
            other => Self::internal(other),
        }
    }
}

impl From<RestoreError> for ApiError {
    fn from(err: RestoreError) -> Self {
        match err {
            RestoreError::Conflict => Self::new(StatusCode::CONFLICT, "restore_pending", err),
            RestoreError::Verification(_) => {
                Self::new(StatusCode::BAD_REQUEST, "verification_failed", err)
            }
            RestoreError::Incompatible => {
                Self::new(StatusCode::BAD_REQUEST, "incompatible_backup", err)
            }
            RestoreError::Backup(inner) => inner.into(),
            other => Self::internal(other),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
}

fn parse_class(raw: &str) -> Result<ContentClass, ApiError> {
    ContentClass::from_dir_name(raw).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "unknown_class",
            format!("Unknown content class {raw:?}"),
        )
    })
}

fn current_user(headers: &HeaderMap) -> CurrentUser {
    let name = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_USER);
    CurrentUser::new(name)
}

fn parse_statuses(raw: Option<&str>) -> Vec<DocStatus> {
    let mut statuses: Vec<DocStatus> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(DocStatus::from_column)
        .collect();
    statuses.dedup();
    if statuses.is_empty() {
        statuses.push(DocStatus::Published);
    }
    statuses
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let restore = match state.coordinator.state() {
        RestoreState::Idle => "idle",
        RestoreState::Staged(_) => "staged",
        RestoreState::Promoting(_) => "promoting",
    };
    Json(json!({ "status": "ok", "restore": restore }))
}

async fn sync(State(state): State<Arc<AppState>>) -> Result<Json<SyncReport>, ApiError> {
    let report = blocking(move || Ok(state.synchronizer.sync_all()?)).await?;
    Ok(Json(report))
}

async fn read_document(
    State(state): State<Arc<AppState>>,
    Path((class, slug)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<LoadedDocument>, ApiError> {
    let class = parse_class(&class)?;
    let user = current_user(&headers);
    let loaded = blocking(move || Ok(state.documents.read(class, &user, &slug)?)).await?;
    Ok(Json(loaded))
}

#[derive(Deserialize)]
struct SaveRequest {
    content: String,
    hub: Option<bool>,
}

async fn save_document(
    State(state): State<Arc<AppState>>,
    Path((class, slug)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<SaveRequest>,
) -> Result<(StatusCode, Json<SavedDocument>), ApiError> {
    let class = parse_class(&class)?;
    let user = current_user(&headers);
    let saved = blocking(move || {
        Ok(state
            .documents
            .save(class, &user, &slug, &request.content, request.hub)?)
    })
    .await?;
    let status = if saved.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(saved)))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path((class, slug)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let class = parse_class(&class)?;
    let user = current_user(&headers);
    blocking(move || Ok(state.documents.delete(class, &user, &slug)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<BackupInfo>), ApiError> {
    let info = blocking(move || {
        state.store.checkpoint()?;
        Ok(state.engine.create_backup()?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupListing>>, ApiError> {
    let listings = blocking(move || Ok(state.engine.list_backups()?)).await?;
    Ok(Json(listings))
}

#[derive(Deserialize)]
struct UploadQuery {
    name: Option<String>,
    signature: Option<String>,
}

/// Store an uploaded archive. It is reported as verified only when the
/// supplied signature matches this installation's secret.
async fn upload_backup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "empty_upload",
            "Upload body is empty",
        ));
    }
    let (name, verified) = blocking(move || {
        let name = query.name.unwrap_or_default();
        let path = state
            .engine
            .save_uploaded_backup(&name, body.as_ref(), query.signature.as_deref())?;
        let verified = state.engine.verify_backup(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((name, verified))
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": name, "verified": verified })),
    ))
}

#[derive(Deserialize)]
struct RestoreRequest {
    file: String,
}

/// Stage a backup for promotion. The server shuts down once this returns.
async fn restore(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let file = request.file.clone();
    blocking(move || Ok(state.coordinator.request_restore(&state.engine, &request.file)?)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "staged", "file": file })),
    ))
}

#[derive(Deserialize)]
struct NavQuery {
    status: Option<String>,
}

async fn nav(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NavQuery>,
) -> Result<Json<Vec<NavNode>>, ApiError> {
    let statuses = parse_statuses(query.status.as_deref());
    let tree = blocking(move || Ok(state.store.nav_tree(&statuses)?)).await?;
    Ok(Json(tree))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    status: Option<String>,
    limit: Option<usize>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchResult>>, ApiError> {
    let statuses = parse_statuses(query.status.as_deref());
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let results = blocking(move || Ok(state.store.search(&query.q, &statuses, limit)?)).await?;
    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn state(tmp: &std::path::Path) -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.content_dir = tmp.join("content");
        config.storage.data_dir = tmp.join("data");
        Arc::new(AppState::open(&config).unwrap())
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (RestoreError::Conflict.into(), StatusCode::CONFLICT),
            (
                RestoreError::Verification("b.zip".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                StoreError::IndexUnavailable(Duration::from_secs(3)).into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (StoreError::Closed.into(), StatusCode::INTERNAL_SERVER_ERROR),
            (
                RestoreError::Backup(BackupError::InvalidFileName("../x".into())).into(),
                StatusCode::BAD_REQUEST,
            ),
            (DocumentError::NotFound("a".into()).into(), StatusCode::NOT_FOUND),
            (DocumentError::SlugTaken("a".into()).into(), StatusCode::CONFLICT),
            (
                DocumentError::Metadata("bad".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn statuses_default_to_published() {
        assert_eq!(parse_statuses(None), vec![DocStatus::Published]);
        assert_eq!(parse_statuses(Some(" ")), vec![DocStatus::Published]);
        assert_eq!(
            parse_statuses(Some("published,unlisted")),
            vec![DocStatus::Published, DocStatus::Unlisted]
        );
    }

    #[tokio::test]
    async fn sync_then_search_and_nav() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        std::fs::write(
            state.paths.published_root.join("guide.md"),
            "# Guide\nInstall the widget.",
        )
        .unwrap();

        let Json(report) = sync(State(state.clone())).await.unwrap();
        assert_eq!(report.scanned, 1);

        let Json(results) = search(
            State(state.clone()),
            Query(SearchQuery {
                q: "widget".into(),
                status: None,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].slug, "guide");

        let Json(tree) = nav(State(state.clone()), Query(NavQuery { status: None }))
            .await
            .unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].title, "Guide");
    }

    fn as_user(name: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, name.parse().unwrap());
        headers
    }

    fn doc_path(class: &str, slug: &str) -> Path<(String, String)> {
        Path((class.to_string(), slug.to_string()))
    }

    #[test]
    fn user_header_defaults_to_owner() {
        assert_eq!(current_user(&HeaderMap::new()).username, "owner");
        assert_eq!(current_user(&as_user("  ")).username, "owner");
        assert_eq!(current_user(&as_user("alice")).username, "alice");
        assert!(parse_class("published").is_ok());
        assert_eq!(parse_class("trash").unwrap_err().status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn documents_can_be_saved_read_and_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());

        let save = |content: &str| {
            Json(SaveRequest {
                content: content.to_string(),
                hub: None,
            })
        };
        let (status, Json(saved)) = save_document(
            State(state.clone()),
            doc_path("drafts", "notes/idea"),
            as_user("alice"),
            save("# Idea\nsprocket"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(saved.index_slug, "alice/notes/idea");

        let (status, _) = save_document(
            State(state.clone()),
            doc_path("drafts", "notes/idea"),
            as_user("alice"),
            save("# Idea\nsprocket v2"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);

        let Json(loaded) = read_document(
            State(state.clone()),
            doc_path("drafts", "notes/idea"),
            as_user("alice"),
        )
        .await
        .unwrap();
        assert_eq!(loaded.body, "# Idea\nsprocket v2");
        assert_eq!(loaded.meta.owner.as_deref(), Some("alice"));

        let missing = read_document(
            State(state.clone()),
            doc_path("drafts", "notes/idea"),
            as_user("bob"),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let status = delete_document(
            State(state.clone()),
            doc_path("drafts", "notes/idea"),
            as_user("alice"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.store.document_by_slug("alice/notes/idea").unwrap().is_none());
    }

    #[tokio::test]
    async fn reserved_slugs_are_rejected_over_http() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        let err = save_document(
            State(state),
            doc_path("published", "settings/x"),
            HeaderMap::new(),
            Json(SaveRequest {
                content: "x".into(),
                hub: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn uploaded_backup_is_stored_and_verified() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        std::fs::write(state.paths.published_root.join("a.md"), "# A").unwrap();
        let info = state.engine.create_backup().unwrap();
        let bytes = std::fs::read(&info.path).unwrap();

        let (status, Json(signed)) = upload_backup(
            State(state.clone()),
            Query(UploadQuery {
                name: Some("copy.zip".into()),
                signature: Some(info.signature.clone()),
            }),
            Bytes::from(bytes.clone()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(signed["name"], "copy.zip");
        assert_eq!(signed["verified"], true);

        let (_, Json(unsigned)) = upload_backup(
            State(state.clone()),
            Query(UploadQuery {
                name: Some("copy.zip".into()),
                signature: None,
            }),
            Bytes::from(bytes),
        )
        .await
        .unwrap();
        assert_eq!(unsigned["name"], "copy_1.zip");
        assert_eq!(unsigned["verified"], false);

        let err = upload_backup(
            State(state),
            Query(UploadQuery {
                name: None,
                signature: None,
            }),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_restore_request_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        std::fs::write(state.paths.published_root.join("a.md"), "# A").unwrap();
        let (status, Json(info)) = create_backup(State(state.clone())).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let request = || {
            Json(RestoreRequest {
                file: info.name.clone(),
            })
        };
        let (status, _) = restore(State(state.clone()), request()).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let err = restore(State(state.clone()), request()).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let Json(health) = health(State(state)).await;
        assert_eq!(health["restore"], "staged");
    }
}
