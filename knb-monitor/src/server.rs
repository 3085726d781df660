//! HTTP surface of the collection agent.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::protocol::{ErrorBody, ErrorCode, StartCollection, COLLECTIONS_PATH, HEALTH_PATH, SYSINFO_PATH};
use crate::recorder::Recorder;
use crate::store::{ClaimError, CollectionStore};

#[derive(Clone)]
pub struct AgentState {
    store: Arc<CollectionStore>,
    recorder: Arc<dyn Recorder>,
}

impl AgentState {
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            store: Arc::new(CollectionStore::new()),
            recorder,
        }
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }
}

/// A protocol error as sent over the wire.
#[derive(Debug)]
pub struct AgentError {
    status: StatusCode,
    body: ErrorBody,
}

impl AgentError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl From<ClaimError> for AgentError {
    fn from(err: ClaimError) -> Self {
        let (status, code) = match &err {
            ClaimError::StillInProgress(_) => (StatusCode::CONFLICT, ErrorCode::StillInProgress),
            ClaimError::Failed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::CollectionFailed),
            ClaimError::UnknownId(_) => (StatusCode::NOT_FOUND, ErrorCode::UnknownId),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .route(COLLECTIONS_PATH, post(start_collection))
        .route("/collections/{id}/results", get(collection_results))
        .route(SYSINFO_PATH, get(system_info))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AgentState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

/// Serves on an already bound listener until the task is dropped.
pub async fn serve_on(listener: TcpListener, state: AgentState) -> anyhow::Result<()> {
    info!("collection agent listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn start_collection(
    State(state): State<AgentState>,
    Json(req): Json<StartCollection>,
) -> Result<StatusCode, AgentError> {
    let id = req.collection_id;
    if !state.store.try_begin(&id) {
        return Err(AgentError::new(
            StatusCode::CONFLICT,
            ErrorCode::AlreadyInProgress,
            format!("collection {id} already exists"),
        ));
    }

    info!("starting collection {} ({}s)", id, req.duration_secs);
    let duration = Duration::from_secs(req.duration_secs);
    tokio::spawn(async move {
        let result = state
            .recorder
            .record(&id, duration)
            .await
            .map_err(|e| format!("{e:#}"));
        if let Err(e) = &result {
            warn!("collection {} failed: {}", id, e);
        }
        state.store.complete(&id, result);
    });

    Ok(StatusCode::ACCEPTED)
}

async fn collection_results(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Response, AgentError> {
    state.store.claim(&id)?;

    let failed = |e: anyhow::Error| {
        AgentError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::CollectionFailed,
            format!("packaging collection {id} failed: {e:#}"),
        )
    };
    let archive = state.recorder.package(&id).await.map_err(failed)?;
    let file = tokio::fs::File::open(&archive)
        .await
        .map_err(|e| failed(anyhow::Error::new(e).context(archive.display().to_string())))?;

    info!("streaming {} for collection {}", archive.display(), id);
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

async fn system_info(State(state): State<AgentState>) -> Result<Vec<u8>, AgentError> {
    state
        .recorder
        .system_info()
        .await
        .map_err(|e| AgentError::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::path::PathBuf;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct GatedRecorder {
        release: Notify,
        fail: bool,
        dir: tempfile::TempDir,
    }

    #[async_trait]
    impl Recorder for GatedRecorder {
        async fn record(&self, _id: &str, _duration: Duration) -> anyhow::Result<()> {
            self.release.notified().await;
            if self.fail {
                Err(anyhow!("perf exited with 1"))
            } else {
                Ok(())
            }
        }

        async fn package(&self, id: &str) -> anyhow::Result<PathBuf> {
            let path = self.dir.path().join(format!("{id}-perf.data.tar.bz2"));
            tokio::fs::write(&path, format!("archive of {id}")).await?;
            Ok(path)
        }

        async fn system_info(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"hostname: k8s1\n".to_vec())
        }
    }

    fn agent(fail: bool) -> (AgentState, Arc<GatedRecorder>) {
        let recorder = Arc::new(GatedRecorder {
            release: Notify::new(),
            fail,
            dir: tempfile::tempdir().unwrap(),
        });
        (AgentState::new(recorder.clone()), recorder)
    }

    fn start(id: &str) -> Request<Body> {
        let body = serde_json::to_vec(&StartCollection {
            collection_id: id.into(),
            duration_secs: 1,
        })
        .unwrap();
        Request::post(COLLECTIONS_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn results(id: &str) -> Request<Body> {
        Request::get(crate::protocol::results_path(id)).body(Body::empty()).unwrap()
    }

    async fn error_code(resp: Response) -> ErrorCode {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<ErrorBody>(&bytes).unwrap().code
    }

    async fn wait_finished(state: &AgentState, id: &str) {
        while state.store().state(id) == Some(crate::store::CollectionState::Running) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let (state, _recorder) = agent(false);
        let app = router(state.clone());

        let first = app.clone().oneshot(start("r1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app.oneshot(start("r1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(second).await, ErrorCode::AlreadyInProgress);
        assert_eq!(state.store().len(), 1);
    }

    #[tokio::test]
    async fn results_follow_the_collection() {
        let (state, recorder) = agent(false);
        let app = router(state.clone());

        let resp = app.clone().oneshot(results("r1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(resp).await, ErrorCode::UnknownId);

        app.clone().oneshot(start("r1")).await.unwrap();
        let resp = app.clone().oneshot(results("r1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(resp).await, ErrorCode::StillInProgress);

        recorder.release.notify_one();
        wait_finished(&state, "r1").await;

        let resp = app.clone().oneshot(results("r1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"archive of r1");

        // the record is gone after the first successful fetch
        let resp = app.oneshot(results("r1")).await.unwrap();
        assert_eq!(error_code(resp).await, ErrorCode::UnknownId);
    }

    #[tokio::test]
    async fn failed_recording_is_reported() {
        let (state, recorder) = agent(true);
        let app = router(state.clone());

        app.clone().oneshot(start("r2")).await.unwrap();
        recorder.release.notify_one();
        wait_finished(&state, "r2").await;

        let resp = app.oneshot(results("r2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(resp).await, ErrorCode::CollectionFailed);
    }

    #[tokio::test]
    async fn sysinfo_and_health() {
        let (state, _recorder) = agent(false);
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(Request::get(SYSINFO_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hostname: k8s1\n");

        let resp = app
            .oneshot(Request::get(HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
