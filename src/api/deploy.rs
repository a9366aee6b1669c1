//! The deploy endpoint: content-type dispatch, credential extraction and
//! the streamed response.
//!
//! A failure before the pipeline produces any output is answered with its
//! real status code and a plain body. Once progress lines start flowing the
//! response is a chunked 200 stream mirroring the pipeline's sink, with the
//! outcome appended as the final line.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::{
    drain_to_string, DeployContentType, DeployError, DeployParams, ProgressSink,
};
use crate::AppState;

const JSON_CONTENT_TYPE: &str = "application/json";
const ZIP_CONTENT_TYPE: &str = "application/zip";

const SUCCESSFUL_DEPLOY: &str = "deploy successful";
const CANNOT_DEPLOY_APPLICATION: &str = "cannot deploy application";
const REQUEST_BODY_EMPTY: &str = "request body is empty";
const CANNOT_PROCESS_ZIP_FILE: &str = "cannot process zip file";
const CONTENT_TYPE_NOT_SUPPORTED: &str = "content type not supported";

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Path((environment, org, space, app_name)): Path<(String, String, String, String)>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(
        origin = %remote_addr,
        environment = %environment,
        org = %org,
        space = %space,
        app = %app_name,
        "deploy requested"
    );

    let basic_auth = parse_basic_auth(&headers);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    match content_type {
        JSON_CONTENT_TYPE => {
            let params = DeployParams {
                environment,
                org,
                space,
                app_name,
                content_type: DeployContentType::Json,
                body,
                app_path: None,
                basic_auth,
            };
            run_deploy(state, params, None).await
        }
        ZIP_CONTENT_TYPE => {
            if body.is_empty() {
                return plain_error(
                    StatusCode::BAD_REQUEST,
                    REQUEST_BODY_EMPTY,
                    "request body required",
                );
            }
            let app_dir = match state.fetcher.fetch_from_zip(&body).await {
                Ok(dir) => dir,
                Err(err) => {
                    return plain_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        CANNOT_PROCESS_ZIP_FILE,
                        &format!("{err:#}"),
                    );
                }
            };
            let params = DeployParams {
                environment,
                org,
                space,
                app_name,
                content_type: DeployContentType::Zip,
                body: Bytes::new(),
                app_path: Some(app_dir.path().to_path_buf()),
                basic_auth,
            };
            run_deploy(state, params, Some(app_dir)).await
        }
        _ => plain_error(
            StatusCode::BAD_REQUEST,
            CONTENT_TYPE_NOT_SUPPORTED,
            "must be application/json or application/zip",
        ),
    }
}

async fn run_deploy(
    state: Arc<AppState>,
    params: DeployParams,
    app_dir: Option<TempDir>,
) -> Response {
    let (sink, mut rx) = ProgressSink::channel();
    let deployer = state.deployer.clone();
    let mut task = tokio::spawn(async move {
        // the extracted upload must outlive the whole deploy
        let _app_dir = app_dir;
        deployer.deploy(params, &sink).await
    });

    tokio::select! {
        biased;
        result = &mut task => buffered_response(result, String::new(), &mut rx),
        chunk = rx.recv() => match chunk {
            Some(first) => {
                // Give a fast-failing pipeline one scheduling turn to
                // finish, so its status code still reaches the client
                // instead of an empty 200 stream.
                tokio::task::yield_now().await;
                if task.is_finished() {
                    let result = (&mut task).await;
                    let prefix = String::from_utf8_lossy(&first).into_owned();
                    buffered_response(result, prefix, &mut rx)
                } else {
                    streaming_response(first, rx, task)
                }
            }
            None => {
                let result = (&mut task).await;
                buffered_response(result, String::new(), &mut rx)
            }
        },
    }
}

type DeployTask = JoinHandle<Result<(), DeployError>>;

/// The pipeline finished before streaming began: answer with its real
/// status code and the full buffered body.
fn buffered_response(
    result: Result<Result<(), DeployError>, tokio::task::JoinError>,
    prefix: String,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Response {
    let mut body = prefix;
    body.push_str(&drain_to_string(rx));
    match result {
        Ok(Ok(())) => {
            body.push_str(SUCCESSFUL_DEPLOY);
            body.push('\n');
            (StatusCode::OK, body).into_response()
        }
        Ok(Err(err)) => {
            error!("{CANNOT_DEPLOY_APPLICATION}: {err}");
            body.push_str(&format!("{CANNOT_DEPLOY_APPLICATION} - {err}\n"));
            (err.status(), body).into_response()
        }
        Err(join_err) => {
            error!("{CANNOT_DEPLOY_APPLICATION}: {join_err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{CANNOT_DEPLOY_APPLICATION} - {join_err}\n"),
            )
                .into_response()
        }
    }
}

/// Output is already flowing: stream it live and append the outcome line
/// once the pipeline returns.
fn streaming_response(
    first: Bytes,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    task: DeployTask,
) -> Response {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        let _ = out_tx.send(first);
        while let Some(chunk) = rx.recv().await {
            if out_tx.send(chunk).is_err() {
                // client went away; let the deploy run to completion anyway
                break;
            }
        }
        match task.await {
            Ok(Ok(())) => {
                let _ = out_tx.send(Bytes::from(format!("{SUCCESSFUL_DEPLOY}\n")));
            }
            Ok(Err(err)) => {
                error!("{CANNOT_DEPLOY_APPLICATION}: {err}");
                let _ = out_tx.send(Bytes::from(format!(
                    "{CANNOT_DEPLOY_APPLICATION} - {err}\n"
                )));
            }
            Err(join_err) => {
                error!("{CANNOT_DEPLOY_APPLICATION}: {join_err}");
                let _ = out_tx.send(Bytes::from(format!(
                    "{CANNOT_DEPLOY_APPLICATION} - {join_err}\n"
                )));
            }
        }
    });

    let stream = futures::stream::unfold(out_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<Bytes, std::convert::Infallible>(chunk), rx))
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn plain_error(status: StatusCode, message: &str, detail: &str) -> Response {
    error!("{message}: {detail}");
    (status, format!("{message} - {detail}\n")).into_response()
}

fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
