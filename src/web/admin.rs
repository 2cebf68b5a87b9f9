use crate::engine::Engine;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, error, info};

/// 缩进 JSON 加换行，便于命令行直接查看
fn pretty<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_string_pretty(body) {
        Ok(text) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            format!("{}\n", text),
        )
            .into_response(),
        Err(e) => error_response(e.into()),
    }
}

fn error_response(e: anyhow::Error) -> Response {
    error!("Request failed: {:?}", e);
    let body = serde_json::json!({ "error": format!("{:#}", e) });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        format!("{}\n", body),
    )
        .into_response()
}

/// 上线通知 API
/// 为已配置的流调度一次确定的 (非轮询) 尝试，未配置的流被忽略
pub async fn online_handler(
    State(state): State<SharedState>,
    Path(stream): Path<String>,
) -> Response {
    debug!("Online notification for [{}]", stream);
    Engine::trigger(&state, &stream, false);
    pretty(StatusCode::OK, &serde_json::json!({}))
}

/// 当前会话状态表快照
pub async fn state_handler(State(state): State<SharedState>) -> Response {
    info!("State requested");
    pretty(StatusCode::OK, &state.snapshot())
}

/// 外部流列表
pub async fn ext_streamlist_handler(State(state): State<SharedState>) -> Response {
    let registry = state.registry();
    pretty(StatusCode::OK, &registry.ext_streamlist())
}

/// 重新加载配置文件
/// 失败时返回 500，当前配置保持不变
pub async fn reload_handler(State(state): State<SharedState>) -> Response {
    let st = state.clone();
    let result = tokio::task::spawn_blocking(move || st.reload_configuration()).await;

    match result {
        Ok(Ok(())) => pretty(StatusCode::OK, &serde_json::json!({})),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StreamRegistry};
    use crate::state::{AppState, StreamState};
    use crate::store::StateStore;
    use axum::body::to_bytes;

    const CONFIG: &str = r#"
server:
  listen: "127.0.0.1:0"
  capture_binary: /bin/true
paths:
  download_dir: /tmp
  completed_dir: /tmp
  log_dir: /tmp
state:
  path: /tmp/unused-state.json
profiles:
  best:
    format: best
    streams: [Foo]
"#;

    fn test_state(config_path: &std::path::Path) -> SharedState {
        std::fs::write(config_path, CONFIG).unwrap();
        let config = AppConfig::load(config_path).unwrap();
        let registry = StreamRegistry::build(&config).unwrap();
        let store = StateStore::from_config(&config.state);
        AppState::new(config_path, config, registry, store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.ends_with(b"\n"));
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn online_for_unknown_stream_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir.path().join("config.yaml"));

        let resp = online_handler(State(state.clone()), Path("nobody".into())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({}));
        assert_eq!(state.tasks.pending(), 0);
    }

    #[tokio::test]
    async fn state_reports_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir.path().join("config.yaml"));
        let cfg = state.stream_config("FOO").unwrap();
        state.streams.lock().unwrap().insert(
            "foo".into(),
            StreamState::new(cfg, std::path::Path::new("/tmp"), true),
        );

        let resp = state_handler(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["foo"]["retry_index"], 0);
        assert_eq!(body["foo"]["poll_attempt"], true);
        assert_eq!(body["foo"]["config"]["stream_id"], "Foo");
    }

    #[tokio::test]
    async fn reload_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let state = test_state(&path);

        let resp = reload_handler(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        std::fs::write(&path, "paths: {").unwrap();
        let resp = reload_handler(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].is_string());
        assert!(state.stream_config("foo").is_some());
    }

    #[tokio::test]
    async fn ext_streamlist_defaults_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir.path().join("config.yaml"));
        let resp = ext_streamlist_handler(State(state)).await;
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }
}
