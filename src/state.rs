use crate::config::{AppConfig, StreamConfig, StreamRegistry};
use crate::store::StateStore;
use crate::tasks::TaskRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

/// 单个流当前会话的持久化状态
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamState {
    /// 采集子进程 PID，仅在子进程被认为存活期间存在
    pub process_id: Option<i32>,
    /// 当前重试序号，从 0 开始
    pub retry_index: u32,
    /// 会话开始时使用的配置快照
    pub config: StreamConfig,
    pub session_id: String,
    pub log_path: PathBuf,
    /// 会话是否由轮询触发 (而非确定的上线信号)
    pub poll_attempt: bool,
    /// 是否由持久化状态恢复而来
    pub resumed: bool,
}

impl StreamState {
    pub fn new(config: StreamConfig, log_dir: &Path, poll_attempt: bool) -> Self {
        let session_id = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
        let log_path = log_dir.join(format!(
            "{}_{}_{}",
            config.stream_id, config.profile_id, session_id
        ));

        Self {
            process_id: None,
            retry_index: 0,
            config,
            session_id,
            log_path,
            poll_attempt,
            resumed: false,
        }
    }

    /// 第 `retry_index` 次尝试的输出文件，每次重试写不同的文件
    pub fn output_path(&self, dir: &Path, retry_index: u32) -> PathBuf {
        dir.join(format!(
            "{}_{}_{}_{}.mkv",
            self.config.stream_id, self.config.profile_id, self.session_id, retry_index
        ))
    }
}

/// 小写流 ID -> 会话状态
pub type StateTable = BTreeMap<String, StreamState>;

/// 每个流的互斥锁，整个尝试期间持有
pub type StreamLock = Arc<tokio::sync::Mutex<()>>;

/// 全局应用上下文
pub struct AppState {
    /// 配置文件路径，重新加载时使用
    pub config_path: PathBuf,
    /// 当前配置，重新加载时整体替换
    pub config: RwLock<Arc<AppConfig>>,
    /// 当前流注册表
    pub registry: RwLock<Arc<StreamRegistry>>,
    /// 会话状态表 (Stream ID -> State)
    pub streams: Mutex<StateTable>,
    /// 流锁表 (Stream ID -> Lock)
    pub locks: Mutex<HashMap<String, StreamLock>>,
    /// 串行化持久化写入
    persist_lock: tokio::sync::Mutex<()>,
    pub store: StateStore,
    pub tasks: TaskRegistry,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config_path: impl Into<PathBuf>,
        config: AppConfig,
        registry: StreamRegistry,
        store: StateStore,
    ) -> SharedState {
        Arc::new(Self {
            config_path: config_path.into(),
            config: RwLock::new(Arc::new(config)),
            registry: RwLock::new(Arc::new(registry)),
            streams: Mutex::new(StateTable::new()),
            locks: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            store,
            tasks: TaskRegistry::new(),
        })
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.read().unwrap().clone()
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.read().unwrap().clone()
    }

    /// 不区分大小写查找流配置
    pub fn stream_config(&self, stream_id: &str) -> Option<StreamConfig> {
        self.registry.read().unwrap().get(stream_id).cloned()
    }

    /// 取得 (必要时创建) 流锁
    pub fn stream_lock(&self, key: &str) -> StreamLock {
        self.locks
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// 状态表快照，用于只读展示
    pub fn snapshot(&self) -> StateTable {
        self.streams.lock().unwrap().clone()
    }

    /// 读取单个流的状态
    pub fn stream_state(&self, key: &str) -> Option<StreamState> {
        self.streams.lock().unwrap().get(key).cloned()
    }

    /// 在锁内修改单个流的状态；条目不存在时返回 None
    pub fn update_stream<R>(&self, key: &str, f: impl FnOnce(&mut StreamState) -> R) -> Option<R> {
        self.streams.lock().unwrap().get_mut(key).map(f)
    }

    /// 将整个状态表写入状态存储
    ///
    /// 快照在持久化锁内获取，保证最后落盘的总是最新的状态
    pub async fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let table = self.snapshot();
        self.store.write(&table).await
    }

    /// 从配置文件重建配置和流注册表
    ///
    /// 加载失败时保留当前配置。
    pub fn reload_configuration(&self) -> anyhow::Result<()> {
        let config = AppConfig::load(&self.config_path)?;
        let registry = StreamRegistry::build(&config)?;
        self.apply_config(config, registry);
        Ok(())
    }

    /// 替换配置和流注册表，并清理不再跟踪的流锁
    pub fn apply_config(&self, config: AppConfig, registry: StreamRegistry) {
        *self.config.write().unwrap() = Arc::new(config);
        *self.registry.write().unwrap() = Arc::new(registry);

        let streams = self.streams.lock().unwrap();
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        // 仅清理既无状态条目、当前也无人持有的锁
        locks.retain(|key, lock| streams.contains_key(key) || Arc::strong_count(lock) > 1);
        info!(
            "Configuration reloaded. Pruned {} stream locks.",
            before - locks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_config() -> StreamConfig {
        StreamConfig {
            stream_id: "Foo".into(),
            profile_id: "best".into(),
            profile_spec: "best".into(),
            max_retries: 2,
        }
    }

    #[test]
    fn paths_are_keyed_by_session_and_retry() {
        let state = StreamState::new(stream_config(), Path::new("/logs"), false);
        assert_eq!(state.retry_index, 0);
        assert!(state.process_id.is_none());
        assert!(!state.resumed);
        assert_eq!(
            state.log_path,
            PathBuf::from(format!("/logs/Foo_best_{}", state.session_id))
        );

        let first = state.output_path(Path::new("/dl"), 0);
        let second = state.output_path(Path::new("/dl"), 1);
        assert_ne!(first, second);
        assert_eq!(
            second,
            PathBuf::from(format!("/dl/Foo_best_{}_1.mkv", state.session_id))
        );
    }

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
"#;

    #[tokio::test]
    async fn reload_rebuilds_registry_and_prunes_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, format!("{CONFIG}profiles:\n  best:\n    format: best\n    streams: [foo]\n")).unwrap();

        let config = AppConfig::load(&path).unwrap();
        let registry = StreamRegistry::build(&config).unwrap();
        let store = StateStore::from_config(&config.state);
        let state = AppState::new(&path, config, registry, store);
        assert!(state.stream_config("foo").is_some());

        // foo 有会话，bar 正被持有，baz 已无人使用
        state.streams.lock().unwrap().insert(
            "foo".into(),
            StreamState::new(stream_config(), Path::new("/logs"), false),
        );
        let bar = state.stream_lock("bar");
        let _held = bar.try_lock().unwrap();
        state.stream_lock("baz");
        state.stream_lock("foo");

        std::fs::write(&path, format!("{CONFIG}profiles:\n  audio:\n    format: audio_only\n    streams: [qux]\n")).unwrap();
        state.reload_configuration().unwrap();

        assert!(state.stream_config("foo").is_none());
        assert_eq!(state.stream_config("QUX").unwrap().profile_id, "audio");
        let locks = state.locks.lock().unwrap();
        assert!(locks.contains_key("foo"));
        assert!(locks.contains_key("bar"));
        assert!(!locks.contains_key("baz"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, format!("{CONFIG}profiles:\n  best:\n    format: best\n    streams: [foo]\n")).unwrap();

        let config = AppConfig::load(&path).unwrap();
        let registry = StreamRegistry::build(&config).unwrap();
        let store = StateStore::from_config(&config.state);
        let state = AppState::new(&path, config, registry, store);

        std::fs::write(&path, "server: [").unwrap();
        assert!(state.reload_configuration().is_err());
        assert!(state.stream_config("foo").is_some());
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let mut state = StreamState::new(stream_config(), Path::new("/logs"), true);
        state.process_id = Some(42);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["process_id"], 42);
        assert_eq!(value["retry_index"], 0);
        assert_eq!(value["poll_attempt"], true);
        assert_eq!(value["config"]["max_retries"], 2);
        assert_eq!(value["config"]["profile_spec"], "best");
    }
}
