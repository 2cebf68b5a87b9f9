use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 外部列表中未单独配置的流使用的档位
pub const FALLBACK_PROFILE: &str = "audio_only";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub poll: PollConfig,

    /// 每个会话允许的最大重试序号
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// 不参与轮询的流
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// 档位 ID -> 档位定义
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,

    /// 外部流列表目录 (每个文件是一个 JSON 字符串数组)
    #[serde(default)]
    pub ext_streamlist_dir: Option<PathBuf>,

    /// 流 ID -> 传给采集程序的附加参数
    #[serde(default)]
    pub extra_args: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// 外部采集程序路径
    pub capture_binary: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// 录制中的文件
    pub download_dir: PathBuf,
    /// 会话结束后文件移动到这里
    pub completed_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_state_timeout")]
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub interval_sec: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    /// 传给采集程序的画质选择串
    pub format: String,
    #[serde(default)]
    pub streams: Vec<String>,
}

/// 单个流的不可变配置，每次重新加载配置时整体重建
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_id: String,
    pub profile_id: String,
    pub profile_spec: String,
    pub max_retries: u32,
}

fn default_retry_count() -> u32 {
    50
}

fn default_state_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    240
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn is_blocked(&self, stream_id: &str) -> bool {
        self.blocklist.iter().any(|s| s.eq_ignore_ascii_case(stream_id))
    }

    pub fn extra_args_for(&self, stream_id: &str) -> Option<&str> {
        self.extra_args
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(stream_id))
            .map(|(_, v)| v.as_str())
    }
}

/// 由配置和外部流列表推导出的流注册表
#[derive(Debug, Default, Clone)]
pub struct StreamRegistry {
    /// 小写流 ID -> 配置
    streams: BTreeMap<String, StreamConfig>,
    /// 外部列表中出现过的流 (保持文件中的顺序)
    ext_streamlist: Vec<String>,
}

impl StreamRegistry {
    pub fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let mut registry = StreamRegistry::default();

        for (profile_id, profile) in &config.profiles {
            for stream_id in &profile.streams {
                registry.insert(StreamConfig {
                    stream_id: stream_id.clone(),
                    profile_id: profile_id.clone(),
                    profile_spec: profile.format.clone(),
                    max_retries: config.retry_count,
                });
            }
        }

        if let Some(dir) = &config.ext_streamlist_dir {
            registry.load_ext_streamlist(dir, config.retry_count)?;
        }

        info!(
            "Stream registry built: {} streams ({} from external list)",
            registry.stream_count(),
            registry.ext_streamlist.len()
        );
        Ok(registry)
    }

    fn load_ext_streamlist(&mut self, dir: &Path, max_retries: u32) -> anyhow::Result<()> {
        let mut files = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read ext streamlist dir {}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        files.sort();

        let mut seen: HashSet<String> = HashSet::new();
        for path in files {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let ids: Vec<String> = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            for raw in ids {
                let stream_id = raw.replace('#', "");
                if stream_id.trim().is_empty() || !seen.insert(stream_id.clone()) {
                    continue;
                }
                self.ext_streamlist.push(stream_id.clone());

                if self.get(&stream_id).is_none() {
                    self.insert(StreamConfig {
                        stream_id,
                        profile_id: FALLBACK_PROFILE.to_string(),
                        profile_spec: FALLBACK_PROFILE.to_string(),
                        max_retries,
                    });
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, cfg: StreamConfig) {
        debug!("Registry: added stream {:?}", cfg);
        self.streams.insert(cfg.stream_id.to_lowercase(), cfg);
    }

    /// 不区分大小写查找
    pub fn get(&self, stream_id: &str) -> Option<&StreamConfig> {
        self.streams.get(&stream_id.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.values()
    }

    pub fn ext_streamlist(&self) -> &[String] {
        &self.ext_streamlist
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
