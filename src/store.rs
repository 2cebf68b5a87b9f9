//! 状态存储
//!
//! 本地文件是持久化的唯一可信来源；可选的远端 HTTP 地址只是尽力而为的镜像，
//! 但加载时优先读取远端。

use crate::config::StateConfig;
use crate::state::StateTable;
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

pub struct StateStore {
    path: PathBuf,
    url: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, url: Option<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            url,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(cfg: &StateConfig) -> Self {
        Self::new(
            cfg.path.clone(),
            cfg.url.clone(),
            Duration::from_secs(cfg.timeout_sec),
        )
    }

    /// 序列化整个状态表并覆盖本地文件，然后尽力同步到远端
    ///
    /// # 错误处理
    /// - 本地写入失败直接返回错误
    /// - 远端失败只记录日志
    pub async fn write(&self, table: &StateTable) -> anyhow::Result<()> {
        let body = serde_json::to_string(table)?;
        fs::write(&self.path, &body)
            .await
            .with_context(|| format!("failed to write state file {}", self.path.display()))?;

        if let Some(url) = &self.url {
            if let Err(e) = self.put_remote(url, body).await {
                error!("State write failed over HTTP ({}): {:#}", url, e);
            }
        }
        Ok(())
    }

    async fn put_remote(&self, url: &str, body: String) -> anyhow::Result<()> {
        self.client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_remote(&self, url: &str) -> anyhow::Result<StateTable> {
        let table = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<StateTable>()
            .await?;
        Ok(table)
    }

    /// 加载状态表
    ///
    /// 优先读取远端，失败后回退到本地文件。本地文件不存在或内容损坏时返回空表，
    /// 调用方对 "没有旧状态" 和 "旧状态损坏" 一视同仁。
    pub async fn load(&self) -> anyhow::Result<StateTable> {
        if let Some(url) = &self.url {
            match self.get_remote(url).await {
                Ok(table) => return Ok(table),
                Err(e) => error!("State load failed over HTTP ({}): {:#}", url, e),
            }
        }

        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateTable::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read state file {}", self.path.display()))
            }
        };

        match serde_json::from_str(&content) {
            Ok(table) => Ok(table),
            Err(e) => {
                warn!(
                    "State file {} is malformed, reinitializing: {}",
                    self.path.display(),
                    e
                );
                Ok(StateTable::new())
            }
        }
    }
}
