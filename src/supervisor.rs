use crate::config::StreamConfig;
use crate::engine::Engine;
use crate::state::SharedState;
use rand::Rng;
use std::time::Duration;
use tracing::{error, info, warn};

/// 为每个已配置且不在黑名单中的流启动一个常驻轮询任务
///
/// # 任务流程：
/// - 先随机等待 [0, interval] 秒，避免所有流同时发起尝试
/// - 之后循环：发起一次轮询尝试，再等待 interval 秒
///
/// 黑名单只在这里检查一次，之后重新加载配置不会影响已启动的任务。
///
/// 单次尝试的错误在轮询任务内部记录并吞掉，不会传到任务注册表；
/// 否则一次失败就会让该流的轮询永久停止。
pub fn spawn_poll_tasks(state: &SharedState, interval_sec: u64) -> usize {
    let config = state.config();
    let registry = state.registry();
    let mut spawned = 0;

    for cfg in registry.iter() {
        if config.is_blocked(&cfg.stream_id) {
            warn!("Poll: stream [{}] in blocklist, skipping", cfg.stream_id);
            continue;
        }

        let st = state.clone();
        let cfg = cfg.clone();
        state.tasks.spawn(
            format!("poll:{}", cfg.stream_id),
            poll_task(st, cfg, interval_sec),
        );
        spawned += 1;
    }

    info!("Spawned {} poll tasks (interval {}s)", spawned, interval_sec);
    spawned
}

async fn poll_task(state: SharedState, cfg: StreamConfig, interval_sec: u64) -> anyhow::Result<()> {
    tokio::time::sleep(jitter(interval_sec)).await;

    loop {
        info!("Poll: trying stream [{}]", cfg.stream_id);
        // 单次尝试失败不终止轮询
        if let Err(e) = Engine::attempt(&state, cfg.clone(), true).await {
            error!("Poll attempt for [{}] failed: {:?}", cfg.stream_id, e);
        }
        tokio::time::sleep(Duration::from_secs(interval_sec)).await;
    }
}

/// [0, interval] 内均匀分布的整秒抖动
fn jitter(interval_sec: u64) -> Duration {
    Duration::from_secs(rand::rng().random_range(0..=interval_sec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StreamRegistry};
    use crate::state::AppState;
    use crate::store::StateStore;

    fn state_with(yaml_tail: &str) -> SharedState {
        let yaml = format!(
            r#"
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
    streams: [Foo, Bar, Baz]
{yaml_tail}"#
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        let registry = StreamRegistry::build(&config).unwrap();
        let store = StateStore::from_config(&config.state);
        AppState::new("/tmp/unused-config.yaml", config, registry, store)
    }

    #[test]
    fn jitter_stays_within_interval() {
        for _ in 0..200 {
            assert!(jitter(5) <= Duration::from_secs(5));
        }
        assert_eq!(jitter(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn blocklisted_streams_get_no_poll_task() {
        let state = state_with("blocklist: [bar]\n");
        // 抖动区间很长，任务在测试期间只会处于等待状态
        assert_eq!(spawn_poll_tasks(&state, 3600), 2);
        assert_eq!(state.tasks.pending(), 2);
        assert!(state.snapshot().is_empty());
    }

    #[tokio::test]
    async fn every_stream_polled_without_blocklist() {
        let state = state_with("");
        assert_eq!(spawn_poll_tasks(&state, 3600), 3);
        assert_eq!(state.tasks.pending(), 3);
    }
}
