use crate::config::{AppConfig, StreamConfig};
use crate::state::{SharedState, StreamState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// 恢复会话时探测旧进程存活的间隔
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// 重试循环的退出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// 重试次数用尽，`attempts` 为已尝试的次数
    Exhausted { attempts: u32 },
    /// 轮询尝试没有拿到数据
    PollEmpty,
}

pub struct Engine;

impl Engine {
    /// 为已配置的流调度一次监督尝试
    ///
    /// 未配置的流只记录日志，不创建任务。返回是否创建了任务。
    pub fn trigger(state: &SharedState, stream_id: &str, poll_attempt: bool) -> bool {
        let Some(cfg) = state.stream_config(stream_id) else {
            info!("Stream [{}] is not configured, ignoring", stream_id);
            return false;
        };

        let st = state.clone();
        state.tasks.spawn(format!("attempt:{}", cfg.stream_id), async move {
            Engine::attempt(&st, cfg, poll_attempt).await
        });
        true
    }

    /// 为持久化状态中的每个会话重新调度尝试
    pub fn resume_sessions(state: &SharedState) {
        for (key, session) in state.snapshot() {
            if state.stream_config(&key).is_none() {
                error!("Could not resume stream [{}]: not configured", key);
                continue;
            }

            state.update_stream(&key, |s| s.resumed = true);
            info!(
                "Resuming stream [{}] at retry {} (pid {:?})",
                key, session.retry_index, session.process_id
            );
            Self::trigger(state, &key, session.poll_attempt);
        }
    }

    /// 对单个流执行一次监督尝试
    ///
    /// 同一流的并发调用通过流锁串行化，任何时刻最多只有一个采集进程。
    /// 循环中的错误在收尾之后原样返回。
    pub async fn attempt(
        state: &SharedState,
        cfg: StreamConfig,
        poll_attempt: bool,
    ) -> anyhow::Result<()> {
        let key = cfg.stream_id.to_lowercase();
        let lock = state.stream_lock(&key);

        // 1. 已确认上线的流正在录制时直接放弃，不排队
        let _guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let definitive = state
                    .stream_state(&key)
                    .map(|s| !s.poll_attempt)
                    .unwrap_or(false);
                if definitive {
                    info!("Stream [{}] already online, abandoning attempt", key);
                    return Ok(());
                }
                lock.lock_owned().await
            }
        };

        // 2. 运行重试循环，无论结果如何都进行收尾；流锁随 _guard 最后释放
        let result = Self::run_retries(state, &cfg, &key, poll_attempt).await;
        Self::finalize(state, &key, &result).await;
        result.map(|_| ())
    }

    async fn run_retries(
        state: &SharedState,
        cfg: &StreamConfig,
        key: &str,
        poll_attempt: bool,
    ) -> anyhow::Result<LoopExit> {
        let config = state.config();

        // 新会话在启动任何子进程之前先落盘
        let created = {
            let mut streams = state.streams.lock().unwrap();
            if streams.contains_key(key) {
                false
            } else {
                let session = StreamState::new(cfg.clone(), &config.paths.log_dir, poll_attempt);
                streams.insert(key.to_string(), session);
                true
            }
        };
        if created {
            state.persist().await?;
        }

        let mut retry_index = state
            .stream_state(key)
            .map(|s| s.retry_index)
            .ok_or_else(|| anyhow::anyhow!("state entry for [{}] disappeared", key))?;

        while retry_index <= cfg.max_retries {
            info!(
                "Stream [{}] attempting capture (retry {}/{})",
                key, retry_index, cfg.max_retries
            );

            let session = state
                .update_stream(key, |s| {
                    s.retry_index = retry_index;
                    s.clone()
                })
                .ok_or_else(|| anyhow::anyhow!("state entry for [{}] disappeared", key))?;
            let output = session.output_path(&config.paths.download_dir, retry_index);
            state.persist().await?;

            match session.process_id {
                None => {
                    let mut child = Self::spawn_capture(&config, cfg, &output, &session.log_path)?;
                    if let Some(pid) = child.id() {
                        let pid = i32::try_from(pid)?;
                        state.update_stream(key, |s| s.process_id = Some(pid));
                        state.persist().await?;
                    }
                    let status = child.wait().await?;
                    debug!("Stream [{}] capture process exited with: {}", key, status);
                }
                Some(pid) => {
                    // 崩溃恢复：旧进程仍在运行时不能再启动新的
                    debug!("Stream [{}] polling existing process {}", key, pid);
                    Self::wait_for_exit(pid).await;
                    debug!("Stream [{}] existing process {} exited", key, pid);
                }
            }

            state.update_stream(key, |s| s.process_id = None);
            state.persist().await?;

            if is_empty_output(&output).await {
                warn!(
                    "Stream [{}] output is empty or missing (retry {})",
                    key, retry_index
                );
                // 没有确认信号的轮询不消耗重试预算
                if poll_attempt {
                    return Ok(LoopExit::PollEmpty);
                }
            }
            retry_index += 1;
        }

        Ok(LoopExit::Exhausted {
            attempts: retry_index,
        })
    }

    /// 会话收尾
    ///
    /// - 重试用尽：删除状态并把所有输出移到完成目录
    /// - 轮询无数据：删除轮询创建的会话
    /// - 其他 (出错)：保留状态供人工处理
    async fn finalize(state: &SharedState, key: &str, result: &anyhow::Result<LoopExit>) {
        match result {
            Ok(LoopExit::Exhausted { attempts }) => {
                let session = state.streams.lock().unwrap().remove(key);
                if let Some(pid) = session.as_ref().and_then(|s| s.process_id) {
                    match terminate(pid) {
                        Ok(()) => debug!("Stream [{}] killed leftover process {}", key, pid),
                        Err(e) => warn!("Stream [{}] unable to kill {}: {}", key, pid, e),
                    }
                }
                if let Err(e) = state.persist().await {
                    error!("Stream [{}] failed to persist state: {:#}", key, e);
                }

                let moved = match session {
                    Some(session) => {
                        let config = state.config();
                        Self::move_completed(&config, key, &session, *attempts).await
                    }
                    None => 0,
                };
                info!(
                    "Stream [{}] session finished, {} of {} outputs completed",
                    key, moved, attempts
                );
            }
            Ok(LoopExit::PollEmpty) => {
                // 只删除轮询创建的会话，确认上线后遗留的会话保留供人工处理
                let removed = {
                    let mut streams = state.streams.lock().unwrap();
                    let definitive = streams.get(key).is_some_and(|s| !s.poll_attempt);
                    !definitive && streams.remove(key).is_some()
                };
                if !removed {
                    warn!(
                        "Stream [{}] poll found no data for a definitive session, keeping state",
                        key
                    );
                    return;
                }
                if let Err(e) = state.persist().await {
                    error!("Stream [{}] failed to persist state: {:#}", key, e);
                }
            }
            Err(e) => {
                warn!(
                    "Stream [{}] exited loop without completing all retries: {:#}",
                    key, e
                );
            }
        }
    }

    /// 把会话中每次重试的输出移动到完成目录，返回成功移动的数量
    async fn move_completed(
        config: &AppConfig,
        key: &str,
        session: &StreamState,
        attempts: u32,
    ) -> usize {
        let mut failed = Vec::new();
        for i in 0..attempts {
            let from = session.output_path(&config.paths.download_dir, i);
            let to = session.output_path(&config.paths.completed_dir, i);
            match fs::rename(&from, &to).await {
                Ok(()) => debug!("Stream [{}] moved {:?} -> {:?}", key, from, to),
                Err(e) => {
                    debug!("Stream [{}] could not move {:?}: {}", key, from, e);
                    failed.push((i, e));
                }
            }
        }

        // 确认上线的会话一个文件都没有产生，说明有更深层的问题
        if attempts > 0 && failed.len() == attempts as usize {
            error!(
                "Stream [{}] could not move any output to completed: {:?}",
                key, failed
            );
        }
        attempts as usize - failed.len()
    }

    /// 启动外部采集程序
    ///
    /// 参数约定: `stream_id profile_spec output_path log_path extra_args`。
    /// 子进程放入独立进程组，监督进程退出后仍继续运行。
    fn spawn_capture(
        config: &AppConfig,
        cfg: &StreamConfig,
        output: &Path,
        log_path: &Path,
    ) -> anyhow::Result<Child> {
        let extra = config.extra_args_for(&cfg.stream_id).unwrap_or_default();
        if !extra.is_empty() {
            info!("Stream [{}] extra capture arguments: {}", cfg.stream_id, extra);
        }

        let mut cmd = std::process::Command::new(&config.server.capture_binary);
        cmd.arg(&cfg.stream_id)
            .arg(&cfg.profile_spec)
            .arg(output)
            .arg(log_path)
            .arg(extra);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.process_group(0);

        let child = Command::from(cmd).spawn().map_err(|e| {
            error!(
                "Failed to spawn capture process {:?}: {}",
                config.server.capture_binary, e
            );
            e
        })?;
        Ok(child)
    }

    async fn wait_for_exit(pid: i32) {
        while is_process_alive(pid) {
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }
}

/// 用 0 号信号探测进程是否存活，任何错误都视为已退出
pub fn is_process_alive(pid: i32) -> bool {
    pid > 0 && signal::kill(Pid::from_raw(pid), None).is_ok()
}

fn terminate(pid: i32) -> nix::Result<()> {
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL)
}

/// 输出文件不存在或长度为 0 即为空
async fn is_empty_output(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(_) => true,
    }
}
