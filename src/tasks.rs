//! 任务注册表
//!
//! 持有所有动态产生的监督/轮询任务，并在主循环中逐个回收。任何任务的错误或 panic
//! 只记录日志，不影响其他任务，也不会让进程退出。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tracing::{debug, error};

/// 已结束任务的回执
struct TaskExit {
    name: String,
    outcome: Result<anyhow::Result<()>, JoinError>,
}

pub struct TaskRegistry {
    pending: AtomicUsize,
    done_tx: mpsc::UnboundedSender<TaskExit>,
    done_rx: Mutex<mpsc::UnboundedReceiver<TaskExit>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            pending: AtomicUsize::new(0),
            done_tx,
            done_rx: Mutex::new(done_rx),
        }
    }

    /// 启动并登记一个任务，可以在回收过程中随时调用
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        // 先计数再启动，回收循环不会在任务登记前看到空集合
        self.pending.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(fut);
        let tx = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            let _ = tx.send(TaskExit { name, outcome });
        });
    }

    /// 尚未回收的任务数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 逐个回收任务直到集合为空
    ///
    /// 每次等待之后都重新检查数量，回收期间新加入的任务同样会被等待。
    pub async fn drain(&self) {
        let mut rx = self.done_rx.lock().await;

        while self.pending() > 0 {
            let Some(exit) = rx.recv().await else {
                break;
            };
            self.pending.fetch_sub(1, Ordering::SeqCst);

            match exit.outcome {
                Ok(Ok(())) => debug!("Task [{}] finished", exit.name),
                Ok(Err(e)) => error!("Task [{}] failed: {:?}", exit.name, e),
                Err(e) if e.is_panic() => error!("Task [{}] panicked: {}", exit.name, e),
                Err(e) => error!("Task [{}] was cancelled: {}", exit.name, e),
            }
        }
    }
}
