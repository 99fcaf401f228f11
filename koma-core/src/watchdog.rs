//! リモート呼び出しのウォッチドッグ
//!
//! 全体停止中にスレッド単独でメソッドを呼び出すと、呼び出し先が他のスレッドの
//! 保持するロックを待ってデッドロックすることがあります。呼び出しが閾値を
//! 超えて続いた場合、一時的にプロセス全体を再開して他のスレッドを走らせ、
//! 呼び出しが終わったら元の停止状態に戻します。
//!
//! タイマーは小さな tokio ランタイム上のタスクとして動き、呼び出しが終われば
//! `Notify` で起こされてすぐに終了します。発火はマネージャへのコマンドとして届き、
//! 状態の変更はすべてマネージャスレッド上で行われます。

use crate::suspend::{ContextId, SuspendManager};
use koma_target::{TargetError, TargetVm, ThreadId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// 監視の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// 閾値に達するのを待っている
    Watching,
    /// 他のスレッドを走らせている
    Triggered,
}

struct Watch {
    context: ContextId,
    thread: ThreadId,
    started: Instant,
    state: WatchState,
    cancel: Arc<Notify>,
}

/// 実行中のリモート呼び出しの監視
#[derive(Default)]
pub struct InvocationWatcher {
    watches: HashMap<WatchId, Watch>,
    next_id: u64,
    runtime: Option<Runtime>,
    timers: Arc<AtomicUsize>,
}

/// タイマータスクの終了時に生存数を減らす
struct TimerGuard(Arc<AtomicUsize>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InvocationWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime(&mut self) -> Option<&Runtime> {
        if self.runtime.is_none() {
            let built = Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("koma-watchdog")
                .enable_time()
                .build();
            match built {
                Ok(rt) => self.runtime = Some(rt),
                Err(e) => error!("failed to start watchdog runtime: {}", e),
            }
        }
        self.runtime.as_ref()
    }

    /// 呼び出しの監視を始める
    ///
    /// `threshold` 経過後に呼び出しが終わっていなければ `on_trigger` が
    /// タイマータスクから呼ばれます。`on_trigger` はマネージャに
    /// [`trigger`](Self::trigger) を実行するコマンドを積むだけにしてください。
    /// `deadlock_delay` 経過後もまだ終わっていなければデッドロックの疑いを記録します。
    pub fn watch<F>(
        &mut self,
        context: ContextId,
        caller: ThreadId,
        threshold: Duration,
        deadlock_delay: Duration,
        on_trigger: F,
    ) -> WatchId
    where
        F: FnOnce(WatchId) + Send + 'static,
    {
        self.next_id += 1;
        let id = WatchId(self.next_id);
        let cancel = Arc::new(Notify::new());
        self.watches.insert(
            id,
            Watch {
                context,
                thread: caller,
                started: Instant::now(),
                state: WatchState::Watching,
                cancel: Arc::clone(&cancel),
            },
        );
        debug!("{} watching invocation in {} ({})", id, caller, context);

        let timers = Arc::clone(&self.timers);
        let Some(runtime) = self.runtime() else {
            warn!("{}: no timer available; invocation is not watched", id);
            return id;
        };
        timers.fetch_add(1, Ordering::SeqCst);
        let guard = TimerGuard(timers);
        runtime.spawn(async move {
            let _guard = guard;
            tokio::select! {
                () = cancel.notified() => return,
                () = tokio::time::sleep(threshold) => {}
            }
            on_trigger(id);

            tokio::select! {
                () = cancel.notified() => {}
                () = tokio::time::sleep(deadlock_delay.saturating_sub(threshold)) => {
                    warn!(
                        "invocation in {} still running after {:?}; likely deadlock",
                        caller, deadlock_delay
                    );
                }
            }
        });
        id
    }

    pub fn state(&self, id: WatchId) -> Option<WatchState> {
        self.watches.get(&id).map(|w| w.state)
    }

    pub fn active(&self) -> usize {
        self.watches.len()
    }

    /// まだ終了していないタイマータスクの数
    pub fn running_timers(&self) -> usize {
        self.timers.load(Ordering::SeqCst)
    }

    /// 閾値を超えた呼び出しのために停止を緩める
    ///
    /// コンテキストの他のスレッドはレジストリ上で停止扱いではなくなり、
    /// プロセス全体が再開されます。呼び出し中のスレッドは停止扱いのままです。
    pub fn trigger(
        &mut self,
        id: WatchId,
        suspend: &mut SuspendManager,
        vm: &dyn TargetVm,
    ) -> Result<bool, TargetError> {
        let Some(watch) = self.watches.get_mut(&id) else {
            return Ok(false);
        };
        if watch.state != WatchState::Watching {
            return Ok(false);
        }
        if !suspend.set_relaxed(watch.context, true) {
            debug!("{}: {} already resumed", id, watch.context);
            return Ok(false);
        }
        watch.state = WatchState::Triggered;
        debug!(
            "{} triggered after {:?}; resuming other threads",
            id,
            watch.started.elapsed()
        );
        vm.resume()?;
        Ok(true)
    }

    /// 呼び出しの終了。発火していた場合は元の停止状態に戻す
    ///
    /// プロセス全体を停止し直してから、呼び出したスレッドとコンテキストで
    /// 明示的に再開されているスレッドを再開します。
    pub fn finish(
        &mut self,
        id: WatchId,
        suspend: &mut SuspendManager,
        vm: &dyn TargetVm,
    ) -> Result<(), TargetError> {
        let Some(watch) = self.watches.remove(&id) else {
            return Ok(());
        };
        watch.cancel.notify_one();
        if watch.state != WatchState::Triggered {
            return Ok(());
        }
        let Some(ctx) = suspend.context(watch.context) else {
            debug!("{}: {} resumed during the invocation", id, watch.context);
            return Ok(());
        };
        let explicitly_resumed: Vec<ThreadId> = ctx.explicitly_resumed().collect();
        suspend.set_relaxed(watch.context, false);

        vm.suspend()?;
        vm.resume_thread(watch.thread)?;
        for t in explicitly_resumed {
            vm.resume_thread(t)?;
        }
        debug!("{} finished after {:?}; suspension restored", id, watch.started.elapsed());
        Ok(())
    }

    /// 全ての監視を打ち切る（接続断）
    pub fn cancel_all(&mut self) {
        for (_, watch) in self.watches.drain() {
            watch.cancel.notify_one();
        }
    }
}
