//! マネージャスレッド（コマンドスケジューラ）
//!
//! デバッガの状態を変更する処理はすべてコマンドとしてキューに積まれ、
//! 一つのワーカースレッドが優先度順に一つずつ実行します。状態 `S` はワーカーが
//! 所有しており、コマンドには [`ManagerContext`] 経由で可変参照として渡されます。
//! 状態へのロックは存在せず、書き込み手は常に一つだけです。
//!
//! ブロッキングなリモート呼び出しは [`ManagerContext::start_long_process_and_fork`] で
//! 補助スレッドに渡し、その完了は継続コマンドとしてキューに戻されます。
//! 呼び出し中もイベント処理は止まりません。

use crate::errors::{CommandError, SchedulerError};
use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

thread_local! {
    static MANAGER_THREAD: Cell<bool> = Cell::new(false);
}

/// 現在のスレッドがマネージャのワーカーかどうか
pub fn is_manager_thread() -> bool {
    MANAGER_THREAD.with(|f| f.get())
}

/// コマンドの優先度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
    Lowest,
}

impl Priority {
    const COUNT: usize = 4;

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
            Priority::Lowest => 3,
        }
    }
}

/// マネージャスレッドで実行されるコマンド
///
/// コマンドはちょうど一度だけ、`action` が実行されるか `command_cancelled` で
/// キャンセルが通知されます。
pub trait DebuggerCommand<S>: Send {
    fn priority(&self) -> Priority {
        Priority::Low
    }

    /// ログ用の名前
    fn name(&self) -> &str {
        "command"
    }

    fn action(self: Box<Self>, ctx: &mut ManagerContext<'_, S>) -> Result<(), CommandError>;

    fn command_cancelled(self: Box<Self>) {}
}

pub type BoxedCommand<S> = Box<dyn DebuggerCommand<S>>;

struct FnCommand<S, F> {
    priority: Priority,
    name: &'static str,
    f: F,
    _state: PhantomData<fn(S)>,
}

impl<S, F> DebuggerCommand<S> for FnCommand<S, F>
where
    F: FnOnce(&mut ManagerContext<'_, S>) -> Result<(), CommandError> + Send,
{
    fn priority(&self) -> Priority {
        self.priority
    }

    fn name(&self) -> &str {
        self.name
    }

    fn action(self: Box<Self>, ctx: &mut ManagerContext<'_, S>) -> Result<(), CommandError> {
        (self.f)(ctx)
    }
}

/// クロージャからコマンドを作成する
pub fn command<S, F>(priority: Priority, name: &'static str, f: F) -> BoxedCommand<S>
where
    S: 'static,
    F: FnOnce(&mut ManagerContext<'_, S>) -> Result<(), CommandError> + Send + 'static,
{
    Box::new(FnCommand {
        priority,
        name,
        f,
        _state: PhantomData,
    })
}

/// 完了を呼び出し元に通知するコマンド
struct WaitingCommand<S> {
    inner: BoxedCommand<S>,
    done: oneshot::Sender<Result<(), SchedulerError>>,
}

impl<S> DebuggerCommand<S> for WaitingCommand<S> {
    fn priority(&self) -> Priority {
        self.inner.priority()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn action(self: Box<Self>, ctx: &mut ManagerContext<'_, S>) -> Result<(), CommandError> {
        let WaitingCommand { inner, done } = *self;
        let result = inner.action(ctx);
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(SchedulerError::Failed(e.to_string())),
        };
        let _ = done.send(outcome);
        result
    }

    fn command_cancelled(self: Box<Self>) {
        let WaitingCommand { inner, done } = *self;
        inner.command_cancelled();
        let _ = done.send(Err(SchedulerError::Cancelled));
    }
}

struct QueueState<S> {
    lanes: [VecDeque<BoxedCommand<S>>; Priority::COUNT],
    closed: bool,
}

/// 優先度付きのコマンドキュー
///
/// 同じ優先度の中では投入順に取り出されます。
struct CommandQueue<S> {
    state: Mutex<QueueState<S>>,
    available: Condvar,
}

impl<S> CommandQueue<S> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: std::array::from_fn(|_| VecDeque::new()),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// キューが閉じている場合はコマンドをそのまま返す
    fn push(&self, cmd: BoxedCommand<S>, front: bool) -> Result<(), BoxedCommand<S>> {
        let mut state = self.lock();
        if state.closed {
            return Err(cmd);
        }
        let lane = &mut state.lanes[cmd.priority().lane()];
        if front {
            lane.push_front(cmd);
        } else {
            lane.push_back(cmd);
        }
        self.available.notify_one();
        Ok(())
    }

    /// 次のコマンドを待つ。閉じられたら `None`
    fn pop(&self) -> Option<BoxedCommand<S>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(cmd) = state.lanes.iter_mut().find_map(VecDeque::pop_front) {
                return Some(cmd);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// キューを閉じ、未実行のコマンドを返す
    fn close(&self) -> Vec<BoxedCommand<S>> {
        let mut state = self.lock();
        state.closed = true;
        self.available.notify_all();
        state.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// ワーカースレッドが持つ「状態を変更する権利」
///
/// ある時点で current なリクエストは一つだけです。
#[derive(Debug)]
pub struct WorkerRequest {
    id: u64,
    stop_requested: AtomicBool,
    activity: Mutex<Activity>,
    idle: Condvar,
}

/// 実行中のコマンドと、これまでに開始したコマンドの数
#[derive(Debug, Default)]
struct Activity {
    busy: bool,
    started: u64,
}

impl WorkerRequest {
    fn new(id: u64) -> Self {
        Self {
            id,
            stop_requested: AtomicBool::new(false),
            activity: Mutex::new(Activity::default()),
            idle: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        let mut a = self.activity();
        a.started += 1;
        a.busy = true;
    }

    fn end(&self) {
        self.activity().busy = false;
        self.idle.notify_all();
    }

    /// 実行中なら、そのコマンドの通し番号
    fn running(&self) -> Option<u64> {
        let a = self.activity();
        a.busy.then_some(a.started)
    }

    /// `started` 番目のコマンドが終わるまで最大 `timeout` 待つ
    ///
    /// 時間内に終わらなければ `true` を返します。
    fn overruns(&self, started: u64, timeout: Duration) -> bool {
        let (a, _) = self
            .idle
            .wait_timeout_while(self.activity(), timeout, |a| a.busy && a.started == started)
            .unwrap_or_else(PoisonError::into_inner);
        a.busy && a.started == started
    }
}

struct Shared<S> {
    name: String,
    queue: CommandQueue<S>,
    current: Mutex<Option<Arc<WorkerRequest>>>,
    next_request: AtomicU64,
}

/// コマンド実行中に渡されるコンテキスト
pub struct ManagerContext<'a, S> {
    state: &'a mut Option<S>,
    manager: &'a ManagerThread<S>,
    request: &'a Arc<WorkerRequest>,
}

impl<'a, S: Send + 'static> ManagerContext<'a, S> {
    /// マネージャが所有する状態
    ///
    /// ワーカーが強制的に置き換えられた直後は、元のワーカーから状態が戻るまで
    /// `StateUnavailable` になります。
    pub fn state(&mut self) -> Result<&mut S, CommandError> {
        self.state.as_mut().ok_or(CommandError::StateUnavailable)
    }

    pub fn manager(&self) -> &ManagerThread<S> {
        self.manager
    }

    /// 現在のワーカーに停止が要求されているか
    pub fn is_stop_requested(&self) -> bool {
        self.request.is_stop_requested()
    }

    /// コマンドをその場で実行する
    pub fn invoke(&mut self, cmd: BoxedCommand<S>) -> Result<(), CommandError> {
        cmd.action(self)
    }

    /// ブロッキングな処理を補助スレッドで実行し、完了後に継続をキューに戻す
    ///
    /// `process` はマネージャの状態に触れてはいけません。継続は `High` 優先度で
    /// 実行されます。キューが先に閉じられた場合、継続は実行されずに破棄されます。
    pub fn start_long_process_and_fork<T, P, C>(&self, process: P, continuation: C)
    where
        T: Send + 'static,
        P: FnOnce() -> T + Send + 'static,
        C: FnOnce(&mut ManagerContext<'_, S>, T) -> Result<(), CommandError> + Send + 'static,
    {
        let manager = self.manager.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-long-process", manager.shared.name))
            .spawn(move || {
                let output = process();
                manager.schedule(command(Priority::High, "rejoin", move |ctx| {
                    continuation(ctx, output)
                }));
            });
        if let Err(e) = spawned {
            error!("failed to spawn long process thread: {}", e);
        }
    }

    fn adopt(&mut self, state: S) {
        if self.state.is_none() {
            debug!("worker {} adopted orphaned state", self.request.id());
            *self.state = Some(state);
        } else {
            warn!("dropping orphaned state: worker {} already owns state", self.request.id());
        }
    }
}

/// マネージャスレッドへのハンドル
pub struct ManagerThread<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for ManagerThread<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Send + 'static> ManagerThread<S> {
    /// 状態を所有するワーカーを起動する
    pub fn start(name: &str, state: S) -> Self {
        let manager = Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                queue: CommandQueue::new(),
                current: Mutex::new(None),
                next_request: AtomicU64::new(1),
            }),
        };
        manager.spawn_worker(Some(state));
        manager
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<WorkerRequest>>> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 現在状態を変更する権利を持つリクエスト
    pub fn current_request(&self) -> Option<Arc<WorkerRequest>> {
        self.current().clone()
    }

    fn is_current(&self, request: &Arc<WorkerRequest>) -> bool {
        self.current()
            .as_ref()
            .map(|r| Arc::ptr_eq(r, request))
            .unwrap_or(false)
    }

    fn spawn_worker(&self, state: Option<S>) -> Arc<WorkerRequest> {
        let id = self.shared.next_request.fetch_add(1, Ordering::SeqCst);
        let request = Arc::new(WorkerRequest::new(id));
        *self.current() = Some(Arc::clone(&request));

        let manager = self.clone();
        let worker_request = Arc::clone(&request);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.shared.name, id))
            .spawn(move || manager.run_worker(worker_request, state));
        if let Err(e) = spawned {
            error!("failed to spawn manager worker: {}", e);
        }
        request
    }

    fn run_worker(self, request: Arc<WorkerRequest>, mut state: Option<S>) {
        MANAGER_THREAD.with(|f| f.set(true));
        debug!("manager worker {} started", request.id());

        while !request.is_stop_requested() {
            let Some(cmd) = self.shared.queue.pop() else {
                break;
            };
            let name = cmd.name().to_string();
            request.begin();
            let mut ctx = ManagerContext {
                state: &mut state,
                manager: &self,
                request: &request,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| cmd.action(&mut ctx)));
            request.end();
            match result {
                Ok(Ok(())) => {}
                Ok(Err(CommandError::Disconnected)) => {
                    debug!("command '{}' aborted: target disconnected", name);
                }
                Ok(Err(e)) => warn!("command '{}' failed: {}", name, e),
                Err(_) => error!("command '{}' panicked", name),
            }
        }

        MANAGER_THREAD.with(|f| f.set(false));
        debug!("manager worker {} stopped", request.id());

        // 置き換えられたワーカーは状態を新しいワーカーに返す
        if let Some(orphan) = state {
            if request.is_stop_requested() {
                self.schedule(command(Priority::High, "adopt-state", move |ctx| {
                    ctx.adopt(orphan);
                    Ok(())
                }));
            }
        }
    }

    /// コマンドを非同期に実行する
    ///
    /// キューが閉じている場合はキャンセルを通知して `false` を返します。
    pub fn schedule(&self, cmd: BoxedCommand<S>) -> bool {
        self.enqueue(cmd, false)
    }

    pub fn schedule_fn<F>(&self, priority: Priority, name: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut ManagerContext<'_, S>) -> Result<(), CommandError> + Send + 'static,
    {
        self.schedule(command(priority, name, f))
    }

    fn enqueue(&self, cmd: BoxedCommand<S>, front: bool) -> bool {
        match self.shared.queue.push(cmd, front) {
            Ok(()) => true,
            Err(cmd) => {
                debug!("queue closed, cancelling '{}'", cmd.name());
                cmd.command_cancelled();
                false
            }
        }
    }

    /// マネージャスレッド外からは `schedule` と同じ
    ///
    /// `ManagerThread` は状態への参照を持たないため、マネージャスレッド上でも
    /// その場では実行できません。代わりに同じ優先度の先頭に積み、現在のコマンドの
    /// 直後に実行されるようにします。即時実行は状態を借用している
    /// [`ManagerContext::invoke`] だけが行います。
    pub fn invoke(&self, cmd: BoxedCommand<S>) -> bool {
        self.enqueue(cmd, is_manager_thread())
    }

    /// コマンドの完了までブロックする
    ///
    /// マネージャスレッドから呼ぶとデッドロックするため、エラーになります。
    pub fn invoke_and_wait(&self, cmd: BoxedCommand<S>) -> Result<(), SchedulerError> {
        if is_manager_thread() {
            error!("invoke_and_wait('{}') called from the manager thread", cmd.name());
            return Err(SchedulerError::InvokeAndWaitOnManagerThread);
        }
        let (tx, rx) = oneshot::channel();
        self.schedule(Box::new(WaitingCommand { inner: cmd, done: tx }));
        rx.blocking_recv()
            .unwrap_or_else(|_| Err(SchedulerError::Failed("command aborted".to_string())))
    }

    /// クロージャを実行して結果を受け取る
    pub fn invoke_and_wait_fn<T, F>(&self, priority: Priority, f: F) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext<'_, S>) -> Result<T, CommandError> + Send + 'static,
    {
        if is_manager_thread() {
            error!("invoke_and_wait called from the manager thread");
            return Err(SchedulerError::InvokeAndWaitOnManagerThread);
        }
        let (tx, rx) = oneshot::channel();
        self.schedule(command(priority, "invoke-and-wait", move |ctx| {
            let result = f(ctx).map_err(|e| SchedulerError::Failed(e.to_string()));
            let _ = tx.send(result);
            Ok(())
        }));
        rx.blocking_recv()
            .unwrap_or(Err(SchedulerError::Cancelled))
    }

    /// コマンドを実行し、実行中のコマンドが `timeout` 以内に終わらなければ
    /// そのワーカーに停止を要求して新しいワーカーでキューの処理を続ける
    pub fn terminate_and_invoke(&self, cmd: BoxedCommand<S>, timeout: Duration) {
        let snapshot = self
            .current_request()
            .and_then(|r| r.running().map(|started| (r, started)));
        self.invoke(cmd);

        let Some((request, started)) = snapshot else {
            return;
        };
        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-terminate-timer", self.shared.name))
            .spawn(move || {
                // コマンドが終われば待たずに抜ける
                if request.overruns(started, timeout) && manager.is_current(&request) {
                    warn!(
                        "command on worker {} overran {:?}; starting a replacement worker",
                        request.id(),
                        timeout
                    );
                    request.request_stop();
                    manager.spawn_worker(None);
                }
            });
        if let Err(e) = spawned {
            error!("failed to spawn terminate timer: {}", e);
        }
    }

    /// キューを閉じる。未実行のコマンドにはキャンセルが通知される
    pub fn close(&self) {
        let pending = self.shared.queue.close();
        if !pending.is_empty() {
            debug!("cancelling {} pending command(s)", pending.len());
        }
        for cmd in pending {
            cmd.command_cancelled();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    type Log = Vec<&'static str>;

    fn block_worker(manager: &ManagerThread<Log>) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        manager.schedule_fn(Priority::High, "gate", move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        started_rx.recv().unwrap();
        release_tx
    }

    fn push(manager: &ManagerThread<Log>, priority: Priority, tag: &'static str) {
        manager.schedule_fn(priority, "push", move |ctx| {
            ctx.state()?.push(tag);
            Ok(())
        });
    }

    #[test]
    fn test_priority_order() {
        let manager = ManagerThread::start("test", Log::new());
        let release = block_worker(&manager);

        push(&manager, Priority::Lowest, "lowest");
        push(&manager, Priority::Low, "low-1");
        push(&manager, Priority::Normal, "normal");
        push(&manager, Priority::High, "high");
        push(&manager, Priority::Low, "low-2");
        release.send(()).unwrap();

        let log = manager
            .invoke_and_wait_fn(Priority::Lowest, |ctx| Ok(ctx.state()?.clone()))
            .unwrap();
        assert_eq!(log, vec!["high", "normal", "low-1", "low-2", "lowest"]);
        manager.close();
    }

    #[test]
    fn test_invoke_and_wait_on_manager_thread_is_rejected() {
        let manager = ManagerThread::start("test", Log::new());
        let nested = manager
            .invoke_and_wait_fn(Priority::Normal, |ctx| {
                Ok(ctx
                    .manager()
                    .invoke_and_wait_fn(Priority::Normal, |_| Ok(())))
            })
            .unwrap();
        assert_eq!(nested, Err(SchedulerError::InvokeAndWaitOnManagerThread));
        manager.close();
    }

    #[test]
    fn test_context_invoke_runs_inline() {
        let manager = ManagerThread::start("test", Log::new());
        let log = manager
            .invoke_and_wait_fn(Priority::Normal, |ctx| {
                ctx.invoke(command(Priority::Lowest, "inline", |ctx: &mut ManagerContext<'_, Log>| {
                    ctx.state()?.push("inline");
                    Ok(())
                }))?;
                ctx.state()?.push("after");
                Ok(ctx.state()?.clone())
            })
            .unwrap();
        assert_eq!(log, vec!["inline", "after"]);
        manager.close();
    }

    #[test]
    fn test_invoke_on_manager_thread_jumps_its_lane() {
        let manager = ManagerThread::start("test", Log::new());
        manager
            .invoke_and_wait_fn(Priority::Normal, |ctx| {
                let m = ctx.manager().clone();
                push(&m, Priority::Normal, "queued");
                m.invoke(command(Priority::Normal, "front", |ctx: &mut ManagerContext<'_, Log>| {
                    ctx.state()?.push("front");
                    Ok(())
                }));
                // その場では実行されない
                assert!(ctx.state()?.is_empty());
                Ok(())
            })
            .unwrap();

        let log = manager
            .invoke_and_wait_fn(Priority::Lowest, |ctx| Ok(ctx.state()?.clone()))
            .unwrap();
        assert_eq!(log, vec!["front", "queued"]);
        manager.close();
    }

    struct Flagged {
        ran: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
    }

    impl DebuggerCommand<Log> for Flagged {
        fn action(self: Box<Self>, _ctx: &mut ManagerContext<'_, Log>) -> Result<(), CommandError> {
            self.ran.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn command_cancelled(self: Box<Self>) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_close_cancels_pending_and_future_commands() {
        let manager = ManagerThread::start("test", Log::new());
        let release = block_worker(&manager);

        let ran = Arc::new(AtomicBool::new(false));
        let pending_cancelled = Arc::new(AtomicBool::new(false));
        manager.schedule(Box::new(Flagged {
            ran: ran.clone(),
            cancelled: pending_cancelled.clone(),
        }));
        manager.close();
        release.send(()).unwrap();
        assert!(pending_cancelled.load(Ordering::SeqCst));

        let future_cancelled = Arc::new(AtomicBool::new(false));
        let accepted = manager.schedule(Box::new(Flagged {
            ran: ran.clone(),
            cancelled: future_cancelled.clone(),
        }));
        assert!(!accepted);
        assert!(future_cancelled.load(Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));

        assert_eq!(
            manager.invoke_and_wait_fn(Priority::High, |_| Ok(())),
            Err(SchedulerError::Cancelled)
        );
    }

    #[test]
    fn test_fork_keeps_queue_running() {
        let manager = ManagerThread::start("test", Log::new());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (joined_tx, joined_rx) = mpsc::channel::<()>();

        manager
            .invoke_and_wait_fn(Priority::Normal, move |ctx| {
                ctx.start_long_process_and_fork(
                    move || {
                        let _ = release_rx.recv();
                        "remote"
                    },
                    move |ctx, value| {
                        ctx.state()?.push(value);
                        let _ = joined_tx.send(());
                        Ok(())
                    },
                );
                Ok(())
            })
            .unwrap();

        // 呼び出しが終わっていなくても他のコマンドは処理される
        push(&manager, Priority::Normal, "event");
        let log = manager
            .invoke_and_wait_fn(Priority::Low, |ctx| Ok(ctx.state()?.clone()))
            .unwrap();
        assert_eq!(log, vec!["event"]);

        release_tx.send(()).unwrap();
        joined_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let log = manager
            .invoke_and_wait_fn(Priority::Low, |ctx| Ok(ctx.state()?.clone()))
            .unwrap();
        assert_eq!(log, vec!["event", "remote"]);
        manager.close();
    }

    #[test]
    fn test_overrun_wait_ends_with_the_command() {
        let request = Arc::new(WorkerRequest::new(1));
        request.begin();
        let started = request.running().unwrap();

        let r = Arc::clone(&request);
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.end();
        });
        let begun = Instant::now();
        assert!(!request.overruns(started, Duration::from_secs(30)));
        assert!(begun.elapsed() < Duration::from_secs(5));
        finisher.join().unwrap();

        request.begin();
        let next = request.running().unwrap();
        assert_ne!(next, started);
        assert!(request.overruns(next, Duration::from_millis(10)));
    }

    #[test]
    fn test_terminate_and_invoke_replaces_stuck_worker() {
        let manager = ManagerThread::start("test", Log::new());
        push(&manager, Priority::High, "before");
        let release = block_worker(&manager);
        let stuck = manager.current_request().unwrap();

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        manager.terminate_and_invoke(
            command(Priority::High, "stop", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            Duration::from_millis(50),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !stopped.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stopped.load(Ordering::SeqCst));
        assert!(stuck.is_stop_requested());
        assert_ne!(manager.current_request().unwrap().id(), stuck.id());

        // 詰まっていたワーカーが終わると状態が引き継がれる
        release.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let log = loop {
            match manager.invoke_and_wait_fn(Priority::Low, |ctx| Ok(ctx.state()?.clone())) {
                Ok(log) => break log,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("state was never adopted: {}", e),
            }
        };
        assert_eq!(log, vec!["before"]);
        manager.close();
    }
}
