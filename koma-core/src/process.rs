//! デバッグ対象プロセスの操作
//!
//! [`DebugProcess`] は外部に公開する操作の入口です。各操作はマネージャスレッドに
//! コマンドとして渡され、[`DebuggerState`] はマネージャスレッドだけが触ります。

use crate::errors::{CommandError, EvaluateError, ERR_CONTEXT_NOT_FOUND, ERR_NOT_ATTACHED, ERR_NO_THREAD};
use crate::evaluation::start_evaluation;
use crate::events::{on_paused, spawn_event_loop, teardown};
use crate::manager::{command, is_manager_thread, ManagerThread, Priority};
use crate::requests::{Breakpoint, BreakpointId, RequestManager, Requestor, WatcherId};
use crate::settings::DebuggerSettings;
use crate::stepping::{do_step, ExtraSteppingFilter, MethodFilter, StepHint};
use crate::suspend::{ContextId, SuspendContext, SuspendListener, SuspendManager};
use crate::watchdog::InvocationWatcher;
use crate::Result;
use anyhow::anyhow;
use koma_target::{
    Event, MethodRef, RequestId, SourcePosition, StepDepth, SuspendPolicy, TargetVm, ThreadId, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// 接続の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Initial,
    Attached,
    Detaching,
    Detached,
}

impl ProcessState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initial,
            1 => Self::Attached,
            2 => Self::Detaching,
            _ => Self::Detached,
        }
    }
}

/// 呼び出し元スレッドとマネージャスレッドで共有する接続状態
#[derive(Debug)]
pub(crate) struct ProcessStateCell(AtomicU8);

impl ProcessStateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ProcessState::Initial as u8))
    }

    pub(crate) fn get(&self) -> ProcessState {
        ProcessState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ProcessState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// `from` の場合だけ `to` に遷移する
    fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// プロセスの状態変化を受け取るリスナー
pub trait DebugProcessListener: Send + Sync {
    fn attached(&self) {}

    fn detached(&self) {}

    fn evaluation_started(&self, _thread: ThreadId) {}

    fn evaluation_finished(&self, _thread: ThreadId, _result: &std::result::Result<Value, EvaluateError>) {}

    /// スマートステップの対象メソッドに到達せずにステップが止まった
    fn smart_step_target_not_reached(&self, _thread: ThreadId, _target: &MethodRef) {}
}

/// スレッドの表示用の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub name: String,
    pub suspended: bool,
    pub frozen: bool,
    pub evaluating: bool,
}

/// マネージャスレッドが所有するデバッガの状態
pub struct DebuggerState {
    pub(crate) vm: Arc<dyn TargetVm>,
    pub(crate) suspend: SuspendManager,
    pub(crate) requests: RequestManager,
    pub(crate) settings: DebuggerSettings,
    /// ステップ要求ごとの判定状態
    pub(crate) step_hints: HashMap<RequestId, StepHint>,
    pub(crate) watchdog: InvocationWatcher,
    pub(crate) extra_filters: Vec<Arc<dyn ExtraSteppingFilter>>,
    pub(crate) listeners: Vec<Arc<dyn DebugProcessListener>>,
    pub(crate) process_state: Arc<ProcessStateCell>,
}

impl DebuggerState {
    pub fn vm(&self) -> &dyn TargetVm {
        &*self.vm
    }

    pub fn suspend(&self) -> &SuspendManager {
        &self.suspend
    }

    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    pub fn settings(&self) -> &DebuggerSettings {
        &self.settings
    }

    /// 進行中のステップ要求の数
    pub fn pending_steps(&self) -> usize {
        self.step_hints.len()
    }

    pub(crate) fn live_context(&self, id: ContextId) -> std::result::Result<&SuspendContext, CommandError> {
        self.suspend
            .context(id)
            .ok_or_else(|| CommandError::Other(anyhow!("{}: {}", ERR_CONTEXT_NOT_FOUND, id)))
    }

    fn context_thread(&self, id: ContextId) -> std::result::Result<ThreadId, CommandError> {
        self.live_context(id)?
            .thread()
            .ok_or_else(|| CommandError::Other(anyhow!("{}: {}", ERR_NO_THREAD, id)))
    }

    /// ステップ要求を出してコンテキストを再開する
    fn begin_step(&mut self, context: ContextId, hint: StepHint) -> std::result::Result<(), CommandError> {
        let policy = self.live_context(context)?.policy();
        let request = do_step(
            &*self.vm,
            &self.settings,
            policy,
            hint.thread(),
            hint.depth(),
            Some(&hint),
        )?;
        // do_step は既存のステップ要求をすべて削除する
        self.step_hints.clear();
        self.step_hints.insert(request, hint);
        self.suspend.resume(&*self.vm, context)?;
        Ok(())
    }

    fn step(
        &mut self,
        context: ContextId,
        depth: StepDepth,
        configure: impl FnOnce(StepHint) -> StepHint,
    ) -> std::result::Result<(), CommandError> {
        let thread = self.context_thread(context)?;
        let hint = configure(StepHint::for_thread(&*self.vm, thread, depth)?);
        self.begin_step(context, hint)
    }

    fn pause(&mut self) -> std::result::Result<Option<ContextId>, CommandError> {
        if self.suspend.is_pause_pressed() {
            debug!("already paused by the user");
            return Ok(None);
        }
        self.vm.suspend()?;
        let id = self.suspend.push_paused_context(&*self.vm, SuspendPolicy::All, None);
        on_paused(self, id);
        Ok(Some(id))
    }

    /// UI からの単一スレッドの再開
    ///
    /// 凍結されていれば凍結を解くだけです。そうでなければ、スレッドを停止させている
    /// コンテキストごとに、それがコンテキスト自身のスレッドならコンテキストを再開し、
    /// そうでなければ明示的に再開します。
    fn resume_thread(&mut self, thread: ThreadId) -> std::result::Result<(), CommandError> {
        if self.suspend.is_frozen(thread) {
            self.suspend.unfreeze_thread(&*self.vm, thread)?;
            return Ok(());
        }
        for id in self.suspend.suspending_contexts(thread) {
            let own = self.suspend.context(id).and_then(|c| c.thread()) == Some(thread);
            if own {
                self.suspend.resume(&*self.vm, id)?;
            } else {
                self.suspend.resume_thread(&*self.vm, id, thread)?;
            }
        }
        Ok(())
    }

    fn thread_summaries(&self) -> Vec<ThreadSummary> {
        self.vm
            .all_threads()
            .into_iter()
            .map(|id| ThreadSummary {
                id,
                name: self.vm.thread_name(id).unwrap_or_else(|_| "<unknown>".to_string()),
                suspended: self.suspend.is_suspended(id),
                frozen: self.suspend.is_frozen(id),
                evaluating: self.suspend.is_evaluating(id),
            })
            .collect()
    }
}

/// デバッグ対象プロセス
pub struct DebugProcess {
    manager: ManagerThread<DebuggerState>,
    vm: Arc<dyn TargetVm>,
    state: Arc<ProcessStateCell>,
    command_timeout: Duration,
}

impl DebugProcess {
    /// マネージャスレッドを起動する。イベントの受信は [`attach`](Self::attach) から
    pub fn new(vm: Arc<dyn TargetVm>, settings: DebuggerSettings) -> Self {
        let state = Arc::new(ProcessStateCell::new());
        let command_timeout = settings.command_timeout;
        let manager = ManagerThread::start(
            "koma-manager",
            DebuggerState {
                vm: Arc::clone(&vm),
                suspend: SuspendManager::new(),
                requests: RequestManager::new(),
                settings,
                step_hints: HashMap::new(),
                watchdog: InvocationWatcher::new(),
                extra_filters: Vec::new(),
                listeners: Vec::new(),
                process_state: Arc::clone(&state),
            },
        );
        Self {
            manager,
            vm,
            state,
            command_timeout,
        }
    }

    /// 接続を開始し、イベントループを起動する
    pub fn attach(&self) -> Result<()> {
        if !self.state.transition(ProcessState::Initial, ProcessState::Attached) {
            return Err(anyhow!("cannot attach in state {:?}", self.state.get()));
        }
        let threads = self.manager.invoke_and_wait_fn(Priority::High, |ctx| {
            let st = ctx.state()?;
            let threads = st.vm.all_threads();
            for t in &threads {
                st.suspend.register_thread(*t);
            }
            for listener in &st.listeners {
                listener.attached();
            }
            Ok(threads.len())
        })?;
        spawn_event_loop(Arc::clone(&self.vm), self.manager.clone())?;
        info!("attached to target with {} thread(s)", threads);
        Ok(())
    }

    pub fn manager(&self) -> &ManagerThread<DebuggerState> {
        &self.manager
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn is_attached(&self) -> bool {
        self.state.get() == ProcessState::Attached
    }

    /// 切断されるまで待つ
    pub fn wait_until_detached(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state.get() != ProcessState::Detached {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(anyhow!(ERR_NOT_ATTACHED))
        }
    }

    /// 状態に対する操作をマネージャスレッドで実行して結果を待つ
    fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DebuggerState) -> std::result::Result<T, CommandError> + Send + 'static,
    {
        self.ensure_attached()?;
        Ok(self
            .manager
            .invoke_and_wait_fn(Priority::Normal, move |ctx| f(ctx.state()?))?)
    }

    // ---- 状態の参照 ----

    pub fn is_suspended(&self, thread: ThreadId) -> Result<bool> {
        self.run(move |st| Ok(st.suspend.is_suspended(thread)))
    }

    pub fn is_frozen(&self, thread: ThreadId) -> Result<bool> {
        self.run(move |st| Ok(st.suspend.is_frozen(thread)))
    }

    /// 停止票で止まっているコンテキスト（のコピー）
    pub fn paused_contexts(&self) -> Result<Vec<SuspendContext>> {
        self.run(|st| Ok(st.suspend.paused_contexts().into_iter().cloned().collect()))
    }

    pub fn context(&self, id: ContextId) -> Result<Option<SuspendContext>> {
        self.run(move |st| Ok(st.suspend.context(id).cloned()))
    }

    pub fn threads(&self) -> Result<Vec<ThreadSummary>> {
        self.run(|st| Ok(st.thread_summaries()))
    }

    /// レジストリの状態をテキストで返す
    pub fn dump(&self) -> Result<String> {
        self.run(|st| Ok(st.suspend.dump()))
    }

    // ---- 実行制御 ----

    pub fn resume(&self, context: ContextId) -> Result<()> {
        self.run(move |st| {
            st.live_context(context)?;
            st.suspend.resume(&*st.vm, context)?;
            Ok(())
        })
    }

    /// ステップイン。`method_filter` を指定するとその呼び出しまで進む
    pub fn step_into(
        &self,
        context: ContextId,
        ignore_filters: bool,
        method_filter: Option<MethodFilter>,
    ) -> Result<()> {
        self.run(move |st| {
            st.step(context, StepDepth::Into, |mut hint| {
                hint.set_ignore_filters(ignore_filters);
                match method_filter {
                    Some(filter) => hint.with_method_filter(filter),
                    None => hint,
                }
            })
        })
    }

    /// ステップオーバー。`ignore_breakpoints` ならステップが止まるまで
    /// ブレークポイントをミュートする
    pub fn step_over(&self, context: ContextId, ignore_breakpoints: bool) -> Result<()> {
        self.run(move |st| {
            if ignore_breakpoints {
                st.requests.set_muted(true);
            }
            st.step(context, StepDepth::Over, |mut hint| {
                hint.set_restore_breakpoints(ignore_breakpoints);
                hint
            })
        })
    }

    pub fn step_out(&self, context: ContextId) -> Result<()> {
        self.run(move |st| st.step(context, StepDepth::Out, |hint| hint))
    }

    /// 指定位置まで実行する
    pub fn run_to_cursor(
        &self,
        context: ContextId,
        position: SourcePosition,
        ignore_breakpoints: bool,
    ) -> Result<()> {
        self.run(move |st| {
            st.live_context(context)?;
            st.requests.set_run_to_cursor(&*st.vm, position, ignore_breakpoints)?;
            if ignore_breakpoints {
                st.requests.set_muted(true);
            }
            st.suspend.resume(&*st.vm, context)?;
            Ok(())
        })
    }

    /// プロセス全体を一時停止する。既にユーザーが一時停止していれば `None`
    pub fn pause(&self) -> Result<Option<ContextId>> {
        self.run(|st| st.pause())
    }

    pub fn resume_thread(&self, thread: ThreadId) -> Result<()> {
        self.run(move |st| st.resume_thread(thread))
    }

    pub fn freeze_thread(&self, thread: ThreadId) -> Result<()> {
        self.run(move |st| Ok(st.suspend.freeze_thread(&*st.vm, thread)?))
    }

    pub fn unfreeze_thread(&self, thread: ThreadId) -> Result<()> {
        self.run(move |st| Ok(st.suspend.unfreeze_thread(&*st.vm, thread)?))
    }

    /// 全体停止のコンテキスト内で1スレッドだけを再開する
    pub fn explicit_resume(&self, context: ContextId, thread: ThreadId) -> Result<()> {
        self.run(move |st| Ok(st.suspend.resume_thread(&*st.vm, context, thread)?))
    }

    pub fn explicit_suspend(&self, context: ContextId, thread: ThreadId) -> Result<()> {
        self.run(move |st| Ok(st.suspend.suspend_thread(&*st.vm, context, thread)?))
    }

    // ---- 評価 ----

    /// コンテキストのスレッドでメソッドを呼び出し、結果を待つ
    pub fn evaluate(
        &self,
        context: ContextId,
        method: MethodRef,
        args: Vec<Value>,
    ) -> std::result::Result<Value, EvaluateError> {
        if !self.is_attached() {
            return Err(EvaluateError::Disconnected);
        }
        if is_manager_thread() {
            error!("evaluate called from the manager thread");
            return Err(EvaluateError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        self.manager.schedule_fn(Priority::Normal, "evaluate", move |ctx| {
            start_evaluation(ctx, context, method, args, tx)
        });
        rx.blocking_recv().unwrap_or(Err(EvaluateError::Cancelled))
    }

    // ---- 要求 ----

    pub fn add_breakpoint(&self, position: SourcePosition, suspend_policy: SuspendPolicy) -> Result<BreakpointId> {
        self.run(move |st| Ok(st.requests.add_breakpoint(&*st.vm, position, suspend_policy)?))
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<bool> {
        self.run(move |st| Ok(st.requests.remove_breakpoint(&*st.vm, id)?))
    }

    pub fn set_breakpoint_enabled(&self, id: BreakpointId, enabled: bool) -> Result<bool> {
        self.run(move |st| Ok(st.requests.set_breakpoint_enabled(id, enabled)))
    }

    pub fn breakpoints(&self) -> Result<Vec<Breakpoint>> {
        self.run(|st| Ok(st.requests.all().into_iter().cloned().collect()))
    }

    pub fn add_requestor(
        &self,
        position: SourcePosition,
        suspend_policy: SuspendPolicy,
        requestor: Box<dyn Requestor>,
    ) -> Result<RequestId> {
        self.run(move |st| Ok(st.requests.add_requestor(&*st.vm, &position, suspend_policy, requestor)?))
    }

    /// 要求に一度だけのハンドラを付ける
    pub fn add_one_shot<F>(&self, request: RequestId, handler: F) -> Result<()>
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        self.run(move |st| {
            st.requests.add_one_shot(request, handler);
            Ok(())
        })
    }

    pub fn add_class_prepare_watcher<F>(&self, pattern: &str, callback: F) -> Result<WatcherId>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let pattern = pattern.to_string();
        self.run(move |st| Ok(st.requests.add_class_prepare_watcher(&pattern, callback)?))
    }

    pub fn set_breakpoints_muted(&self, muted: bool) -> Result<()> {
        self.run(move |st| {
            st.requests.set_muted(muted);
            Ok(())
        })
    }

    // ---- リスナーと設定 ----

    pub fn add_suspend_listener(&self, listener: Arc<dyn SuspendListener>) -> Result<()> {
        self.configure(move |st| st.suspend.add_listener(listener))
    }

    pub fn add_listener(&self, listener: Arc<dyn DebugProcessListener>) -> Result<()> {
        self.configure(move |st| st.listeners.push(listener))
    }

    pub fn add_extra_filter(&self, filter: Arc<dyn ExtraSteppingFilter>) -> Result<()> {
        self.configure(move |st| st.extra_filters.push(filter))
    }

    /// 接続前でも使える設定変更
    fn configure<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut DebuggerState) + Send + 'static,
    {
        if self.state.get() == ProcessState::Detached {
            return Err(anyhow!(ERR_NOT_ATTACHED));
        }
        Ok(self.manager.invoke_and_wait_fn(Priority::High, move |ctx| {
            f(ctx.state()?);
            Ok(())
        })?)
    }

    // ---- 停止 ----

    /// デバッグを終了する
    ///
    /// `force` ならターゲットを終了させ、そうでなければ再開して接続を破棄します。
    /// 実行中のコマンドが `command_timeout` 以内に終わらない場合はワーカーを
    /// 置き換えてから実行します。
    pub fn stop(&self, force: bool) -> Result<()> {
        if !self.state.transition(ProcessState::Attached, ProcessState::Detaching) {
            return Err(anyhow!(ERR_NOT_ATTACHED));
        }
        let vm = Arc::clone(&self.vm);
        let state = Arc::clone(&self.state);
        self.manager.terminate_and_invoke(
            command(Priority::High, "stop", move |ctx| {
                let result = if force {
                    vm.exit(-1)
                } else {
                    vm.resume().and_then(|()| vm.dispose())
                };
                if let Err(e) = result {
                    debug!("stop: {}", e);
                }
                if ctx.state().is_ok() {
                    teardown(ctx)
                } else {
                    // 状態は置き換え前のワーカーにある
                    state.set(ProcessState::Detached);
                    ctx.manager().close();
                    Ok(())
                }
            }),
            self.command_timeout,
        );
        Ok(())
    }
}

impl Drop for DebugProcess {
    fn drop(&mut self) {
        self.manager.close();
    }
}
