//! サスペンドレジストリ
//!
//! どのスレッドが、どのサスペンドコンテキストによって停止しているかを管理します。
//! スレッドはアリーナ（`ThreadId` をキーとするマップ）で保持し、コンテキストは
//! スレッドIDの集合だけを持ちます。
//!
//! レジストリはマネージャスレッドが所有し、コマンドからのみ変更されます。

use crate::errors::SuspendError;
use koma_target::{EventSet, SuspendPolicy, TargetError, TargetVm, ThreadId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, error};

/// サスペンドコンテキストID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// レジストリが把握しているターゲットスレッド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionThread {
    pub id: ThreadId,
    /// コンテキストと無関係に停止させられている
    pub frozen: bool,
    /// このスレッドで評価が進行中
    pub evaluating: bool,
}

/// 投票の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResolution {
    /// まだ票が残っている
    Pending,
    /// 全員が再開に投票した。呼び出し側が `resume` をスケジュールする
    Resume,
    /// 停止票があった。コンテキストは paused に移った
    Paused,
}

/// サスペンドコンテキスト
///
/// イベントセットごと、または明示的な一時停止ごとに作られます。
/// 生存中（投票・変更が可能）か再開済み（破棄される直前）のどちらかです。
#[derive(Debug, Clone)]
pub struct SuspendContext {
    id: ContextId,
    policy: SuspendPolicy,
    thread: Option<ThreadId>,
    votes: u32,
    suspend_voted: bool,
    event_set: Option<EventSet>,
    explicitly_resumed: BTreeSet<ThreadId>,
    not_executable: BTreeSet<ThreadId>,
    evaluating: Option<ThreadId>,
    paused_by_user: bool,
    relaxed: bool,
    resumed: bool,
}

impl SuspendContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    /// コンテキストのスレッド（イベントスレッド）
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn votes_left(&self) -> u32 {
        self.votes
    }

    pub fn event_set(&self) -> Option<&EventSet> {
        self.event_set.as_ref()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn is_paused_by_user(&self) -> bool {
        self.paused_by_user
    }

    /// 評価中のスレッド
    pub fn evaluation_thread(&self) -> Option<ThreadId> {
        self.evaluating
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating.is_some()
    }

    pub fn is_explicitly_resumed(&self, thread: ThreadId) -> bool {
        self.explicitly_resumed.contains(&thread)
    }

    pub fn explicitly_resumed(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.explicitly_resumed.iter().copied()
    }

    /// 評価に失敗し、このコンテキストでは実行できないとマークされたか
    pub fn is_not_executable(&self, thread: ThreadId) -> bool {
        self.not_executable.contains(&thread)
    }

    /// ウォッチドッグによって一時的に全体停止が緩められているか
    pub fn is_relaxed(&self) -> bool {
        self.relaxed
    }

    fn covers(&self, thread: ThreadId) -> bool {
        match self.policy {
            SuspendPolicy::All => true,
            SuspendPolicy::EventThread => self.thread == Some(thread),
            SuspendPolicy::None => false,
        }
    }

    /// このコンテキストが `thread` を停止させているか
    pub fn suspends(&self, thread: ThreadId) -> bool {
        if self.resumed {
            return false;
        }
        if self.relaxed && self.evaluating != Some(thread) {
            return false;
        }
        self.covers(thread) && !self.explicitly_resumed.contains(&thread)
    }
}

impl fmt::Display for SuspendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} policy={:?}", self.id, self.policy)?;
        if let Some(t) = self.thread {
            write!(f, " thread={}", t)?;
        }
        write!(f, " votes={}", self.votes)?;
        if self.suspend_voted {
            write!(f, " suspend-voted")?;
        }
        if !self.explicitly_resumed.is_empty() {
            let ids: Vec<String> = self.explicitly_resumed.iter().map(|t| t.to_string()).collect();
            write!(f, " explicitly-resumed=[{}]", ids.join(", "))?;
        }
        if let Some(t) = self.evaluating {
            write!(f, " evaluating={}", t)?;
        }
        if self.relaxed {
            write!(f, " relaxed")?;
        }
        Ok(())
    }
}

/// 評価の前に `prepare_for_resume` が退避した状態
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeData {
    thread: Option<ThreadId>,
    was_frozen: bool,
    resumed_threads: BTreeSet<ThreadId>,
}

/// サスペンド状態の変化を受け取るリスナー
pub trait SuspendListener: Send + Sync {
    fn paused(&self, _context: &SuspendContext) {}

    fn resumed(&self, _context: &SuspendContext) {}
}

/// サスペンドレジストリ
#[derive(Default)]
pub struct SuspendManager {
    threads: BTreeMap<ThreadId, ExecutionThread>,
    /// 生存中のコンテキスト（作成順）
    contexts: Vec<SuspendContext>,
    /// 停止票で止まっているコンテキスト
    paused: Vec<ContextId>,
    next_id: u64,
    listeners: Vec<Arc<dyn SuspendListener>>,
}

impl SuspendManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn SuspendListener>) {
        self.listeners.push(listener);
    }

    // ---- スレッドアリーナ ----

    /// スレッドを登録する（登録済みなら何もしない）
    pub fn register_thread(&mut self, thread: ThreadId) -> &mut ExecutionThread {
        self.threads.entry(thread).or_insert(ExecutionThread {
            id: thread,
            frozen: false,
            evaluating: false,
        })
    }

    /// 消滅したスレッドを全ての集合から取り除く
    pub fn remove_thread(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
        for ctx in &mut self.contexts {
            ctx.explicitly_resumed.remove(&thread);
            ctx.not_executable.remove(&thread);
        }
        debug!("thread {} removed from suspend registry", thread);
    }

    pub fn thread(&self, thread: ThreadId) -> Option<&ExecutionThread> {
        self.threads.get(&thread)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ExecutionThread> {
        self.threads.values()
    }

    // ---- コンテキスト ----

    fn allocate_id(&mut self) -> ContextId {
        self.next_id += 1;
        ContextId(self.next_id)
    }

    fn missing(&self, id: ContextId) -> SuspendError {
        if id.0 >= 1 && id.0 <= self.next_id {
            SuspendError::ContextNotLive
        } else {
            SuspendError::UnknownContext
        }
    }

    pub fn context(&self, id: ContextId) -> Option<&SuspendContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    fn live_mut(&mut self, id: ContextId) -> Result<&mut SuspendContext, SuspendError> {
        let err = self.missing(id);
        self.contexts.iter_mut().find(|c| c.id == id).ok_or(err)
    }

    fn index_of(&self, id: ContextId) -> Result<usize, SuspendError> {
        self.contexts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| self.missing(id))
    }

    /// 生存中の全コンテキスト
    pub fn event_contexts(&self) -> impl Iterator<Item = &SuspendContext> {
        self.contexts.iter()
    }

    /// 停止票で止まっているコンテキスト
    pub fn paused_contexts(&self) -> Vec<&SuspendContext> {
        self.paused
            .iter()
            .filter_map(|id| self.context(*id))
            .collect()
    }

    pub fn is_paused(&self, id: ContextId) -> bool {
        self.paused.contains(&id)
    }

    /// ユーザーの一時停止で止まっているか
    pub fn is_pause_pressed(&self) -> bool {
        self.contexts.iter().any(|c| c.paused_by_user)
    }

    /// `thread` を停止させている生存中のコンテキスト
    pub fn suspending_contexts(&self, thread: ThreadId) -> Vec<ContextId> {
        self.contexts
            .iter()
            .filter(|c| c.suspends(thread))
            .map(|c| c.id)
            .collect()
    }

    /// 新しいコンテキストを登録する
    ///
    /// 全体停止のコンテキストを積む前に、生存中のスレッド単位のコンテキストを
    /// 再開して全体停止に切り替えます。
    pub fn push_context(
        &mut self,
        vm: &dyn TargetVm,
        policy: SuspendPolicy,
        votes: u32,
        thread: Option<ThreadId>,
    ) -> ContextId {
        self.push(vm, policy, votes, thread, None)
    }

    /// イベントセットからコンテキストを作成する。票数はイベント数
    pub fn push_event_context(&mut self, vm: &dyn TargetVm, set: EventSet) -> ContextId {
        let policy = set.suspend_policy;
        let votes = set.len() as u32;
        let thread = set.thread();
        self.push(vm, policy, votes, thread, Some(set))
    }

    fn push(
        &mut self,
        vm: &dyn TargetVm,
        policy: SuspendPolicy,
        votes: u32,
        thread: Option<ThreadId>,
        event_set: Option<EventSet>,
    ) -> ContextId {
        if policy == SuspendPolicy::All {
            self.switch_to_suspend_all(vm);
            if self.contexts.iter().any(|c| c.policy == SuspendPolicy::All) {
                error!(
                    state = %self.dump(),
                    "pushing a second live whole-process suspend context"
                );
            }
        }
        if let Some(t) = thread {
            self.register_thread(t);
        }
        let id = self.allocate_id();
        self.contexts.push(SuspendContext {
            id,
            policy,
            thread,
            votes,
            suspend_voted: false,
            event_set,
            explicitly_resumed: BTreeSet::new(),
            not_executable: BTreeSet::new(),
            evaluating: None,
            paused_by_user: false,
            relaxed: false,
            resumed: false,
        });
        debug!("pushed suspend context {} ({:?}, {} vote(s))", id, policy, votes);
        id
    }

    /// 生存中のスレッド単位コンテキストを解消する
    ///
    /// スレッドは新しい全体停止コンテキストによって停止したままになります。
    fn switch_to_suspend_all(&mut self, vm: &dyn TargetVm) {
        let stale: Vec<ContextId> = self
            .contexts
            .iter()
            .filter(|c| c.policy == SuspendPolicy::EventThread)
            .map(|c| c.id)
            .collect();
        for id in stale {
            debug!("switching {} to the whole-process suspend", id);
            if let Err(e) = self.resume(vm, id) {
                debug!("failed to resolve {}: {}", id, e);
            }
        }
    }

    /// 停止状態で作られるコンテキスト（一時停止コマンド）を登録する
    pub fn push_paused_context(
        &mut self,
        vm: &dyn TargetVm,
        policy: SuspendPolicy,
        thread: Option<ThreadId>,
    ) -> ContextId {
        let id = self.push(vm, policy, 0, thread, None);
        if let Ok(ctx) = self.live_mut(id) {
            ctx.suspend_voted = true;
            ctx.paused_by_user = true;
        }
        self.enter_paused(id);
        id
    }

    fn enter_paused(&mut self, id: ContextId) {
        self.paused.push(id);
        debug!("{} paused", id);
        if let Some(ctx) = self.context(id) {
            for listener in &self.listeners {
                listener.paused(ctx);
            }
        }
    }

    fn cast_vote(&mut self, id: ContextId, suspend: bool) -> Result<VoteResolution, SuspendError> {
        let ctx = match self.live_mut(id) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(state = %self.dump(), "vote on {} which is not live", id);
                return Err(e);
            }
        };
        if ctx.votes == 0 {
            error!(state = %self.dump(), "extra vote on {}", id);
            return Err(SuspendError::ContextNotLive);
        }
        ctx.votes -= 1;
        ctx.suspend_voted |= suspend;
        if ctx.votes > 0 {
            return Ok(VoteResolution::Pending);
        }
        if ctx.suspend_voted {
            self.enter_paused(id);
            Ok(VoteResolution::Paused)
        } else {
            debug!("{} voted to resume", id);
            Ok(VoteResolution::Resume)
        }
    }

    /// 再開に投票する
    pub fn vote_resume(&mut self, id: ContextId) -> Result<VoteResolution, SuspendError> {
        self.cast_vote(id, false)
    }

    /// 停止に投票する
    pub fn vote_suspend(&mut self, id: ContextId) -> Result<VoteResolution, SuspendError> {
        self.cast_vote(id, true)
    }

    /// コンテキストを再開して破棄する
    ///
    /// 明示的に再開されていたスレッドを一つずつ停止し直してから、ポリシーに応じた
    /// 再開を行います。サスペンドはカウンタなので、この順序で元の状態に戻ります。
    pub fn resume(&mut self, vm: &dyn TargetVm, id: ContextId) -> Result<SuspendContext, SuspendError> {
        let index = match self.index_of(id) {
            Ok(i) => i,
            Err(e) => {
                error!(state = %self.dump(), "resume of {} which is not live", id);
                return Err(e);
            }
        };

        let mut ctx = self.contexts.remove(index);
        self.paused.retain(|p| *p != id);
        ctx.resumed = true;

        let mut result: Result<(), TargetError> = Ok(());
        for t in std::mem::take(&mut ctx.explicitly_resumed) {
            if let Err(e) = vm.suspend_thread(t) {
                result = result.and(Err(e));
            }
        }
        let resumed = match ctx.policy {
            SuspendPolicy::All => vm.resume(),
            SuspendPolicy::EventThread => match ctx.thread {
                Some(t) => vm.resume_thread(t),
                None => Ok(()),
            },
            SuspendPolicy::None => Ok(()),
        };
        result = result.and(resumed);
        debug!("{} resumed", id);

        for listener in &self.listeners {
            listener.resumed(&ctx);
        }
        match result {
            Ok(()) | Err(TargetError::InvalidThread(_)) => Ok(ctx),
            Err(e) => Err(e.into()),
        }
    }

    /// コンテキスト内で1スレッドだけを明示的に再開する
    ///
    /// 全体停止のコンテキストだけが対象です。
    pub fn resume_thread(
        &mut self,
        vm: &dyn TargetVm,
        id: ContextId,
        thread: ThreadId,
    ) -> Result<(), SuspendError> {
        let check = match self.context(id) {
            None => Err(self.missing(id)),
            Some(ctx) if ctx.policy != SuspendPolicy::All || !ctx.covers(thread) => {
                Err(SuspendError::NotWholeProcess)
            }
            Some(ctx) if ctx.thread == Some(thread) => Err(SuspendError::BreakpointThread),
            Some(ctx) if ctx.explicitly_resumed.contains(&thread) => {
                Err(SuspendError::AlreadyExplicitlyResumed)
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = check {
            error!(state = %self.dump(), "cannot explicitly resume {} in {}: {}", thread, id, e);
            return Err(e);
        }
        self.register_thread(thread);
        self.live_mut(id)?.explicitly_resumed.insert(thread);
        vm.resume_thread(thread)?;
        debug!("{} explicitly resumed in {}", thread, id);
        Ok(())
    }

    /// 明示的に再開したスレッドを停止し直す
    pub fn suspend_thread(
        &mut self,
        vm: &dyn TargetVm,
        id: ContextId,
        thread: ThreadId,
    ) -> Result<(), SuspendError> {
        let check = match self.context(id) {
            None => Err(self.missing(id)),
            Some(ctx) if !ctx.explicitly_resumed.contains(&thread) => {
                Err(SuspendError::NotExplicitlyResumed)
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = check {
            error!(state = %self.dump(), "cannot re-suspend {} in {}: {}", thread, id, e);
            return Err(e);
        }
        self.live_mut(id)?.explicitly_resumed.remove(&thread);
        vm.suspend_thread(thread)?;
        debug!("{} re-suspended in {}", thread, id);
        Ok(())
    }

    // ---- 凍結 ----

    pub fn is_frozen(&self, thread: ThreadId) -> bool {
        self.threads.get(&thread).map(|t| t.frozen).unwrap_or(false)
    }

    /// スレッドを凍結する。凍結済みなら何もしない
    pub fn freeze_thread(&mut self, vm: &dyn TargetVm, thread: ThreadId) -> Result<(), TargetError> {
        if self.is_frozen(thread) {
            return Ok(());
        }
        vm.suspend_thread(thread)?;
        self.register_thread(thread).frozen = true;
        debug!("{} frozen", thread);
        Ok(())
    }

    /// 凍結を解除する。凍結されていなければ何もしない
    pub fn unfreeze_thread(&mut self, vm: &dyn TargetVm, thread: ThreadId) -> Result<(), TargetError> {
        if !self.is_frozen(thread) {
            return Ok(());
        }
        self.register_thread(thread).frozen = false;
        vm.resume_thread(thread)?;
        debug!("{} unfrozen", thread);
        Ok(())
    }

    /// スレッドが停止しているとみなされるか
    ///
    /// 凍結されているか、生存中のいずれかのコンテキストが（明示的な再開なしに）
    /// 停止させている場合に true です。
    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.is_frozen(thread) || self.contexts.iter().any(|c| c.suspends(thread))
    }

    /// スレッドを停止させている理由の数（凍結 + コンテキスト）
    pub fn suspend_count(&self, thread: ThreadId) -> usize {
        let frozen = usize::from(self.is_frozen(thread));
        frozen + self.contexts.iter().filter(|c| c.suspends(thread)).count()
    }

    // ---- 評価 ----

    /// スレッドで評価が進行中か
    pub fn is_evaluating(&self, thread: ThreadId) -> bool {
        self.threads.get(&thread).map(|t| t.evaluating).unwrap_or(false)
    }

    pub(crate) fn set_evaluating(&mut self, id: ContextId, thread: ThreadId, evaluating: bool) {
        self.register_thread(thread).evaluating = evaluating;
        if let Ok(ctx) = self.live_mut(id) {
            ctx.evaluating = evaluating.then_some(thread);
        }
    }

    pub(crate) fn mark_not_executable(&mut self, id: ContextId, thread: ThreadId) {
        if let Ok(ctx) = self.live_mut(id) {
            ctx.not_executable.insert(thread);
        }
    }

    pub(crate) fn set_relaxed(&mut self, id: ContextId, relaxed: bool) -> bool {
        match self.live_mut(id) {
            Ok(ctx) => {
                ctx.relaxed = relaxed;
                true
            }
            Err(_) => false,
        }
    }

    /// 評価の前に、コンテキストのスレッドの凍結を解き、明示的に再開されていた
    /// スレッドを一時的に停止する
    pub fn prepare_for_resume(
        &mut self,
        vm: &dyn TargetVm,
        id: ContextId,
    ) -> Result<ResumeData, SuspendError> {
        let thread = self.context(id).ok_or_else(|| self.missing(id))?.thread;
        let was_frozen = thread.map(|t| self.is_frozen(t)).unwrap_or(false);
        if let (true, Some(t)) = (was_frozen, thread) {
            self.unfreeze_thread(vm, t)?;
        }
        let resumed_threads = std::mem::take(&mut self.live_mut(id)?.explicitly_resumed);
        for t in &resumed_threads {
            vm.suspend_thread(*t)?;
        }
        Ok(ResumeData {
            thread,
            was_frozen,
            resumed_threads,
        })
    }

    /// `prepare_for_resume` の逆を行う
    pub fn restore_after_resume(
        &mut self,
        vm: &dyn TargetVm,
        id: ContextId,
        data: ResumeData,
    ) -> Result<(), SuspendError> {
        if let (true, Some(t)) = (data.was_frozen, data.thread) {
            self.freeze_thread(vm, t)?;
        }
        if self.context(id).is_none() {
            debug!("{} disposed during evaluation; explicit resumes dropped", id);
            return Ok(());
        }
        for t in &data.resumed_threads {
            vm.resume_thread(*t)?;
        }
        self.live_mut(id)?.explicitly_resumed = data.resumed_threads;
        Ok(())
    }

    // ---- 破棄 ----

    /// 接続断での後始末。全てのコンテキストをターゲットに触れずに破棄する
    pub fn dispose_all(&mut self) -> usize {
        let disposed = self.contexts.len();
        for mut ctx in std::mem::take(&mut self.contexts) {
            ctx.resumed = true;
            for listener in &self.listeners {
                listener.resumed(&ctx);
            }
        }
        self.paused.clear();
        self.threads.clear();
        disposed
    }

    /// 診断用のレジストリ状態
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "suspend contexts: {}", self.contexts.len());
        for ctx in &self.contexts {
            let marker = if self.paused.contains(&ctx.id) { "paused" } else { "live" };
            let _ = writeln!(out, "  [{}] {}", marker, ctx);
        }
        let frozen: Vec<String> = self
            .threads
            .values()
            .filter(|t| t.frozen)
            .map(|t| t.id.to_string())
            .collect();
        let _ = write!(out, "frozen: [{}]", frozen.join(", "));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use koma_target::{Event, SimulatedVm};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        paused: Mutex<Vec<ContextId>>,
        resumed: Mutex<Vec<ContextId>>,
    }

    impl SuspendListener for Recorder {
        fn paused(&self, context: &SuspendContext) {
            self.paused.lock().unwrap().push(context.id());
        }

        fn resumed(&self, context: &SuspendContext) {
            self.resumed.lock().unwrap().push(context.id());
        }
    }

    fn setup(n: usize) -> (SimulatedVm, Vec<ThreadId>, SuspendManager) {
        let vm = SimulatedVm::new();
        let threads = (0..n).map(|i| vm.add_thread(&format!("t{}", i))).collect();
        (vm, threads, SuspendManager::new())
    }

    #[test]
    fn test_all_resume_votes_resolve_to_resume() {
        let (vm, t, mut sm) = setup(1);
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 3, Some(t[0]));
        assert_eq!(sm.vote_resume(ctx), Ok(VoteResolution::Pending));
        assert_eq!(sm.vote_resume(ctx), Ok(VoteResolution::Pending));
        assert_eq!(sm.vote_resume(ctx), Ok(VoteResolution::Resume));
        assert!(sm.paused_contexts().is_empty());
        // 解決後の余分な票は拒否される
        assert_eq!(sm.vote_resume(ctx), Err(SuspendError::ContextNotLive));
    }

    #[test]
    fn test_single_suspend_vote_pauses_once() {
        let (vm, t, mut sm) = setup(1);
        let recorder = Arc::new(Recorder::default());
        sm.add_listener(recorder.clone());

        let ctx = sm.push_context(&vm, SuspendPolicy::All, 3, Some(t[0]));
        assert_eq!(sm.vote_resume(ctx), Ok(VoteResolution::Pending));
        assert_eq!(sm.vote_suspend(ctx), Ok(VoteResolution::Pending));
        assert_eq!(sm.vote_resume(ctx), Ok(VoteResolution::Paused));

        assert_eq!(*recorder.paused.lock().unwrap(), vec![ctx]);
        assert_eq!(sm.paused_contexts().len(), 1);
        assert!(sm.is_suspended(t[0]));
    }

    #[test]
    fn test_resume_resuspends_explicitly_resumed_threads() {
        let (vm, t, mut sm) = setup(3);
        vm.suspend().unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 0, Some(t[0]));

        sm.resume_thread(&vm, ctx, t[1]).unwrap();
        assert!(!sm.is_suspended(t[1]));
        assert!(vm.is_running(t[1]));
        assert!(sm.is_suspended(t[2]));

        let disposed = sm.resume(&vm, ctx).unwrap();
        assert!(disposed.is_resumed());
        assert_eq!(disposed.explicitly_resumed().count(), 0);
        for thread in &t {
            assert!(!sm.is_suspended(*thread));
            assert_eq!(vm.suspend_count(*thread).unwrap(), 0);
        }
        assert_eq!(sm.resume(&vm, ctx).map(|_| ()), Err(SuspendError::ContextNotLive));
    }

    #[test]
    fn test_resume_leaves_other_live_context_in_effect() {
        let (vm, t, mut sm) = setup(2);
        vm.suspend().unwrap();
        let outer = sm.push_context(&vm, SuspendPolicy::All, 0, Some(t[0]));
        sm.resume_thread(&vm, outer, t[1]).unwrap();

        vm.suspend_thread(t[1]).unwrap();
        let inner = sm.push_context(&vm, SuspendPolicy::EventThread, 0, Some(t[1]));
        assert!(sm.is_suspended(t[1]));

        sm.resume(&vm, inner).unwrap();
        assert!(!sm.is_suspended(t[1]));
        assert!(sm.is_suspended(t[0]));
        assert!(vm.is_running(t[1]));
    }

    #[test]
    fn test_explicit_resume_ordering_is_checked() {
        let (vm, t, mut sm) = setup(2);
        vm.suspend().unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 0, Some(t[0]));

        assert_eq!(sm.suspend_thread(&vm, ctx, t[1]), Err(SuspendError::NotExplicitlyResumed));
        assert_eq!(sm.resume_thread(&vm, ctx, t[0]), Err(SuspendError::BreakpointThread));
        sm.resume_thread(&vm, ctx, t[1]).unwrap();
        assert_eq!(
            sm.resume_thread(&vm, ctx, t[1]),
            Err(SuspendError::AlreadyExplicitlyResumed)
        );
        sm.suspend_thread(&vm, ctx, t[1]).unwrap();
        assert!(sm.is_suspended(t[1]));
        assert!(!vm.is_running(t[1]));
    }

    #[test]
    fn test_explicit_resume_needs_whole_process_context() {
        let (vm, t, mut sm) = setup(2);
        vm.suspend_thread(t[0]).unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::EventThread, 0, Some(t[0]));
        sm.freeze_thread(&vm, t[1]).unwrap();

        assert_eq!(sm.resume_thread(&vm, ctx, t[1]), Err(SuspendError::NotWholeProcess));
        assert!(sm.is_suspended(t[1]));
        assert!(!vm.is_running(t[1]));
        assert!(!sm.context(ctx).unwrap().is_explicitly_resumed(t[1]));
    }

    #[test]
    fn test_freeze_overrides_context_state() {
        let (vm, t, mut sm) = setup(1);
        sm.freeze_thread(&vm, t[0]).unwrap();
        sm.freeze_thread(&vm, t[0]).unwrap();
        assert_eq!(vm.suspend_count(t[0]).unwrap(), 1);
        assert!(sm.is_suspended(t[0]));

        vm.suspend().unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 0, None);
        sm.resume(&vm, ctx).unwrap();
        assert!(sm.is_suspended(t[0]));
        assert!(!vm.is_running(t[0]));

        sm.unfreeze_thread(&vm, t[0]).unwrap();
        sm.unfreeze_thread(&vm, t[0]).unwrap();
        assert!(!sm.is_suspended(t[0]));
        assert!(vm.is_running(t[0]));
    }

    #[test]
    fn test_whole_process_context_switches_thread_contexts() {
        let (vm, t, mut sm) = setup(2);
        let recorder = Arc::new(Recorder::default());
        sm.add_listener(recorder.clone());

        vm.post(EventSet::new(
            SuspendPolicy::EventThread,
            vec![Event::ThreadStart { thread: t[0] }],
        ));
        let set = vm.next_event_set().unwrap();
        let single = sm.push_event_context(&vm, set);
        assert_eq!(sm.vote_suspend(single), Ok(VoteResolution::Paused));

        vm.post(EventSet::new(
            SuspendPolicy::All,
            vec![Event::ThreadStart { thread: t[1] }],
        ));
        let set = vm.next_event_set().unwrap();
        let all = sm.push_event_context(&vm, set);

        assert!(sm.context(single).is_none());
        assert_eq!(*recorder.resumed.lock().unwrap(), vec![single]);
        assert_eq!(vm.suspend_count(t[0]).unwrap(), 1);
        assert_eq!(sm.suspending_contexts(t[0]), vec![all]);
    }

    #[test]
    fn test_prepare_and_restore_around_evaluation() {
        let (vm, t, mut sm) = setup(2);
        vm.suspend().unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 0, Some(t[0]));
        sm.resume_thread(&vm, ctx, t[1]).unwrap();
        sm.freeze_thread(&vm, t[0]).unwrap();

        let data = sm.prepare_for_resume(&vm, ctx).unwrap();
        assert!(!sm.is_frozen(t[0]));
        assert!(!vm.is_running(t[1]));
        assert!(!sm.context(ctx).unwrap().is_explicitly_resumed(t[1]));

        sm.restore_after_resume(&vm, ctx, data).unwrap();
        assert!(sm.is_frozen(t[0]));
        assert!(vm.is_running(t[1]));
        assert!(sm.context(ctx).unwrap().is_explicitly_resumed(t[1]));
    }

    #[test]
    fn test_thread_death_clears_sets() {
        let (vm, t, mut sm) = setup(2);
        vm.suspend().unwrap();
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 0, Some(t[0]));
        sm.resume_thread(&vm, ctx, t[1]).unwrap();
        sm.mark_not_executable(ctx, t[1]);

        sm.remove_thread(t[1]);
        let c = sm.context(ctx).unwrap();
        assert!(!c.is_explicitly_resumed(t[1]));
        assert!(!c.is_not_executable(t[1]));
        assert!(sm.thread(t[1]).is_none());
    }

    #[test]
    fn test_dispose_all_and_dump() {
        let (vm, t, mut sm) = setup(1);
        let ctx = sm.push_context(&vm, SuspendPolicy::All, 1, Some(t[0]));
        sm.vote_suspend(ctx).unwrap();
        let dump = sm.dump();
        assert!(dump.contains("[paused] ctx#1 policy=All thread=thread#1"));

        assert_eq!(sm.dispose_all(), 1);
        assert!(sm.paused_contexts().is_empty());
        assert!(!sm.is_suspended(t[0]));
    }
}
