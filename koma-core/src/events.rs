//! イベントループ
//!
//! 専用スレッドでターゲットからイベントセットを受け取り、`High` 優先度のコマンドとして
//! マネージャに渡します。イベントセットはマネージャスレッド上でサスペンドコンテキストに
//! まとめられ、各イベントのハンドラがちょうど1票ずつ投票します。

use crate::errors::CommandError;
use crate::manager::{ManagerContext, ManagerThread, Priority};
use crate::process::{DebuggerState, ProcessState};
use crate::requests::Vote;
use crate::stepping::{delete_step_requests, do_step, StepDecision, StepFilters, StepHint};
use crate::suspend::{ContextId, VoteResolution};
use koma_target::{
    Event, EventSet, LocatableKind, Location, RequestId, StepDepth, SuspendPolicy, TargetError,
    TargetVm, ThreadId,
};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// イベントループのスレッドを起動する
pub(crate) fn spawn_event_loop(
    vm: Arc<dyn TargetVm>,
    manager: ManagerThread<DebuggerState>,
) -> crate::Result<()> {
    thread::Builder::new()
        .name("koma-events".to_string())
        .spawn(move || run_event_loop(&*vm, &manager))?;
    Ok(())
}

fn run_event_loop(vm: &dyn TargetVm, manager: &ManagerThread<DebuggerState>) {
    debug!("event loop started");
    loop {
        match vm.next_event_set() {
            Ok(set) => {
                debug!("received {} event(s) ({:?})", set.len(), set.suspend_policy);
                let scheduled = manager.schedule_fn(Priority::High, "event-set", move |ctx| {
                    process_event_set(ctx, set)
                });
                if !scheduled {
                    debug!("manager closed; event loop exits");
                    break;
                }
            }
            Err(TargetError::Disconnected) => {
                info!("target disconnected");
                manager.schedule_fn(Priority::High, "disconnect", teardown);
                break;
            }
            Err(e) => warn!("failed to read events: {}", e),
        }
    }
    debug!("event loop stopped");
}

/// イベントセットを処理する
fn process_event_set(ctx: &mut ManagerContext<'_, DebuggerState>, set: EventSet) -> Result<(), CommandError> {
    let manager = ctx.manager().clone();
    let st = ctx.state()?;
    if st.process_state.get() == ProcessState::Detached {
        return Ok(());
    }

    // 一度きりのハンドラが取ったイベントはコンテキストを作らずに処理する
    let policy = set.suspend_policy;
    let set_thread = set.thread();
    let mut remaining = Vec::with_capacity(set.len());
    for event in set.events {
        match event.request().and_then(|r| st.requests.take_one_shot(r)) {
            Some(handler) => handler(&event),
            None => remaining.push(event),
        }
    }
    if remaining.is_empty() {
        debug!("all events claimed by one-shot handlers; resuming");
        resume_without_context(&*st.vm, policy, set_thread)?;
        return Ok(());
    }

    let set = EventSet::new(policy, remaining);
    let context = st.suspend.push_event_context(&*st.vm, set.clone());

    let mut disconnected = false;
    let mut resolution = VoteResolution::Pending;
    for event in &set.events {
        disconnected |= matches!(event, Event::VmDeath | Event::VmDisconnect);
        let vote = match dispatch(st, context, event) {
            Ok(vote) => vote,
            Err(CommandError::Disconnected) => {
                disconnected = true;
                Vote::Resume
            }
            Err(e) => {
                warn!("failed to handle {:?}: {}", event, e);
                Vote::Suspend
            }
        };
        let voted = match vote {
            Vote::Resume => st.suspend.vote_resume(context),
            Vote::Suspend => st.suspend.vote_suspend(context),
        };
        match voted {
            Ok(r) => resolution = r,
            Err(e) => debug!("vote on {} rejected: {}", context, e),
        }
    }

    if disconnected {
        return teardown(ctx);
    }
    match resolution {
        VoteResolution::Resume => {
            manager.schedule_fn(Priority::High, "resume-context", move |ctx| {
                let st = ctx.state()?;
                if st.suspend.context(context).is_some() {
                    st.suspend.resume(&*st.vm, context)?;
                }
                Ok(())
            });
        }
        VoteResolution::Paused => on_paused(st, context),
        VoteResolution::Pending => {
            error!(state = %st.suspend.dump(), "{} still has votes after dispatch", context);
        }
    }
    Ok(())
}

fn resume_without_context(
    vm: &dyn TargetVm,
    policy: SuspendPolicy,
    thread: Option<ThreadId>,
) -> Result<(), TargetError> {
    match (policy, thread) {
        (SuspendPolicy::All, _) => vm.resume(),
        (SuspendPolicy::EventThread, Some(t)) => vm.resume_thread(t),
        _ => Ok(()),
    }
}

/// イベントの種類ごとの処理。戻り値がそのイベントの票になる
fn dispatch(st: &mut DebuggerState, context: ContextId, event: &Event) -> Result<Vote, CommandError> {
    match event {
        Event::VmStart { .. } => Ok(Vote::Resume),
        Event::VmDeath | Event::VmDisconnect => Ok(Vote::Resume),
        Event::ThreadStart { thread } => {
            st.suspend.register_thread(*thread);
            Ok(Vote::Resume)
        }
        Event::ThreadDeath { thread } => {
            st.suspend.remove_thread(*thread);
            st.step_hints.retain(|_, hint| hint.thread() != *thread);
            Ok(Vote::Resume)
        }
        Event::ClassPrepare { class_name, .. } => {
            let notified = st.requests.notify_class_prepared(class_name);
            debug!("{} prepared; {} watcher(s) notified", class_name, notified);
            Ok(Vote::Resume)
        }
        Event::Locatable {
            kind: LocatableKind::Step,
            request,
            thread,
            location,
        } => process_step(st, context, *request, *thread, location),
        Event::Locatable { .. } => Ok(st.requests.process_locatable(event, &*st.vm)),
    }
}

/// ステップ完了イベントの判定
fn process_step(
    st: &mut DebuggerState,
    context: ContextId,
    request: Option<RequestId>,
    thread: ThreadId,
    location: &Location,
) -> Result<Vote, CommandError> {
    let Some(mut hint) = request.and_then(|r| st.step_hints.remove(&r)) else {
        debug!("step event in {} without a pending step; stopping", thread);
        delete_step_requests(&*st.vm, Some(thread));
        return Ok(Vote::Suspend);
    };

    let frame_count = st.vm.frame_count(thread)?;
    let filters = StepFilters {
        settings: &st.settings,
        extra: &st.extra_filters,
    };
    let decision = hint.decide(frame_count, location, &filters);
    debug!("step in {} at {} (depth {}): {:?}", thread, location, frame_count, decision);

    match decision {
        StepDecision::Stop => {
            if hint.is_target_not_reached() {
                if let Some(filter) = hint.method_filter() {
                    for listener in &st.listeners {
                        listener.smart_step_target_not_reached(thread, filter.target());
                    }
                }
            }
            finish_step(st, thread, &hint);
            Ok(Vote::Suspend)
        }
        StepDecision::Resume => {
            finish_step(st, thread, &hint);
            Ok(Vote::Resume)
        }
        StepDecision::Step(depth) => {
            if depth == StepDepth::Out && depth != hint.depth() {
                hint = hint.nested(StepDepth::Out, frame_count, location.position());
            }
            let policy = st
                .suspend
                .context(context)
                .map(|c| c.policy())
                .unwrap_or(SuspendPolicy::All);
            let next = do_step(&*st.vm, &st.settings, policy, thread, depth, Some(&hint))?;
            st.step_hints.insert(next, hint);
            Ok(Vote::Resume)
        }
    }
}

fn finish_step(st: &mut DebuggerState, thread: ThreadId, hint: &StepHint) {
    if hint.restore_breakpoints() {
        st.requests.set_muted(false);
    }
    delete_step_requests(&*st.vm, Some(thread));
}

/// コンテキストが停止状態になったときの後始末
///
/// カーソル位置への実行を取り消し、コンテキストのスレッドのステップ要求を削除します。
pub(crate) fn on_paused(st: &mut DebuggerState, context: ContextId) {
    st.requests.cancel_run_to_cursor(&*st.vm);
    if let Some(thread) = st.suspend.context(context).and_then(|c| c.thread()) {
        let deleted = delete_step_requests(&*st.vm, Some(thread));
        st.step_hints.retain(|_, hint| hint.thread() != thread);
        if deleted > 0 {
            debug!("{} paused; deleted {} step request(s) of {}", context, deleted, thread);
        }
    }
}

/// 接続断の後始末
///
/// 全てのコンテキストをターゲットに触れずに破棄し、キューを閉じます。
pub(crate) fn teardown(ctx: &mut ManagerContext<'_, DebuggerState>) -> Result<(), CommandError> {
    let manager = ctx.manager().clone();
    let st = ctx.state()?;
    if st.process_state.get() == ProcessState::Detached {
        return Ok(());
    }
    st.process_state.set(ProcessState::Detaching);
    let disposed = st.suspend.dispose_all();
    st.requests.clear();
    st.step_hints.clear();
    st.watchdog.cancel_all();
    st.process_state.set(ProcessState::Detached);
    info!("detached; {} suspend context(s) disposed", disposed);
    for listener in &st.listeners {
        listener.detached();
    }
    manager.close();
    Ok(())
}
