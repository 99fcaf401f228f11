//! 停止中のスレッドでのメソッド呼び出し
//!
//! 呼び出しはマネージャスレッドで準備され、補助スレッドで実行されます。
//! 呼び出し中もマネージャはイベントを処理し続け、完了は継続コマンドとして戻ります。
//!
//! 準備では次のことを行います。
//! - 呼び出しスレッドを、評価するコンテキスト以外で停止させているコンテキストで明示的に再開する
//! - 評価するコンテキストのスレッドの凍結を解き、明示的に再開されていたスレッドを一時的に停止する
//! - 全体停止中のスレッド単独の呼び出しはウォッチドッグで監視する

use crate::errors::{CommandError, EvaluateError, SuspendError};
use crate::manager::{ManagerContext, Priority};
use crate::process::DebuggerState;
use crate::stepping::delete_step_requests;
use crate::suspend::{ContextId, ResumeData};
use crate::watchdog::WatchId;
use koma_target::{
    InvokeOptions, MethodRef, SuspendPolicy, TargetError, TargetVm, ThreadId, Value,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type EvaluateResult = Result<Value, EvaluateError>;

/// 呼び出しの前後で元に戻す必要のある状態
struct Evaluation {
    context: ContextId,
    thread: ThreadId,
    /// 呼び出しスレッドを明示的に再開したコンテキスト
    overrides: Vec<ContextId>,
    watch: Option<WatchId>,
}

/// 評価を開始する。結果は `done` に送られる
pub(crate) fn start_evaluation(
    ctx: &mut ManagerContext<'_, DebuggerState>,
    context: ContextId,
    method: MethodRef,
    args: Vec<Value>,
    done: oneshot::Sender<EvaluateResult>,
) -> Result<(), CommandError> {
    let manager = ctx.manager().clone();
    let st = ctx.state()?;

    let Some(sc) = st.suspend.context(context) else {
        let _ = done.send(Err(EvaluateError::ContextResumed));
        return Ok(());
    };
    let policy = sc.policy();
    let Some(thread) = sc.thread() else {
        let _ = done.send(Err(EvaluateError::NoThread));
        return Ok(());
    };
    if sc.is_not_executable(thread) {
        let _ = done.send(Err(EvaluateError::ThreadNotSuspendable));
        return Ok(());
    }
    if st.suspend.is_evaluating(thread) {
        debug!("rejecting nested evaluation in {}", thread);
        let _ = done.send(Err(EvaluateError::NestedEvaluation));
        return Ok(());
    }

    // 他のコンテキストに止められたままだと呼び出せない
    let mut overrides = Vec::new();
    for other in st.suspend.suspending_contexts(thread) {
        if other == context {
            continue;
        }
        let own = st.suspend.context(other).and_then(|c| c.thread()) == Some(thread);
        if own {
            continue;
        }
        match st.suspend.resume_thread(&*st.vm, other, thread) {
            Ok(()) => overrides.push(other),
            Err(e) => debug!("could not resume {} in {}: {}", thread, other, e),
        }
    }

    let data = match st.suspend.prepare_for_resume(&*st.vm, context) {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to prepare {} for evaluation: {}", context, e);
            release_overrides(st, thread, &overrides);
            let _ = done.send(Err(match e {
                SuspendError::Target(t) => t.into(),
                _ => EvaluateError::ContextResumed,
            }));
            return Ok(());
        }
    };
    st.suspend.set_evaluating(context, thread, true);

    let single_threaded = policy == SuspendPolicy::EventThread || st.settings.invoke_single_threaded;
    let watch = (single_threaded && policy == SuspendPolicy::All).then(|| {
        st.watchdog.watch(
            context,
            thread,
            st.settings.watchdog_threshold,
            st.settings.deadlock_report_delay,
            move |id| {
                manager.schedule_fn(Priority::High, "watchdog-trigger", move |ctx| {
                    let st = ctx.state()?;
                    st.watchdog.trigger(id, &mut st.suspend, &*st.vm)?;
                    Ok(())
                });
            },
        )
    });

    for listener in &st.listeners {
        listener.evaluation_started(thread);
    }
    debug!(
        "invoking {} in {} ({})",
        method,
        thread,
        if single_threaded { "single-threaded" } else { "all threads" }
    );

    let evaluation = Evaluation {
        context,
        thread,
        overrides,
        watch,
    };
    let vm = Arc::clone(&st.vm);
    ctx.start_long_process_and_fork(
        move || invoke_loading_classes(&*vm, thread, &method, &args, InvokeOptions { single_threaded }),
        move |ctx, result: Result<Value, TargetError>| {
            let st = ctx.state()?;
            if let Err(TargetError::IncompatibleThreadState(t)) = &result {
                st.suspend.mark_not_executable(evaluation.context, *t);
            }
            finish_evaluation(st, &evaluation, data);

            let result = result.map_err(EvaluateError::from);
            for listener in &st.listeners {
                listener.evaluation_finished(evaluation.thread, &result);
            }
            let _ = done.send(result);
            Ok(())
        },
    );
    Ok(())
}

/// 呼び出す。未ロードのクラスがあれば一度だけロードしてやり直す
fn invoke_loading_classes(
    vm: &dyn TargetVm,
    thread: ThreadId,
    method: &MethodRef,
    args: &[Value],
    options: InvokeOptions,
) -> Result<Value, TargetError> {
    let mut loaded = None;
    loop {
        match vm.invoke_method(thread, method, args, options) {
            Err(TargetError::ClassNotLoaded(class)) if loaded.as_ref() != Some(&class) => {
                debug!("{} needs {}; loading it in {}", method, class, thread);
                vm.load_class(thread, &class)?;
                loaded = Some(class);
            }
            result => return result,
        }
    }
}

/// 呼び出し前の状態に戻す
///
/// 呼び出し中に作られたステップ要求は、次の呼び出しで発火してユーザーを
/// 別の場所で止めてしまうため削除します。
fn finish_evaluation(st: &mut DebuggerState, evaluation: &Evaluation, data: ResumeData) {
    let (context, thread) = (evaluation.context, evaluation.thread);
    let deleted = delete_step_requests(&*st.vm, Some(thread));
    if deleted > 0 {
        debug!("deleted {} step request(s) left by the evaluation in {}", deleted, thread);
    }
    st.step_hints.retain(|_, hint| hint.thread() != thread);
    if let Some(id) = evaluation.watch {
        if let Err(e) = st.watchdog.finish(id, &mut st.suspend, &*st.vm) {
            warn!("failed to restore suspension after {}: {}", id, e);
        }
    }
    st.suspend.set_evaluating(context, thread, false);
    if let Err(e) = st.suspend.restore_after_resume(&*st.vm, context, data) {
        warn!("failed to restore {} after evaluation: {}", context, e);
    }
    release_overrides(st, thread, &evaluation.overrides);
}

/// 評価のために取った明示的な再開を戻す
fn release_overrides(st: &mut DebuggerState, thread: ThreadId, overrides: &[ContextId]) {
    for &id in overrides {
        let Some(sc) = st.suspend.context(id) else {
            continue;
        };
        if sc.is_evaluating() || !sc.is_explicitly_resumed(thread) {
            continue;
        }
        if let Err(e) = st.suspend.suspend_thread(&*st.vm, id, thread) {
            warn!("failed to re-suspend {} in {}: {}", thread, id, e);
        }
    }
}
