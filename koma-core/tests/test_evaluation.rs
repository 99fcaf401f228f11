//! 停止中スレッドでのメソッド呼び出しのテスト

use koma_core::{
    ContextId, DebugProcess, DebugProcessListener, DebuggerSettings, EvaluateError, Priority,
};
use koma_target::{
    Location, MethodInfo, MethodRef, SimulatedVm, SourcePosition, StepDepth, StepRequestSpec,
    SuspendPolicy, TargetError, TargetVm, ThreadId, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn loc(line: u32) -> Location {
    Location::new(MethodInfo::new("app.Main", "run", "()V"), "Main.java", line)
}

fn method() -> MethodRef {
    MethodRef::new("app.Main", "describe", "()Ljava/lang/String;")
}

#[derive(Default)]
struct EvaluationCounter {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl DebugProcessListener for EvaluationCounter {
    fn evaluation_started(&self, _thread: ThreadId) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn evaluation_finished(&self, _thread: ThreadId, _result: &Result<Value, EvaluateError>) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    vm: Arc<SimulatedVm>,
    main: ThreadId,
    other: ThreadId,
    process: DebugProcess,
    counter: Arc<EvaluationCounter>,
}

impl Fixture {
    fn new(settings: DebuggerSettings) -> Self {
        let vm = Arc::new(SimulatedVm::new());
        let main = vm.add_thread("main");
        let other = vm.add_thread("worker");
        vm.set_frames(main, vec![loc(1)]).unwrap();
        vm.set_frames(other, vec![loc(1)]).unwrap();
        let process = DebugProcess::new(vm.clone(), settings);
        let counter = Arc::new(EvaluationCounter::default());
        process.add_listener(counter.clone()).unwrap();
        process.attach().unwrap();
        Self {
            vm,
            main,
            other,
            process,
            counter,
        }
    }

    /// main スレッドを全体停止のブレークポイントで止める
    fn stop_main(&self) -> ContextId {
        let position = SourcePosition::new("Main.java", 10);
        self.process.add_breakpoint(position.clone(), SuspendPolicy::All).unwrap();
        let request = self.vm.breakpoint_at(&position).unwrap();
        self.vm.emit_breakpoint(self.main, request, loc(10), 1).unwrap();
        assert!(wait_until(|| !self.process.paused_contexts().unwrap().is_empty()));
        self.process.paused_contexts().unwrap().pop().unwrap().id()
    }

    /// 呼び出しを `release` に送信があるまでブロックさせる
    fn block_invocations(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let rx = Mutex::new(rx);
        self.vm.set_invocation_handler(move |_call| {
            let _ = rx.lock().unwrap().recv_timeout(TIMEOUT);
            Ok(Value::Int(42))
        });
        tx
    }
}

#[test]
fn test_evaluate_returns_value() {
    let f = Fixture::new(DebuggerSettings::default());
    f.vm
        .set_invocation_handler(|call| Ok(Value::Str(format!("{} on {}", call.method.name, call.thread))));
    let ctx = f.stop_main();

    let value = f.process.evaluate(ctx, method(), Vec::new()).unwrap();
    assert_eq!(value, Value::Str(format!("describe on {}", f.main)));
    assert_eq!(f.vm.invocation_count(), 1);
    assert_eq!(f.counter.started.load(Ordering::SeqCst), 1);
    assert_eq!(f.counter.finished.load(Ordering::SeqCst), 1);

    // 呼び出しの後も停止状態は変わらない
    assert!(!f.vm.is_running(f.main));
    assert!(!f.vm.is_running(f.other));
    assert!(f.process.is_suspended(f.main).unwrap());
    assert!(!f.process.context(ctx).unwrap().unwrap().is_evaluating());
}

#[test]
fn test_watchdog_lets_other_threads_run() {
    let settings = DebuggerSettings {
        watchdog_threshold: Duration::from_millis(20),
        deadlock_report_delay: Duration::from_secs(1),
        ..DebuggerSettings::default()
    };
    let f = Fixture::new(settings);
    let ctx = f.stop_main();
    let release = f.block_invocations();

    thread::scope(|s| {
        let evaluation = s.spawn(|| f.process.evaluate(ctx, method(), Vec::new()));

        // 閾値を超えると他のスレッドは走り、呼び出し中のスレッドは停止扱いのまま
        assert!(wait_until(|| !f.process.is_suspended(f.other).unwrap()));
        assert!(f.vm.is_running(f.other));
        assert!(f.process.is_suspended(f.main).unwrap());
        assert!(f.process.context(ctx).unwrap().unwrap().is_relaxed());

        release.send(()).unwrap();
        assert_eq!(evaluation.join().unwrap(), Ok(Value::Int(42)));
    });

    assert!(f.process.is_suspended(f.other).unwrap());
    assert!(!f.vm.is_running(f.other));
    assert!(!f.vm.is_running(f.main));
    assert!(!f.process.context(ctx).unwrap().unwrap().is_relaxed());
}

#[test]
fn test_nested_evaluation_is_rejected() {
    let f = Fixture::new(DebuggerSettings::default());
    let ctx = f.stop_main();
    let release = f.block_invocations();

    thread::scope(|s| {
        let evaluation = s.spawn(|| f.process.evaluate(ctx, method(), Vec::new()));
        assert!(wait_until(|| {
            f.process
                .threads()
                .unwrap()
                .iter()
                .any(|t| t.id == f.main && t.evaluating)
        }));

        assert_eq!(
            f.process.evaluate(ctx, method(), Vec::new()),
            Err(EvaluateError::NestedEvaluation)
        );

        release.send(()).unwrap();
        assert_eq!(evaluation.join().unwrap(), Ok(Value::Int(42)));
    });
    assert_eq!(f.vm.invocation_count(), 1);
}

#[test]
fn test_incompatible_thread_is_not_executable() {
    let f = Fixture::new(DebuggerSettings::default());
    f.vm
        .set_invocation_handler(|call| Err(TargetError::IncompatibleThreadState(call.thread)));
    let ctx = f.stop_main();

    assert_eq!(
        f.process.evaluate(ctx, method(), Vec::new()),
        Err(EvaluateError::ThreadNotSuspendable)
    );
    assert!(f.process.context(ctx).unwrap().unwrap().is_not_executable(f.main));

    // 同じコンテキストでは二度と呼び出さない
    assert_eq!(
        f.process.evaluate(ctx, method(), Vec::new()),
        Err(EvaluateError::ThreadNotSuspendable)
    );
    assert_eq!(f.vm.invocation_count(), 1);
}

#[test]
fn test_explicitly_resumed_threads_stop_during_evaluation() {
    let f = Fixture::new(DebuggerSettings::default());
    let ctx = f.stop_main();
    f.process.explicit_resume(ctx, f.other).unwrap();
    assert!(f.vm.is_running(f.other));

    let vm = Arc::downgrade(&f.vm);
    let other = f.other;
    f.vm.set_invocation_handler(move |_call| {
        let running = vm.upgrade().map(|vm| vm.is_running(other)).unwrap_or(true);
        Ok(Value::Bool(running))
    });

    assert_eq!(f.process.evaluate(ctx, method(), Vec::new()), Ok(Value::Bool(false)));
    assert!(f.vm.is_running(f.other));
    assert!(f.process.context(ctx).unwrap().unwrap().is_explicitly_resumed(f.other));
}

#[test]
fn test_step_requests_left_by_evaluation_are_deleted() {
    let f = Fixture::new(DebuggerSettings::default());
    let vm = Arc::downgrade(&f.vm);
    f.vm.set_invocation_handler(move |call| {
        if let Some(vm) = vm.upgrade() {
            vm.create_step_request(StepRequestSpec::new(call.thread, StepDepth::Out))?;
        }
        Ok(Value::Void)
    });
    let ctx = f.stop_main();

    assert_eq!(f.process.evaluate(ctx, method(), Vec::new()), Ok(Value::Void));
    assert!(f.vm.step_requests().is_empty());
    let pending = f
        .process
        .manager()
        .invoke_and_wait_fn(Priority::Normal, |ctx| Ok(ctx.state()?.pending_steps()))
        .unwrap();
    assert_eq!(pending, 0);
}

#[test]
fn test_missing_class_is_loaded_and_retried() {
    let f = Fixture::new(DebuggerSettings::default());
    let vm = Arc::downgrade(&f.vm);
    f.vm.set_invocation_handler(move |_call| {
        let loaded = vm.upgrade().map(|vm| vm.is_class_loaded("app.Helper")).unwrap_or(false);
        if loaded {
            Ok(Value::Int(7))
        } else {
            Err(TargetError::ClassNotLoaded("app.Helper".to_string()))
        }
    });
    let ctx = f.stop_main();

    assert_eq!(f.process.evaluate(ctx, method(), Vec::new()), Ok(Value::Int(7)));
    assert!(f.vm.is_class_loaded("app.Helper"));
    assert_eq!(f.vm.invocation_count(), 2);
    assert!(!f.vm.is_running(f.main));
}

#[test]
fn test_class_that_stays_missing_is_reported() {
    let f = Fixture::new(DebuggerSettings::default());
    f.vm
        .set_invocation_handler(|_call| Err(TargetError::ClassNotLoaded("app.Gone".to_string())));
    let ctx = f.stop_main();

    assert_eq!(
        f.process.evaluate(ctx, method(), Vec::new()),
        Err(EvaluateError::ClassNotLoaded("app.Gone".to_string()))
    );
    assert_eq!(f.vm.invocation_count(), 2);
}

#[test]
fn test_evaluate_needs_a_live_context_with_thread() {
    let f = Fixture::new(DebuggerSettings::default());
    let paused = f.process.pause().unwrap().unwrap();
    assert_eq!(
        f.process.evaluate(paused, method(), Vec::new()),
        Err(EvaluateError::NoThread)
    );
    f.process.resume(paused).unwrap();

    let ctx = f.stop_main();
    f.process.resume(ctx).unwrap();
    assert_eq!(
        f.process.evaluate(ctx, method(), Vec::new()),
        Err(EvaluateError::ContextResumed)
    );
    assert_eq!(f.vm.invocation_count(), 0);
    assert_eq!(f.counter.started.load(Ordering::SeqCst), 0);
}

#[test]
fn test_disconnect_during_evaluation() {
    let f = Fixture::new(DebuggerSettings::default());
    let ctx = f.stop_main();
    let release = f.block_invocations();

    thread::scope(|s| {
        let evaluation = s.spawn(|| f.process.evaluate(ctx, method(), Vec::new()));
        assert!(wait_until(|| f.vm.invocation_count() == 1));
        f.vm.disconnect();
        release.send(()).unwrap();
        let result = evaluation.join().unwrap();
        assert!(
            matches!(result, Err(EvaluateError::Disconnected) | Err(EvaluateError::Cancelled)),
            "unexpected {:?}",
            result
        );
    });
    assert!(f.process.wait_until_detached(TIMEOUT));
}
