//! インメモリのシミュレーションターゲット
//!
//! 実プロセスの代わりに、スレッドごとのサスペンドカウンタ・スタック・イベントキューを
//! メモリ上で再現します。テストと CLI のデモで使用します。

use crate::{
    Event, EventSet, InvokeOptions, LocatableKind, Location, MethodRef, RequestId, SourcePosition,
    StepRequestSpec, SuspendPolicy, TargetError, TargetVm, ThreadId, ThreadStatus, Value,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// ハンドラに渡されるリモート呼び出しの内容
#[derive(Debug, Clone)]
pub struct InvocationCall {
    pub thread: ThreadId,
    pub method: MethodRef,
    pub args: Vec<Value>,
    pub options: InvokeOptions,
}

type InvocationHandler = dyn Fn(&InvocationCall) -> Result<Value, TargetError> + Send + Sync;

struct SimThread {
    name: String,
    suspend_count: u32,
    /// 末尾がトップフレーム
    frames: Vec<Location>,
}

#[derive(Clone)]
enum SimRequest {
    Step(StepRequestSpec),
    Breakpoint {
        position: SourcePosition,
        suspend_policy: SuspendPolicy,
    },
}

#[derive(Default)]
struct SimState {
    threads: BTreeMap<ThreadId, SimThread>,
    pending: VecDeque<EventSet>,
    requests: BTreeMap<RequestId, SimRequest>,
    next_thread: u64,
    next_request: u32,
    disconnected: bool,
    exit_code: Option<i32>,
    invocations: usize,
    loaded_classes: BTreeSet<String>,
}

impl SimState {
    fn thread(&self, thread: ThreadId) -> Result<&SimThread, TargetError> {
        self.threads
            .get(&thread)
            .ok_or(TargetError::InvalidThread(thread))
    }

    fn thread_mut(&mut self, thread: ThreadId) -> Result<&mut SimThread, TargetError> {
        self.threads
            .get_mut(&thread)
            .ok_or(TargetError::InvalidThread(thread))
    }

    fn stopped_thread(&self, thread: ThreadId) -> Result<&SimThread, TargetError> {
        let t = self.thread(thread)?;
        if t.suspend_count == 0 {
            return Err(TargetError::IncompatibleThreadState(thread));
        }
        Ok(t)
    }

    fn apply_policy(&mut self, policy: SuspendPolicy, thread: Option<ThreadId>) {
        match policy {
            SuspendPolicy::All => {
                for t in self.threads.values_mut() {
                    t.suspend_count += 1;
                }
            }
            SuspendPolicy::EventThread => {
                if let Some(t) = thread.and_then(|id| self.threads.get_mut(&id)) {
                    t.suspend_count += 1;
                }
            }
            SuspendPolicy::None => {}
        }
    }

    fn ensure_connected(&self) -> Result<(), TargetError> {
        if self.disconnected {
            Err(TargetError::Disconnected)
        } else {
            Ok(())
        }
    }
}

/// シミュレーションターゲット
///
/// サスペンドのセマンティクスは JDI に合わせています。イベントの投入時には
/// イベントセットのポリシーに従ってスレッドが停止されます。
pub struct SimulatedVm {
    state: Mutex<SimState>,
    events_ready: Condvar,
    handler: Mutex<Option<Arc<InvocationHandler>>>,
}

impl SimulatedVm {
    /// スレッドを持たない空のターゲットを作成する
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_thread: 1,
                next_request: 1,
                ..SimState::default()
            }),
            events_ready: Condvar::new(),
            handler: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 実行中のスレッドを追加する
    pub fn add_thread(&self, name: &str) -> ThreadId {
        let mut state = self.lock();
        let id = ThreadId(state.next_thread);
        state.next_thread += 1;
        state.threads.insert(
            id,
            SimThread {
                name: name.to_string(),
                suspend_count: 0,
                frames: Vec::new(),
            },
        );
        id
    }

    /// スレッドを消滅させる
    pub fn remove_thread(&self, thread: ThreadId) {
        self.lock().threads.remove(&thread);
    }

    /// スタックを置き換える（末尾がトップフレーム）
    pub fn set_frames(&self, thread: ThreadId, frames: Vec<Location>) -> Result<(), TargetError> {
        self.lock().thread_mut(thread)?.frames = frames;
        Ok(())
    }

    /// スタックを `depth` 段にしてトップフレームを `location` にする
    pub fn move_to(&self, thread: ThreadId, location: Location, depth: usize) -> Result<(), TargetError> {
        let mut state = self.lock();
        let t = state.thread_mut(thread)?;
        t.frames.truncate(depth.saturating_sub(1));
        while t.frames.len() + 1 < depth {
            t.frames.push(location.clone());
        }
        t.frames.push(location);
        Ok(())
    }

    /// イベントセットを投入する
    ///
    /// ポリシーに従ってスレッドを停止してからキューに積みます。
    pub fn post(&self, set: EventSet) {
        let mut state = self.lock();
        state.apply_policy(set.suspend_policy, set.thread());
        debug!("sim: posting {} event(s) with {:?}", set.len(), set.suspend_policy);
        state.pending.push_back(set);
        self.events_ready.notify_all();
    }

    /// スレッドに対する有効なステップ要求があれば、ステップ完了イベントを発生させる
    pub fn emit_step(&self, thread: ThreadId, location: Location, depth: usize) -> Option<RequestId> {
        let (request, policy) = {
            let state = self.lock();
            state.requests.iter().find_map(|(id, req)| match req {
                SimRequest::Step(spec) if spec.thread == thread => Some((*id, spec.suspend_policy)),
                _ => None,
            })?
        };
        self.move_to(thread, location.clone(), depth).ok()?;
        self.post(EventSet::new(
            policy,
            vec![Event::Locatable {
                request: Some(request),
                kind: LocatableKind::Step,
                thread,
                location,
            }],
        ));
        Some(request)
    }

    /// ブレークポイント要求に対するヒットイベントを発生させる
    pub fn emit_breakpoint(
        &self,
        thread: ThreadId,
        request: RequestId,
        location: Location,
        depth: usize,
    ) -> Result<(), TargetError> {
        let policy = match self.lock().requests.get(&request) {
            Some(SimRequest::Breakpoint { suspend_policy, .. }) => *suspend_policy,
            _ => return Err(TargetError::InvalidRequest(request)),
        };
        self.move_to(thread, location.clone(), depth)?;
        self.post(EventSet::new(
            policy,
            vec![Event::Locatable {
                request: Some(request),
                kind: LocatableKind::Breakpoint,
                thread,
                location,
            }],
        ));
        Ok(())
    }

    /// 指定位置に設定されたブレークポイント要求
    pub fn breakpoint_at(&self, position: &SourcePosition) -> Option<RequestId> {
        self.lock().requests.iter().find_map(|(id, req)| match req {
            SimRequest::Breakpoint { position: p, .. } if p == position => Some(*id),
            _ => None,
        })
    }

    /// 接続を切断する。待機中の `next_event_set` は `Disconnected` を返す
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.events_ready.notify_all();
    }

    /// リモート呼び出しの振る舞いを設定する
    pub fn set_invocation_handler<F>(&self, handler: F)
    where
        F: Fn(&InvocationCall) -> Result<Value, TargetError> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// スレッドが実際に走っているかどうか（サスペンドカウンタが0）
    pub fn is_running(&self, thread: ThreadId) -> bool {
        self.lock()
            .threads
            .get(&thread)
            .map(|t| t.suspend_count == 0)
            .unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    /// `load_class` でロードされたクラスか
    pub fn is_class_loaded(&self, class_name: &str) -> bool {
        self.lock().loaded_classes.contains(class_name)
    }

    /// これまでに実行されたリモート呼び出しの数
    pub fn invocation_count(&self) -> usize {
        self.lock().invocations
    }
}

impl Default for SimulatedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetVm for SimulatedVm {
    fn next_event_set(&self) -> Result<EventSet, TargetError> {
        let mut state = self.lock();
        loop {
            if let Some(set) = state.pending.pop_front() {
                return Ok(set);
            }
            if state.disconnected {
                return Err(TargetError::Disconnected);
            }
            state = self
                .events_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn all_threads(&self) -> Vec<ThreadId> {
        self.lock().threads.keys().copied().collect()
    }

    fn thread_name(&self, thread: ThreadId) -> Result<String, TargetError> {
        Ok(self.lock().thread(thread)?.name.clone())
    }

    fn thread_status(&self, thread: ThreadId) -> Result<ThreadStatus, TargetError> {
        self.lock().thread(thread)?;
        Ok(ThreadStatus::Running)
    }

    fn suspend_count(&self, thread: ThreadId) -> Result<u32, TargetError> {
        Ok(self.lock().thread(thread)?.suspend_count)
    }

    fn suspend(&self) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        for t in state.threads.values_mut() {
            t.suspend_count += 1;
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        for t in state.threads.values_mut() {
            t.suspend_count = t.suspend_count.saturating_sub(1);
        }
        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.thread_mut(thread)?.suspend_count += 1;
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let t = state.thread_mut(thread)?;
        t.suspend_count = t.suspend_count.saturating_sub(1);
        Ok(())
    }

    fn frame_count(&self, thread: ThreadId) -> Result<usize, TargetError> {
        Ok(self.lock().stopped_thread(thread)?.frames.len())
    }

    fn location(&self, thread: ThreadId) -> Result<Location, TargetError> {
        self.lock()
            .stopped_thread(thread)?
            .frames
            .last()
            .cloned()
            .ok_or(TargetError::IncompatibleThreadState(thread))
    }

    fn create_step_request(&self, spec: StepRequestSpec) -> Result<RequestId, TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.thread(spec.thread)?;
        let id = RequestId(state.next_request);
        state.next_request += 1;
        state.requests.insert(id, SimRequest::Step(spec));
        Ok(id)
    }

    fn create_breakpoint_request(
        &self,
        position: &SourcePosition,
        suspend_policy: SuspendPolicy,
    ) -> Result<RequestId, TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let id = RequestId(state.next_request);
        state.next_request += 1;
        state.requests.insert(
            id,
            SimRequest::Breakpoint {
                position: position.clone(),
                suspend_policy,
            },
        );
        Ok(id)
    }

    fn delete_event_request(&self, request: RequestId) -> Result<(), TargetError> {
        self.lock()
            .requests
            .remove(&request)
            .map(|_| ())
            .ok_or(TargetError::InvalidRequest(request))
    }

    fn step_requests(&self) -> Vec<(RequestId, ThreadId)> {
        self.lock()
            .requests
            .iter()
            .filter_map(|(id, req)| match req {
                SimRequest::Step(spec) => Some((*id, spec.thread)),
                SimRequest::Breakpoint { .. } => None,
            })
            .collect()
    }

    fn invoke_method(
        &self,
        thread: ThreadId,
        method: &MethodRef,
        args: &[Value],
        options: InvokeOptions,
    ) -> Result<Value, TargetError> {
        // 呼び出し中は対象スレッド（または全スレッド）を走らせる
        let saved: Vec<(ThreadId, u32)> = {
            let mut state = self.lock();
            state.ensure_connected()?;
            state.stopped_thread(thread)?;
            state.invocations += 1;
            let saved = if options.single_threaded {
                vec![(thread, state.thread(thread)?.suspend_count)]
            } else {
                state
                    .threads
                    .iter()
                    .map(|(id, t)| (*id, t.suspend_count))
                    .collect()
            };
            for (id, _) in &saved {
                if let Some(t) = state.threads.get_mut(id) {
                    t.suspend_count = 0;
                }
            }
            saved
        };

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let call = InvocationCall {
            thread,
            method: method.clone(),
            args: args.to_vec(),
            options,
        };
        let result = match handler {
            Some(h) => h(&call),
            None => Ok(Value::Void),
        };

        let mut state = self.lock();
        for (id, count) in saved {
            if let Some(t) = state.threads.get_mut(&id) {
                t.suspend_count = count;
            }
        }
        if state.disconnected {
            return Err(TargetError::Disconnected);
        }
        result
    }

    fn load_class(&self, thread: ThreadId, class_name: &str) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.stopped_thread(thread)?;
        debug!("sim: loading {} in {}", class_name, thread);
        state.loaded_classes.insert(class_name.to_string());
        Ok(())
    }

    fn exit(&self, code: i32) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.exit_code = Some(code);
        state
            .pending
            .push_back(EventSet::new(SuspendPolicy::None, vec![Event::VmDeath]));
        state.disconnected = true;
        self.events_ready.notify_all();
        Ok(())
    }

    fn dispose(&self) -> Result<(), TargetError> {
        let mut state = self.lock();
        for t in state.threads.values_mut() {
            t.suspend_count = 0;
        }
        state.requests.clear();
        state.disconnected = true;
        self.events_ready.notify_all();
        Ok(())
    }
}
