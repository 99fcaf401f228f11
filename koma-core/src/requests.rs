//! イベント要求とリクエスタの管理
//!
//! ブレークポイントやクラスロードの監視など、ターゲットのイベント要求と
//! そのイベントを処理するハンドラを対応付けます。

use crate::settings::ClassFilter;
use crate::Result;
use koma_target::{Event, RequestId, SourcePosition, SuspendPolicy, TargetError, TargetVm};
use std::collections::HashMap;
use tracing::{debug, warn};

/// ハンドラの投票
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Resume,
    Suspend,
}

/// 位置イベントを処理するハンドラ
///
/// ブレークポイントに相当するもので、イベントごとにちょうど一票を投じます。
pub trait Requestor: Send {
    /// ログ用の名前
    fn name(&self) -> String;

    /// 停止すべきなら `Vote::Suspend`
    fn process_event(&mut self, event: &Event, vm: &dyn TargetVm) -> Result<Vote>;
}

/// ブレークポイントID
pub type BreakpointId = usize;

/// 行ブレークポイント
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub position: SourcePosition,
    pub suspend_policy: SuspendPolicy,
    pub enabled: bool,
    pub hit_count: u64,
    pub request: RequestId,
}

/// クラスロード監視ID
pub type WatcherId = usize;

pub type ClassPrepareCallback = Box<dyn FnMut(&str) + Send>;
pub type OneShotHandler = Box<dyn FnOnce(&Event) + Send>;

struct ClassPrepareWatcher {
    id: WatcherId,
    filter: ClassFilter,
    callback: ClassPrepareCallback,
}

struct RunToCursor {
    request: RequestId,
    position: SourcePosition,
    /// 停止時にミュートを解除する
    restore_breakpoints: bool,
}

enum Handler {
    Breakpoint(BreakpointId),
    RunToCursor,
    Custom(Box<dyn Requestor>),
}

/// イベント要求マネージャ
pub struct RequestManager {
    breakpoints: HashMap<BreakpointId, Breakpoint>,
    handlers: HashMap<RequestId, Handler>,
    one_shots: HashMap<RequestId, OneShotHandler>,
    watchers: Vec<ClassPrepareWatcher>,
    run_to_cursor: Option<RunToCursor>,
    muted: bool,
    next_id: usize,
}

impl RequestManager {
    /// 新しいマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: HashMap::new(),
            handlers: HashMap::new(),
            one_shots: HashMap::new(),
            watchers: Vec::new(),
            run_to_cursor: None,
            muted: false,
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// ブレークポイントを追加し、ターゲットに要求を作成する
    pub fn add_breakpoint(
        &mut self,
        vm: &dyn TargetVm,
        position: SourcePosition,
        suspend_policy: SuspendPolicy,
    ) -> std::result::Result<BreakpointId, TargetError> {
        let request = vm.create_breakpoint_request(&position, suspend_policy)?;
        let id = self.allocate_id();
        debug!("breakpoint {} at {} ({})", id, position, request);
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                position,
                suspend_policy,
                enabled: true,
                hit_count: 0,
                request,
            },
        );
        self.handlers.insert(request, Handler::Breakpoint(id));
        Ok(id)
    }

    /// ブレークポイントを削除する
    pub fn remove_breakpoint(
        &mut self,
        vm: &dyn TargetVm,
        id: BreakpointId,
    ) -> std::result::Result<bool, TargetError> {
        let Some(bp) = self.breakpoints.remove(&id) else {
            return Ok(false);
        };
        self.handlers.remove(&bp.request);
        vm.delete_event_request(bp.request)?;
        Ok(true)
    }

    pub fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// ブレークポイントを取得する
    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// 全てのブレークポイントを取得する（ID順）
    pub fn all(&self) -> Vec<&Breakpoint> {
        let mut all: Vec<&Breakpoint> = self.breakpoints.values().collect();
        all.sort_by_key(|bp| bp.id);
        all
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// 任意のリクエスタを位置に登録する
    pub fn add_requestor(
        &mut self,
        vm: &dyn TargetVm,
        position: &SourcePosition,
        suspend_policy: SuspendPolicy,
        requestor: Box<dyn Requestor>,
    ) -> std::result::Result<RequestId, TargetError> {
        let request = vm.create_breakpoint_request(position, suspend_policy)?;
        debug!("requestor '{}' at {} ({})", requestor.name(), position, request);
        self.handlers.insert(request, Handler::Custom(requestor));
        Ok(request)
    }

    /// 一度だけ発火するハンドラを登録する
    ///
    /// このハンドラが受け取ったイベントはサスペンドコンテキストを作らずに
    /// 処理され、再開に投票したものとして扱われます。
    pub fn add_one_shot<F>(&mut self, request: RequestId, handler: F)
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        self.one_shots.insert(request, Box::new(handler));
    }

    /// 一度きりのハンドラを取り出す
    pub fn take_one_shot(&mut self, request: RequestId) -> Option<OneShotHandler> {
        self.one_shots.remove(&request)
    }

    /// クラスロードを監視する。パターンは `*` のワイルドカードが使える
    pub fn add_class_prepare_watcher<F>(&mut self, pattern: &str, callback: F) -> Result<WatcherId>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let filter = ClassFilter::new(pattern)?;
        let id = self.allocate_id();
        self.watchers.push(ClassPrepareWatcher {
            id,
            filter,
            callback: Box::new(callback),
        });
        Ok(id)
    }

    pub fn remove_class_prepare_watcher(&mut self, id: WatcherId) -> bool {
        let before = self.watchers.len();
        self.watchers.retain(|w| w.id != id);
        self.watchers.len() != before
    }

    /// クラスの準備完了を通知する。通知したウォッチャーの数を返す
    pub fn notify_class_prepared(&mut self, class_name: &str) -> usize {
        let mut notified = 0;
        for watcher in self.watchers.iter_mut().filter(|w| w.filter.matches(class_name)) {
            (watcher.callback)(class_name);
            notified += 1;
        }
        notified
    }

    /// カーソル位置まで実行するための一時ブレークポイントを設定する
    pub fn set_run_to_cursor(
        &mut self,
        vm: &dyn TargetVm,
        position: SourcePosition,
        restore_breakpoints: bool,
    ) -> std::result::Result<RequestId, TargetError> {
        self.cancel_run_to_cursor(vm);
        let request = vm.create_breakpoint_request(&position, SuspendPolicy::All)?;
        debug!("run to cursor at {} ({})", position, request);
        self.handlers.insert(request, Handler::RunToCursor);
        self.run_to_cursor = Some(RunToCursor {
            request,
            position,
            restore_breakpoints,
        });
        Ok(request)
    }

    pub fn run_to_cursor_position(&self) -> Option<&SourcePosition> {
        self.run_to_cursor.as_ref().map(|r| &r.position)
    }

    /// カーソル位置の一時ブレークポイントを取り消す
    pub fn cancel_run_to_cursor(&mut self, vm: &dyn TargetVm) -> bool {
        let Some(rtc) = self.run_to_cursor.take() else {
            return false;
        };
        self.handlers.remove(&rtc.request);
        if let Err(e) = vm.delete_event_request(rtc.request) {
            debug!("failed to delete run-to-cursor request: {}", e);
        }
        if rtc.restore_breakpoints {
            self.muted = false;
        }
        true
    }

    /// ブレークポイントをミュートする（ミュート中は再開に投票する）
    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            debug!("breakpoints {}", if muted { "muted" } else { "unmuted" });
        }
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// 位置イベントを要求に対応するハンドラで処理する
    ///
    /// ハンドラのエラーはログに残し、停止に投票します。
    pub fn process_locatable(&mut self, event: &Event, vm: &dyn TargetVm) -> Vote {
        let Some(request) = event.request() else {
            return Vote::Resume;
        };
        let muted = self.muted;
        match self.handlers.get_mut(&request) {
            None => {
                debug!("no requestor for {}", request);
                Vote::Resume
            }
            Some(Handler::RunToCursor) => Vote::Suspend,
            Some(Handler::Breakpoint(id)) => {
                let id = *id;
                let Some(bp) = self.breakpoints.get_mut(&id) else {
                    return Vote::Resume;
                };
                if muted || !bp.enabled {
                    return Vote::Resume;
                }
                bp.hit_count += 1;
                Vote::Suspend
            }
            Some(Handler::Custom(requestor)) => {
                if muted {
                    return Vote::Resume;
                }
                match requestor.process_event(event, vm) {
                    Ok(vote) => vote,
                    Err(e) => {
                        warn!("requestor '{}' failed: {:#}", requestor.name(), e);
                        Vote::Suspend
                    }
                }
            }
        }
    }

    /// 接続断での後始末
    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.handlers.clear();
        self.one_shots.clear();
        self.watchers.clear();
        self.run_to_cursor = None;
        self.muted = false;
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}
