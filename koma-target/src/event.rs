//! デバッグイベント

use crate::{Location, ThreadId};
use std::fmt;

/// イベント要求ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// イベント発生時にターゲットがどこまで停止させたか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendPolicy {
    /// プロセス全体を停止
    All,
    /// イベントを発生させたスレッドのみ停止
    EventThread,
    /// 停止しない
    None,
}

/// 位置情報を持つイベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatableKind {
    /// ブレークポイントヒット
    Breakpoint,
    /// ステップ実行完了
    Step,
    /// 例外送出
    Exception { exception_class: String, caught: bool },
    /// メソッド開始
    MethodEntry,
    /// メソッド終了
    MethodExit,
}

/// ターゲットから届くデバッグイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// プロセス開始
    VmStart { thread: Option<ThreadId> },
    /// プロセス終了
    VmDeath,
    /// 接続断
    VmDisconnect,
    /// スレッド開始
    ThreadStart { thread: ThreadId },
    /// スレッド終了
    ThreadDeath { thread: ThreadId },
    /// クラスの準備完了
    ClassPrepare {
        request: Option<RequestId>,
        thread: Option<ThreadId>,
        class_name: String,
    },
    /// 位置情報を持つイベント
    Locatable {
        request: Option<RequestId>,
        kind: LocatableKind,
        thread: ThreadId,
        location: Location,
    },
}

impl Event {
    /// このイベントを発生させた要求
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Event::ClassPrepare { request, .. } | Event::Locatable { request, .. } => *request,
            _ => None,
        }
    }

    /// このイベントに関連するスレッド
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Event::VmStart { thread } => *thread,
            Event::ClassPrepare { thread, .. } => *thread,
            Event::ThreadStart { thread } | Event::ThreadDeath { thread } => Some(*thread),
            Event::Locatable { thread, .. } => Some(*thread),
            Event::VmDeath | Event::VmDisconnect => None,
        }
    }

    /// ステップ完了イベントかどうか
    pub fn is_step(&self) -> bool {
        matches!(
            self,
            Event::Locatable {
                kind: LocatableKind::Step,
                ..
            }
        )
    }
}

/// 同時に到着したイベントの集合
///
/// イベントセットは一つの単位として投票されます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

impl EventSet {
    pub fn new(suspend_policy: SuspendPolicy, events: Vec<Event>) -> Self {
        Self {
            suspend_policy,
            events,
        }
    }

    /// イベントセットを発生させたスレッド（最初にスレッドを持つイベントのもの）
    pub fn thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(Event::thread)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
