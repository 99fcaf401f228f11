//! エラー型とエラーメッセージ定数

use koma_target::TargetError;
use thiserror::Error;

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// サスペンドコンテキストが見つからない場合のエラーメッセージ
pub const ERR_CONTEXT_NOT_FOUND: &str = "Suspend context not found";

/// コンテキストにスレッドがない場合のエラーメッセージ
pub const ERR_NO_THREAD: &str = "Suspend context has no thread";

/// コマンドスケジューラのエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// キューが閉じられている
    #[error("command queue is closed")]
    QueueClosed,
    /// マネージャスレッド上で invoke_and_wait が呼ばれた
    #[error("invoke_and_wait called from the manager thread")]
    InvokeAndWaitOnManagerThread,
    /// コマンドが実行されずにキャンセルされた
    #[error("command cancelled")]
    Cancelled,
    /// コマンドが失敗した
    #[error("command failed: {0}")]
    Failed(String),
}

/// サスペンドレジストリの不変条件違反
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SuspendError {
    #[error("unknown suspend context")]
    UnknownContext,
    /// 再開済み（または破棄済み）のコンテキストに対する操作
    #[error("suspend context is not live")]
    ContextNotLive,
    /// 明示的に再開されていないスレッドの再停止
    #[error("thread was not explicitly resumed in this context")]
    NotExplicitlyResumed,
    /// コンテキスト自身のスレッドに対する明示的な再開・停止
    #[error("operation not allowed on the context's own thread")]
    BreakpointThread,
    /// 全体停止でないコンテキスト、またはコンテキストが止めていないスレッド
    #[error("explicit resume needs a whole-process context covering the thread")]
    NotWholeProcess,
    #[error("thread is already explicitly resumed in this context")]
    AlreadyExplicitlyResumed,
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// 評価（リモートメソッド呼び出し）のエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluateError {
    /// 同じスレッドで評価が進行中
    #[error("nested evaluation is not supported")]
    NestedEvaluation,
    #[error("no thread to evaluate in")]
    NoThread,
    /// スレッドがイベントで停止していないため呼び出せない
    #[error("thread is not suspended by an event and cannot invoke methods")]
    ThreadNotSuspendable,
    #[error("suspend context was resumed")]
    ContextResumed,
    #[error("method threw {0}")]
    Exception(String),
    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),
    #[error("evaluation timed out")]
    Timeout,
    #[error("target disconnected")]
    Disconnected,
    #[error("evaluation cancelled")]
    Cancelled,
}

impl From<TargetError> for EvaluateError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Disconnected => Self::Disconnected,
            TargetError::IncompatibleThreadState(_) | TargetError::InvalidThread(_) => {
                Self::ThreadNotSuspendable
            }
            TargetError::InvocationException(e) => Self::Exception(e),
            TargetError::ClassNotLoaded(c) => Self::ClassNotLoaded(c),
            TargetError::Timeout(_) => Self::Timeout,
            TargetError::InvalidRequest(r) => Self::Exception(format!("invalid request {}", r)),
        }
    }
}

/// コマンド実行中のエラー
#[derive(Debug, Error)]
pub enum CommandError {
    /// ターゲットとの接続が切れた
    #[error("target disconnected")]
    Disconnected,
    /// ワーカーがデバッガ状態を保持していない（強制的な置き換えの直後）
    #[error("debugger state is not available on this worker")]
    StateUnavailable,
    #[error(transparent)]
    Suspend(SuspendError),
    #[error(transparent)]
    Target(TargetError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TargetError> for CommandError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Disconnected => Self::Disconnected,
            other => Self::Target(other),
        }
    }
}

impl From<SuspendError> for CommandError {
    fn from(err: SuspendError) -> Self {
        match err {
            SuspendError::Target(TargetError::Disconnected) => Self::Disconnected,
            other => Self::Suspend(other),
        }
    }
}
