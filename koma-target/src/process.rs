//! ターゲットプロセス制御の抽象

use crate::{
    EventSet, Location, MethodRef, RequestId, SourcePosition, StepRequestSpec, SuspendPolicy,
    ThreadId, ThreadStatus,
};
use std::time::Duration;
use thiserror::Error;

/// ターゲット操作のエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// ターゲットとの接続が切れた
    #[error("target disconnected")]
    Disconnected,
    /// 存在しないスレッド
    #[error("invalid thread {0}")]
    InvalidThread(ThreadId),
    /// スレッドが要求された状態にない（例: 呼び出し時に停止していない）
    #[error("incompatible thread state for {0}")]
    IncompatibleThreadState(ThreadId),
    /// 呼び出し先が例外を送出した
    #[error("method threw {0}")]
    InvocationException(String),
    /// クラスが未ロード
    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),
    /// ターゲットが応答しなかった
    #[error("target did not respond within {0:?}")]
    Timeout(Duration),
    /// 存在しない要求
    #[error("invalid event request {0}")]
    InvalidRequest(RequestId),
}

/// リモート呼び出しの値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i64),
    Str(String),
    Object { type_name: String, id: u64 },
}

/// リモート呼び出しのオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvokeOptions {
    /// 呼び出しスレッドのみを再開する
    pub single_threaded: bool,
}

/// デバッグ対象プロセス
///
/// サスペンドはスレッドごとのカウンタで管理されます。`suspend`/`suspend_thread` は
/// カウンタを1増やし、`resume`/`resume_thread` は0より大きい場合のみ1減らします。
/// カウンタが0のスレッドだけが実際に走ります。
pub trait TargetVm: Send + Sync {
    /// 次のイベントセットが届くまでブロックする
    fn next_event_set(&self) -> Result<EventSet, TargetError>;

    /// 生存している全スレッド
    fn all_threads(&self) -> Vec<ThreadId>;

    fn thread_name(&self, thread: ThreadId) -> Result<String, TargetError>;

    fn thread_status(&self, thread: ThreadId) -> Result<ThreadStatus, TargetError>;

    /// スレッドのサスペンドカウンタ
    fn suspend_count(&self, thread: ThreadId) -> Result<u32, TargetError>;

    /// プロセス全体を停止する
    fn suspend(&self) -> Result<(), TargetError>;

    /// プロセス全体を再開する
    fn resume(&self) -> Result<(), TargetError>;

    fn suspend_thread(&self, thread: ThreadId) -> Result<(), TargetError>;

    fn resume_thread(&self, thread: ThreadId) -> Result<(), TargetError>;

    /// スタックフレーム数（停止中のスレッドのみ）
    fn frame_count(&self, thread: ThreadId) -> Result<usize, TargetError>;

    /// トップフレームの実行位置（停止中のスレッドのみ）
    fn location(&self, thread: ThreadId) -> Result<Location, TargetError>;

    fn create_step_request(&self, spec: StepRequestSpec) -> Result<RequestId, TargetError>;

    fn create_breakpoint_request(
        &self,
        position: &SourcePosition,
        suspend_policy: SuspendPolicy,
    ) -> Result<RequestId, TargetError>;

    fn delete_event_request(&self, request: RequestId) -> Result<(), TargetError>;

    /// 有効なステップ要求とその対象スレッド
    fn step_requests(&self) -> Vec<(RequestId, ThreadId)>;

    /// 停止中のスレッドでメソッドを呼び出す
    ///
    /// 呼び出しが戻るか例外を送出するまで、呼び出し元の OS スレッドをブロックします。
    fn invoke_method(
        &self,
        thread: ThreadId,
        method: &MethodRef,
        args: &[Value],
        options: InvokeOptions,
    ) -> Result<Value, TargetError>;

    /// `thread` のコンテキストでクラスをロードする（停止中のスレッドのみ）
    ///
    /// 呼び出しが `ClassNotLoaded` で失敗したときに使います。
    fn load_class(&self, thread: ThreadId, class_name: &str) -> Result<(), TargetError>;

    /// ターゲットを終了させる
    fn exit(&self, code: i32) -> Result<(), TargetError>;

    /// 接続を破棄する
    fn dispose(&self) -> Result<(), TargetError>;
}
