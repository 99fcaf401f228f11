//! Koma ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象プロセスとのやり取りに使う型と抽象を提供します。
//! スレッド識別子、コード位置、デバッグイベント、ステップ・ブレークポイント要求、
//! そしてブロッキングなイベント取得・サスペンド制御・リモートメソッド呼び出しを
//! まとめた [`TargetVm`] トレイトを定義します。

pub mod thread;
pub mod location;
pub mod event;
pub mod request;
pub mod process;
pub mod sim;

pub use thread::{ThreadId, ThreadStatus};
pub use location::{Location, MethodInfo, MethodRef, SourcePosition};
pub use event::{Event, EventSet, LocatableKind, RequestId, SuspendPolicy};
pub use request::{StepDepth, StepRequestSpec, StepSize};
pub use process::{InvokeOptions, TargetError, TargetVm, Value};
pub use sim::{InvocationCall, SimulatedVm};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
