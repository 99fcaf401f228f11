//! Koma デバッガのコア機能
//!
//! デバッグ対象プロセスの停止状態を管理する調停エンジンです。
//! 全ての状態はマネージャスレッドが所有し、操作はコマンドとして渡されます。

pub mod command;
pub mod errors;
mod evaluation;
mod events;
pub mod manager;
pub mod parse;
pub mod process;
pub mod requests;
pub mod settings;
pub mod stepping;
pub mod suspend;
pub mod watchdog;

pub use command::Command;
pub use errors::{CommandError, EvaluateError, SchedulerError, SuspendError};
pub use manager::{DebuggerCommand, ManagerContext, ManagerThread, Priority};
pub use process::{DebugProcess, DebugProcessListener, DebuggerState, ProcessState, ThreadSummary};
pub use requests::{Breakpoint, BreakpointId, Requestor, Vote};
pub use settings::{ClassFilter, DebuggerSettings};
pub use stepping::{ExtraSteppingFilter, MethodFilter, ReachedAction, StepDecision, StepHint};
pub use suspend::{ContextId, SuspendContext, SuspendListener, SuspendManager, VoteResolution};

// 他のクレートから使用するために再エクスポート
pub use koma_target::{SimulatedVm, TargetVm, ThreadId};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
