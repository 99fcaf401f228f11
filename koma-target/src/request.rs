//! ステップ実行要求

use crate::{SuspendPolicy, ThreadId};

/// ステップの深さ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepDepth {
    /// 呼び出し先に入る
    Into,
    /// 呼び出しをまたぐ
    Over,
    /// 現在のメソッドから抜ける
    Out,
}

/// ステップの粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepSize {
    /// 最小単位（命令）
    Min,
    /// ソース行
    Line,
}

/// ターゲットに発行するステップ要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequestSpec {
    pub thread: ThreadId,
    pub size: StepSize,
    pub depth: StepDepth,
    /// ステップ中に報告しないクラスのパターン
    pub class_exclusion_filters: Vec<String>,
    pub suspend_policy: SuspendPolicy,
}

impl StepRequestSpec {
    pub fn new(thread: ThreadId, depth: StepDepth) -> Self {
        Self {
            thread,
            size: StepSize::Line,
            depth,
            class_exclusion_filters: Vec::new(),
            suspend_policy: SuspendPolicy::All,
        }
    }
}
