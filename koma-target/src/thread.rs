//! スレッド識別子

use std::fmt;

/// スレッドID
///
/// ターゲット側のスレッドを一意に識別します。スレッドの生存期間中は変化しません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// ターゲットが報告するスレッドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// 実行中
    Running,
    /// sleep中
    Sleeping,
    /// モニタ待ち
    Monitor,
    /// wait中
    Wait,
    /// 終了済み
    Zombie,
    /// 未開始
    NotStarted,
    /// 不明
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId(7).to_string(), "thread#7");
    }
}
