//! デバッガ設定

use regex::Regex;
use std::time::Duration;

/// ステップ実行時に除外するクラスのパターン
///
/// パターンはクラス名に対するワイルドカード（`*`）で、`java.*` や `*.Proxy` のように書きます。
#[derive(Debug, Clone)]
pub struct ClassFilter {
    pattern: String,
    regex: Regex,
    pub enabled: bool,
}

impl ClassFilter {
    /// パターンからフィルタを作成する
    pub fn new(pattern: &str) -> crate::Result<Self> {
        let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
        let regex = Regex::new(&format!("^{}$", escaped.join(".*")))
            .map_err(|e| anyhow::anyhow!("Invalid class filter '{}': {}", pattern, e))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            enabled: true,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// クラス名がパターンにマッチするか
    pub fn matches(&self, class_name: &str) -> bool {
        self.regex.is_match(class_name)
    }
}

/// クラス名が有効なフィルタのいずれかにマッチするか
pub fn is_filtered(class_name: &str, filters: &[ClassFilter]) -> bool {
    filters
        .iter()
        .any(|f| f.enabled && f.matches(class_name))
}

/// デバッガ設定
#[derive(Debug, Clone)]
pub struct DebuggerSettings {
    /// 合成メソッドをステップ対象から外す
    pub skip_synthetic_methods: bool,
    /// 単純なgetterをステップ対象から外す
    pub skip_getters: bool,
    /// コンストラクタをステップ対象から外す
    pub skip_constructors: bool,
    /// クラスローダーのメソッドをステップ対象から外す
    pub skip_class_loaders: bool,
    /// `stepping_filters` を有効にする
    pub tracing_filters_enabled: bool,
    pub stepping_filters: Vec<ClassFilter>,
    /// 全スレッド停止中の評価を呼び出しスレッドだけで行う
    pub invoke_single_threaded: bool,
    /// 評価が長引いたときに他スレッドを走らせるまでの時間
    pub watchdog_threshold: Duration,
    /// デッドロックの疑いを報告するまでの時間
    pub deadlock_report_delay: Duration,
    /// 停止コマンドが詰まったときにワーカーを置き換えるまでの時間
    pub command_timeout: Duration,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            skip_synthetic_methods: true,
            skip_getters: false,
            skip_constructors: false,
            skip_class_loaders: true,
            tracing_filters_enabled: true,
            stepping_filters: Vec::new(),
            invoke_single_threaded: true,
            watchdog_threshold: Duration::from_millis(500),
            deadlock_report_delay: Duration::from_secs(10),
            command_timeout: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_filter_wildcards() {
        let f = ClassFilter::new("java.*").unwrap();
        assert!(f.matches("java.lang.String"));
        assert!(!f.matches("javax.swing.JFrame"));
        assert!(!f.matches("app.java.Main"));

        let exact = ClassFilter::new("app.Main$1").unwrap();
        assert!(exact.matches("app.Main$1"));
        assert!(!exact.matches("app.Main$12"));
    }

    #[test]
    fn test_disabled_filter_is_ignored() {
        let mut f = ClassFilter::new("sun.*").unwrap();
        f.enabled = false;
        assert!(!is_filtered("sun.misc.Unsafe", &[f]));
    }
}
