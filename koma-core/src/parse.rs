//! パース関連のユーティリティ関数

use anyhow::Result;
use koma_target::{MethodRef, SourcePosition, ThreadId};

/// スレッドIDをパース
///
/// `3` と `thread#3` の両方の書き方をサポート
///
/// # Examples
/// ```
/// use koma_core::parse::parse_thread_id;
/// use koma_core::ThreadId;
///
/// assert_eq!(parse_thread_id("3").unwrap(), ThreadId(3));
/// assert_eq!(parse_thread_id("thread#3").unwrap(), ThreadId(3));
/// ```
pub fn parse_thread_id(s: &str) -> Result<ThreadId> {
    let s = s.trim();
    let digits = s.strip_prefix("thread#").unwrap_or(s);
    digits
        .parse::<u64>()
        .map(ThreadId)
        .map_err(|e| anyhow::anyhow!("Invalid thread id '{}': {}", s, e))
}

/// `ファイル:行` 形式のソース位置をパース
pub fn parse_position(s: &str) -> Result<SourcePosition> {
    let s = s.trim();
    let (file, line) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid position '{}': expected FILE:LINE", s))?;
    if file.is_empty() {
        return Err(anyhow::anyhow!("Invalid position '{}': missing file", s));
    }
    let line = line
        .parse::<u32>()
        .map_err(|e| anyhow::anyhow!("Invalid line in '{}': {}", s, e))?;
    Ok(SourcePosition::new(file, line))
}

/// `クラス.メソッド(シグネチャ)` 形式のメソッド参照をパース
///
/// シグネチャを省略すると `()V` になります。
pub fn parse_method(s: &str) -> Result<MethodRef> {
    let s = s.trim();
    let (qualified, signature) = match s.find('(') {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, "()V"),
    };
    match qualified.rsplit_once('.') {
        Some((class, method)) if !class.is_empty() && !method.is_empty() => {
            Ok(MethodRef::new(class, method, signature))
        }
        _ => Err(anyhow::anyhow!("Invalid method '{}': expected CLASS.METHOD", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_id() {
        assert_eq!(parse_thread_id("7").unwrap(), ThreadId(7));
        assert_eq!(parse_thread_id(" thread#12 ").unwrap(), ThreadId(12));
        assert!(parse_thread_id("main").is_err());
        assert!(parse_thread_id("thread#").is_err());
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("Main.java:10").unwrap(), SourcePosition::new("Main.java", 10));
        assert_eq!(
            parse_position("C:/src/Main.java:3").unwrap(),
            SourcePosition::new("C:/src/Main.java", 3)
        );
        assert!(parse_position("Main.java").is_err());
        assert!(parse_position(":10").is_err());
        assert!(parse_position("Main.java:x").is_err());
    }

    #[test]
    fn test_parse_method() {
        let m = parse_method("app.Main.toString()Ljava/lang/String;").unwrap();
        assert_eq!(m, MethodRef::new("app.Main", "toString", "()Ljava/lang/String;"));
        assert_eq!(parse_method("app.Main.run").unwrap().signature, "()V");
        assert!(parse_method("run").is_err());
    }
}
