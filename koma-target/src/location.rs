//! コード位置とメソッド情報

use std::fmt;

/// メソッド参照（クラス名・メソッド名・シグネチャ）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class_name: String,
    pub name: String,
    pub signature: String,
}

impl MethodRef {
    /// 新しいメソッド参照を作成する
    pub fn new(class_name: &str, name: &str, signature: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            name: name.to_string(),
            signature: signature.to_string(),
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.signature)
    }
}

/// ターゲットが報告するメソッドの属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub reference: MethodRef,
    /// コンパイラが生成したメソッド
    pub synthetic: bool,
    /// ブリッジメソッド
    pub bridge: bool,
    /// コンストラクタ
    pub constructor: bool,
    /// クラス初期化子
    pub static_initializer: bool,
    /// フィールドを返すだけの単純なgetter
    pub simple_getter: bool,
}

impl MethodInfo {
    /// 通常のメソッドとして作成する
    pub fn new(class_name: &str, name: &str, signature: &str) -> Self {
        Self {
            reference: MethodRef::new(class_name, name, signature),
            synthetic: false,
            bridge: false,
            constructor: name == "<init>",
            static_initializer: name == "<clinit>",
            simple_getter: false,
        }
    }

    pub fn with_synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn with_bridge(mut self) -> Self {
        self.bridge = true;
        self.synthetic = true;
        self
    }

    pub fn with_simple_getter(mut self) -> Self {
        self.simple_getter = true;
        self
    }

    pub fn class_name(&self) -> &str {
        &self.reference.class_name
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }
}

/// ソース上の位置（ファイルと行）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub file: String,
    pub line: u32,
}

impl SourcePosition {
    pub fn new(file: &str, line: u32) -> Self {
        Self {
            file: file.to_string(),
            line,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// 実行位置
///
/// スレッドのトップフレームが指している位置です。ソース情報がない場合もあります。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub method: MethodInfo,
    pub source_file: Option<String>,
    pub line: Option<u32>,
    /// 宣言クラスのスーパータイプ（近い順）
    pub supertypes: Vec<String>,
}

impl Location {
    /// 新しい実行位置を作成する
    pub fn new(method: MethodInfo, source_file: &str, line: u32) -> Self {
        Self {
            method,
            source_file: Some(source_file.to_string()),
            line: Some(line),
            supertypes: Vec::new(),
        }
    }

    pub fn with_supertypes(mut self, supertypes: &[&str]) -> Self {
        self.supertypes = supertypes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// 宣言クラス名を取得する
    pub fn class_name(&self) -> &str {
        self.method.class_name()
    }

    /// ソース位置を取得する（ファイルと行が揃っている場合のみ）
    pub fn position(&self) -> Option<SourcePosition> {
        match (&self.source_file, self.line) {
            (Some(file), Some(line)) => Some(SourcePosition::new(file, line)),
            _ => None,
        }
    }

    /// 宣言クラスが指定したクラスに代入可能かどうか
    pub fn is_assignable_to(&self, class_name: &str) -> bool {
        self.class_name() == class_name || self.supertypes.iter().any(|s| s == class_name)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position() {
            Some(pos) => write!(f, "{}.{} ({})", self.class_name(), self.method.name(), pos),
            None => write!(f, "{}.{}", self.class_name(), self.method.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_detection() {
        assert!(MethodInfo::new("a.B", "<init>", "()V").constructor);
        assert!(MethodInfo::new("a.B", "<clinit>", "()V").static_initializer);
        assert!(!MethodInfo::new("a.B", "run", "()V").constructor);
    }

    #[test]
    fn test_assignable() {
        let loc = Location::new(MethodInfo::new("app.Loader", "load", "()V"), "Loader.java", 3)
            .with_supertypes(&["java.lang.ClassLoader", "java.lang.Object"]);
        assert!(loc.is_assignable_to("java.lang.ClassLoader"));
        assert!(loc.is_assignable_to("app.Loader"));
        assert!(!loc.is_assignable_to("java.lang.Thread"));
    }
}
