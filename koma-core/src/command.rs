//! デバッガコマンド

use crate::parse::{parse_method, parse_position, parse_thread_id};
use crate::BreakpointId;
use koma_target::{MethodRef, SourcePosition, ThreadId};

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(SourcePosition),
    /// ブレークポイントを削除
    Delete(BreakpointId),
    /// ブレークポイント一覧
    Breakpoints,
    /// 実行継続
    Continue,
    /// ステップイン
    Step,
    /// 次の行へ
    Next,
    /// 現在のメソッドから抜けるまで実行
    Finish,
    /// 指定位置まで実行
    Until(SourcePosition),
    /// 全スレッドを一時停止
    Pause,
    /// スレッド一覧表示
    Threads,
    /// スレッドを1つだけ再開
    ResumeThread(ThreadId),
    /// スレッドを凍結
    Freeze(ThreadId),
    /// 凍結を解除
    Thaw(ThreadId),
    /// メソッド呼び出しの評価
    Eval(MethodRef),
    /// ブレークポイントのミュート切り替え
    Mute(bool),
    /// サスペンドコンテキストの状態表示
    Contexts,
    /// シミュレーション: ブレークポイントにヒットさせる
    SimHit(ThreadId, SourcePosition),
    /// シミュレーション: ステップ完了（行とフレーム数）
    SimStep(ThreadId, u32, usize),
    /// シミュレーション: スレッドを開始
    SimThread(String),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => parts.get(1).and_then(|p| parse_position(p).ok()).map(Command::Break),
            "delete" | "d" => parts.get(1).and_then(|p| p.parse().ok()).map(Command::Delete),
            "breakpoints" | "bl" => Some(Command::Breakpoints),
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::Step),
            "next" | "n" => Some(Command::Next),
            "finish" | "f" => Some(Command::Finish),
            "until" | "u" => parts.get(1).and_then(|p| parse_position(p).ok()).map(Command::Until),
            "pause" | "p" => Some(Command::Pause),
            "threads" | "t" => Some(Command::Threads),
            "resume" => thread_arg(&parts).map(Command::ResumeThread),
            "freeze" => thread_arg(&parts).map(Command::Freeze),
            "thaw" => thread_arg(&parts).map(Command::Thaw),
            "eval" | "e" => parts.get(1).and_then(|p| parse_method(p).ok()).map(Command::Eval),
            "mute" => match parts.get(1) {
                None | Some(&"on") => Some(Command::Mute(true)),
                Some(&"off") => Some(Command::Mute(false)),
                _ => None,
            },
            "contexts" | "ctx" => Some(Command::Contexts),
            "sim" => Self::parse_sim(&parts[1..]),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }

    fn parse_sim(parts: &[&str]) -> Option<Self> {
        match parts {
            ["hit", thread, position] => Some(Command::SimHit(
                parse_thread_id(thread).ok()?,
                parse_position(position).ok()?,
            )),
            ["step", thread, line, frames] => Some(Command::SimStep(
                parse_thread_id(thread).ok()?,
                line.parse().ok()?,
                frames.parse().ok()?,
            )),
            ["thread", name] => Some(Command::SimThread(name.to_string())),
            _ => None,
        }
    }
}

fn thread_arg(parts: &[&str]) -> Option<ThreadId> {
    parts.get(1).and_then(|p| parse_thread_id(p).ok())
}
