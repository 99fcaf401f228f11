//! ステップ実行の判定
//!
//! ステップ要求ごとに [`StepHint`] を持ち、ステップ完了イベントのたびに
//! 「止まるか、どの深さで続けるか」を判定します。

use crate::settings::{is_filtered, ClassFilter, DebuggerSettings};
use koma_target::{
    Location, MethodRef, RequestId, SourcePosition, StepDepth, StepRequestSpec, SuspendPolicy,
    TargetError, TargetVm, ThreadId,
};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

/// 判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    /// ここで停止してユーザーに見せる
    Stop,
    /// ステップをやめてプロセスを再開する
    Resume,
    /// 指定の深さでステップを続ける
    Step(StepDepth),
}

/// 目的のメソッドに到達したときの動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachedAction {
    Stop,
    Resume,
}

/// スマートステップの対象メソッド
#[derive(Debug, Clone)]
pub struct MethodFilter {
    target: MethodRef,
    /// 最初の何回の一致を読み飛ばすか
    skip_count: u32,
    matches: u32,
    /// 呼び出し式が占める行
    calling_lines: Option<RangeInclusive<u32>>,
    reached: ReachedAction,
}

impl MethodFilter {
    pub fn new(target: MethodRef) -> Self {
        Self {
            target,
            skip_count: 0,
            matches: 0,
            calling_lines: None,
            reached: ReachedAction::Stop,
        }
    }

    pub fn with_skip_count(mut self, skip_count: u32) -> Self {
        self.skip_count = skip_count;
        self
    }

    pub fn with_calling_lines(mut self, lines: RangeInclusive<u32>) -> Self {
        self.calling_lines = Some(lines);
        self
    }

    pub fn with_reached_action(mut self, reached: ReachedAction) -> Self {
        self.reached = reached;
        self
    }

    pub fn target(&self) -> &MethodRef {
        &self.target
    }

    fn covers_line(&self, line: u32) -> bool {
        self.calling_lines
            .as_ref()
            .map(|r| r.contains(&line))
            .unwrap_or(false)
    }

    /// 実行位置が対象メソッドか
    ///
    /// ブリッジメソッドは一致とみなしません。プロキシクラス経由の呼び出しは
    /// 名前とシグネチャだけで判定します。
    pub fn location_matches(&self, location: &Location) -> bool {
        let method = &location.method;
        if method.reference.name != self.target.name
            || method.reference.signature != self.target.signature
            || method.bridge
        {
            return false;
        }
        location.is_assignable_to(&self.target.class_name) || is_proxy_class(location.class_name())
    }
}

fn is_proxy_class(class_name: &str) -> bool {
    class_name.contains("$Proxy") || class_name.contains("$$EnhancerBy")
}

/// 設定以外で登録される追加のステップフィルタ
pub trait ExtraSteppingFilter: Send + Sync {
    fn is_applicable(&self, location: &Location) -> bool;

    fn step_depth(&self) -> StepDepth {
        StepDepth::Out
    }
}

/// フィルタ判定に使う設定
pub struct StepFilters<'a> {
    pub settings: &'a DebuggerSettings,
    pub extra: &'a [Arc<dyn ExtraSteppingFilter>],
}

/// 進行中のステップ要求の状態
#[derive(Debug, Clone)]
pub struct StepHint {
    thread: ThreadId,
    depth: StepDepth,
    frame_count: usize,
    position: Option<SourcePosition>,
    method_filter: Option<MethodFilter>,
    ignore_filters: bool,
    restore_breakpoints: bool,
    stepped_out: bool,
    target_matched: bool,
    parent: Option<Box<StepHint>>,
}

impl StepHint {
    /// ステップ開始時のフレーム数と位置から作成する
    pub fn new(
        thread: ThreadId,
        depth: StepDepth,
        frame_count: usize,
        position: Option<SourcePosition>,
    ) -> Self {
        Self {
            thread,
            depth,
            frame_count,
            position,
            method_filter: None,
            ignore_filters: false,
            restore_breakpoints: false,
            stepped_out: false,
            target_matched: false,
            parent: None,
        }
    }

    /// スレッドの現在位置から作成する
    pub fn for_thread(vm: &dyn TargetVm, thread: ThreadId, depth: StepDepth) -> Result<Self, TargetError> {
        let frame_count = vm.frame_count(thread)?;
        let position = vm.location(thread)?.position();
        Ok(Self::new(thread, depth, frame_count, position))
    }

    pub fn with_method_filter(mut self, filter: MethodFilter) -> Self {
        self.method_filter = Some(filter);
        self
    }

    pub fn set_ignore_filters(&mut self, ignore: bool) {
        self.ignore_filters = ignore;
    }

    /// ステップ終了時にブレークポイントのミュートを解除する
    pub fn set_restore_breakpoints(&mut self, restore: bool) {
        self.restore_breakpoints = restore;
    }

    /// 現在の判定を親として、入れ子のステップを作る
    pub fn nested(self, depth: StepDepth, frame_count: usize, position: Option<SourcePosition>) -> Self {
        let mut child = Self::new(self.thread, depth, frame_count, position);
        child.ignore_filters = self.ignore_filters;
        child.restore_breakpoints = self.restore_breakpoints;
        child.parent = Some(Box::new(self));
        child
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn depth(&self) -> StepDepth {
        self.depth
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn position(&self) -> Option<&SourcePosition> {
        self.position.as_ref()
    }

    pub fn ignore_filters(&self) -> bool {
        self.ignore_filters
    }

    /// 親を含めて、ブレークポイントの復元が必要か
    pub fn restore_breakpoints(&self) -> bool {
        self.restore_breakpoints || self.parent.as_ref().map(|p| p.restore_breakpoints()).unwrap_or(false)
    }

    pub fn is_stepped_out(&self) -> bool {
        self.stepped_out
    }

    pub fn method_filter(&self) -> Option<&MethodFilter> {
        self.method_filter.as_ref()
    }

    pub fn is_target_matched(&self) -> bool {
        self.target_matched
    }

    /// スマートステップの対象に到達しないまま止まったか
    pub fn is_target_not_reached(&self) -> bool {
        self.method_filter.is_some() && !self.target_matched
    }

    pub fn parent(&self) -> Option<&StepHint> {
        self.parent.as_deref()
    }

    /// 入れ子の深さ（自身を含む）
    pub fn chain_len(&self) -> usize {
        1 + self.parent.as_ref().map(|p| p.chain_len()).unwrap_or(0)
    }

    /// 現在位置での判定
    pub fn next_step_depth(
        &mut self,
        frame_count: usize,
        location: &Location,
        filters: &StepFilters<'_>,
    ) -> StepDecision {
        if frame_count < self.frame_count {
            self.stepped_out = true;
        }

        // 対象メソッドの呼び出しに入ったか
        if frame_count != self.frame_count {
            if let Some(filter) = self.method_filter.as_mut() {
                if filter.location_matches(location) {
                    filter.matches += 1;
                    if filter.matches > filter.skip_count {
                        self.target_matched = true;
                        return match filter.reached {
                            ReachedAction::Stop => StepDecision::Stop,
                            ReachedAction::Resume => StepDecision::Resume,
                        };
                    }
                }
            }
        }

        // 同じ文の途中ならそのまま続ける
        if !self.stepped_out && frame_count == self.frame_count && self.depth != StepDepth::Out {
            if let (Some(origin), Some(line)) = (&self.position, location.line) {
                let same_file = location.source_file.as_deref() == Some(origin.file.as_str());
                let in_call = self
                    .method_filter
                    .as_ref()
                    .map(|f| f.covers_line(line))
                    .unwrap_or(false);
                if same_file && (line == origin.line || in_call) {
                    return StepDecision::Step(self.depth);
                }
            }
        }

        if frame_count > self.frame_count && self.depth != StepDepth::Into && self.method_filter.is_none() {
            return StepDecision::Step(self.depth);
        }

        if self.depth == StepDepth::Into || frame_count != self.frame_count {
            if let Some(decision) = self.apply_filters(location, filters) {
                return decision;
            }
        }

        if self.method_filter.is_some() && frame_count > self.frame_count {
            return StepDecision::Step(StepDepth::Out);
        }

        StepDecision::Stop
    }

    fn apply_filters(&self, location: &Location, filters: &StepFilters<'_>) -> Option<StepDecision> {
        let settings = filters.settings;
        let method = &location.method;

        if (settings.skip_synthetic_methods || self.method_filter.is_some())
            && (method.synthetic || method.bridge)
        {
            return Some(StepDecision::Step(self.depth));
        }
        if !self.ignore_filters {
            if settings.skip_getters && method.simple_getter {
                return Some(StepDecision::Step(StepDepth::Out));
            }
            if settings.skip_constructors && (method.constructor || method.static_initializer) {
                return Some(StepDecision::Step(StepDepth::Out));
            }
            if settings.skip_class_loaders && location.is_assignable_to("java.lang.ClassLoader") {
                return Some(StepDecision::Step(StepDepth::Out));
            }
        }
        filters
            .extra
            .iter()
            .find(|f| f.is_applicable(location))
            .map(|f| StepDecision::Step(f.step_depth()))
    }

    /// 判定を行い、入れ子のステップが終わったら親の判定に戻る
    pub fn decide(
        &mut self,
        frame_count: usize,
        location: &Location,
        filters: &StepFilters<'_>,
    ) -> StepDecision {
        let mut decision = self.next_step_depth(frame_count, location, filters);
        while decision == StepDecision::Stop {
            let Some(parent) = self.parent.take() else {
                break;
            };
            debug!("nested {:?} step finished at {}; back to {:?}", self.depth, location, parent.depth);
            *self = *parent;
            decision = self.next_step_depth(frame_count, location, filters);
        }
        decision
    }
}

/// 有効なステップ要求を削除する。`thread` を指定するとそのスレッドの要求だけ
pub fn delete_step_requests(vm: &dyn TargetVm, thread: Option<ThreadId>) -> usize {
    let mut deleted = 0;
    for (request, owner) in vm.step_requests() {
        if thread.map(|t| t == owner).unwrap_or(true) {
            match vm.delete_event_request(request) {
                Ok(()) => deleted += 1,
                Err(e) => debug!("failed to delete step request {}: {}", request, e),
            }
        }
    }
    deleted
}

/// ステップ要求を作成する
///
/// 既存のステップ要求は削除されます。ステップフィルタは、ヒントがフィルタを
/// 無視する場合と、現在のクラス自体がフィルタ対象の場合を除いてクラス除外として
/// 追加されます。要求のサスペンドポリシーはコンテキストに合わせます。
pub fn do_step(
    vm: &dyn TargetVm,
    settings: &DebuggerSettings,
    context_policy: SuspendPolicy,
    thread: ThreadId,
    depth: StepDepth,
    hint: Option<&StepHint>,
) -> Result<RequestId, TargetError> {
    delete_step_requests(vm, None);

    let mut spec = StepRequestSpec::new(thread, depth);
    if !hint.map(|h| h.ignore_filters()).unwrap_or(false) {
        let active: Vec<&ClassFilter> = if settings.tracing_filters_enabled {
            settings.stepping_filters.iter().filter(|f| f.enabled).collect()
        } else {
            Vec::new()
        };
        if !active.is_empty() {
            let current_class = current_class_name(vm, thread);
            let filtered = current_class
                .as_deref()
                .map(|c| is_filtered(c, &settings.stepping_filters))
                .unwrap_or(false);
            if !filtered {
                spec.class_exclusion_filters = active.iter().map(|f| f.pattern().to_string()).collect();
            }
        }
    }
    spec.suspend_policy = match context_policy {
        SuspendPolicy::EventThread => SuspendPolicy::EventThread,
        _ => SuspendPolicy::All,
    };

    let request = vm.create_step_request(spec)?;
    debug!("step {:?} requested on {} ({})", depth, thread, request);
    Ok(request)
}

fn current_class_name(vm: &dyn TargetVm, thread: ThreadId) -> Option<String> {
    match vm.frame_count(thread) {
        Ok(n) if n > 0 => vm.location(thread).ok().map(|l| l.class_name().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use koma_target::{MethodInfo, SimulatedVm};

    fn at(method: MethodInfo, line: u32) -> Location {
        Location::new(method, "Main.java", line)
    }

    fn run(line: u32) -> Location {
        at(MethodInfo::new("app.Main", "run", "()V"), line)
    }

    fn hint(depth: StepDepth, frames: usize, line: u32) -> StepHint {
        StepHint::new(
            ThreadId(1),
            depth,
            frames,
            Some(SourcePosition::new("Main.java", line)),
        )
    }

    fn decide_with(h: &mut StepHint, settings: &DebuggerSettings, frames: usize, loc: &Location) -> StepDecision {
        let filters = StepFilters { settings, extra: &[] };
        h.decide(frames, loc, &filters)
    }

    #[test]
    fn test_step_over_same_line_continues() {
        let settings = DebuggerSettings::default();
        let mut h = hint(StepDepth::Over, 2, 10);
        assert_eq!(
            decide_with(&mut h, &settings, 2, &run(10)),
            StepDecision::Step(StepDepth::Over)
        );
        assert_eq!(decide_with(&mut h, &settings, 2, &run(11)), StepDecision::Stop);
    }

    #[test]
    fn test_deeper_location_keeps_requested_depth() {
        let settings = DebuggerSettings::default();
        let mut h = hint(StepDepth::Over, 2, 10);
        let callee = at(MethodInfo::new("app.Util", "compute", "()I"), 40);
        assert_eq!(
            decide_with(&mut h, &settings, 3, &callee),
            StepDecision::Step(StepDepth::Over)
        );
        assert!(!h.is_stepped_out());
    }

    #[test]
    fn test_stepping_out_disables_same_line_shortcut() {
        let settings = DebuggerSettings::default();
        let mut h = hint(StepDepth::Over, 2, 10);
        assert_eq!(decide_with(&mut h, &settings, 1, &run(5)), StepDecision::Stop);
        assert!(h.is_stepped_out());
        // 同じ深さ・同じ行に戻っても、もう同じ文とはみなさない
        assert_eq!(decide_with(&mut h, &settings, 2, &run(10)), StepDecision::Stop);
    }

    #[test]
    fn test_step_into_filters() {
        let mut settings = DebuggerSettings::default();
        settings.skip_getters = true;
        settings.skip_constructors = true;

        let synthetic = at(MethodInfo::new("app.Main", "access$000", "()I").with_synthetic(), 1);
        let bridge = at(MethodInfo::new("app.Box", "compareTo", "(Ljava/lang/Object;)I").with_bridge(), 1);
        let getter = at(MethodInfo::new("app.Point", "getX", "()I").with_simple_getter(), 7);
        let ctor = at(MethodInfo::new("app.Point", "<init>", "()V"), 3);
        let loader = at(MethodInfo::new("app.MyLoader", "loadClass", "()V"), 9)
            .with_supertypes(&["java.lang.ClassLoader"]);
        let plain = at(MethodInfo::new("app.Point", "norm", "()D"), 12);

        let cases = [
            (&synthetic, StepDecision::Step(StepDepth::Into)),
            (&bridge, StepDecision::Step(StepDepth::Into)),
            (&getter, StepDecision::Step(StepDepth::Out)),
            (&ctor, StepDecision::Step(StepDepth::Out)),
            (&loader, StepDecision::Step(StepDepth::Out)),
            (&plain, StepDecision::Stop),
        ];
        for (loc, expected) in cases {
            let mut h = hint(StepDepth::Into, 2, 10);
            assert_eq!(decide_with(&mut h, &settings, 3, loc), expected, "at {}", loc);
        }
    }

    #[test]
    fn test_ignore_filters_stops_in_getter() {
        let mut settings = DebuggerSettings::default();
        settings.skip_getters = true;
        let getter = at(MethodInfo::new("app.Point", "getX", "()I").with_simple_getter(), 7);
        let mut h = hint(StepDepth::Into, 2, 10);
        h.set_ignore_filters(true);
        assert_eq!(decide_with(&mut h, &settings, 3, &getter), StepDecision::Stop);
    }

    struct SkipPackage(&'static str);

    impl ExtraSteppingFilter for SkipPackage {
        fn is_applicable(&self, location: &Location) -> bool {
            location.class_name().starts_with(self.0)
        }
    }

    #[test]
    fn test_extra_filter() {
        let settings = DebuggerSettings::default();
        let extra: Vec<Arc<dyn ExtraSteppingFilter>> = vec![Arc::new(SkipPackage("kotlin."))];
        let filters = StepFilters { settings: &settings, extra: &extra };
        let inline = at(MethodInfo::new("kotlin.collections.Maps", "get", "()V"), 1);
        let mut h = hint(StepDepth::Into, 2, 10);
        assert_eq!(h.decide(3, &inline, &filters), StepDecision::Step(StepDepth::Out));
    }

    #[test]
    fn test_method_filter_skips_until_target() {
        let settings = DebuggerSettings::default();
        let target = MethodRef::new("app.Service", "handle", "()V");
        let mut h = hint(StepDepth::Into, 2, 10)
            .with_method_filter(MethodFilter::new(target).with_skip_count(1));

        let other = at(MethodInfo::new("app.Args", "build", "()V"), 4);
        assert_eq!(decide_with(&mut h, &settings, 3, &other), StepDecision::Step(StepDepth::Out));

        let handle = at(MethodInfo::new("app.ServiceImpl", "handle", "()V"), 20)
            .with_supertypes(&["app.Service"]);
        // 1回目の一致は読み飛ばす
        assert_eq!(decide_with(&mut h, &settings, 3, &handle), StepDecision::Step(StepDepth::Out));
        assert!(!h.is_target_matched());
        assert_eq!(decide_with(&mut h, &settings, 3, &handle), StepDecision::Stop);
        assert!(h.is_target_matched());
        assert!(!h.is_target_not_reached());
    }

    #[test]
    fn test_method_filter_bridge_and_proxy() {
        let target = MethodRef::new("app.Service", "handle", "()V");
        let filter = MethodFilter::new(target);
        let bridge = at(MethodInfo::new("app.ServiceImpl", "handle", "()V").with_bridge(), 1)
            .with_supertypes(&["app.Service"]);
        let proxy = at(MethodInfo::new("com.sun.proxy.$Proxy12", "handle", "()V"), 1);
        let wrong_sig = at(MethodInfo::new("app.Service", "handle", "(I)V"), 1);
        assert!(!filter.location_matches(&bridge));
        assert!(filter.location_matches(&proxy));
        assert!(!filter.location_matches(&wrong_sig));
    }

    #[test]
    fn test_method_filter_calling_lines_and_not_reached() {
        let settings = DebuggerSettings::default();
        let target = MethodRef::new("app.Service", "handle", "()V");
        let mut h = hint(StepDepth::Into, 2, 10)
            .with_method_filter(MethodFilter::new(target).with_calling_lines(10..=12));
        assert_eq!(
            decide_with(&mut h, &settings, 2, &run(12)),
            StepDecision::Step(StepDepth::Into)
        );
        assert_eq!(decide_with(&mut h, &settings, 2, &run(13)), StepDecision::Stop);
        assert!(h.is_target_not_reached());
    }

    #[test]
    fn test_reached_action_resume() {
        let settings = DebuggerSettings::default();
        let target = MethodRef::new("app.Main", "lambda$run$0", "()V");
        let mut h = hint(StepDepth::Into, 2, 10).with_method_filter(
            MethodFilter::new(target).with_reached_action(ReachedAction::Resume),
        );
        let lambda = at(MethodInfo::new("app.Main", "lambda$run$0", "()V"), 11);
        assert_eq!(decide_with(&mut h, &settings, 4, &lambda), StepDecision::Resume);
    }

    #[test]
    fn test_nested_step_out_returns_to_parent_decision() {
        let settings = DebuggerSettings::default();
        let parent = hint(StepDepth::Into, 2, 10);
        let mut h = parent.nested(StepDepth::Out, 3, Some(SourcePosition::new("Point.java", 7)));
        assert_eq!(h.chain_len(), 2);

        // 呼び出し元の同じ行に戻ったので、親の Into を続ける
        assert_eq!(
            decide_with(&mut h, &settings, 2, &run(10)),
            StepDecision::Step(StepDepth::Into)
        );
        assert_eq!(h.chain_len(), 1);
        assert_eq!(h.depth(), StepDepth::Into);
    }

    #[test]
    fn test_do_step_filters_and_policy() {
        let vm = SimulatedVm::new();
        let t = vm.add_thread("main");
        vm.suspend().unwrap();
        vm.move_to(t, run(10), 2).unwrap();

        let mut settings = DebuggerSettings::default();
        settings.stepping_filters = vec![ClassFilter::new("java.*").unwrap()];

        let first = do_step(&vm, &settings, SuspendPolicy::EventThread, t, StepDepth::Into, None).unwrap();
        let second = do_step(&vm, &settings, SuspendPolicy::All, t, StepDepth::Over, None).unwrap();
        assert_ne!(first, second);
        assert_eq!(vm.step_requests(), vec![(second, t)]);

        // 現在のクラス自体がフィルタ対象ならフィルタは付けない
        vm.move_to(t, at(MethodInfo::new("java.util.List", "add", "()V"), 1), 3).unwrap();
        do_step(&vm, &settings, SuspendPolicy::All, t, StepDepth::Out, None).unwrap();
        assert_eq!(delete_step_requests(&vm, Some(t)), 1);
        assert!(vm.step_requests().is_empty());
    }
}
