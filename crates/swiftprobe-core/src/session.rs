/*
 * SwiftProbe - デバッグセッション
 *
 * 1つのデバッグ対象に対するプロセス・ブレークポイント・スタック・変数・ウォッチ式を
 * まとめて管理する状態機械です。
 *
 *   Initializing → Ready → (Running ⇄ Suspended) → Terminated
 *
 * Error には回復不能なプロセス障害でどの状態からも遷移します。
 * コマンドの直列化はセッションを包むレジストリ側のゲートで行います。
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::adapter::{strip_prompts, BackendAdapter, ReportedValue, StopEvent};
use crate::breakpoints::BreakpointManager;
use crate::config::{EngineConfig, SessionConfig};
use crate::error::{DebugError, Result};
use crate::evaluator::{rejected, ExpressionEvaluator};
use crate::inspector::{VariableInspector, MAX_CHILDREN};
use crate::process::{LaunchSpec, ProcessController};
use crate::protocol::{
    Breakpoint, BreakpointRequest, DebugConfiguration, DebugState, EvaluationResult, SessionDescriptor, SessionId,
    SessionStatus, StackFrame, StepKind, StopReason, Variable, VariableScope, WatchExpression,
};
use crate::relay::Collected;
use crate::stack::CallStackTracker;

/// デバッグセッション
pub struct DebugSession {
    id: SessionId,
    config: DebugConfiguration,
    settings: SessionConfig,
    queue_capacity: usize,
    adapter: Arc<dyn BackendAdapter>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,

    /// セッションに結び付いた唯一のプロセス
    process: Option<ProcessController>,

    breakpoints: BreakpointManager,
    stack: CallStackTracker,
    inspector: VariableInspector,
    evaluator: ExpressionEvaluator,
    watches: BTreeMap<usize, WatchExpression>,
    next_watch_id: usize,

    /// 現在の停止位置のローカル変数
    variables: Vec<Variable>,
    stop_reason: Option<StopReason>,

    /// 直前のコマンドで得た出力
    output: Vec<String>,

    /// プログラムが実行を開始しているか（GDBの run / continue の区別）
    started: bool,
}

impl DebugSession {
    pub fn new(id: SessionId, config: DebugConfiguration, adapter: Arc<dyn BackendAdapter>, engine: &EngineConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            settings: engine.session.clone(),
            queue_capacity: engine.output.queue_capacity,
            adapter,
            status: SessionStatus::Initializing,
            created_at: now,
            last_activity: now,
            process: None,
            breakpoints: BreakpointManager::new(id),
            stack: CallStackTracker::new(),
            inspector: VariableInspector::new(&engine.inspector),
            evaluator: ExpressionEvaluator::new(engine.session.evaluate_timeout()),
            watches: BTreeMap::new(),
            next_watch_id: 1,
            variables: Vec::new(),
            stop_reason: None,
            output: Vec::new(),
            started: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn config(&self) -> &DebugConfiguration {
        &self.config
    }

    pub fn adapter(&self) -> Arc<dyn BackendAdapter> {
        self.adapter.clone()
    }

    /// 実行中のプロセスID
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.handle().pid)
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id,
            status: self.status,
            target: self.config.target.clone(),
            backend: self.config.backend,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// 現在の状態のスナップショット
    pub fn state(&self) -> DebugState {
        DebugState {
            session_id: self.id,
            status: self.status,
            stop_reason: self.stop_reason.clone(),
            current_frame: self.stack.current().cloned(),
            call_stack: self.stack.frames().to_vec(),
            variables: self.variables.clone(),
            watch_expressions: self.watches.values().cloned().collect(),
            output: self.output.clone(),
            timestamp: Utc::now(),
        }
    }

    /// バックエンドを起動し、保留中のブレークポイントを反映する
    pub async fn start(&mut self) -> Result<DebugState> {
        if self.status != SessionStatus::Initializing {
            return Err(DebugError::InvalidState(format!("{} は既に開始されています", self.id)));
        }
        self.touch();

        match self.launch().await {
            Ok(()) => {
                info!(
                    "{} を開始しました: {} ({})",
                    self.id,
                    self.config.target.display(),
                    self.adapter.kind()
                );
                Ok(self.state())
            }
            Err(err) => {
                error!("{} の開始に失敗: {}", self.id, err);
                self.mark_error().await;
                let err = match err {
                    DebugError::ProcessSpawn { .. } => err,
                    other => DebugError::spawn(self.adapter.launch_command(&self.config).0, other),
                };
                Err(err)
            }
        }
    }

    async fn launch(&mut self) -> Result<()> {
        let target = resolve_target(&self.config);
        if !target.is_file() {
            return Err(DebugError::spawn(&target, "デバッグ対象が見つかりません"));
        }

        let (program, args) = self.adapter.launch_command(&self.config);
        let spec = LaunchSpec {
            program: program.clone(),
            args,
            working_dir: self.config.working_dir.clone(),
            env: self.config.env.clone(),
            prompts: self.adapter.prompts(),
            queue_capacity: self.queue_capacity,
        };
        self.process = Some(ProcessController::start(&spec).await?);

        // 最初のプロンプトまでがバナー
        let adapter = self.adapter.clone();
        let timeout = self.settings.command_timeout();
        let banner = match self.process.as_ref() {
            Some(process) => {
                process
                    .output()
                    .collect_until(|l| adapter.is_response_end(l), timeout)
                    .await
            }
            None => Collected::default(),
        };
        if !banner.complete {
            let detail = strip_prompts(adapter.as_ref(), &banner.lines).join(" / ");
            return Err(DebugError::spawn(program, format!("バックエンドが応答しません: {}", detail)));
        }

        for command in adapter.init_commands() {
            self.exchange(&command).await?;
        }
        self.replay_breakpoints().await?;
        self.status = SessionStatus::Ready;

        if let Some(StopEvent::Location { .. }) = adapter.parse_stop(&banner.lines) {
            self.started = true;
            self.stop_reason = Some(StopReason::Entry);
            self.refresh_suspension().await;
        }
        Ok(())
    }

    /// ブレークポイントを設定する
    ///
    /// 開始前は保留され、Ready / Suspended であれば即座にバックエンドへ送る。
    pub async fn set_breakpoint(&mut self, request: &BreakpointRequest) -> Result<Breakpoint> {
        self.touch();
        if self.status.is_final() {
            return Err(DebugError::InvalidState(format!("{} は終了しています", self.id)));
        }

        let breakpoint = self.breakpoints.build(request)?;
        let id = self.breakpoints.add(breakpoint);

        if self.status.accepts_commands() {
            if let Some(breakpoint) = self.breakpoints.get(id).cloned() {
                if let Err(err) = self.install_breakpoint(&breakpoint).await {
                    self.breakpoints.remove(id);
                    return Err(err);
                }
            }
        } else {
            debug!("ブレークポイント {} を保留しました ({:?})", id, self.status);
        }

        self.breakpoints
            .get(id)
            .cloned()
            .ok_or_else(|| DebugError::InvalidState(format!("ブレークポイント {} が見つかりません", id)))
    }

    /// ブレークポイントを削除する
    pub async fn remove_breakpoint(&mut self, id: usize) -> Result<bool> {
        self.touch();
        if self.status.is_final() {
            return Err(DebugError::InvalidState(format!("{} は終了しています", self.id)));
        }

        let Some(breakpoint) = self.breakpoints.remove(id) else {
            return Ok(false);
        };
        if breakpoint.verified && self.status.accepts_commands() {
            if let Some(command) = self.adapter.clear_breakpoint_command(&breakpoint) {
                if let Err(err) = self.exchange(&command).await {
                    warn!("バックエンドのブレークポイント解除に失敗: {}", err);
                }
            }
        }
        Ok(true)
    }

    pub fn set_breakpoint_enabled(&mut self, id: usize, enabled: bool) -> Result<bool> {
        self.touch();
        if self.status.is_final() {
            return Err(DebugError::InvalidState(format!("{} は終了しています", self.id)));
        }
        Ok(self.breakpoints.set_enabled(id, enabled))
    }

    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.list()
    }

    /// ステップ実行
    ///
    /// 終了済みのセッションでは何もせず最後の状態を返す。
    pub async fn step(&mut self, kind: StepKind, count: usize) -> Result<DebugState> {
        self.touch();
        match self.status {
            SessionStatus::Terminated => {
                debug!("{} は終了済みのため {:?} を無視します", self.id, kind);
                return Ok(self.state());
            }
            SessionStatus::Initializing | SessionStatus::Error => {
                return Err(DebugError::InvalidState(format!(
                    "{} は {:?} 状態のためステップできません",
                    self.id, self.status
                )));
            }
            _ => {}
        }

        for _ in 0..count.max(1) {
            self.step_once(kind).await?;
            if self.status == SessionStatus::Terminated {
                break;
            }
        }
        Ok(self.state())
    }

    async fn step_once(&mut self, kind: StepKind) -> Result<()> {
        let Some(mut command) = self.adapter.step_command(kind, self.started) else {
            if kind == StepKind::Pause {
                // コマンドは直列化されているため、ここに来るときは既に停止している
                debug!("{} はpauseコマンドを持たないため何もしません", self.adapter.kind());
                return Ok(());
            }
            return Err(DebugError::Unsupported(format!(
                "{:?} は {} では使えません",
                kind,
                self.adapter.kind()
            )));
        };

        let previous = self.status;
        let origin = StepOrigin::capture(&self.stack);
        self.status = SessionStatus::Running;
        self.output.clear();
        let mut hops = 0usize;
        // 無視したヒットから元のステップを再開している途中か
        let mut resuming = false;

        loop {
            let collected = match self.exchange(&command).await {
                Ok(collected) => collected,
                Err(err @ DebugError::CommandTimeout { .. }) => {
                    // プロセスは止めず、実行中のまま返す
                    return Err(err);
                }
                Err(err) => {
                    if !self.process_alive() {
                        return Err(self.backend_lost().await);
                    }
                    self.status = previous;
                    return Err(err);
                }
            };
            self.output.extend(strip_prompts(self.adapter.as_ref(), &collected.lines));

            let event = self.adapter.parse_stop(&collected.lines);
            if collected.closed && !matches!(event, Some(StopEvent::Exited { .. })) {
                return Err(self.backend_lost().await);
            }

            match event {
                Some(StopEvent::Exited { exit_code }) => {
                    self.finish(exit_code).await;
                    return Ok(());
                }
                Some(StopEvent::Exception { description }) => {
                    for id in self.breakpoints.exception_breakpoints() {
                        self.breakpoints.record_hit(id);
                    }
                    self.started = true;
                    self.stop_reason = Some(StopReason::Exception { description });
                    break;
                }
                Some(StopEvent::Location {
                    file_path,
                    line,
                    function_name,
                }) => {
                    self.started = true;
                    match kind {
                        StepKind::Restart => {
                            self.stop_reason = Some(StopReason::Entry);
                            break;
                        }
                        StepKind::Pause => {
                            self.stop_reason = Some(StopReason::Pause);
                            break;
                        }
                        _ => {}
                    }
                    if origin.completes(kind, function_name.as_deref()) {
                        self.stop_reason = Some(StopReason::Step);
                        break;
                    }

                    if file_path.as_os_str().is_empty() {
                        self.refresh_stack().await?;
                    }
                    let ids = self.breakpoints_at(&file_path, line, function_name.as_deref());
                    if ids.is_empty() && !resuming {
                        self.stop_reason = Some(StopReason::Step);
                        break;
                    }

                    // 同じ位置のブレークポイントはすべてヒットを記録する
                    let mut suspend_on = None;
                    for id in ids {
                        if self.breakpoints.record_hit(id) && suspend_on.is_none() {
                            suspend_on = Some(id);
                        }
                    }
                    if let Some(id) = suspend_on {
                        self.stop_reason = Some(StopReason::Breakpoint { id });
                        break;
                    }

                    hops += 1;
                    if hops >= self.settings.max_continue_hops {
                        warn!("自動継続が上限 ({}) に達したため停止します", hops);
                        self.stop_reason = Some(StopReason::Pause);
                        break;
                    }
                    // continue はそのまま続け、ステップは呼び出し先から抜けて元のフレームへ戻る
                    let resume = if kind == StepKind::Continue {
                        StepKind::Continue
                    } else {
                        StepKind::Out
                    };
                    debug!("無視されたヒットのため {:?} で再開します ({}回目)", resume, hops);
                    resuming = kind != StepKind::Continue;
                    if let Some(next) = self.adapter.step_command(resume, true) {
                        command = next;
                    }
                }
                None => {
                    debug!("停止イベントを判別できない出力を停止として扱います");
                    self.stop_reason = Some(StopReason::Step);
                    break;
                }
            }
        }

        self.status = SessionStatus::Suspended;
        self.refresh_suspension().await;
        if let Err(err) = self.replay_breakpoints().await {
            warn!("保留中のブレークポイントを反映できません: {}", err);
        }
        Ok(())
    }

    /// 停止位置に対応するブレークポイント
    fn breakpoints_at(&self, file: &Path, line: usize, function: Option<&str>) -> Vec<usize> {
        let (file, line) = if file.as_os_str().is_empty() {
            match self.stack.innermost_location() {
                Some((path, line)) => (path.to_path_buf(), line),
                None => return Vec::new(),
            }
        } else {
            (file.to_path_buf(), line)
        };

        let ids = self.breakpoints.at_location(&file, line);
        if !ids.is_empty() {
            return ids;
        }
        function
            .map(str::to_string)
            .or_else(|| self.stack.frames().first().map(|f| f.function_name.clone()))
            .map(|name| self.breakpoints.for_function(&name))
            .unwrap_or_default()
    }

    /// スコープの変数を取得する
    ///
    /// ローカル変数は停止時に取得したものを返し、それ以外は毎回問い合わせる。
    pub async fn get_variables(&mut self, scope: VariableScope) -> Result<Vec<Variable>> {
        self.touch();
        self.ensure_interactive()?;
        match scope {
            VariableScope::Local if self.status == SessionStatus::Suspended || !self.variables.is_empty() => {
                Ok(self.variables.clone())
            }
            _ => self.query_scope(scope).await,
        }
    }

    /// 変数の子要素を展開する（最大 MAX_CHILDREN 個）
    pub async fn expand_variable(&mut self, id: usize) -> Result<Vec<Variable>> {
        self.touch();
        self.ensure_interactive()?;
        let variable = self
            .inspector
            .get(id)
            .cloned()
            .ok_or_else(|| DebugError::InvalidState(format!("変数IDが無効です: {}", id)))?;
        if !variable.has_children {
            return Ok(Vec::new());
        }
        if !variable.children.is_empty() {
            return Ok(variable.children);
        }

        let command = self
            .adapter
            .children_command(&variable.evaluate_name, MAX_CHILDREN)
            .ok_or_else(|| DebugError::Unsupported(format!("{} は子要素の展開に対応していません", self.adapter.kind())))?;
        let collected = self.exchange(&command).await?;
        let values = self.adapter.parse_values(&collected.lines);
        let children = self.inspector.attach_children(self.adapter.as_ref(), id, values)?;

        if let Some(top) = self.variables.iter_mut().find(|v| v.id == id) {
            top.children = children.clone();
        }
        Ok(children)
    }

    pub fn get_call_stack(&self) -> Vec<StackFrame> {
        self.stack.frames().to_vec()
    }

    /// 式を評価する。失敗はすべて結果の中で報告する
    pub async fn evaluate(
        &mut self,
        expression: &str,
        frame_level: Option<usize>,
        timeout: Option<Duration>,
    ) -> EvaluationResult {
        self.touch();
        if let Err(err) = self.ensure_interactive() {
            return rejected(self.id, expression, &err);
        }
        if let Some(level) = frame_level {
            if level > 0 && level >= self.stack.depth() {
                let err = DebugError::InvalidState(format!("フレーム {} は存在しません", level));
                return rejected(self.id, expression, &err);
            }
        }
        let Some(process) = self.process.as_mut() else {
            let err = DebugError::InvalidState(format!("{} にプロセスがありません", self.id));
            return rejected(self.id, expression, &err);
        };
        self.evaluator
            .evaluate(self.id, process, self.adapter.as_ref(), expression, frame_level, timeout)
            .await
    }

    /// ウォッチ式を追加する（評価は要求時のみ）
    pub fn add_watch(&mut self, expression: &str, name: Option<&str>) -> Result<WatchExpression> {
        self.touch();
        if self.status.is_final() {
            return Err(DebugError::InvalidState(format!("{} は終了しています", self.id)));
        }
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(DebugError::Evaluation("ウォッチ式が空です".to_string()));
        }

        let now = Utc::now();
        let watch = WatchExpression {
            id: self.next_watch_id,
            expression: expression.to_string(),
            name: name.unwrap_or(expression).to_string(),
            created_at: now,
            updated_at: now,
            last_value: None,
            last_error: false,
        };
        self.next_watch_id += 1;
        self.watches.insert(watch.id, watch.clone());
        Ok(watch)
    }

    pub fn remove_watch(&mut self, id: usize) -> bool {
        self.watches.remove(&id).is_some()
    }

    pub fn list_watches(&self) -> Vec<WatchExpression> {
        self.watches.values().cloned().collect()
    }

    /// すべてのウォッチ式を再評価する
    async fn evaluate_watches(&mut self) -> Result<Vec<Variable>> {
        let watches: Vec<WatchExpression> = self.watches.values().cloned().collect();
        let mut variables = Vec::with_capacity(watches.len());

        for watch in watches {
            let result = self.evaluate(&watch.expression, None, None).await;
            if let Some(stored) = self.watches.get_mut(&watch.id) {
                stored.updated_at = result.timestamp;
                stored.last_value = Some(result.result.clone());
                stored.last_error = result.is_error;
            }

            let category = if result.is_error {
                crate::protocol::TypeCategory::Unknown
            } else {
                self.adapter.categorize(&result.type_name, &result.result)
            };
            let value = ReportedValue {
                name: watch.name.clone(),
                value: result.result,
                type_name: result.type_name,
                category,
                size: None,
            };
            variables.push(
                self.inspector
                    .build_single(&watch.name, &watch.expression, value, VariableScope::Watch),
            );
        }
        Ok(variables)
    }

    /// セッションを停止する（2回目以降は false）
    pub async fn stop(&mut self) -> bool {
        if self.status == SessionStatus::Terminated {
            return false;
        }
        self.touch();
        self.release_process().await;
        self.status = SessionStatus::Terminated;
        self.clear_suspension();
        info!("{} を停止しました", self.id);
        true
    }

    /// プロファイラーなどから任意のコマンドを順に送る
    pub(crate) async fn run_commands(&mut self, commands: &[String], timeout: Duration) -> Result<Vec<String>> {
        self.ensure_interactive()?;
        let mut lines = Vec::new();
        for command in commands {
            let collected = self.exchange_with(command, timeout).await?;
            lines.extend(strip_prompts(self.adapter.as_ref(), &collected.lines));
        }
        Ok(lines)
    }

    fn ensure_interactive(&self) -> Result<()> {
        match self.status {
            SessionStatus::Initializing => Err(DebugError::InvalidState(format!("{} はまだ開始されていません", self.id))),
            SessionStatus::Terminated | SessionStatus::Error => {
                Err(DebugError::InvalidState(format!("{} は終了しています", self.id)))
            }
            _ => Ok(()),
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Collected> {
        let timeout = self.settings.command_timeout();
        self.exchange_with(command, timeout).await
    }

    async fn exchange_with(&mut self, command: &str, timeout: Duration) -> Result<Collected> {
        let adapter = self.adapter.clone();
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| DebugError::InvalidState("プロセスが起動していません".to_string()))?;
        process
            .exchange(command, |l| adapter.is_response_end(l), timeout)
            .await
    }

    async fn install_breakpoint(&mut self, breakpoint: &Breakpoint) -> Result<()> {
        let Some(command) = self.adapter.set_breakpoint_command(breakpoint) else {
            // 例外ブレークポイントなどは停止イベントからコア側で判定する
            self.breakpoints.mark_verified(breakpoint.id, None);
            return Ok(());
        };

        let collected = self.exchange(&command).await?;
        let lines = strip_prompts(self.adapter.as_ref(), &collected.lines);
        if let Some(message) = self.adapter.classifier().find_error(&lines) {
            return Err(DebugError::InvalidBreakpointLocation {
                path: breakpoint.file_path.clone(),
                line: breakpoint.line,
                reason: message.to_string(),
            });
        }
        let number = self.adapter.parse_breakpoint_number(&lines);
        self.breakpoints.mark_verified(breakpoint.id, number);
        Ok(())
    }

    async fn replay_breakpoints(&mut self) -> Result<()> {
        let pending = self.breakpoints.unverified();
        if !pending.is_empty() {
            debug!("{} 件のブレークポイントを反映します", pending.len());
        }
        for breakpoint in pending {
            match self.install_breakpoint(&breakpoint).await {
                Ok(()) => {}
                Err(err @ DebugError::InvalidBreakpointLocation { .. }) => {
                    // 再有効化されるまで再送しない
                    warn!("ブレークポイント {} を無効化しました: {}", breakpoint.id, err);
                    self.breakpoints.set_enabled(breakpoint.id, false);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// 停止位置のスタックとローカル変数を作り直す
    async fn refresh_suspension(&mut self) {
        if let Err(err) = self.refresh_stack().await {
            warn!("スタックを取得できません: {}", err);
        }
        self.inspector.reset();
        self.variables = match self.query_scope(VariableScope::Local).await {
            Ok(variables) => variables,
            Err(err) => {
                warn!("ローカル変数を取得できません: {}", err);
                Vec::new()
            }
        };
    }

    async fn refresh_stack(&mut self) -> Result<()> {
        let command = self.adapter.stack_command();
        let collected = self.exchange(&command).await?;
        let frames = self.adapter.parse_stack(&collected.lines);
        self.stack.rebuild(frames);
        Ok(())
    }

    async fn query_scope(&mut self, scope: VariableScope) -> Result<Vec<Variable>> {
        if scope == VariableScope::Watch {
            return self.evaluate_watches().await;
        }
        let Some(command) = self.adapter.scope_command(scope) else {
            return Ok(Vec::new());
        };
        let collected = self.exchange(&command).await?;
        let values = self.adapter.parse_values(&collected.lines);
        Ok(self.inspector.build_scope(values, scope))
    }

    async fn finish(&mut self, exit_code: Option<i32>) {
        info!("{} のプログラムが終了しました (終了コード {:?})", self.id, exit_code);
        self.stop_reason = Some(StopReason::Exited { exit_code });
        self.release_process().await;
        self.status = SessionStatus::Terminated;
        self.clear_suspension();
    }

    /// 停止イベントなしにバックエンドが終了したときの後始末
    async fn backend_lost(&mut self) -> DebugError {
        let exit_code = match self.process.as_mut() {
            Some(process) => process.wait_exit(self.settings.shutdown_grace()).await,
            None => None,
        };
        error!("{} のバックエンドが予期せず終了しました (終了コード {:?})", self.id, exit_code);
        self.mark_error().await;
        DebugError::BackendExited {
            program: self.adapter.launch_command(&self.config).0,
            exit_code,
        }
    }

    async fn mark_error(&mut self) {
        self.release_process().await;
        self.status = SessionStatus::Error;
        self.clear_suspension();
    }

    async fn release_process(&mut self) -> bool {
        match self.process.take() {
            Some(mut process) => {
                let quit = self.adapter.quit_command();
                process.stop(quit.as_deref(), self.settings.shutdown_grace()).await
            }
            None => false,
        }
    }

    fn process_alive(&mut self) -> bool {
        self.process.as_mut().map_or(false, |p| p.is_alive())
    }

    fn clear_suspension(&mut self) {
        self.stack.clear();
        self.variables.clear();
        self.inspector.reset();
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("target", &self.config.target)
            .field("backend", &self.adapter.kind())
            .field("breakpoints", &self.breakpoints.len())
            .finish()
    }
}

/// ステップ開始時のフレーム
///
/// 停止位置がステップ自身の完了地点か、呼び出し先で踏んだブレークポイントかを
/// 関数名で見分ける。
#[derive(Debug, Default)]
struct StepOrigin {
    function: Option<String>,
    callers: Vec<String>,
}

impl StepOrigin {
    fn capture(stack: &CallStackTracker) -> Self {
        let Some(current) = stack.current() else {
            return Self::default();
        };
        Self {
            function: Some(current.function_name.clone()),
            callers: stack
                .frames()
                .iter()
                .filter(|f| f.level > current.level)
                .map(|f| f.function_name.clone())
                .collect(),
        }
    }

    /// 停止がステップそのものの完了か
    ///
    /// into は次の行で必ず完了する。over は元の関数か呼び出し元、out は呼び出し元での
    /// 停止が完了で、それより深い位置の停止はブレークポイントとして扱う。
    fn completes(&self, kind: StepKind, function: Option<&str>) -> bool {
        if kind == StepKind::Continue {
            return false;
        }
        let (Some(origin), Some(function)) = (self.function.as_deref(), function) else {
            return true;
        };
        let in_caller = self.callers.iter().any(|c| c == function);
        match kind {
            StepKind::Over => function == origin || in_caller,
            StepKind::Out => in_caller,
            _ => true,
        }
    }
}

/// 作業ディレクトリを考慮したデバッグ対象のパス
pub fn resolve_target(config: &DebugConfiguration) -> PathBuf {
    match &config.working_dir {
        Some(dir) if config.target.is_relative() => dir.join(&config.target),
        _ => config.target.clone(),
    }
}
