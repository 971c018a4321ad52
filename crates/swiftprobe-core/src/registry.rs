/*
 * SwiftProbe - セッションレジストリ
 *
 * 複数のデバッグセッションをIDで管理します。
 * セッションごとにゲート（非同期Mutex）を持ち、同じセッションへのコマンドは直列化され、
 * 異なるセッションのコマンドは並行に実行されます。
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::adapter::AdapterRegistry;
use crate::config::EngineConfig;
use crate::error::{DebugError, Result};
use crate::process::program_exists;
use crate::protocol::{
    Breakpoint, BreakpointRequest, DebugState, EvaluationResult, ProfileId, ProfileKind, SessionDescriptor,
    SessionId, SessionRequest, StackFrame, StepKind, Variable, VariableScope, WatchExpression,
};
use crate::session::{resolve_target, DebugSession};

/// ステップ実行と排他プロファイラーの調停情報
#[derive(Debug, Default)]
struct SessionActivity {
    /// 実行中・待機中のステップ数
    stepping: usize,
    exclusive: Option<(ProfileId, ProfileKind)>,
}

/// レジストリ内の1セッション分
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) session: Mutex<DebugSession>,
    activity: StdMutex<SessionActivity>,
}

impl SessionSlot {
    fn activity(&self) -> std::sync::MutexGuard<'_, SessionActivity> {
        // 汚染されても中身はそのまま使える
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// ステップ中の数を戻すガード
struct StepGuard<'a> {
    slot: &'a SessionSlot,
}

impl<'a> StepGuard<'a> {
    /// 排他プロファイラーが動作中でなければステップ中として数える
    fn enter(id: SessionId, slot: &'a SessionSlot) -> Result<Self> {
        let mut activity = slot.activity();
        if let Some((profile, profile_kind)) = activity.exclusive {
            return Err(DebugError::ProfilerConflict {
                session: id,
                kind: profile_kind,
                reason: format!("{} の実行中はステップ実行できません", profile),
            });
        }
        activity.stepping += 1;
        Ok(Self { slot })
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        let mut activity = self.slot.activity();
        activity.stepping = activity.stepping.saturating_sub(1);
    }
}

/// デバッグセッションレジストリ
#[derive(Debug)]
pub struct DebugSessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    adapters: AdapterRegistry,
    config: EngineConfig,
    next_id: AtomicU64,
}

impl Default for DebugSessionRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl DebugSessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_adapters(config, AdapterRegistry::default())
    }

    pub fn with_adapters(config: EngineConfig, adapters: AdapterRegistry) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            adapters,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// セッションを作成して起動する
    ///
    /// 起動に失敗したセッションはレジストリに残さない。
    pub async fn create_session(&self, request: SessionRequest) -> Result<DebugState> {
        let id = self.prepare_session(request).await?;
        self.start_session(id).await
    }

    /// セッションを登録する（バックエンドはまだ起動しない）
    ///
    /// 起動前にブレークポイントを設定したい場合に使う。
    pub async fn prepare_session(&self, request: SessionRequest) -> Result<SessionId> {
        let SessionRequest { config, breakpoints } = request;

        let adapter = self
            .adapters
            .get(config.backend)
            .ok_or_else(|| DebugError::Unsupported(format!("バックエンド {} は登録されていません", config.backend)))?;

        let target = resolve_target(&config);
        if !target.is_file() {
            return Err(DebugError::spawn(&target, "デバッグ対象が見つかりません"));
        }
        let (program, _) = adapter.launch_command(&config);
        if !program_exists(&program) {
            return Err(DebugError::spawn(&program, "バックエンドの実行ファイルが見つかりません"));
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut session = DebugSession::new(id, config, adapter, &self.config);
        for request in &breakpoints {
            session.set_breakpoint(request).await?;
        }

        let slot = Arc::new(SessionSlot {
            session: Mutex::new(session),
            activity: StdMutex::new(SessionActivity::default()),
        });
        self.sessions.write().await.insert(id, slot);
        debug!("{} を登録しました", id);
        Ok(id)
    }

    /// 登録済みセッションのバックエンドを起動する
    pub async fn start_session(&self, id: SessionId) -> Result<DebugState> {
        let slot = self.slot(id).await?;
        let result = slot.session.lock().await.start().await;
        if result.is_err() {
            self.sessions.write().await.remove(&id);
            warn!("{} の起動に失敗したため削除しました", id);
        }
        result
    }

    pub async fn set_breakpoint(&self, id: SessionId, request: &BreakpointRequest) -> Result<Breakpoint> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.set_breakpoint(request).await
    }

    pub async fn remove_breakpoint(&self, id: SessionId, breakpoint_id: usize) -> Result<bool> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.remove_breakpoint(breakpoint_id).await
    }

    pub async fn set_breakpoint_enabled(&self, id: SessionId, breakpoint_id: usize, enabled: bool) -> Result<bool> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.set_breakpoint_enabled(breakpoint_id, enabled)
    }

    pub async fn list_breakpoints(&self, id: SessionId) -> Result<Vec<Breakpoint>> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.list_breakpoints())
    }

    /// ステップ実行
    ///
    /// 排他プロファイラーが動作中のセッションでは `ProfilerConflict` を返す。
    /// バックエンドが落ちたセッションはエラーを1度返したあとレジストリから取り除く。
    pub async fn step(&self, id: SessionId, kind: StepKind, count: usize) -> Result<DebugState> {
        let slot = self.slot(id).await?;
        let result = {
            let _guard = StepGuard::enter(id, &slot)?;
            let mut session = slot.session.lock().await;
            session.step(kind, count).await
        };
        if matches!(&result, Err(err) if err.is_fatal()) {
            self.evict(id, &slot).await;
        }
        result
    }

    pub async fn get_variables(&self, id: SessionId, scope: VariableScope) -> Result<Vec<Variable>> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.get_variables(scope).await
    }

    pub async fn expand_variable(&self, id: SessionId, variable_id: usize) -> Result<Vec<Variable>> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.expand_variable(variable_id).await
    }

    pub async fn get_call_stack(&self, id: SessionId) -> Result<Vec<StackFrame>> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.get_call_stack())
    }

    /// 式を評価する
    ///
    /// 不明なセッションIDだけはエラーとして返し、それ以外の失敗は結果の中で報告する。
    pub async fn evaluate(
        &self,
        id: SessionId,
        expression: &str,
        frame_level: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Result<EvaluationResult> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        Ok(session
            .evaluate(expression, frame_level, timeout_ms.map(Duration::from_millis))
            .await)
    }

    pub async fn add_watch(&self, id: SessionId, expression: &str, name: Option<&str>) -> Result<WatchExpression> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        session.add_watch(expression, name)
    }

    pub async fn remove_watch(&self, id: SessionId, watch_id: usize) -> Result<bool> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        Ok(session.remove_watch(watch_id))
    }

    pub async fn list_watches(&self, id: SessionId) -> Result<Vec<WatchExpression>> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.list_watches())
    }

    pub async fn state(&self, id: SessionId) -> Result<DebugState> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.state())
    }

    /// セッション一覧（ID順）
    pub async fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let slots: Vec<Arc<SessionSlot>> = self.sessions.read().await.values().cloned().collect();
        let mut descriptors = Vec::with_capacity(slots.len());
        for slot in slots {
            descriptors.push(slot.session.lock().await.descriptor());
        }
        descriptors.sort_by_key(|d| d.id);
        descriptors
    }

    /// セッションを停止する。セッションは Terminated として残る
    pub async fn stop_session(&self, id: SessionId) -> Result<bool> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        Ok(session.stop().await)
    }

    /// セッションを停止してレジストリから取り除く
    pub async fn remove_session(&self, id: SessionId) -> Result<()> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(DebugError::SessionNotFound(id))?;
        slot.session.lock().await.stop().await;
        info!("{} を削除しました", id);
        Ok(())
    }

    /// すべてのセッションを停止する
    pub async fn shutdown(&self) {
        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self.sessions.write().await.drain().collect();
        if !slots.is_empty() {
            info!("{} 個のセッションを停止します", slots.len());
        }
        for (_, slot) in slots {
            slot.session.lock().await.stop().await;
        }
    }

    /// 同じスロットが登録されたままなら取り除く
    async fn evict(&self, id: SessionId, slot: &Arc<SessionSlot>) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            sessions.remove(&id);
            warn!("{} のバックエンドが失われたため削除しました", id);
        }
    }

    pub(crate) async fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DebugError::SessionNotFound(id))
    }

    /// 排他プロファイラーの実行権を取得する
    pub(crate) async fn claim_exclusive(&self, id: SessionId, profile: ProfileId, kind: ProfileKind) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut activity = slot.activity();
        if activity.stepping > 0 {
            return Err(DebugError::ProfilerConflict {
                session: id,
                kind,
                reason: "ステップ実行中です".to_string(),
            });
        }
        if let Some((other, other_kind)) = activity.exclusive {
            return Err(DebugError::ProfilerConflict {
                session: id,
                kind,
                reason: format!("{} ({:?}) が実行中です", other, other_kind),
            });
        }
        activity.exclusive = Some((profile, kind));
        Ok(())
    }

    pub(crate) async fn release_exclusive(&self, id: SessionId, profile: ProfileId) {
        if let Ok(slot) = self.slot(id).await {
            let mut activity = slot.activity();
            if matches!(activity.exclusive, Some((owner, _)) if owner == profile) {
                activity.exclusive = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BackendKind, DebugConfiguration, SessionStatus};
    use std::io::Write;

    fn target_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".py").tempfile().unwrap();
        writeln!(file, "print('hello')").unwrap();
        file
    }

    fn request(target: &std::path::Path) -> SessionRequest {
        let mut config = DebugConfiguration::new(target, "python", BackendKind::Pdb);
        // 起動はしないため、存在が保証されているプログラムを使う
        config.backend_command = Some(vec!["sh".to_string()]);
        SessionRequest::from(config)
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = DebugSessionRegistry::default();
        let err = registry.state(SessionId(42)).await.unwrap_err();
        assert!(matches!(err, DebugError::SessionNotFound(SessionId(42))));
        assert!(registry.evaluate(SessionId(42), "1", None, None).await.is_err());
        assert!(registry.remove_session(SessionId(42)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_target_is_not_registered() {
        let registry = DebugSessionRegistry::default();
        let err = registry
            .create_session(request(std::path::Path::new("/no/such/app.py")))
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::ProcessSpawn { .. }));
        assert!(registry.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_backend_program() {
        let target = target_file();
        let mut req = request(target.path());
        req.config.backend_command = Some(vec!["/no/such/python-debugger".to_string()]);
        let err = DebugSessionRegistry::default().prepare_session(req).await.unwrap_err();
        assert!(matches!(err, DebugError::ProcessSpawn { .. }));
    }

    #[tokio::test]
    async fn test_prepared_session_lifecycle() {
        let target = target_file();
        let registry = DebugSessionRegistry::default();
        let mut req = request(target.path());
        req.breakpoints.push(BreakpointRequest::line(target.path(), 1));
        let id = registry.prepare_session(req).await.unwrap();

        assert_eq!(registry.list_breakpoints(id).await.unwrap().len(), 1);
        assert_eq!(registry.state(id).await.unwrap().status, SessionStatus::Initializing);
        assert_eq!(registry.list_sessions().await.len(), 1);

        assert!(registry.stop_session(id).await.unwrap());
        assert!(!registry.stop_session(id).await.unwrap());
        assert_eq!(registry.state(id).await.unwrap().status, SessionStatus::Terminated);

        registry.remove_session(id).await.unwrap();
        assert!(registry.state(id).await.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_profiler_blocks_stepping() {
        let target = target_file();
        let registry = DebugSessionRegistry::default();
        let id = registry.prepare_session(request(target.path())).await.unwrap();

        registry.claim_exclusive(id, ProfileId(1), ProfileKind::Cpu).await.unwrap();
        let err = registry.step(id, StepKind::Over, 1).await.unwrap_err();
        assert!(matches!(err, DebugError::ProfilerConflict { .. }));
        assert!(registry
            .claim_exclusive(id, ProfileId(2), ProfileKind::LineLevel)
            .await
            .is_err());

        // 別のプロファイルIDでは解放されない
        registry.release_exclusive(id, ProfileId(2)).await;
        assert!(registry.step(id, StepKind::Over, 1).await.is_err());

        registry.release_exclusive(id, ProfileId(1)).await;
        // 未起動のため状態エラーになるが、競合ではない
        let err = registry.step(id, StepKind::Over, 1).await.unwrap_err();
        assert!(matches!(err, DebugError::InvalidState(_)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_steps_keep_profilers_out() {
        let target = target_file();
        let registry = DebugSessionRegistry::default();
        let id = registry.prepare_session(request(target.path())).await.unwrap();
        let slot = registry.slot(id).await.unwrap();

        let first = StepGuard::enter(id, &slot).unwrap();
        let second = StepGuard::enter(id, &slot).unwrap();
        drop(first);
        // 2つ目のステップが残っている間は取得できない
        let err = registry
            .claim_exclusive(id, ProfileId(1), ProfileKind::Cpu)
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::ProfilerConflict { .. }));

        drop(second);
        registry.claim_exclusive(id, ProfileId(1), ProfileKind::Cpu).await.unwrap();
        assert!(StepGuard::enter(id, &slot).is_err());
        registry.shutdown().await;
    }
}
