/*
 * SwiftProbe - プロファイリングセッション
 *
 * CPU・メモリ・コールグラフ・行単位のプロファイラーを、デバッグセッションと同じ
 * 開始・停止のライフサイクルで管理します。計測は対象セッションのバックエンド内で
 * 行うか、別プロセスとして対象を実行してその出力を解析します。
 * 集計結果はすべて同じサマリー形式（ボトルネック・推奨事項・メトリクス）で返します。
 */

mod callgraph;
mod cpu;
mod memory;

pub use callgraph::{caller_severity, CallEdge, CallGraphAggregator, CallNode};
pub use cpu::{severity_for, CpuAggregator, FunctionProfile, LineAggregator, LineProfile};
pub use memory::{leak_severity, HeapSnapshot, LeakSuspect, MemoryAggregator, LEAK_THRESHOLD_BYTES};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::adapter::BackendAdapter;
use crate::config::ProfilerConfig;
use crate::error::{DebugError, Result};
use crate::process::{LaunchSpec, ProcessController};
use crate::protocol::{ProfileId, ProfileKind, SessionId};
use crate::registry::{DebugSessionRegistry, SessionSlot};
use crate::relay::STDERR_TAG;

/// 計測対象
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileTarget {
    /// デバッグセッションのバックエンド内で計測する
    #[default]
    Session,

    /// 対象を別プロセスで実行する（`command` 省略時はアダプターの既定コマンド）
    Process { command: Option<Vec<String>> },
}

/// プロファイラー設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub target: ProfileTarget,
    /// 報告するボトルネック数（省略時はエンジン設定）
    pub top_n: Option<usize>,
    /// メモリスナップショットの間隔
    pub snapshot_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    Running,
    Stopped,
    Failed,
}

/// プロファイリングセッション
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSession {
    pub id: ProfileId,
    pub session_id: SessionId,
    pub kind: ProfileKind,
    pub status: ProfileStatus,
    pub config: ProfileConfig,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub name: String,
    pub severity: Severity,
    /// 判定に使った値（時間はミリ秒、メモリはバイト、コールグラフは呼び出し元数）
    pub value: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub target: String,
    pub message: String,
}

/// すべてのプロファイラーで共通のサマリー
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<Recommendation>,
    pub metrics: BTreeMap<String, f64>,
}

/// プロファイラーごとの生データ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProfilePayload {
    Cpu {
        functions: Vec<FunctionProfile>,
    },
    LineLevel {
        lines: Vec<LineProfile>,
    },
    Memory {
        snapshots: Vec<HeapSnapshot>,
        leaks: Vec<LeakSuspect>,
    },
    CallGraph {
        nodes: Vec<CallNode>,
        edges: Vec<CallEdge>,
        most_called: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    pub session: ProfileSession,
    pub payload: ProfilePayload,
    pub summary: ProfileSummary,
}

/// 種類ごとの集計器
#[derive(Debug, Clone)]
pub enum Collector {
    Cpu(CpuAggregator),
    LineLevel(LineAggregator),
    Memory(MemoryAggregator),
    CallGraph(CallGraphAggregator),
}

impl Collector {
    pub fn new(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Cpu => Collector::Cpu(CpuAggregator::default()),
            ProfileKind::LineLevel => Collector::LineLevel(LineAggregator::default()),
            ProfileKind::Memory => Collector::Memory(MemoryAggregator::default()),
            ProfileKind::CallGraph => Collector::CallGraph(CallGraphAggregator::default()),
        }
    }

    /// プロファイラー出力の1行を取り込む。認識した行なら true
    pub fn ingest(&mut self, adapter: &dyn BackendAdapter, line: &str) -> bool {
        let line = line.strip_prefix(STDERR_TAG).unwrap_or(line);
        match adapter.parse_profile_line(line) {
            Some(event) => {
                match self {
                    Collector::Cpu(c) => c.record(&event),
                    Collector::LineLevel(c) => c.record(&event),
                    Collector::Memory(c) => c.record(&event),
                    Collector::CallGraph(c) => c.record(&event),
                }
                true
            }
            None => false,
        }
    }

    pub fn analyze(&self, top_n: usize) -> (ProfilePayload, ProfileSummary) {
        match self {
            Collector::Cpu(c) => {
                let (functions, summary) = c.analyze(top_n);
                (ProfilePayload::Cpu { functions }, summary)
            }
            Collector::LineLevel(c) => {
                let (lines, summary) = c.analyze(top_n);
                (ProfilePayload::LineLevel { lines }, summary)
            }
            Collector::Memory(c) => {
                let (snapshots, leaks, summary) = c.analyze(top_n);
                (ProfilePayload::Memory { snapshots, leaks }, summary)
            }
            Collector::CallGraph(c) => {
                let (nodes, edges, most_called, summary) = c.analyze(top_n);
                (
                    ProfilePayload::CallGraph {
                        nodes,
                        edges,
                        most_called,
                    },
                    summary,
                )
            }
        }
    }

    fn next_heap_index(&self) -> u64 {
        match self {
            Collector::Memory(m) => m.next_index(),
            _ => 0,
        }
    }
}

type SharedCollector = Arc<StdMutex<Collector>>;

fn lock_collector(collector: &SharedCollector) -> MutexGuard<'_, Collector> {
    collector.lock().unwrap_or_else(|e| e.into_inner())
}

/// 計測中のタスク
#[derive(Debug)]
enum Running {
    Session { sampler: Option<(JoinHandle<()>, Arc<Notify>)> },
    Process {
        reader: JoinHandle<Option<i32>>,
        /// 対象プロセスの終了を指示する
        stop: Arc<Notify>,
        /// 読み取りが終わると true になる
        done: watch::Receiver<bool>,
    },
}

struct ProfileEntry {
    info: StdMutex<ProfileSession>,
    collector: SharedCollector,
    adapter: Arc<dyn BackendAdapter>,
    top_n: usize,
    /// 停止処理の直列化と結果のキャッシュ
    state: Mutex<EntryState>,
}

#[derive(Debug, Default)]
struct EntryState {
    running: Option<Running>,
    result: Option<ProfileData>,
}

impl std::fmt::Debug for ProfileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileEntry")
            .field("info", &self.info)
            .field("backend", &self.adapter.kind())
            .field("top_n", &self.top_n)
            .finish()
    }
}

impl ProfileEntry {
    fn info(&self) -> MutexGuard<'_, ProfileSession> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// プロファイリングセッションコントローラー
#[derive(Debug)]
pub struct ProfilingSessionController {
    registry: Arc<DebugSessionRegistry>,
    profiles: RwLock<HashMap<ProfileId, Arc<ProfileEntry>>>,
    next_id: AtomicU64,
    config: ProfilerConfig,
}

impl ProfilingSessionController {
    pub fn new(registry: Arc<DebugSessionRegistry>) -> Self {
        let config = registry.config().profiler.clone();
        Self {
            registry,
            profiles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// プロファイリングを開始する
    ///
    /// CPU・行単位は1セッションにつき1つだけで、ステップ実行中は開始できない。
    pub async fn start(&self, session_id: SessionId, kind: ProfileKind, config: ProfileConfig) -> Result<ProfileSession> {
        let slot = self.registry.slot(session_id).await?;
        let id = ProfileId(self.next_id.fetch_add(1, Ordering::SeqCst));

        if kind.is_exclusive() {
            self.registry.claim_exclusive(session_id, id, kind).await?;
        }

        let collector: SharedCollector = Arc::new(StdMutex::new(Collector::new(kind)));
        let launched = match &config.target {
            ProfileTarget::Session => self.start_in_session(&slot, kind, &config, &collector).await,
            ProfileTarget::Process { command } => self
                .start_process(&slot, kind, command.as_deref(), &collector)
                .await,
        };
        let (running, adapter) = match launched {
            Ok(launched) => launched,
            Err(err) => {
                if kind.is_exclusive() {
                    self.registry.release_exclusive(session_id, id).await;
                }
                return Err(err);
            }
        };

        let info = ProfileSession {
            id,
            session_id,
            kind,
            status: ProfileStatus::Running,
            config: config.clone(),
            started_at: Utc::now(),
            stopped_at: None,
        };
        let entry = Arc::new(ProfileEntry {
            info: StdMutex::new(info.clone()),
            collector,
            adapter,
            top_n: config.top_n.unwrap_or(self.config.top_n),
            state: Mutex::new(EntryState {
                running: Some(running),
                result: None,
            }),
        });
        self.profiles.write().await.insert(id, entry);
        info!("{} を開始しました ({:?}, {})", id, kind, session_id);
        Ok(info)
    }

    /// 複数の種類をまとめて開始する。1つでも失敗したら開始済みのものを停止する
    pub async fn start_many(
        &self,
        session_id: SessionId,
        kinds: &[ProfileKind],
        config: ProfileConfig,
    ) -> Result<Vec<ProfileSession>> {
        let mut started = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.start(session_id, *kind, config.clone()).await {
                Ok(profile) => started.push(profile),
                Err(err) => {
                    for profile in &started {
                        if let Err(stop_err) = self.stop(profile.id).await {
                            warn!("{} の停止に失敗: {}", profile.id, stop_err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(started)
    }

    async fn start_in_session(
        &self,
        slot: &Arc<SessionSlot>,
        kind: ProfileKind,
        config: &ProfileConfig,
        collector: &SharedCollector,
    ) -> Result<(Running, Arc<dyn BackendAdapter>)> {
        let mut session = slot.session.lock().await;
        let adapter = session.adapter();
        let commands = adapter.profile_start_commands(kind).ok_or_else(|| {
            DebugError::Unsupported(format!("{} はセッション内の {:?} プロファイリングに対応していません", adapter.kind(), kind))
        })?;

        let timeout = self.config.flush_timeout();
        session.run_commands(&commands, timeout).await?;

        let mut sampler = None;
        if kind == ProfileKind::Memory {
            if let Some(command) = adapter.heap_snapshot_command(0) {
                let lines = session.run_commands(&[command], timeout).await?;
                ingest_all(collector, adapter.as_ref(), &lines);
            }
            let interval = config
                .snapshot_interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.snapshot_interval());
            sampler = Some(spawn_sampler(slot.clone(), collector.clone(), adapter.clone(), interval, timeout));
        }
        Ok((Running::Session { sampler }, adapter))
    }

    async fn start_process(
        &self,
        slot: &Arc<SessionSlot>,
        kind: ProfileKind,
        command: Option<&[String]>,
        collector: &SharedCollector,
    ) -> Result<(Running, Arc<dyn BackendAdapter>)> {
        let (adapter, config, queue_capacity) = {
            let session = slot.session.lock().await;
            (
                session.adapter(),
                session.config().clone(),
                self.registry.config().output.queue_capacity,
            )
        };

        let (program, args) = match command {
            Some([program, args @ ..]) => (PathBuf::from(program), args.to_vec()),
            _ => adapter.profiler_command(kind, &config).ok_or_else(|| {
                DebugError::Unsupported(format!("{} は {:?} プロファイラーの実行コマンドを持ちません", adapter.kind(), kind))
            })?,
        };

        let spec = LaunchSpec {
            program,
            args,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            prompts: Vec::new(),
            queue_capacity,
        };
        let process = ProcessController::start(&spec).await?;
        let grace = self.registry.config().session.shutdown_grace();
        let (reader, stop, done) = spawn_reader(process, collector.clone(), adapter.clone(), grace);
        Ok((Running::Process { reader, stop, done }, adapter))
    }

    /// 別プロセスの計測対象が自分で終了するまで待つ
    ///
    /// セッション内の計測や停止済みのプロファイルではすぐに戻る。
    pub async fn wait(&self, id: ProfileId) -> Result<()> {
        let entry = self.entry(id).await?;
        let done = match &entry.state.lock().await.running {
            Some(Running::Process { done, .. }) => Some(done.clone()),
            _ => None,
        };
        if let Some(mut done) = done {
            // 送信側が消えた場合も読み取りは終わっている
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(())
    }

    /// プロファイリングを停止して結果を返す（2回目以降は同じ結果）
    ///
    /// 別プロセスの対象は猶予期間内に終わらなければ終了させ、残りの出力を取り込む。
    pub async fn stop(&self, id: ProfileId) -> Result<ProfileData> {
        let entry = self.entry(id).await?;
        let mut state = entry.state.lock().await;
        if let Some(result) = &state.result {
            return Ok(result.clone());
        }

        let (session_id, kind) = {
            let info = entry.info();
            (info.session_id, info.kind)
        };
        let mut failed = false;

        match state.running.take() {
            Some(Running::Session { sampler }) => {
                if let Some((task, stop)) = sampler {
                    stop.notify_one();
                    if let Err(err) = task.await {
                        warn!("スナップショットタスクが異常終了しました: {}", err);
                    }
                }
                if let Err(err) = self.collect_from_session(session_id, kind, &entry).await {
                    warn!("{} の結果を回収できません: {}", id, err);
                    failed = true;
                }
            }
            Some(Running::Process { mut reader, stop, .. }) => {
                let grace = self.registry.config().session.shutdown_grace();
                let joined = match tokio::time::timeout(grace, &mut reader).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        info!("{} の対象プロセスを終了させます", id);
                        stop.notify_one();
                        match tokio::time::timeout(self.config.flush_timeout(), &mut reader).await {
                            Ok(joined) => Some(joined),
                            Err(_) => {
                                warn!("{} の出力待ちがタイムアウトしたため中止します", id);
                                reader.abort();
                                None
                            }
                        }
                    }
                };
                match joined {
                    Some(Ok(code)) => debug!("{} のプロセスが終了しました (終了コード {:?})", id, code),
                    Some(Err(err)) => {
                        warn!("{} の読み取りタスクが異常終了しました: {}", id, err);
                        failed = true;
                    }
                    None => {}
                }
            }
            None => {}
        }

        if kind.is_exclusive() {
            self.registry.release_exclusive(session_id, id).await;
        }

        let (payload, summary) = analyze_blocking(&entry).await?;
        let session = {
            let mut info = entry.info();
            info.status = if failed { ProfileStatus::Failed } else { ProfileStatus::Stopped };
            info.stopped_at = Some(Utc::now());
            info.clone()
        };
        let data = ProfileData {
            session,
            payload,
            summary,
        };
        state.result = Some(data.clone());
        info!("{} を停止しました", id);
        Ok(data)
    }

    async fn collect_from_session(&self, session_id: SessionId, kind: ProfileKind, entry: &ProfileEntry) -> Result<()> {
        let slot = self.registry.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let timeout = self.config.flush_timeout();

        if kind == ProfileKind::Memory {
            let index = lock_collector(&entry.collector).next_heap_index();
            if let Some(command) = entry.adapter.heap_snapshot_command(index) {
                let lines = session.run_commands(&[command], timeout).await?;
                ingest_all(&entry.collector, entry.adapter.as_ref(), &lines);
            }
        }
        if let Some(commands) = entry.adapter.profile_stop_commands(kind) {
            let lines = session.run_commands(&commands, timeout).await?;
            ingest_all(&entry.collector, entry.adapter.as_ref(), &lines);
        }
        Ok(())
    }

    /// 推奨事項を返す。実行中のプロファイルでもそれまでのデータで分析する
    pub async fn analyze(&self, id: ProfileId) -> Result<Vec<Recommendation>> {
        let entry = self.entry(id).await?;
        {
            let state = entry.state.lock().await;
            if let Some(result) = &state.result {
                return Ok(result.summary.recommendations.clone());
            }
        }
        let (_, summary) = analyze_blocking(&entry).await?;
        Ok(summary.recommendations)
    }

    pub async fn get_profile(&self, id: ProfileId) -> Result<ProfileSession> {
        let entry = self.entry(id).await?;
        let info = entry.info().clone();
        Ok(info)
    }

    /// プロファイル一覧（ID順）
    pub async fn list_profiles(&self) -> Vec<ProfileSession> {
        let mut profiles: Vec<ProfileSession> = self
            .profiles
            .read()
            .await
            .values()
            .map(|entry| entry.info().clone())
            .collect();
        profiles.sort_by_key(|p| p.id);
        profiles
    }

    async fn entry(&self, id: ProfileId) -> Result<Arc<ProfileEntry>> {
        self.profiles
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DebugError::ProfileNotFound(id))
    }
}

fn ingest_all(collector: &SharedCollector, adapter: &dyn BackendAdapter, lines: &[String]) {
    let mut collector = lock_collector(collector);
    let recognized = lines.iter().filter(|line| collector.ingest(adapter, line)).count();
    debug!("プロファイラー出力 {} / {} 行を取り込みました", recognized, lines.len());
}

/// 集計はCPUを使うためブロッキングスレッドで行う
async fn analyze_blocking(entry: &ProfileEntry) -> Result<(ProfilePayload, ProfileSummary)> {
    let snapshot = lock_collector(&entry.collector).clone();
    let top_n = entry.top_n;
    tokio::task::spawn_blocking(move || snapshot.analyze(top_n))
        .await
        .map_err(|e| DebugError::InvalidState(format!("プロファイルの分析に失敗: {}", e)))
}

/// セッションが空いているときだけヒープスナップショットを取る
fn spawn_sampler(
    slot: Arc<SessionSlot>,
    collector: SharedCollector,
    adapter: Arc<dyn BackendAdapter>,
    interval: Duration,
    timeout: Duration,
) -> (JoinHandle<()>, Arc<Notify>) {
    let stop = Arc::new(Notify::new());
    let stop_signal = stop.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_signal.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Ok(mut session) = slot.session.try_lock() else {
                debug!("セッションが使用中のためスナップショットを省略します");
                continue;
            };
            if !session.status().accepts_commands() {
                if session.status().is_final() {
                    break;
                }
                continue;
            }

            let index = lock_collector(&collector).next_heap_index();
            let Some(command) = adapter.heap_snapshot_command(index) else {
                break;
            };
            match session.run_commands(&[command], timeout).await {
                Ok(lines) => ingest_all(&collector, adapter.as_ref(), &lines),
                Err(err) => warn!("ヒープスナップショットに失敗: {}", err),
            }
        }
    });
    (task, stop)
}

/// 別プロセスの出力を終了まで読み取る
///
/// 停止を指示されたらプロセスを止め、残っている出力だけを取り込んで終わる。
fn spawn_reader(
    mut process: ProcessController,
    collector: SharedCollector,
    adapter: Arc<dyn BackendAdapter>,
    grace: Duration,
) -> (JoinHandle<Option<i32>>, Arc<Notify>, watch::Receiver<bool>) {
    let stop = Arc::new(Notify::new());
    let stop_signal = stop.clone();
    let (done_tx, done_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut stopped = false;
        loop {
            let stop_requested = tokio::select! {
                _ = stop_signal.notified() => true,
                lines = process.output().drain(Duration::from_millis(200)) => {
                    if !lines.is_empty() {
                        ingest_all(&collector, adapter.as_ref(), &lines);
                    } else if process.output().stdout.is_exhausted() {
                        break;
                    }
                    false
                }
            };
            if stop_requested {
                process.stop(None, grace).await;
                stopped = true;
                break;
            }
        }

        if stopped {
            loop {
                let lines = process.output().drain(Duration::from_millis(100)).await;
                if lines.is_empty() {
                    break;
                }
                ingest_all(&collector, adapter.as_ref(), &lines);
            }
        } else {
            // 標準エラー出力は標準出力より後に閉じることがある
            loop {
                let lines = process.output().stderr.drain(Duration::from_secs(1)).await;
                let done = lines.is_empty();
                ingest_all(&collector, adapter.as_ref(), &lines);
                if done || process.output().stderr.is_exhausted() {
                    break;
                }
            }
        }

        let code = if stopped {
            process.exit_code()
        } else {
            process.wait_exit(Duration::from_secs(5)).await
        };
        let _ = done_tx.send(true);
        code
    });
    (task, stop, done_rx)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::protocol::{BackendKind, DebugConfiguration, SessionRequest};
    use std::io::Write;

    async fn prepared(registry: &DebugSessionRegistry) -> (SessionId, tempfile::NamedTempFile) {
        let mut target = tempfile::Builder::new().suffix(".py").tempfile().unwrap();
        writeln!(target, "pass").unwrap();
        let mut config = DebugConfiguration::new(target.path(), "python", BackendKind::Pdb);
        config.backend_command = Some(vec!["sh".to_string()]);
        let id = registry.prepare_session(SessionRequest::from(config)).await.unwrap();
        (id, target)
    }

    fn process_target(script: &str) -> ProfileConfig {
        ProfileConfig {
            target: ProfileTarget::Process {
                command: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            },
            ..ProfileConfig::default()
        }
    }

    #[tokio::test]
    async fn test_process_target_cpu_profile() {
        let registry = Arc::new(DebugSessionRegistry::new(EngineConfig::default()));
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let script = "echo '@prof stat main 1 2500000'; echo '@prof stat work 40 1200000'; echo noise; echo '@prof stat helper 400 90000' >&2";
        let profile = controller
            .start(session_id, ProfileKind::Cpu, process_target(script))
            .await
            .unwrap();
        assert_eq!(profile.status, ProfileStatus::Running);

        let data = controller.stop(profile.id).await.unwrap();
        assert_eq!(data.session.status, ProfileStatus::Stopped);
        let ProfilePayload::Cpu { functions } = &data.payload else {
            panic!("CPUの結果ではありません");
        };
        assert_eq!(functions.len(), 3);
        assert_eq!(data.summary.bottlenecks[0].name, "main");
        assert_eq!(data.summary.bottlenecks[0].severity, Severity::High);

        // 停止は冪等
        let again = controller.stop(profile.id).await.unwrap();
        assert_eq!(again, data);
        assert_eq!(controller.analyze(profile.id).await.unwrap(), data.summary.recommendations);

        // 排他スロットは解放されている
        let next = controller
            .start(session_id, ProfileKind::LineLevel, process_target("true"))
            .await
            .unwrap();
        controller.stop(next.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_long_running_target() {
        let mut config = EngineConfig::default();
        config.session.shutdown_grace_ms = 200;
        config.profiler.flush_timeout_ms = 5_000;
        let registry = Arc::new(DebugSessionRegistry::new(config));
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let profile = controller
            .start(session_id, ProfileKind::Cpu, process_target("echo '@prof stat main 1 2000000'; exec sleep 30"))
            .await
            .unwrap();
        // 最初の行が取り込まれるのを待つ
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        let data = tokio::time::timeout(Duration::from_secs(4), controller.stop(profile.id))
            .await
            .expect("停止が猶予期間内に終わらない")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(data.session.status, ProfileStatus::Stopped);
        assert_eq!(data.summary.bottlenecks[0].name, "main");

        // 終了済みの対象は待たずに戻る
        controller.wait(profile.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_when_target_exits() {
        let registry = Arc::new(DebugSessionRegistry::new(EngineConfig::default()));
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let profile = controller
            .start(session_id, ProfileKind::CallGraph, process_target("sleep 0.3; echo '@prof call main work 4'"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), controller.wait(profile.id))
            .await
            .unwrap()
            .unwrap();
        let data = controller.stop(profile.id).await.unwrap();
        let ProfilePayload::CallGraph { most_called, .. } = data.payload else {
            panic!("コールグラフの結果ではありません");
        };
        assert_eq!(most_called.as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_exclusive_profilers_conflict() {
        let registry = Arc::new(DebugSessionRegistry::new(EngineConfig::default()));
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let cpu = controller
            .start(session_id, ProfileKind::Cpu, process_target("sleep 1"))
            .await
            .unwrap();
        let err = controller
            .start(session_id, ProfileKind::LineLevel, process_target("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::ProfilerConflict { .. }));

        // 非排他の種類は並行して動かせる
        let graph = controller
            .start(session_id, ProfileKind::CallGraph, process_target("echo '@prof call main work 10'"))
            .await
            .unwrap();
        assert_eq!(controller.list_profiles().await.len(), 2);

        controller.stop(cpu.id).await.unwrap();
        let data = controller.stop(graph.id).await.unwrap();
        let ProfilePayload::CallGraph { most_called, .. } = data.payload else {
            panic!("コールグラフの結果ではありません");
        };
        assert_eq!(most_called.as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_start_many_rolls_back() {
        let registry = Arc::new(DebugSessionRegistry::new(EngineConfig::default()));
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let err = controller
            .start_many(
                session_id,
                &[ProfileKind::Memory, ProfileKind::Cpu, ProfileKind::LineLevel],
                process_target("true"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::ProfilerConflict { .. }));
        assert!(controller
            .list_profiles()
            .await
            .iter()
            .all(|p| p.status != ProfileStatus::Running));

        // ロールバック後はCPUを開始できる
        let cpu = controller
            .start(session_id, ProfileKind::Cpu, process_target("true"))
            .await
            .unwrap();
        controller.stop(cpu.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let registry = Arc::new(DebugSessionRegistry::default());
        let controller = ProfilingSessionController::new(registry);
        assert!(matches!(
            controller.stop(ProfileId(9)).await,
            Err(DebugError::ProfileNotFound(_))
        ));
        assert!(matches!(
            controller
                .start(SessionId(9), ProfileKind::Memory, ProfileConfig::default())
                .await,
            Err(DebugError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_target_requires_started_session() {
        let registry = Arc::new(DebugSessionRegistry::default());
        let (session_id, _target) = prepared(&registry).await;
        let controller = ProfilingSessionController::new(registry.clone());

        let err = controller
            .start(session_id, ProfileKind::Cpu, ProfileConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::InvalidState(_)));
        // 失敗した開始は排他スロットを残さない
        assert!(registry.claim_exclusive(session_id, ProfileId(99), ProfileKind::Cpu).await.is_ok());
    }
}
