/*
 * SwiftProbe - データモデル
 *
 * このモジュールは、呼び出し側とやり取りするデバッグセッションのデータ型を定義します。
 * セッション状態、ブレークポイント、変数、スタックフレーム、ウォッチ式、評価結果を含みます。
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DebugError;

/// デバッグセッションID（不透明な識別子）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// プロファイルセッションID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile-{}", self.0)
    }
}

/// セッションステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// 初期化中
    Initializing,

    /// 準備完了
    Ready,

    /// 実行中
    Running,

    /// 停止中
    Suspended,

    /// 回復不能なエラー
    Error,

    /// 終了
    Terminated,
}

impl SessionStatus {
    /// バックエンドがコマンドを受け付ける状態か
    pub fn accepts_commands(self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Suspended)
    }

    /// 終端状態か
    pub fn is_final(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Error)
    }
}

/// バックエンドデバッガーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Python標準のpdb
    Pdb,

    /// GNUデバッガー
    Gdb,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Pdb => write!(f, "pdb"),
            BackendKind::Gdb => write!(f, "gdb"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdb" | "python" => Ok(BackendKind::Pdb),
            "gdb" => Ok(BackendKind::Gdb),
            other => Err(DebugError::Unsupported(format!("不明なバックエンド: {}", other))),
        }
    }
}

/// 停止理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// エントリポイントでの停止
    Entry,

    /// ブレークポイントによる停止
    Breakpoint { id: usize },

    /// ステップ実行による停止
    Step,

    /// 例外による停止
    Exception { description: String },

    /// 一時停止（ユーザーリクエスト）
    Pause,

    /// 実行終了
    Exited { exit_code: Option<i32> },
}

/// ステップ実行の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    /// ステップオーバー（関数をスキップ）
    Over,

    /// ステップイン（関数内に入る）
    Into,

    /// ステップアウト（関数から出る）
    Out,

    /// 継続実行
    Continue,

    /// 一時停止
    Pause,

    /// 再起動
    Restart,
}

impl FromStr for StepKind {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "over" | "next" | "n" => Ok(StepKind::Over),
            "into" | "step" | "s" => Ok(StepKind::Into),
            "out" | "return" | "o" => Ok(StepKind::Out),
            "continue" | "c" => Ok(StepKind::Continue),
            "pause" => Ok(StepKind::Pause),
            "restart" | "r" => Ok(StepKind::Restart),
            other => Err(DebugError::Unsupported(format!("不明なステップ種別: {}", other))),
        }
    }
}

/// ブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointKind {
    Line,
    Function,
    Conditional,
    Exception,
}

/// ブレークポイントの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointStatus {
    Enabled,
    Disabled,
}

/// ブレークポイント情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// ブレークポイントID
    pub id: usize,

    /// 所属セッション（参照のみ）
    pub session_id: SessionId,

    /// 種類
    pub kind: BreakpointKind,

    /// 状態
    pub status: BreakpointStatus,

    /// ソースファイルパス
    pub file_path: PathBuf,

    /// 行番号
    pub line: usize,

    /// 関数名（Function種別のみ）
    pub function_name: Option<String>,

    /// 条件式（オプション）
    pub condition: Option<String>,

    /// 無視するヒット回数
    pub ignore_count: u32,

    /// ヒット回数
    pub hit_count: u32,

    /// 最終ヒット時刻
    pub last_hit: Option<DateTime<Utc>>,

    /// バックエンド側のブレークポイント番号
    pub backend_id: Option<usize>,

    /// バックエンドに反映済みかどうか
    pub verified: bool,
}

impl Breakpoint {
    pub fn is_enabled(&self) -> bool {
        self.status == BreakpointStatus::Enabled
    }
}

/// ブレークポイント設定リクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub file_path: PathBuf,
    pub line: usize,
    pub kind: BreakpointKind,
    pub condition: Option<String>,
    pub ignore_count: Option<u32>,
    pub function_name: Option<String>,
}

impl BreakpointRequest {
    /// 行ブレークポイントのリクエストを作成
    pub fn line(file_path: impl Into<PathBuf>, line: usize) -> Self {
        Self {
            file_path: file_path.into(),
            line,
            kind: BreakpointKind::Line,
            condition: None,
            ignore_count: None,
            function_name: None,
        }
    }

    pub fn with_ignore_count(mut self, ignore_count: u32) -> Self {
        self.ignore_count = Some(ignore_count);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.kind = BreakpointKind::Conditional;
        self.condition = Some(condition.into());
        self
    }
}

/// 変数の型カテゴリ（バックエンドアダプターが決定する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeCategory {
    Primitive,
    Collection,
    Function,
    Class,
    Module,
    Object,
    Unknown,
}

impl TypeCategory {
    /// 子要素を持ちうる複合値か
    pub fn is_composite(self) -> bool {
        matches!(self, TypeCategory::Collection | TypeCategory::Object | TypeCategory::Class)
    }
}

/// 変数のスコープ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableScope {
    Local,
    Instance,
    Global,
    Watch,
}

impl FromStr for VariableScope {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "locals" => Ok(VariableScope::Local),
            "instance" | "self" => Ok(VariableScope::Instance),
            "global" | "globals" => Ok(VariableScope::Global),
            "watch" | "watches" => Ok(VariableScope::Watch),
            other => Err(DebugError::Unsupported(format!("不明なスコープ: {}", other))),
        }
    }
}

/// 変数情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// 変数ID（停止ごとに再採番）
    pub id: usize,

    /// 変数名
    pub name: String,

    /// 値の表示用文字列（切り詰め済み）
    pub value: String,

    /// 型名
    pub type_name: String,

    /// 型カテゴリ
    pub category: TypeCategory,

    /// スコープ
    pub scope: VariableScope,

    /// 要素数などのサイズ見積もり
    pub size: Option<usize>,

    /// 子要素を持つかどうか
    pub has_children: bool,

    /// 展開済みの子要素（最大10個）
    pub children: Vec<Variable>,

    /// 子要素の展開に使う式
    pub evaluate_name: String,

    /// ツリー内の深さ
    pub depth: usize,
}

/// スタックフレーム情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// フレームID
    pub id: usize,

    /// 深さ（0 = 最も内側）
    pub level: usize,

    /// 関数名
    pub function_name: String,

    /// ソースファイルパス
    pub file_path: PathBuf,

    /// 行番号
    pub line: usize,

    /// 現在選択中のフレームか
    pub is_current: bool,
}

/// ウォッチ式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchExpression {
    pub id: usize,
    pub expression: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 最後に評価した結果
    pub last_value: Option<String>,
    /// 最後の評価がエラーだったか
    pub last_error: bool,
}

/// 式評価の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub session_id: SessionId,
    pub expression: String,
    /// バックエンドが出力した結果テキスト
    pub result: String,
    /// 推定した型名
    pub type_name: String,
    pub is_error: bool,
    pub error_message: Option<String>,
    /// 実行時間（マイクロ秒）
    pub execution_time_us: u64,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationResult {
    /// 成功時の値を取り出す
    pub fn into_value(self) -> Result<String, DebugError> {
        if self.is_error {
            Err(DebugError::Evaluation(
                self.error_message.unwrap_or(self.result),
            ))
        } else {
            Ok(self.result)
        }
    }
}

/// デバッグターゲット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfiguration {
    /// ターゲットファイル
    pub target: PathBuf,

    /// ターゲットの言語
    pub language: String,

    /// バックエンドの種類
    pub backend: BackendKind,

    /// 作業ディレクトリ
    pub working_dir: Option<PathBuf>,

    /// 環境変数（上書き分）
    pub env: BTreeMap<String, String>,

    /// プログラム引数
    pub args: Vec<String>,

    /// バックエンド起動コマンドの上書き（プログラムと先頭の引数）
    pub backend_command: Option<Vec<String>>,
}

impl DebugConfiguration {
    pub fn new(target: impl Into<PathBuf>, language: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            target: target.into(),
            language: language.into(),
            backend,
            working_dir: None,
            env: BTreeMap::new(),
            args: Vec::new(),
            backend_command: None,
        }
    }
}

/// セッション作成リクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub config: DebugConfiguration,
    /// 起動前に登録するブレークポイント
    pub breakpoints: Vec<BreakpointRequest>,
}

impl From<DebugConfiguration> for SessionRequest {
    fn from(config: DebugConfiguration) -> Self {
        Self {
            config,
            breakpoints: Vec::new(),
        }
    }
}

/// セッションの概要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub status: SessionStatus,
    pub target: PathBuf,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// 状態変更後に返すデバッグ状態のスナップショット
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugState {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub current_frame: Option<StackFrame>,
    pub call_stack: Vec<StackFrame>,
    pub variables: Vec<Variable>,
    pub watch_expressions: Vec<WatchExpression>,
    /// 直前のコマンドで得たプログラム出力
    pub output: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// プロファイラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileKind {
    Cpu,
    Memory,
    CallGraph,
    LineLevel,
}

impl ProfileKind {
    /// 実行スレッドを計装するため、ステップ実行と同時に動かせない種類か
    pub fn is_exclusive(self) -> bool {
        matches!(self, ProfileKind::Cpu | ProfileKind::LineLevel)
    }
}

impl FromStr for ProfileKind {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(ProfileKind::Cpu),
            "memory" | "mem" => Ok(ProfileKind::Memory),
            "call-graph" | "callgraph" => Ok(ProfileKind::CallGraph),
            "line-level" | "line" => Ok(ProfileKind::LineLevel),
            other => Err(DebugError::Unsupported(format!("不明なプロファイラー: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(SessionStatus::Ready.accepts_commands());
        assert!(SessionStatus::Suspended.accepts_commands());
        assert!(!SessionStatus::Running.accepts_commands());
        assert!(SessionStatus::Terminated.is_final());
        assert!(!SessionStatus::Initializing.is_final());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("pdb".parse::<BackendKind>().unwrap(), BackendKind::Pdb);
        assert_eq!("GDB".parse::<BackendKind>().unwrap(), BackendKind::Gdb);
        assert!("lldb".parse::<BackendKind>().is_err());
        assert_eq!("c".parse::<StepKind>().unwrap(), StepKind::Continue);
        assert_eq!("call-graph".parse::<ProfileKind>().unwrap(), ProfileKind::CallGraph);
        assert_eq!("globals".parse::<VariableScope>().unwrap(), VariableScope::Global);
    }

    #[test]
    fn test_exclusive_profilers() {
        assert!(ProfileKind::Cpu.is_exclusive());
        assert!(ProfileKind::LineLevel.is_exclusive());
        assert!(!ProfileKind::Memory.is_exclusive());
        assert!(!ProfileKind::CallGraph.is_exclusive());
    }

    #[test]
    fn test_evaluation_into_value() {
        let ok = EvaluationResult {
            session_id: SessionId(1),
            expression: "1+1".to_string(),
            result: "2".to_string(),
            type_name: "int".to_string(),
            is_error: false,
            error_message: None,
            execution_time_us: 10,
            timestamp: Utc::now(),
        };
        assert_eq!(ok.clone().into_value().unwrap(), "2");

        let failed = EvaluationResult {
            is_error: true,
            error_message: Some("NameError".to_string()),
            ..ok
        };
        assert!(matches!(failed.into_value(), Err(DebugError::Evaluation(m)) if m == "NameError"));
    }

    #[test]
    fn test_session_request_from_json() {
        let request: SessionRequest = serde_json::from_str(
            r#"{
                "config": {
                    "target": "app.py",
                    "language": "python",
                    "backend": "Pdb",
                    "working_dir": null,
                    "env": {"PYTHONHASHSEED": "0"},
                    "args": ["--fast"]
                },
                "breakpoints": [
                    {"file_path": "app.py", "line": 12, "kind": "Conditional", "condition": "i > 3"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(request.config.backend, BackendKind::Pdb);
        assert_eq!(request.config.env["PYTHONHASHSEED"], "0");
        assert!(request.config.backend_command.is_none());
        assert_eq!(request.breakpoints[0].condition.as_deref(), Some("i > 3"));
        assert_eq!(request.breakpoints[0].ignore_count, None);

        let id = serde_json::to_value(SessionId(7)).unwrap();
        assert_eq!(id, serde_json::json!(7));
    }
}
