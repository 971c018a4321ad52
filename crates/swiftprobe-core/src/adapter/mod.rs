/*
 * SwiftProbe - バックエンドアダプター
 *
 * 言語ごとの外部デバッガー（行指向のテキストプロトコル）をコアから隔離します。
 * コマンド文字列の生成と出力テキストの解析はすべてアダプターの責務です。
 */

mod gdb;
mod pdb;

pub use gdb::GdbAdapter;
pub use pdb::PdbAdapter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::protocol::{BackendKind, Breakpoint, DebugConfiguration, ProfileKind, StepKind, TypeCategory, VariableScope};

/// アダプターが報告する値（名前・値・型カテゴリの組）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedValue {
    pub name: String,
    pub value: String,
    pub type_name: String,
    pub category: TypeCategory,
    pub size: Option<usize>,
}

/// スタック問い合わせの1行分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub function_name: String,
    pub file_path: PathBuf,
    pub line: usize,
    pub is_current: bool,
}

/// バックエンドが報告した停止イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// ソース位置で停止（ブレークポイントかステップかはコアが判断）
    Location {
        file_path: PathBuf,
        line: usize,
        function_name: Option<String>,
    },

    /// 例外による停止
    Exception { description: String },

    /// プログラムの終了
    Exited { exit_code: Option<i32> },
}

/// プロファイラー出力の1行分
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEvent {
    /// 1回の関数呼び出し
    Call {
        caller: Option<String>,
        function: String,
        elapsed: Duration,
    },

    /// 関数単位の集計値
    FunctionStats {
        function: String,
        calls: u64,
        cumulative: Duration,
    },

    /// 呼び出し元→呼び出し先の集計値
    Edge {
        caller: String,
        callee: String,
        calls: u64,
        elapsed: Duration,
    },

    /// 行単位のヒット
    LineHit {
        file_path: PathBuf,
        line: usize,
        elapsed: Duration,
    },

    /// ヒープスナップショットの1エントリ
    HeapSample {
        snapshot: u64,
        site: String,
        bytes: u64,
    },
}

/// 評価出力の分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputClass {
    Value(String),
    Error(String),
}

/// バックエンド出力のエラー判定
///
/// バックエンドには成功・失敗を示す構造化チャネルがないため、テキストのパターンで判定する。
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<Regex>,
}

impl ErrorClassifier {
    /// パターン（正規表現）から作成する。不正なパターンは無視する
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match Regex::new(p.as_ref()) {
                Ok(re) => Some(re),
                Err(err) => {
                    log::warn!("エラーパターンを無視します: {}: {}", p.as_ref(), err);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// いずれかの行がエラーを示すか
    pub fn find_error<'a>(&self, lines: &'a [String]) -> Option<&'a str> {
        lines
            .iter()
            .map(|l| l.as_str())
            .find(|line| self.patterns.iter().any(|re| re.is_match(line)))
    }

    pub fn classify(&self, lines: &[String]) -> OutputClass {
        match self.find_error(lines) {
            Some(_) => OutputClass::Error(lines.join("\n")),
            None => OutputClass::Value(lines.join("\n")),
        }
    }
}

/// 変数の問い合わせと解析（言語オブジェクトへのリフレクションの代わり）
pub trait Introspectable {
    /// スコープ内の変数を列挙するコマンド
    fn scope_command(&self, scope: VariableScope) -> Option<String>;

    /// 式が指す値の子要素を最大 `limit` 個列挙するコマンド
    fn children_command(&self, expression: &str, limit: usize) -> Option<String>;

    /// 子要素の式を組み立てる
    fn child_expression(&self, parent: &str, child: &str) -> String;

    /// 出力から値を取り出す
    fn parse_values(&self, lines: &[String]) -> Vec<ReportedValue>;

    /// 型名と値表記から型カテゴリを決める（評価結果の分類に使う）
    fn categorize(&self, type_name: &str, value: &str) -> TypeCategory;
}

/// 言語ごとのデバッガーバックエンド
pub trait BackendAdapter: Introspectable + Send + Sync {
    fn kind(&self) -> BackendKind;

    /// バックエンドの起動コマンド（プログラムと引数）
    fn launch_command(&self, config: &DebugConfiguration) -> (PathBuf, Vec<String>);

    /// プロファイラー付きでターゲットを直接実行するコマンド
    fn profiler_command(&self, kind: ProfileKind, config: &DebugConfiguration) -> Option<(PathBuf, Vec<String>)>;

    /// 改行なしで出力されるプロンプト
    fn prompts(&self) -> Vec<String>;

    /// 応答の終わりを示す行か
    fn is_response_end(&self, line: &str) -> bool {
        let line = line.trim_end();
        self.prompts()
            .iter()
            .any(|p| !p.trim_end().is_empty() && line.ends_with(p.trim_end()))
    }

    /// 起動直後に送るコマンド
    fn init_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// ブレークポイント設定コマンド（対応していない種類は None）
    fn set_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String>;

    /// ブレークポイント解除コマンド
    fn clear_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String>;

    /// 設定応答からバックエンド側の番号を取り出す
    fn parse_breakpoint_number(&self, lines: &[String]) -> Option<usize>;

    /// ステップコマンド。`started` はプログラムが既に実行を開始しているか
    fn step_command(&self, kind: StepKind, started: bool) -> Option<String>;

    fn stack_command(&self) -> String;

    /// スタック出力を解析する（最も内側のフレームが先頭）
    fn parse_stack(&self, lines: &[String]) -> Vec<RawFrame>;

    /// 停止イベントを解析する
    fn parse_stop(&self, lines: &[String]) -> Option<StopEvent>;

    fn evaluate_command(&self, expression: &str) -> String;

    /// フレーム選択と復帰のコマンド
    fn select_frame_commands(&self, level: usize) -> (Vec<String>, Vec<String>);

    /// 評価出力から値部分を取り出す
    fn extract_value(&self, lines: &[String]) -> String;

    fn classifier(&self) -> &ErrorClassifier;

    fn quit_command(&self) -> Option<String>;

    /// ライブセッションでプロファイリングを開始・停止するコマンド
    fn profile_start_commands(&self, _kind: ProfileKind) -> Option<Vec<String>> {
        None
    }

    fn profile_stop_commands(&self, _kind: ProfileKind) -> Option<Vec<String>> {
        None
    }

    /// ヒープスナップショットを要求するコマンド
    fn heap_snapshot_command(&self, _snapshot: u64) -> Option<String> {
        None
    }

    /// プロファイラー出力の1行を解析する
    fn parse_profile_line(&self, line: &str) -> Option<ProfileEvent> {
        parse_prof_line(line)
    }

    /// 評価結果の型を推定する
    fn infer_type(&self, value: &str) -> String {
        infer_literal_type(value)
    }
}

/// 出力行からバックエンドのプロンプトと区切りを除く
pub(crate) fn strip_prompts(adapter: &dyn BackendAdapter, lines: &[String]) -> Vec<String> {
    let prompts = adapter.prompts();
    lines
        .iter()
        .filter_map(|line| {
            let mut text = line.as_str();
            for prompt in &prompts {
                let prompt = prompt.trim_end();
                if prompt.is_empty() {
                    continue;
                }
                let trimmed = text.trim_end();
                if let Some(rest) = trimmed.strip_suffix(prompt) {
                    text = rest;
                }
                if let Some(rest) = text.trim_start().strip_prefix(prompt) {
                    text = rest.trim_start();
                }
            }
            if text.trim().is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        })
        .collect()
}

fn micros(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_micros)
}

/// 共通のプロファイラー行プロトコル（`@prof ...`）を解析する
pub fn parse_prof_line(line: &str) -> Option<ProfileEvent> {
    let mut parts = line.trim().split_whitespace();
    if parts.next()? != "@prof" {
        return None;
    }
    let tag = parts.next()?;
    let fields: Vec<&str> = parts.collect();

    match (tag, fields.as_slice()) {
        ("call", [caller, function, elapsed]) => Some(ProfileEvent::Call {
            caller: (*caller != "-").then(|| caller.to_string()),
            function: function.to_string(),
            elapsed: micros(elapsed)?,
        }),
        ("stat", [function, calls, cumulative]) => Some(ProfileEvent::FunctionStats {
            function: function.to_string(),
            calls: calls.parse().ok()?,
            cumulative: micros(cumulative)?,
        }),
        ("edge", [caller, callee, calls, elapsed]) => Some(ProfileEvent::Edge {
            caller: caller.to_string(),
            callee: callee.to_string(),
            calls: calls.parse().ok()?,
            elapsed: micros(elapsed)?,
        }),
        ("line", [location, elapsed]) => {
            let (file, line) = location.rsplit_once(':')?;
            Some(ProfileEvent::LineHit {
                file_path: PathBuf::from(file),
                line: line.parse().ok()?,
                elapsed: micros(elapsed)?,
            })
        }
        ("heap", [snapshot, site, bytes]) => Some(ProfileEvent::HeapSample {
            snapshot: snapshot.parse().ok()?,
            site: site.to_string(),
            bytes: bytes.parse().ok()?,
        }),
        _ => None,
    }
}

/// リテラル表記から型名を推定する
pub fn infer_literal_type(value: &str) -> String {
    let value = value.trim();
    let name = if value.is_empty() {
        "unknown"
    } else if value.parse::<i64>().is_ok() {
        "int"
    } else if value.parse::<f64>().is_ok() {
        "float"
    } else if matches!(value, "True" | "False" | "true" | "false") {
        "bool"
    } else if matches!(value, "None" | "null" | "nil") {
        "NoneType"
    } else if (value.starts_with('\'') && value.ends_with('\''))
        || (value.starts_with('"') && value.ends_with('"'))
    {
        "str"
    } else if value.starts_with('[') {
        "list"
    } else if value.starts_with('{') {
        "dict"
    } else if value.starts_with('(') {
        "tuple"
    } else if value.starts_with("<function") || value.starts_with("<bound method") {
        "function"
    } else if value.starts_with("<module") {
        "module"
    } else if value.starts_with("<class") {
        "type"
    } else {
        "object"
    };
    name.to_string()
}

/// バックエンド種別からアダプターを引くレジストリ
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(PdbAdapter::new()));
        registry.register(Arc::new(GdbAdapter::new()));
        registry
    }
}

impl AdapterRegistry {
    /// アダプターを登録（同じ種別は置き換える）
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prof_line_protocol() {
        assert_eq!(
            parse_prof_line("@prof call main work 1500"),
            Some(ProfileEvent::Call {
                caller: Some("main".to_string()),
                function: "work".to_string(),
                elapsed: Duration::from_micros(1500),
            })
        );
        assert_eq!(
            parse_prof_line("@prof call - main 10"),
            Some(ProfileEvent::Call {
                caller: None,
                function: "main".to_string(),
                elapsed: Duration::from_micros(10),
            })
        );
        assert_eq!(
            parse_prof_line("@prof line src/app.py:42 7"),
            Some(ProfileEvent::LineHit {
                file_path: PathBuf::from("src/app.py"),
                line: 42,
                elapsed: Duration::from_micros(7),
            })
        );
        assert_eq!(
            parse_prof_line("@prof heap 2 app.py:10 2048"),
            Some(ProfileEvent::HeapSample {
                snapshot: 2,
                site: "app.py:10".to_string(),
                bytes: 2048,
            })
        );
        assert!(parse_prof_line("@prof call main").is_none());
        assert!(parse_prof_line("@prof heap x site 1").is_none());
        assert!(parse_prof_line("plain output").is_none());
    }

    #[test]
    fn test_literal_type_inference() {
        assert_eq!(infer_literal_type("2"), "int");
        assert_eq!(infer_literal_type("2.5"), "float");
        assert_eq!(infer_literal_type("'abc'"), "str");
        assert_eq!(infer_literal_type("[1, 2]"), "list");
        assert_eq!(infer_literal_type("True"), "bool");
        assert_eq!(infer_literal_type("<module 'os'>"), "module");
        assert_eq!(infer_literal_type("Point(x=1)"), "object");
    }

    #[test]
    fn test_classifier_patterns() {
        let classifier = ErrorClassifier::new(["^\\*\\*\\* ", "Traceback", "("]);
        let ok = vec!["2".to_string()];
        let bad = vec!["*** NameError: name 'x' is not defined".to_string()];
        assert_eq!(classifier.classify(&ok), OutputClass::Value("2".to_string()));
        assert!(matches!(classifier.classify(&bad), OutputClass::Error(_)));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.get(BackendKind::Pdb).unwrap().kind(), BackendKind::Pdb);
        assert_eq!(registry.get(BackendKind::Gdb).unwrap().kind(), BackendKind::Gdb);
    }
}
