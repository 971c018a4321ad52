/*
 * SwiftProbe - エンジン設定
 *
 * タイムアウト、出力キューの容量、変数表示の制限、プロファイラーの間隔などを
 * TOMLファイルから読み込みます。すべての項目にデフォルト値があります。
 */

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{DebugError, Result};

/// 設定ファイルのパスを指定する環境変数
pub const CONFIG_ENV_VAR: &str = "SWIFTPROBE_CONFIG";

/// エンジン全体の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// セッション設定
    #[serde(default)]
    pub session: SessionConfig,

    /// 出力リレー設定
    #[serde(default)]
    pub output: OutputConfig,

    /// 変数インスペクター設定
    #[serde(default)]
    pub inspector: InspectorConfig,

    /// プロファイラー設定
    #[serde(default)]
    pub profiler: ProfilerConfig,
}

/// セッション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// ステップなどのコマンドのタイムアウト (ミリ秒)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// 式評価のタイムアウト (ミリ秒)
    #[serde(default = "default_evaluate_timeout")]
    pub evaluate_timeout_ms: u64,

    /// 停止時の猶予期間 (ミリ秒)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// 無視されたヒットで自動継続する最大回数
    #[serde(default = "default_max_continue_hops")]
    pub max_continue_hops: usize,
}

/// 出力リレー設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// ストリームごとのキュー容量 (行数)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// 変数インスペクター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// 値の表示文字列の最大長
    #[serde(default = "default_max_value_length")]
    pub max_value_length: usize,

    /// 変数ツリーの最大深さ
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// プロファイラー設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// メモリスナップショットの間隔 (ミリ秒)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,

    /// ボトルネックとして報告する上位件数
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// 停止時にプロファイラー出力を待つ時間 (ミリ秒)
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

fn default_command_timeout() -> u64 {
    10_000
}

fn default_evaluate_timeout() -> u64 {
    5_000
}

fn default_shutdown_grace() -> u64 {
    2_000
}

fn default_max_continue_hops() -> usize {
    1_000
}

fn default_queue_capacity() -> usize {
    2_000
}

fn default_max_value_length() -> usize {
    200
}

fn default_max_depth() -> usize {
    3
}

fn default_snapshot_interval() -> u64 {
    1_000
}

fn default_top_n() -> usize {
    10
}

fn default_flush_timeout() -> u64 {
    30_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            evaluate_timeout_ms: default_evaluate_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_continue_hops: default_max_continue_hops(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_value_length: default_max_value_length(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval(),
            top_n: default_top_n(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn evaluate_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluate_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ProfilerConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl EngineConfig {
    /// TOML文字列から設定を読み込む
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定ファイルを読み込む
    pub fn load(path: &Path) -> Result<Self> {
        debug!("設定ファイルを読み込んでいます: {}", path.display());
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// 環境変数が指す設定ファイルを読み込む（未設定ならデフォルト）
    pub fn from_env() -> Result<Self> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                info!("{} から設定を読み込みます", CONFIG_ENV_VAR);
                Self::load(Path::new(&path))
            }
            None => Ok(Self::default()),
        }
    }

    /// 設定値の妥当性を検証
    pub fn validate(&self) -> Result<()> {
        if self.output.queue_capacity == 0 {
            return Err(DebugError::Config("output.queue_capacity は1以上が必要です".to_string()));
        }
        if self.session.command_timeout_ms == 0 || self.session.evaluate_timeout_ms == 0 {
            return Err(DebugError::Config("タイムアウトは1ms以上が必要です".to_string()));
        }
        if self.inspector.max_depth == 0 {
            return Err(DebugError::Config("inspector.max_depth は1以上が必要です".to_string()));
        }
        Ok(())
    }
}
