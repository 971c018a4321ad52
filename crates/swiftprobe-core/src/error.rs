/*
 * SwiftProbe - エラー定義
 *
 * デバッグセッションコアで発生するすべてのエラーを表現します。
 * プロセスレベルの致命的なエラーと、コマンド単位の回復可能なエラーを区別します。
 */

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{ProfileId, ProfileKind, SessionId};

/// デバッグコアの結果型
pub type Result<T> = std::result::Result<T, DebugError>;

/// デバッガーエラー
#[derive(Error, Debug, Clone)]
pub enum DebugError {
    /// ターゲットまたはバックエンドの起動に失敗（致命的）
    #[error("プロセスの起動に失敗: {program}: {reason}")]
    ProcessSpawn {
        /// 起動しようとしたプログラム
        program: PathBuf,
        /// 失敗理由
        reason: String,
    },

    /// バックエンドが停止イベントなしに終了した（致命的）
    #[error("バックエンドが予期せず終了しました: {program} (終了コード {exit_code:?})")]
    BackendExited {
        /// 終了したバックエンド
        program: PathBuf,
        exit_code: Option<i32>,
    },

    /// コマンドのタイムアウト（回復可能）
    #[error("コマンドがタイムアウトしました ({timeout_ms}ms): {command}")]
    CommandTimeout {
        /// 送信したコマンド
        command: String,
        /// タイムアウト値（ミリ秒）
        timeout_ms: u64,
    },

    /// 無効なブレークポイント位置
    #[error("無効なブレークポイント位置 {path}:{line}: {reason}")]
    InvalidBreakpointLocation {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// 不明または期限切れのセッションID
    #[error("セッションが見つかりません: {0}")]
    SessionNotFound(SessionId),

    /// プロファイラーの競合
    #[error("プロファイラーの競合 (セッション {session}, {kind:?}): {reason}")]
    ProfilerConflict {
        session: SessionId,
        kind: ProfileKind,
        reason: String,
    },

    /// バックエンドが評価中にエラーを報告
    #[error("式のエラー: {0}")]
    Evaluation(String),

    /// 不明なプロファイルセッションID
    #[error("プロファイルセッションが見つかりません: {0}")]
    ProfileNotFound(ProfileId),

    /// 現在の状態では実行できない操作
    #[error("無効な状態: {0}")]
    InvalidState(String),

    /// バックエンドが機能をサポートしていない
    #[error("サポートされていない操作: {0}")]
    Unsupported(String),

    /// 設定ファイルのエラー
    #[error("設定エラー: {0}")]
    Config(String),

    /// IOエラー
    #[error("IO エラー: {0}")]
    Io(Arc<io::Error>),
}

impl DebugError {
    /// セッションをError状態に遷移させるプロセスレベルのエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(self, DebugError::ProcessSpawn { .. } | DebugError::BackendExited { .. })
    }

    /// 呼び出し側が再試行できるコマンド単位のエラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DebugError::CommandTimeout { .. }
                | DebugError::Evaluation(_)
                | DebugError::InvalidBreakpointLocation { .. }
                | DebugError::ProfilerConflict { .. }
        )
    }

    pub(crate) fn spawn(program: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DebugError::ProcessSpawn {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<io::Error> for DebugError {
    fn from(err: io::Error) -> Self {
        DebugError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for DebugError {
    fn from(err: toml::de::Error) -> Self {
        DebugError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let spawn = DebugError::spawn("/missing/python3", "not found");
        assert!(spawn.is_fatal());
        assert!(!spawn.is_recoverable());

        let timeout = DebugError::CommandTimeout {
            command: "continue".to_string(),
            timeout_ms: 100,
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.is_recoverable());

        let crashed = DebugError::BackendExited {
            program: "/usr/bin/python3".into(),
            exit_code: Some(3),
        };
        assert!(crashed.is_fatal());
        assert!(crashed.to_string().contains("Some(3)"));
    }

    #[test]
    fn test_io_conversion() {
        let err: DebugError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, DebugError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
