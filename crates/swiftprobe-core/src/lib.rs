//! SwiftProbe デバッグ・プロファイリングコア
//!
//! 外部デバッガー（pdb、GDB など）をテキストプロトコルで制御し、
//! ブレークポイント、ステップ実行、スタック・変数の検査、式評価、
//! CPU・メモリ・コールグラフのプロファイリングをセッション単位で提供します。
//!
//! 呼び出し側は [`DebugSessionRegistry`] と [`ProfilingSessionController`] を通して操作します。

/// バックエンドアダプター：デバッガーごとのコマンド生成と出力解析
pub mod adapter;

/// ブレークポイント管理
pub mod breakpoints;

/// エンジン設定
pub mod config;

/// エラー定義
pub mod error;

/// 式評価
pub mod evaluator;

/// 変数の検査と展開
pub mod inspector;

/// 子プロセス制御
pub mod process;

/// プロファイリング
pub mod profiler;

/// データモデル
pub mod protocol;

/// セッションレジストリ
pub mod registry;

/// 出力リレー
pub mod relay;

/// デバッグセッション
pub mod session;

/// コールスタック追跡
pub mod stack;

pub use adapter::{AdapterRegistry, BackendAdapter, GdbAdapter, PdbAdapter};
pub use config::EngineConfig;
pub use error::{DebugError, Result};
pub use profiler::{ProfileConfig, ProfileData, ProfileTarget, ProfilingSessionController};
pub use protocol::*;
pub use registry::DebugSessionRegistry;
pub use session::DebugSession;

/// ライブラリのバージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
