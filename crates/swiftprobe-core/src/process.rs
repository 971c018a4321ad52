/*
 * SwiftProbe - プロセス制御
 *
 * デバッグセッションごとに1つの子プロセスを所有し、標準入出力を管理します。
 * 停止時は終了コマンドを送って猶予期間だけ待ち、それでも終わらなければ強制終了します。
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::error::{DebugError, Result};
use crate::relay::{Collected, OutputChannels, OutputRelay, StreamKind};

/// 子プロセスの起動パラメーター
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// 実行するプログラム
    pub program: PathBuf,

    /// 引数
    pub args: Vec<String>,

    /// 作業ディレクトリ
    pub working_dir: Option<PathBuf>,

    /// 環境変数の上書き
    pub env: BTreeMap<String, String>,

    /// 改行なしで出力されるプロンプト
    pub prompts: Vec<String>,

    /// 出力キューの容量
    pub queue_capacity: usize,
}

/// 起動済みプロセスの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub program: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// 子プロセスコントローラー
#[derive(Debug)]
pub struct ProcessController {
    handle: ProcessHandle,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: OutputChannels,
    exit_code: Option<i32>,
}

impl ProcessController {
    /// プロセスを起動する
    pub async fn start(spec: &LaunchSpec) -> Result<Self> {
        if !program_exists(&spec.program) {
            return Err(DebugError::spawn(&spec.program, "実行ファイルが見つかりません"));
        }
        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return Err(DebugError::spawn(
                    &spec.program,
                    format!("作業ディレクトリが存在しません: {}", dir.display()),
                ));
            }
        }

        debug!("プロセスを起動しています: {} {:?}", spec.program.display(), spec.args);

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| DebugError::spawn(&spec.program, e))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DebugError::spawn(&spec.program, "標準出力を取得できません"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DebugError::spawn(&spec.program, "標準エラー出力を取得できません"))?;

        let output = OutputChannels {
            stdout: OutputRelay::spawn(
                StreamKind::Stdout,
                stdout,
                spec.queue_capacity,
                spec.prompts.clone(),
            ),
            stderr: OutputRelay::spawn(StreamKind::Stderr, stderr, spec.queue_capacity, Vec::new()),
        };

        let handle = ProcessHandle {
            pid: child.id(),
            program: spec.program.clone(),
            started_at: Utc::now(),
        };
        info!("プロセスを起動しました: {} (pid={:?})", handle.program.display(), handle.pid);

        Ok(Self {
            handle,
            child: Some(child),
            stdin,
            output,
            exit_code: None,
        })
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn output(&self) -> &OutputChannels {
        &self.output
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// 1行のコマンドを送信する（プロセス終了後は false）
    pub async fn send_command(&mut self, line: &str) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        debug!("-> {}", line);
        let mut payload = line.trim_end_matches('\n').to_string();
        payload.push('\n');
        match stdin.write_all(payload.as_bytes()).await {
            Ok(()) => stdin.flush().await.is_ok(),
            Err(err) => {
                warn!("コマンドの送信に失敗: {}", err);
                false
            }
        }
    }

    /// コマンドを送り、区切り行までの応答を集める
    ///
    /// 前のコマンドの残り出力は送信前に捨てる。区切りが現れないままタイムアウトした場合は
    /// `CommandTimeout` を返すが、プロセスは停止しない。
    pub async fn exchange<F>(&mut self, command: &str, is_end: F, timeout: Duration) -> Result<Collected>
    where
        F: Fn(&str) -> bool,
    {
        self.output.discard_pending();
        if !self.send_command(command).await {
            return Err(DebugError::InvalidState(format!(
                "プロセスが終了しているためコマンドを送信できません: {}",
                command
            )));
        }

        let collected = self.output.collect_until(is_end, timeout).await;
        if !collected.complete && !collected.closed {
            warn!("応答がタイムアウトしました: {}", command);
            return Err(DebugError::CommandTimeout {
                command: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(collected)
    }

    /// プロセスが実行中か
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_code = status.code();
                false
            }
            Err(err) => {
                warn!("プロセス状態の取得に失敗: {}", err);
                false
            }
        }
    }

    /// プロセスを停止する
    ///
    /// `quit_command` を送って標準入力を閉じ、`grace` だけ待ってから強制終了する。
    pub async fn stop(&mut self, quit_command: Option<&str>, grace: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return false;
        };

        if let Some(quit) = quit_command {
            if let Some(stdin) = self.stdin.as_mut() {
                let _ = stdin.write_all(format!("{}\n", quit).as_bytes()).await;
                let _ = stdin.flush().await;
            }
        }
        // 標準入力を閉じるとほとんどのデバッガーは終了する
        self.stdin = None;

        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!("プロセスの待機に失敗: {}", err);
                None
            }
            Err(_) => {
                warn!("猶予期間内に終了しなかったため強制終了します: pid={:?}", self.handle.pid);
                if let Err(err) = child.kill().await {
                    warn!("強制終了に失敗: {}", err);
                }
                child.try_wait().ok().flatten()
            }
        };

        self.exit_code = status.and_then(|s| s.code()).or(self.exit_code);
        self.output.shutdown(grace).await;
        info!("プロセスを停止しました: pid={:?}, 終了コード={:?}", self.handle.pid, self.exit_code);
        true
    }

    /// プロセスの終了を待つ（タイムアウト付き）
    pub async fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        let child = self.child.as_mut()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
                self.exit_code
            }
            _ => None,
        }
    }
}

/// プログラムが存在するか（PATH上の名前も探す）
pub fn program_exists(program: &Path) -> bool {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return program.is_file();
    };
    std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
}
