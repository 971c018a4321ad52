/*
 * SwiftProbe - 出力リレー
 *
 * 子プロセスの標準出力・標準エラー出力をストリームごとの読み取りタスクで
 * 行単位に分割し、容量制限付きのキューに蓄積します。
 * キューが満杯の場合は古い行から破棄し、取り出し時に切り詰めマーカーを挿入します。
 */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// 標準エラー出力の行に付けるタグ
pub const STDERR_TAG: &str = "[stderr] ";

/// 出力ストリームの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// 切り詰めマーカーの文字列
pub fn truncation_marker(dropped: usize) -> String {
    format!("[output truncated: {} lines dropped]", dropped)
}

#[derive(Debug, Default)]
struct QueueState {
    lines: VecDeque<String>,
    dropped: usize,
    closed: bool,
}

/// 読み取りタスクと取り出し側で共有するキュー
#[derive(Debug)]
struct RelayQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl RelayQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, line: String) {
        {
            let mut state = self.lock();
            if state.lines.len() >= self.capacity {
                state.lines.pop_front();
                state.dropped += 1;
            }
            state.lines.push_back(line);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn take(state: &mut QueueState) -> Vec<String> {
        let mut lines = Vec::with_capacity(state.lines.len() + 1);
        if state.dropped > 0 {
            warn!("出力キューが満杯のため {} 行を破棄しました", state.dropped);
            lines.push(truncation_marker(state.dropped));
            state.dropped = 0;
        }
        lines.extend(state.lines.drain(..));
        lines
    }
}

/// 1ストリーム分の出力リレー
#[derive(Debug)]
pub struct OutputRelay {
    kind: StreamKind,
    queue: Arc<RelayQueue>,
    task: Option<JoinHandle<()>>,
}

impl OutputRelay {
    /// 読み取りタスクを起動する
    ///
    /// `prompts` は改行なしで出力されるプロンプトで、未完了の行がこれで終わる場合は
    /// その時点で1行として扱う。
    pub fn spawn<R>(kind: StreamKind, reader: R, capacity: usize, prompts: Vec<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let queue = Arc::new(RelayQueue::new(capacity));
        let task_queue = queue.clone();
        let task = tokio::spawn(async move {
            read_lines(reader, kind, &task_queue, &prompts).await;
            task_queue.close();
        });

        Self {
            kind,
            queue,
            task: Some(task),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// キューにある行をすべて取り出す。空の場合は最大 `timeout` まで待つ
    pub async fn drain(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.queue.lock();
                if !state.lines.is_empty() || state.dropped > 0 || state.closed {
                    return RelayQueue::take(&mut state);
                }
            }
            if timeout_at(deadline, self.queue.notify.notified()).await.is_err() {
                let mut state = self.queue.lock();
                return RelayQueue::take(&mut state);
            }
        }
    }

    /// 待たずに取り出す
    pub fn try_drain(&self) -> Vec<String> {
        let mut state = self.queue.lock();
        RelayQueue::take(&mut state)
    }

    /// ストリームが閉じられ、キューも空か
    pub fn is_exhausted(&self) -> bool {
        let state = self.queue.lock();
        state.closed && state.lines.is_empty()
    }

    /// 読み取りタスクの終了を待つ（猶予を過ぎたら中止）
    pub async fn shutdown(&mut self, grace: Duration) {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!("{:?} の読み取りタスクを中止します", self.kind);
                task.abort();
            }
        }
    }
}

impl Drop for OutputRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn read_lines<R>(mut reader: R, kind: StreamKind, queue: &RelayQueue, prompts: &[String])
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    queue.push(decode_line(kind, &raw[..raw.len() - 1]));
                }
                if !pending.is_empty() && ends_with_prompt(&pending, prompts) {
                    queue.push(decode_line(kind, &pending));
                    pending.clear();
                }
            }
            Err(err) => {
                warn!("{:?} の読み取りに失敗: {}", kind, err);
                break;
            }
        }
    }

    if !pending.is_empty() {
        queue.push(decode_line(kind, &pending));
    }
    debug!("{:?} が閉じられました", kind);
}

fn ends_with_prompt(pending: &[u8], prompts: &[String]) -> bool {
    let text = String::from_utf8_lossy(pending);
    let text = text.trim_end();
    prompts
        .iter()
        .map(|p| p.trim_end())
        .any(|p| !p.is_empty() && text.ends_with(p))
}

fn decode_line(kind: StreamKind, raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    match kind {
        StreamKind::Stdout => text.to_string(),
        StreamKind::Stderr => format!("{}{}", STDERR_TAG, text),
    }
}

/// コマンド応答の収集結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// 収集した行（標準エラー出力はタグ付き）
    pub lines: Vec<String>,

    /// 応答の区切りを検出したか
    pub complete: bool,

    /// ストリームが閉じられたか（プロセス終了）
    pub closed: bool,
}

/// 1プロセス分の出力リレー（stdout/stderr）
#[derive(Debug)]
pub struct OutputChannels {
    pub stdout: OutputRelay,
    pub stderr: OutputRelay,
}

impl OutputChannels {
    /// 両ストリームから取り出す（stdoutのみ待機する）
    pub async fn drain(&self, timeout: Duration) -> Vec<String> {
        let mut lines = self.stdout.drain(timeout).await;
        lines.extend(self.stderr.try_drain());
        lines
    }

    /// 区切り行が現れるか、タイムアウトするまで出力を集める
    pub async fn collect_until<F>(&self, is_end: F, timeout: Duration) -> Collected
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut collected = Collected::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let batch = self.stdout.drain(remaining).await;
            if batch.iter().any(|line| is_end(line)) {
                collected.complete = true;
            }
            collected.lines.extend(batch);
            collected.lines.extend(self.stderr.try_drain());

            if collected.complete {
                break;
            }
            if self.stdout.is_exhausted() {
                collected.closed = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        collected
    }

    /// 前のコマンドの残り出力を捨てる
    pub fn discard_pending(&self) -> usize {
        let stale = self.stdout.try_drain().len() + self.stderr.try_drain().len();
        if stale > 0 {
            debug!("前回のコマンドの出力 {} 行を破棄しました", stale);
        }
        stale
    }

    pub async fn shutdown(&mut self, grace: Duration) {
        self.stdout.shutdown(grace).await;
        self.stderr.shutdown(grace).await;
    }
}
