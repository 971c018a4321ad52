/*
 * SwiftProbe - 式評価
 *
 * 評価コマンドを1つ送り、次の応答と対応付けて結果を作ります。
 * バックエンドには成功・失敗を示す構造化チャネルがないため、エラーはアダプターの
 * パターンで判定し、すべて結果の中で報告します（セッションは停止しません）。
 */

use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};

use crate::adapter::{strip_prompts, BackendAdapter, OutputClass};
use crate::error::DebugError;
use crate::process::ProcessController;
use crate::protocol::{EvaluationResult, SessionId};

/// 式評価器
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    default_timeout: Duration,
}

impl ExpressionEvaluator {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 式を評価する
    ///
    /// `frame_level` が指定された場合はそのフレームを選択して評価し、最後に元のフレームへ戻す。
    pub async fn evaluate(
        &self,
        session_id: SessionId,
        process: &mut ProcessController,
        adapter: &dyn BackendAdapter,
        expression: &str,
        frame_level: Option<usize>,
        timeout: Option<Duration>,
    ) -> EvaluationResult {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let (select, restore) = adapter.select_frame_commands(frame_level.unwrap_or(0));

        let outcome = async {
            for command in &select {
                process
                    .exchange(command, |l| adapter.is_response_end(l), timeout)
                    .await?;
            }
            let command = adapter.evaluate_command(expression);
            process
                .exchange(&command, |l| adapter.is_response_end(l), timeout)
                .await
        }
        .await;

        for command in &restore {
            if let Err(err) = process
                .exchange(command, |l| adapter.is_response_end(l), timeout)
                .await
            {
                warn!("フレームの復帰に失敗: {}", err);
            }
        }

        let elapsed = started.elapsed();
        match outcome {
            Ok(collected) => {
                let lines = strip_prompts(adapter, &collected.lines);
                match adapter.classifier().classify(&lines) {
                    OutputClass::Error(message) => {
                        debug!("評価エラー: {} => {}", expression, message);
                        error_result(session_id, expression, message, elapsed)
                    }
                    OutputClass::Value(_) if collected.closed && lines.is_empty() => error_result(
                        session_id,
                        expression,
                        "評価中にバックエンドが終了しました".to_string(),
                        elapsed,
                    ),
                    OutputClass::Value(_) => {
                        let value = adapter.extract_value(&collected.lines);
                        EvaluationResult {
                            session_id,
                            expression: expression.to_string(),
                            type_name: adapter.infer_type(&value),
                            result: value,
                            is_error: false,
                            error_message: None,
                            execution_time_us: elapsed.as_micros() as u64,
                            timestamp: Utc::now(),
                        }
                    }
                }
            }
            Err(err) => error_result(session_id, expression, err.to_string(), elapsed),
        }
    }
}

/// 評価できない状態などでの失敗結果
pub fn error_result(session_id: SessionId, expression: &str, message: String, elapsed: Duration) -> EvaluationResult {
    EvaluationResult {
        session_id,
        expression: expression.to_string(),
        result: message.clone(),
        type_name: "error".to_string(),
        is_error: true,
        error_message: Some(message),
        execution_time_us: elapsed.as_micros() as u64,
        timestamp: Utc::now(),
    }
}

/// 状態エラーを失敗結果に変換する
pub fn rejected(session_id: SessionId, expression: &str, err: &DebugError) -> EvaluationResult {
    error_result(session_id, expression, err.to_string(), Duration::ZERO)
}
