/*
 * SwiftProbe - コールスタック追跡
 *
 * 停止のたびにバックエンドのスタック出力からフレーム一覧を作り直します。
 * レベル0は常に最も内側（最新）の呼び出しです。
 */

use std::path::Path;

use crate::adapter::RawFrame;
use crate::protocol::StackFrame;

#[derive(Debug, Default)]
pub struct CallStackTracker {
    frames: Vec<StackFrame>,
    /// フレームIDはセッション内で再利用しない
    next_id: usize,
}

impl CallStackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// フレーム一覧を作り直す（`raw` は内側から順）
    pub fn rebuild(&mut self, raw: Vec<RawFrame>) -> &[StackFrame] {
        let current = raw.iter().position(|f| f.is_current).unwrap_or(0);
        self.frames = raw
            .into_iter()
            .enumerate()
            .map(|(level, frame)| {
                self.next_id += 1;
                StackFrame {
                    id: self.next_id,
                    level,
                    function_name: frame.function_name,
                    file_path: frame.file_path,
                    line: frame.line,
                    is_current: level == current,
                }
            })
            .collect();
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn current(&self) -> Option<&StackFrame> {
        self.frames.iter().find(|f| f.is_current).or_else(|| self.frames.first())
    }

    pub fn frame(&self, level: usize) -> Option<&StackFrame> {
        self.frames.get(level)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// 最も内側のフレームの位置
    pub fn innermost_location(&self) -> Option<(&Path, usize)> {
        self.frames.first().map(|f| (f.file_path.as_path(), f.line))
    }
}
