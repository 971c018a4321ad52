/*
 * SwiftProbe - ブレークポイント管理
 *
 * ブレークポイントの追加・削除・有効化と、ヒット回数・無視回数の管理を行います。
 * 状態はプロセスの生死とは独立しており、起動前に設定したものは後で再送されます。
 */

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;

use crate::error::{DebugError, Result};
use crate::protocol::{Breakpoint, BreakpointKind, BreakpointRequest, BreakpointStatus, SessionId};

/// セッション単位のブレークポイントマネージャー
#[derive(Debug)]
pub struct BreakpointManager {
    session_id: SessionId,
    breakpoints: BTreeMap<usize, Breakpoint>,
    /// (ファイル, 行) → ブレークポイントID
    location_index: HashMap<(PathBuf, usize), Vec<usize>>,
    /// 関数名 → ブレークポイントID
    function_index: HashMap<String, Vec<usize>>,
    next_id: usize,
}

impl BreakpointManager {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            breakpoints: BTreeMap::new(),
            location_index: HashMap::new(),
            function_index: HashMap::new(),
            next_id: 1,
        }
    }

    /// リクエストを検証してブレークポイントを作成する（まだ登録しない）
    pub fn build(&self, request: &BreakpointRequest) -> Result<Breakpoint> {
        let invalid = |reason: &str| DebugError::InvalidBreakpointLocation {
            path: request.file_path.clone(),
            line: request.line,
            reason: reason.to_string(),
        };

        match request.kind {
            BreakpointKind::Line | BreakpointKind::Conditional => {
                if request.file_path.as_os_str().is_empty() {
                    return Err(invalid("ファイルパスが空です"));
                }
                if request.line == 0 {
                    return Err(invalid("行番号は1から始まります"));
                }
            }
            BreakpointKind::Function => {
                if request.function_name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                    return Err(invalid("関数名が指定されていません"));
                }
            }
            BreakpointKind::Exception => {}
        }
        if request.kind == BreakpointKind::Conditional
            && request.condition.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            return Err(invalid("条件付きブレークポイントに条件式がありません"));
        }

        Ok(Breakpoint {
            id: self.next_id,
            session_id: self.session_id,
            kind: request.kind,
            status: BreakpointStatus::Enabled,
            file_path: request.file_path.clone(),
            line: request.line,
            function_name: request.function_name.clone(),
            condition: request.condition.clone(),
            ignore_count: request.ignore_count.unwrap_or(0),
            hit_count: 0,
            last_hit: None,
            backend_id: None,
            verified: false,
        })
    }

    /// ブレークポイントを登録し、IDを返す
    pub fn add(&mut self, mut breakpoint: Breakpoint) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        breakpoint.id = id;
        breakpoint.session_id = self.session_id;
        debug!(
            "ブレークポイントを追加: id={}, {}:{}",
            id,
            breakpoint.file_path.display(),
            breakpoint.line
        );
        self.breakpoints.insert(id, breakpoint);
        self.rebuild_index();
        id
    }

    /// ブレークポイントを削除
    pub fn remove(&mut self, id: usize) -> Option<Breakpoint> {
        let removed = self.breakpoints.remove(&id);
        if removed.is_some() {
            self.rebuild_index();
        }
        removed
    }

    /// 有効・無効を切り替える
    pub fn set_enabled(&mut self, id: usize, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(bp) => {
                bp.status = if enabled {
                    BreakpointStatus::Enabled
                } else {
                    BreakpointStatus::Disabled
                };
                true
            }
            None => false,
        }
    }

    /// ヒットを記録し、停止すべきかを返す
    ///
    /// ヒット回数は常に増加し、`hit_count <= ignore_count` の間は停止しない。
    pub fn record_hit(&mut self, id: usize) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.hit_count = bp.hit_count.saturating_add(1);
        bp.last_hit = Some(Utc::now());
        if bp.hit_count <= bp.ignore_count {
            debug!("ブレークポイント {} のヒットを無視 ({}/{})", id, bp.hit_count, bp.ignore_count);
            return false;
        }
        bp.is_enabled()
    }

    /// バックエンドへの反映結果を記録
    pub fn mark_verified(&mut self, id: usize, backend_id: Option<usize>) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.verified = true;
            bp.backend_id = backend_id;
        }
    }

    /// プロセスの再起動などでバックエンド側の状態が失われた
    pub fn reset_verification(&mut self) {
        for bp in self.breakpoints.values_mut() {
            bp.verified = false;
            bp.backend_id = None;
        }
    }

    pub fn get(&self, id: usize) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// 位置に一致するブレークポイント
    pub fn at_location(&self, file: &Path, line: usize) -> Vec<usize> {
        if let Some(ids) = self.location_index.get(&(file.to_path_buf(), line)) {
            return ids.clone();
        }
        // バックエンドが絶対パスを報告し、登録時は相対パスだった場合
        self.breakpoints
            .values()
            .filter(|bp| bp.line == line && !bp.file_path.as_os_str().is_empty())
            .filter(|bp| file.ends_with(&bp.file_path) || bp.file_path.ends_with(file))
            .filter(|bp| matches!(bp.kind, BreakpointKind::Line | BreakpointKind::Conditional))
            .map(|bp| bp.id)
            .collect()
    }

    /// 関数名に一致するブレークポイント
    pub fn for_function(&self, function: &str) -> Vec<usize> {
        self.function_index.get(function).cloned().unwrap_or_default()
    }

    /// 例外ブレークポイント
    pub fn exception_breakpoints(&self) -> Vec<usize> {
        self.breakpoints
            .values()
            .filter(|bp| bp.kind == BreakpointKind::Exception)
            .map(|bp| bp.id)
            .collect()
    }

    /// 未反映の有効なブレークポイント
    pub fn unverified(&self) -> Vec<Breakpoint> {
        self.breakpoints
            .values()
            .filter(|bp| !bp.verified && bp.is_enabled())
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.location_index.clear();
        self.function_index.clear();
        for bp in self.breakpoints.values() {
            match bp.kind {
                BreakpointKind::Line | BreakpointKind::Conditional => {
                    self.location_index
                        .entry((bp.file_path.clone(), bp.line))
                        .or_default()
                        .push(bp.id);
                }
                BreakpointKind::Function => {
                    if let Some(name) = &bp.function_name {
                        self.function_index.entry(name.clone()).or_default().push(bp.id);
                    }
                }
                BreakpointKind::Exception => {}
            }
        }
    }
}
