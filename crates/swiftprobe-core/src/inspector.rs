/*
 * SwiftProbe - 変数インスペクター
 *
 * アダプターが報告した値を深さ制限付きの変数ツリーに変換します。
 * 複合値の子要素は要求時に展開し、1回の展開で最大 MAX_CHILDREN 個までに制限します。
 */

use std::collections::HashMap;

use log::debug;

use crate::adapter::{Introspectable, ReportedValue};
use crate::config::InspectorConfig;
use crate::error::{DebugError, Result};
use crate::protocol::{TypeCategory, Variable, VariableScope};

/// 1回の展開で生成する子要素の上限
pub const MAX_CHILDREN: usize = 10;

/// 停止位置ごとの変数ツリー
#[derive(Debug)]
pub struct VariableInspector {
    max_value_length: usize,
    max_depth: usize,
    /// 変数ID → 変数（子要素は親の `children` にも複製される）
    variables: HashMap<usize, Variable>,
    next_id: usize,
}

impl VariableInspector {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            max_value_length: config.max_value_length.max(1),
            max_depth: config.max_depth.max(1),
            variables: HashMap::new(),
            next_id: 1,
        }
    }

    /// 停止のたびに呼び、以前の変数IDをすべて無効にする
    pub fn reset(&mut self) {
        self.variables.clear();
        self.next_id = 1;
    }

    /// 最上位の変数を作成する
    pub fn build_scope(&mut self, values: Vec<ReportedValue>, scope: VariableScope) -> Vec<Variable> {
        values
            .into_iter()
            .map(|value| {
                let evaluate_name = value.name.clone();
                self.register(value, scope, evaluate_name, 0)
            })
            .collect()
    }

    /// 評価結果を1つの変数として登録する（ウォッチ式など）
    pub fn build_single(
        &mut self,
        name: &str,
        expression: &str,
        value: ReportedValue,
        scope: VariableScope,
    ) -> Variable {
        let mut variable = self.register(value, scope, expression.to_string(), 0);
        variable.name = name.to_string();
        if let Some(stored) = self.variables.get_mut(&variable.id) {
            stored.name = name.to_string();
        }
        variable
    }

    /// 子要素を展開する
    ///
    /// `values` はアダプターが報告した子要素で、先頭から最大 [`MAX_CHILDREN`] 個だけ採用する。
    pub fn attach_children<A>(&mut self, adapter: &A, parent_id: usize, values: Vec<ReportedValue>) -> Result<Vec<Variable>>
    where
        A: Introspectable + ?Sized,
    {
        let parent = self
            .variables
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| DebugError::InvalidState(format!("変数IDが無効です: {}", parent_id)))?;
        if !parent.has_children {
            return Ok(Vec::new());
        }

        if values.len() > MAX_CHILDREN {
            debug!(
                "{} の子要素を {} 個に制限します (報告数 {})",
                parent.name,
                MAX_CHILDREN,
                values.len()
            );
        }

        let children: Vec<Variable> = values
            .into_iter()
            .take(MAX_CHILDREN)
            .map(|value| {
                let evaluate_name = adapter.child_expression(&parent.evaluate_name, &value.name);
                self.register(value, parent.scope, evaluate_name, parent.depth + 1)
            })
            .collect();

        if let Some(stored) = self.variables.get_mut(&parent_id) {
            stored.children = children.clone();
        }
        Ok(children)
    }

    pub fn get(&self, id: usize) -> Option<&Variable> {
        self.variables.get(&id)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// 表示用の値文字列
    ///
    /// 要素数がわかるコレクション・オブジェクトは `TypeName[count]`、それ以外は切り詰めた値。
    pub fn display_value(&self, value: &ReportedValue) -> String {
        match (value.category, value.size) {
            (TypeCategory::Collection | TypeCategory::Object, Some(count)) => {
                format!("{}[{}]", value.type_name, count)
            }
            _ => truncate(&value.value, self.max_value_length),
        }
    }

    fn register(&mut self, value: ReportedValue, scope: VariableScope, evaluate_name: String, depth: usize) -> Variable {
        let id = self.next_id;
        self.next_id += 1;

        // 最大深さの要素は展開しない
        let has_children =
            value.category.is_composite() && depth + 1 < self.max_depth && value.size.map_or(true, |n| n > 0);

        let variable = Variable {
            id,
            value: self.display_value(&value),
            name: value.name,
            type_name: value.type_name,
            category: value.category,
            scope,
            size: value.size,
            has_children,
            children: Vec::new(),
            evaluate_name,
            depth,
        };
        self.variables.insert(id, variable.clone());
        variable
    }
}

/// 文字数で切り詰める
pub fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.char_indices();
    match chars.nth(max_chars) {
        Some((end, _)) => format!("{}...", &value[..end]),
        None => value.to_string(),
    }
}
