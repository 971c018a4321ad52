/*
 * SwiftProbe - GDB アダプター
 *
 * GDBのコンソール出力（`(gdb) ` プロンプト）を解析します。
 * ネイティブターゲットのプロファイリングはプロセス直接実行の `@prof` 行のみ対応します。
 */

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use super::{strip_prompts, BackendAdapter, ErrorClassifier, Introspectable, RawFrame, ReportedValue, StopEvent};
use crate::protocol::{
    BackendKind, Breakpoint, BreakpointKind, DebugConfiguration, ProfileKind, StepKind, TypeCategory, VariableScope,
};

const PROMPT: &str = "(gdb) ";

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(\d+)\s+(?:0x[0-9a-fA-F]+ in )?(\S+) \(.*\)(?: at (.+):(\d+))?").expect("frame pattern")
});
static BREAKPOINT_STOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Temporary breakpoint|Breakpoint) \d+, (?:0x[0-9a-fA-F]+ in )?(\S+) \(.*\) at (.+):(\d+)")
        .expect("breakpoint stop pattern")
});
static FUNCTION_STOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:0x[0-9a-fA-F]+ in )?([A-Za-z_][\w:<>~]*) \(.*\) at (.+):(\d+)$").expect("function stop pattern")
});
static SOURCE_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\t").expect("source line pattern"));
static EXITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[Inferior \d+ \(process \d+\) exited (?:normally|with code (\d+))\]").expect("exit pattern")
});
static SIGNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Program received signal (.+)$").expect("signal pattern"));
static BREAKPOINT_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:Breakpoint|Catchpoint) (\d+)[ :]").expect("breakpoint pattern"));
static ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_]\w*) = (.*)$").expect("assignment pattern"));
static HISTORY_VALUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\$\d+ = (.*)$").expect("history pattern"));

static GDB_ERRORS: LazyLock<ErrorClassifier> = LazyLock::new(|| {
    ErrorClassifier::new([
        r"^No symbol ",
        r"^Cannot access memory",
        r"[Ss]yntax error",
        r"^No frame selected",
        r"^The program is not being run",
        r"^Attempt to ",
    ])
});

#[derive(Debug, Clone)]
pub struct GdbAdapter {
    classifier: ErrorClassifier,
}

impl Default for GdbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GdbAdapter {
    pub fn new() -> Self {
        Self {
            classifier: GDB_ERRORS.clone(),
        }
    }

    fn category_of(value: &str) -> TypeCategory {
        let value = value.trim();
        if value.starts_with('{') {
            if split_top_level(value).iter().any(|e| e.contains(" = ")) {
                TypeCategory::Object
            } else {
                TypeCategory::Collection
            }
        } else if value.starts_with("0x") && value.contains('<') {
            TypeCategory::Function
        } else if value.is_empty() {
            TypeCategory::Unknown
        } else {
            TypeCategory::Primitive
        }
    }

    /// `name = value` を1件の値にする
    fn reported(name: String, value: String) -> ReportedValue {
        let category = Self::category_of(&value);
        let size = category
            .is_composite()
            .then(|| split_top_level(&value).len());
        ReportedValue {
            type_name: c_type_name(&value),
            name,
            value,
            category,
            size,
        }
    }
}

/// `{a, b, {c, d}}` を最上位の要素に分割する
fn split_top_level(value: &str) -> Vec<String> {
    let inner = value
        .trim()
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or("");
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '"' => in_string = !in_string,
            '{' | '(' | '[' if !in_string => depth += 1,
            '}' | ')' | ']' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn c_type_name(value: &str) -> String {
    let value = value.trim();
    let name = if value.starts_with('{') {
        "struct"
    } else if value.starts_with('"') {
        "char *"
    } else if value.starts_with("0x") && value.contains('<') {
        "function"
    } else if value.starts_with("0x") {
        "pointer"
    } else if value.parse::<i64>().is_ok() {
        "int"
    } else if value.parse::<f64>().is_ok() {
        "double"
    } else if matches!(value, "true" | "false") {
        "bool"
    } else if value.split_whitespace().nth(1).map_or(false, |c| c.starts_with('\'')) {
        "char"
    } else {
        "unknown"
    };
    name.to_string()
}

impl Introspectable for GdbAdapter {
    fn scope_command(&self, scope: VariableScope) -> Option<String> {
        match scope {
            VariableScope::Local => Some("info locals".to_string()),
            VariableScope::Instance => Some("info args".to_string()),
            VariableScope::Global | VariableScope::Watch => None,
        }
    }

    fn children_command(&self, expression: &str, _limit: usize) -> Option<String> {
        Some(format!("print {}", expression))
    }

    fn child_expression(&self, parent: &str, child: &str) -> String {
        if child.chars().all(|c| c.is_ascii_digit()) {
            format!("{}[{}]", parent, child)
        } else {
            format!("{}.{}", parent, child)
        }
    }

    fn parse_values(&self, lines: &[String]) -> Vec<ReportedValue> {
        let lines = strip_prompts(self, lines);

        // `print` の応答は子要素の列挙として扱う
        if let Some(caps) = lines.iter().find_map(|l| HISTORY_VALUE.captures(l)) {
            return split_top_level(&caps[1])
                .into_iter()
                .enumerate()
                .map(|(index, element)| match element.split_once(" = ") {
                    Some((name, value)) => Self::reported(name.trim().to_string(), value.trim().to_string()),
                    None => Self::reported(index.to_string(), element),
                })
                .collect();
        }

        lines
            .iter()
            .filter_map(|line| ASSIGNMENT.captures(line))
            .map(|caps| Self::reported(caps[1].to_string(), caps[2].to_string()))
            .collect()
    }

    fn categorize(&self, _type_name: &str, value: &str) -> TypeCategory {
        Self::category_of(value)
    }
}

impl BackendAdapter for GdbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Gdb
    }

    fn launch_command(&self, config: &DebugConfiguration) -> (PathBuf, Vec<String>) {
        let (program, mut args) = match &config.backend_command {
            Some(cmd) if !cmd.is_empty() => (PathBuf::from(&cmd[0]), cmd[1..].to_vec()),
            _ => (
                PathBuf::from("gdb"),
                vec!["-q".to_string(), "-nx".to_string(), "--args".to_string()],
            ),
        };
        args.push(config.target.to_string_lossy().into_owned());
        args.extend(config.args.iter().cloned());
        (program, args)
    }

    fn profiler_command(&self, _kind: ProfileKind, config: &DebugConfiguration) -> Option<(PathBuf, Vec<String>)> {
        // ネイティブターゲットは自身で `@prof` 行を出力する前提
        Some((config.target.clone(), config.args.clone()))
    }

    fn prompts(&self) -> Vec<String> {
        vec![PROMPT.to_string()]
    }

    fn init_commands(&self) -> Vec<String> {
        ["set pagination off", "set confirm off", "set width 0"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    fn set_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String> {
        let location = format!("{}:{}", breakpoint.file_path.display(), breakpoint.line);
        match breakpoint.kind {
            BreakpointKind::Line => Some(format!("break {}", location)),
            BreakpointKind::Conditional => Some(format!(
                "break {} if {}",
                location,
                breakpoint.condition.as_deref().unwrap_or("1")
            )),
            BreakpointKind::Function => breakpoint.function_name.as_ref().map(|f| format!("break {}", f)),
            BreakpointKind::Exception => Some("catch throw".to_string()),
        }
    }

    fn clear_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String> {
        if let Some(number) = breakpoint.backend_id {
            return Some(format!("delete {}", number));
        }
        match breakpoint.kind {
            BreakpointKind::Line | BreakpointKind::Conditional => Some(format!(
                "clear {}:{}",
                breakpoint.file_path.display(),
                breakpoint.line
            )),
            BreakpointKind::Function => breakpoint.function_name.as_ref().map(|f| format!("clear {}", f)),
            BreakpointKind::Exception => None,
        }
    }

    fn parse_breakpoint_number(&self, lines: &[String]) -> Option<usize> {
        strip_prompts(self, lines)
            .iter()
            .find_map(|line| BREAKPOINT_NUMBER.captures(line))
            .and_then(|caps| caps[1].parse().ok())
    }

    fn step_command(&self, kind: StepKind, started: bool) -> Option<String> {
        let command = match (kind, started) {
            (StepKind::Pause, _) => return None,
            (StepKind::Restart, _) | (StepKind::Continue, false) => "run",
            (_, false) => "start",
            (StepKind::Over, true) => "next",
            (StepKind::Into, true) => "step",
            (StepKind::Out, true) => "finish",
            (StepKind::Continue, true) => "continue",
        };
        Some(command.to_string())
    }

    fn stack_command(&self) -> String {
        "bt".to_string()
    }

    fn parse_stack(&self, lines: &[String]) -> Vec<RawFrame> {
        strip_prompts(self, lines)
            .iter()
            .filter_map(|line| FRAME.captures(line))
            .map(|caps| {
                let level: usize = caps[1].parse().unwrap_or(0);
                RawFrame {
                    function_name: caps[2].to_string(),
                    file_path: caps
                        .get(3)
                        .map(|m| PathBuf::from(m.as_str()))
                        .unwrap_or_else(|| PathBuf::from("??")),
                    line: caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
                    is_current: level == 0,
                }
            })
            .collect()
    }

    fn parse_stop(&self, lines: &[String]) -> Option<StopEvent> {
        let lines = strip_prompts(self, lines);

        if let Some(caps) = lines.iter().find_map(|l| EXITED.captures(l)) {
            // GDBは終了コードを8進数で表示する
            let exit_code = match caps.get(1) {
                Some(code) => i32::from_str_radix(code.as_str(), 8).ok(),
                None => Some(0),
            };
            return Some(StopEvent::Exited { exit_code });
        }
        if lines.iter().any(|l| l.starts_with("Program terminated with signal")) {
            return Some(StopEvent::Exited { exit_code: None });
        }
        if let Some(caps) = lines.iter().find_map(|l| SIGNAL.captures(l)) {
            return Some(StopEvent::Exception {
                description: caps[1].trim().to_string(),
            });
        }

        for line in lines.iter().rev() {
            if let Some(caps) = BREAKPOINT_STOP
                .captures(line)
                .or_else(|| FUNCTION_STOP.captures(line))
            {
                if let Ok(line_number) = caps[3].parse() {
                    return Some(StopEvent::Location {
                        file_path: PathBuf::from(&caps[2]),
                        line: line_number,
                        function_name: Some(caps[1].to_string()),
                    });
                }
            }
        }

        // 同じ関数内のステップでは行番号とソースだけが表示される
        lines
            .iter()
            .rev()
            .find_map(|l| SOURCE_LINE.captures(l))
            .and_then(|caps| caps[1].parse().ok())
            .map(|line| StopEvent::Location {
                file_path: PathBuf::new(),
                line,
                function_name: None,
            })
    }

    fn evaluate_command(&self, expression: &str) -> String {
        format!("print {}", expression.replace('\n', " "))
    }

    fn select_frame_commands(&self, level: usize) -> (Vec<String>, Vec<String>) {
        if level == 0 {
            return (Vec::new(), Vec::new());
        }
        (vec![format!("frame {}", level)], vec!["frame 0".to_string()])
    }

    fn extract_value(&self, lines: &[String]) -> String {
        let lines = strip_prompts(self, lines);
        match lines.iter().find_map(|l| HISTORY_VALUE.captures(l)) {
            Some(caps) => caps[1].to_string(),
            None => lines.join("\n"),
        }
    }

    fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    fn quit_command(&self) -> Option<String> {
        Some("quit".to_string())
    }

    fn infer_type(&self, value: &str) -> String {
        c_type_name(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    #[test]
    fn test_launch_command() {
        let adapter = GdbAdapter::new();
        let mut config = DebugConfiguration::new("./server", "c", BackendKind::Gdb);
        config.args = vec!["8080".to_string()];
        let (program, args) = adapter.launch_command(&config);
        assert_eq!(program, PathBuf::from("gdb"));
        assert_eq!(args, vec!["-q", "-nx", "--args", "./server", "8080"]);
    }

    #[test]
    fn test_step_commands_before_start() {
        let adapter = GdbAdapter::new();
        assert_eq!(adapter.step_command(StepKind::Continue, false).unwrap(), "run");
        assert_eq!(adapter.step_command(StepKind::Over, false).unwrap(), "start");
        assert_eq!(adapter.step_command(StepKind::Over, true).unwrap(), "next");
        assert_eq!(adapter.step_command(StepKind::Out, true).unwrap(), "finish");
        assert!(adapter.step_command(StepKind::Pause, true).is_none());
    }

    #[test]
    fn test_parse_stops() {
        let adapter = GdbAdapter::new();
        let hit = lines("\nBreakpoint 1, compute (n=3) at main.c:12\n12\t  int total = 0;\n(gdb) ");
        assert_eq!(
            adapter.parse_stop(&hit),
            Some(StopEvent::Location {
                file_path: PathBuf::from("main.c"),
                line: 12,
                function_name: Some("compute".to_string()),
            })
        );

        let stepped = lines("13\t  for (int i = 0; i < n; i++) {\n(gdb) ");
        assert_eq!(
            adapter.parse_stop(&stepped),
            Some(StopEvent::Location {
                file_path: PathBuf::new(),
                line: 13,
                function_name: None,
            })
        );

        let exited = lines("[Inferior 1 (process 4242) exited with code 012]\n(gdb) ");
        assert_eq!(adapter.parse_stop(&exited), Some(StopEvent::Exited { exit_code: Some(10) }));

        let normal = lines("[Inferior 1 (process 4242) exited normally]\n(gdb) ");
        assert_eq!(adapter.parse_stop(&normal), Some(StopEvent::Exited { exit_code: Some(0) }));

        let crashed = lines("\nProgram received signal SIGSEGV, Segmentation fault.\n0x0000 in main () at main.c:4\n(gdb) ");
        assert_eq!(
            adapter.parse_stop(&crashed),
            Some(StopEvent::Exception {
                description: "SIGSEGV, Segmentation fault.".to_string()
            })
        );
    }

    #[test]
    fn test_parse_backtrace() {
        let adapter = GdbAdapter::new();
        let output = lines(
            "#0  compute (n=3) at main.c:12\n#1  0x0000555555555189 in main () at main.c:20\n#2  0x00007ffff7829d90 in __libc_start_call_main () from /lib/libc.so.6\n(gdb) ",
        );
        let frames = adapter.parse_stack(&output);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function_name, "compute");
        assert!(frames[0].is_current);
        assert_eq!(frames[1].line, 20);
        assert_eq!(frames[2].file_path, PathBuf::from("??"));
        assert_eq!(frames[2].line, 0);
    }

    #[test]
    fn test_parse_locals_and_children() {
        let adapter = GdbAdapter::new();
        let locals = lines("total = 6\npoint = {x = 1, y = 2}\nvalues = {1, 2, 3}\ncb = 0x401136 <handler>\n(gdb) ");
        let values = adapter.parse_values(&locals);
        assert_eq!(values.len(), 4);
        assert_eq!(values[0].category, TypeCategory::Primitive);
        assert_eq!(values[0].type_name, "int");
        assert_eq!(values[1].category, TypeCategory::Object);
        assert_eq!(values[1].size, Some(2));
        assert_eq!(values[2].category, TypeCategory::Collection);
        assert_eq!(values[2].size, Some(3));
        assert_eq!(values[3].category, TypeCategory::Function);

        let children = adapter.parse_values(&lines("$3 = {x = 1, y = {a = 5, b = 6}}\n(gdb) "));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "x");
        assert_eq!(children[1].name, "y");
        assert_eq!(children[1].category, TypeCategory::Object);

        let elements = adapter.parse_values(&lines("$4 = {10, 20}\n(gdb) "));
        assert_eq!(elements[1].name, "1");
        assert_eq!(adapter.child_expression("values", "1"), "values[1]");
    }

    #[test]
    fn test_evaluate_output() {
        let adapter = GdbAdapter::new();
        assert_eq!(adapter.extract_value(&lines("$1 = 42\n(gdb) ")), "42");
        let err = lines("No symbol \"nope\" in current context.\n(gdb) ");
        assert!(adapter.classifier().find_error(&err).is_some());
        assert_eq!(adapter.parse_breakpoint_number(&lines("Breakpoint 2 at 0x1149: file main.c, line 12.")), Some(2));
    }
}
