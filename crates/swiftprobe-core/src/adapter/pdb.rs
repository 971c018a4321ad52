/*
 * SwiftProbe - Python pdb アダプター
 *
 * 変数の列挙には `!` 文で1行1変数の `@var` 形式を出力させ、型カテゴリは型名から決めます。
 * プロファイリングは cProfile / tracemalloc をセッション内で有効化し、`@prof` 行で回収します。
 */

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{
    parse_prof_line, strip_prompts, BackendAdapter, ErrorClassifier, Introspectable, ProfileEvent, RawFrame,
    ReportedValue, StopEvent,
};
use crate::protocol::{
    BackendKind, Breakpoint, BreakpointKind, DebugConfiguration, ProfileKind, StepKind, TypeCategory, VariableScope,
};

const PROMPT: &str = "(Pdb) ";
const VAR_TAG: &str = "@var";
const DEFAULT_INTERPRETER: &str = "python3";

/// 値を1行ずつ出力するPython式の断片
const PRINT_VAR: &str = "print('@var', __n, type(__v).__name__, \
len(__v) if hasattr(type(__v), '__len__') else '-', repr(__v)[:500], sep='\\t')";

/// pstatsのキーを空白なしの関数名に整形するPython式
const FORMAT_KEY: &str = "(lambda k: ('%s:%d(%s)' % (__import__('os').path.basename(k[0]), k[1], k[2])).replace(' ', '_'))";

static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^> (.+)\((\d+)\)(.*)\(\)").expect("location pattern"));
static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[> ] (.+)\((\d+)\)(.*)\(\)\s*$").expect("frame pattern"));
static BREAKPOINT_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Breakpoint (\d+) at ").expect("breakpoint pattern"));
static EXIT_STATUS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Exit status: (-?\d+)").expect("exit pattern"));
static CPROFILE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)(?:/\d+)?\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+(.+)$").expect("cprofile pattern")
});

/// pdbとPythonのエラー出力
static PYTHON_ERRORS: LazyLock<ErrorClassifier> = LazyLock::new(|| {
    ErrorClassifier::new([
        r"^\*\*\* ",
        r"^Traceback \(most recent call last\)",
        r"^[A-Za-z_][\w.]*(Error|Exception): ",
    ])
});

#[derive(Debug, Clone)]
pub struct PdbAdapter {
    classifier: ErrorClassifier,
}

impl Default for PdbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PdbAdapter {
    pub fn new() -> Self {
        Self::with_classifier(PYTHON_ERRORS.clone())
    }

    /// エラー判定パターンを差し替えて作成する
    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self { classifier }
    }

    fn interpreter(config: &DebugConfiguration) -> PathBuf {
        config
            .backend_command
            .as_ref()
            .and_then(|cmd| cmd.first())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETER))
    }

    fn category_of(type_name: &str) -> TypeCategory {
        match type_name {
            "" => TypeCategory::Unknown,
            "int" | "float" | "complex" | "bool" | "str" | "bytes" | "bytearray" | "NoneType" | "Decimal" => {
                TypeCategory::Primitive
            }
            "list" | "tuple" | "dict" | "set" | "frozenset" | "deque" | "OrderedDict" | "defaultdict"
            | "Counter" | "range" | "dict_keys" | "dict_values" | "dict_items" => TypeCategory::Collection,
            "function" | "builtin_function_or_method" | "method" | "method-wrapper" | "partial"
            | "wrapper_descriptor" | "classmethod" | "staticmethod" => TypeCategory::Function,
            "type" | "ABCMeta" | "EnumMeta" | "EnumType" => TypeCategory::Class,
            "module" => TypeCategory::Module,
            _ => TypeCategory::Object,
        }
    }

    fn is_internal_frame(path: &str) -> bool {
        path.starts_with('<') || path.ends_with("bdb.py") || path.ends_with("pdb.py")
    }

    fn for_each_var(source: &str) -> String {
        format!("!for __n, __v in {}: {}", source, PRINT_VAR)
    }
}

impl Introspectable for PdbAdapter {
    fn scope_command(&self, scope: VariableScope) -> Option<String> {
        let source = match scope {
            VariableScope::Local => "list(locals().items())",
            VariableScope::Global => "list(globals().items())",
            VariableScope::Instance => {
                "list((vars(self) if 'self' in dir() and hasattr(self, '__dict__') else {}).items())"
            }
            VariableScope::Watch => return None,
        };
        Some(Self::for_each_var(source))
    }

    fn children_command(&self, expression: &str, limit: usize) -> Option<String> {
        let source = format!(
            "__import__('itertools').islice((lambda __o: [(repr(k), v) for k, v in __o.items()] \
if isinstance(__o, dict) else list(enumerate(__o)) if isinstance(__o, (list, tuple, set, frozenset)) \
else list(vars(__o).items()) if hasattr(__o, '__dict__') else [])({}), {})",
            expression.replace('\n', " "),
            limit
        );
        Some(Self::for_each_var(&source))
    }

    fn child_expression(&self, parent: &str, child: &str) -> String {
        let first = child.chars().next().unwrap_or('_');
        if first.is_ascii_digit() || first == '\'' || first == '"' || first == '-' {
            format!("{}[{}]", parent, child)
        } else {
            format!("{}.{}", parent, child)
        }
    }

    fn parse_values(&self, lines: &[String]) -> Vec<ReportedValue> {
        lines
            .iter()
            .filter_map(|line| {
                let start = line.find(VAR_TAG)?;
                let mut fields = line[start..].splitn(5, '\t');
                if fields.next()? != VAR_TAG {
                    return None;
                }
                let name = fields.next()?.to_string();
                let type_name = fields.next()?.to_string();
                let size = fields.next()?.parse::<usize>().ok();
                let value = fields.next().unwrap_or_default().to_string();
                if name.starts_with("__") {
                    return None;
                }
                Some(ReportedValue {
                    category: Self::category_of(&type_name),
                    name,
                    value,
                    type_name,
                    size,
                })
            })
            .collect()
    }

    fn categorize(&self, type_name: &str, _value: &str) -> TypeCategory {
        Self::category_of(type_name)
    }
}

impl BackendAdapter for PdbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Pdb
    }

    fn launch_command(&self, config: &DebugConfiguration) -> (PathBuf, Vec<String>) {
        let (program, mut args) = match &config.backend_command {
            Some(cmd) if !cmd.is_empty() => (PathBuf::from(&cmd[0]), cmd[1..].to_vec()),
            _ => (
                PathBuf::from(DEFAULT_INTERPRETER),
                vec!["-u".to_string(), "-m".to_string(), "pdb".to_string()],
            ),
        };
        args.push(config.target.to_string_lossy().into_owned());
        args.extend(config.args.iter().cloned());
        (program, args)
    }

    fn profiler_command(&self, kind: ProfileKind, config: &DebugConfiguration) -> Option<(PathBuf, Vec<String>)> {
        let mut args = vec!["-u".to_string()];
        if kind == ProfileKind::Cpu {
            args.extend(["-m", "cProfile", "-s", "cumulative"].map(String::from));
        }
        if kind == ProfileKind::Memory {
            args.extend(["-X", "tracemalloc"].map(String::from));
        }
        args.push(config.target.to_string_lossy().into_owned());
        args.extend(config.args.iter().cloned());
        Some((Self::interpreter(config), args))
    }

    fn prompts(&self) -> Vec<String> {
        vec![PROMPT.to_string()]
    }

    fn set_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String> {
        let location = format!("{}:{}", breakpoint.file_path.display(), breakpoint.line);
        match breakpoint.kind {
            BreakpointKind::Line => Some(format!("break {}", location)),
            BreakpointKind::Conditional => Some(format!(
                "break {}, {}",
                location,
                breakpoint.condition.as_deref().unwrap_or("True")
            )),
            BreakpointKind::Function => breakpoint.function_name.as_ref().map(|f| format!("break {}", f)),
            BreakpointKind::Exception => None,
        }
    }

    fn clear_breakpoint_command(&self, breakpoint: &Breakpoint) -> Option<String> {
        match (breakpoint.backend_id, breakpoint.kind) {
            (Some(number), _) => Some(format!("clear {}", number)),
            (None, BreakpointKind::Line | BreakpointKind::Conditional) => Some(format!(
                "clear {}:{}",
                breakpoint.file_path.display(),
                breakpoint.line
            )),
            _ => None,
        }
    }

    fn parse_breakpoint_number(&self, lines: &[String]) -> Option<usize> {
        lines
            .iter()
            .find_map(|line| BREAKPOINT_NUMBER.captures(line))
            .and_then(|caps| caps[1].parse().ok())
    }

    fn step_command(&self, kind: StepKind, _started: bool) -> Option<String> {
        let command = match kind {
            StepKind::Over => "next",
            StepKind::Into => "step",
            StepKind::Out => "return",
            StepKind::Continue => "continue",
            StepKind::Restart => "restart",
            // 実行中のpdbは標準入力から割り込めない
            StepKind::Pause => return None,
        };
        Some(command.to_string())
    }

    fn stack_command(&self) -> String {
        "where".to_string()
    }

    fn parse_stack(&self, lines: &[String]) -> Vec<RawFrame> {
        let mut frames: Vec<RawFrame> = strip_prompts(self, lines)
            .iter()
            .filter_map(|line| FRAME.captures(line))
            .filter(|caps| !Self::is_internal_frame(&caps[1]))
            .filter_map(|caps| {
                Some(RawFrame {
                    function_name: caps[3].to_string(),
                    file_path: PathBuf::from(&caps[1]),
                    line: caps[2].parse().ok()?,
                    is_current: caps[0].starts_with('>'),
                })
            })
            .collect();
        // pdbは外側から順に出力する
        frames.reverse();
        frames
    }

    fn parse_stop(&self, lines: &[String]) -> Option<StopEvent> {
        if let Some(line) = lines
            .iter()
            .find(|l| l.contains("The program finished") || l.contains("The program exited via sys.exit()"))
        {
            let exit_code = EXIT_STATUS
                .captures(line)
                .and_then(|caps| caps[1].parse().ok())
                .or(Some(0));
            return Some(StopEvent::Exited { exit_code });
        }

        if let Some(pos) = lines.iter().position(|l| l.contains("Uncaught exception")) {
            let description = lines[..pos]
                .iter()
                .rev()
                .map(|l| l.trim())
                .find(|l| !l.is_empty() && !l.starts_with("Traceback") && !l.starts_with("File "))
                .unwrap_or("uncaught exception")
                .to_string();
            return Some(StopEvent::Exception { description });
        }

        lines
            .iter()
            .rev()
            .filter_map(|line| {
                let text = line.trim_start_matches(PROMPT);
                LOCATION.captures(text)
            })
            .find_map(|caps| {
                Some(StopEvent::Location {
                    file_path: PathBuf::from(&caps[1]),
                    line: caps[2].parse().ok()?,
                    function_name: Some(caps[3].to_string()).filter(|f| !f.is_empty()),
                })
            })
    }

    fn evaluate_command(&self, expression: &str) -> String {
        format!("p {}", expression.replace('\n', " "))
    }

    fn select_frame_commands(&self, level: usize) -> (Vec<String>, Vec<String>) {
        if level == 0 {
            return (Vec::new(), Vec::new());
        }
        (vec![format!("up {}", level)], vec![format!("down {}", level)])
    }

    fn extract_value(&self, lines: &[String]) -> String {
        strip_prompts(self, lines)
            .into_iter()
            .filter(|l| !l.starts_with("[stderr] "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    fn quit_command(&self) -> Option<String> {
        Some("quit".to_string())
    }

    fn profile_start_commands(&self, kind: ProfileKind) -> Option<Vec<String>> {
        let command = match kind {
            ProfileKind::Cpu => {
                "!import builtins, cProfile; builtins.__swp_prof = cProfile.Profile(); builtins.__swp_prof.enable()"
            }
            ProfileKind::CallGraph => {
                "!import builtins, cProfile; builtins.__swp_cg = cProfile.Profile(); builtins.__swp_cg.enable()"
            }
            ProfileKind::Memory => "!import tracemalloc; tracemalloc.start()",
            // 行単位の計測はpdb自身のトレース関数と衝突する
            ProfileKind::LineLevel => return None,
        };
        Some(vec![command.to_string()])
    }

    fn profile_stop_commands(&self, kind: ProfileKind) -> Option<Vec<String>> {
        match kind {
            ProfileKind::Cpu => Some(vec![
                "!__swp_prof.disable()".to_string(),
                format!(
                    "![print('@prof', 'stat', {fmt}(k), v[1], int(v[3] * 1e6)) for k, v in __import__('pstats').Stats(__swp_prof).stats.items()]",
                    fmt = FORMAT_KEY
                ),
            ]),
            ProfileKind::CallGraph => Some(vec![
                "!__swp_cg.disable()".to_string(),
                format!(
                    "![print('@prof', 'edge', {fmt}(c), {fmt}(k), cv[1], int(cv[3] * 1e6)) for k, v in __import__('pstats').Stats(__swp_cg).stats.items() for c, cv in v[4].items()]",
                    fmt = FORMAT_KEY
                ),
            ]),
            ProfileKind::Memory => Some(vec!["!__import__('tracemalloc').stop()".to_string()]),
            ProfileKind::LineLevel => None,
        }
    }

    fn heap_snapshot_command(&self, snapshot: u64) -> Option<String> {
        Some(format!(
            "![print('@prof', 'heap', {}, '%s:%d' % (__import__('os').path.basename(s.traceback[0].filename), s.traceback[0].lineno), s.size) for s in __import__('tracemalloc').take_snapshot().statistics('lineno')[:100]]",
            snapshot
        ))
    }

    fn parse_profile_line(&self, line: &str) -> Option<ProfileEvent> {
        if let Some(event) = parse_prof_line(line) {
            return Some(event);
        }
        // cProfile / pstats の表形式
        let caps = CPROFILE_ROW.captures(line)?;
        let cumulative: f64 = caps[4].parse().ok()?;
        Some(ProfileEvent::FunctionStats {
            function: caps[6].trim().replace(' ', "_"),
            calls: caps[1].parse().ok()?,
            cumulative: Duration::from_secs_f64(cumulative.max(0.0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BreakpointStatus, SessionId};

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    #[test]
    fn test_launch_command_default_and_override() {
        let adapter = PdbAdapter::new();
        let mut config = DebugConfiguration::new("app.py", "python", BackendKind::Pdb);
        config.args = vec!["--fast".to_string()];

        let (program, args) = adapter.launch_command(&config);
        assert_eq!(program, PathBuf::from("python3"));
        assert_eq!(args, vec!["-u", "-m", "pdb", "app.py", "--fast"]);

        config.backend_command = Some(vec!["sh".to_string(), "fake.sh".to_string()]);
        let (program, args) = adapter.launch_command(&config);
        assert_eq!(program, PathBuf::from("sh"));
        assert_eq!(args, vec!["fake.sh", "app.py", "--fast"]);
    }

    #[test]
    fn test_parse_location_stop() {
        let adapter = PdbAdapter::new();
        let output = lines("> /tmp/app.py(10)loop()\n-> total += i\n(Pdb) ");
        assert_eq!(
            adapter.parse_stop(&output),
            Some(StopEvent::Location {
                file_path: PathBuf::from("/tmp/app.py"),
                line: 10,
                function_name: Some("loop".to_string()),
            })
        );
    }

    #[test]
    fn test_custom_classifier_keeps_shared_patterns() {
        let custom = PdbAdapter::with_classifier(ErrorClassifier::new(["^FAIL"]));
        let output = lines("> /tmp/app.py(3)main()\n-> run()\n(Pdb) ");
        assert_eq!(custom.parse_stop(&output), PdbAdapter::new().parse_stop(&output));
        assert_eq!(custom.parse_breakpoint_number(&lines("Breakpoint 4 at /tmp/app.py:3")), Some(4));

        assert!(custom.classifier().find_error(&lines("FAIL here")).is_some());
        assert!(custom.classifier().find_error(&lines("*** NameError: x")).is_none());
        assert!(PdbAdapter::new().classifier().find_error(&lines("*** NameError: x")).is_some());
    }

    #[test]
    fn test_parse_exit_and_exception() {
        let adapter = PdbAdapter::new();
        let finished = lines("The program finished and will be restarted\n> /tmp/app.py(1)<module>()\n(Pdb) ");
        assert_eq!(adapter.parse_stop(&finished), Some(StopEvent::Exited { exit_code: Some(0) }));

        let exited = lines("The program exited via sys.exit(). Exit status: 3\n(Pdb) ");
        assert_eq!(adapter.parse_stop(&exited), Some(StopEvent::Exited { exit_code: Some(3) }));

        let crashed = lines(
            "Traceback (most recent call last):\n  File \"/tmp/app.py\", line 3, in <module>\nZeroDivisionError: division by zero\nUncaught exception. Entering post mortem debugging\n> /tmp/app.py(3)<module>()\n(Pdb) ",
        );
        assert_eq!(
            adapter.parse_stop(&crashed),
            Some(StopEvent::Exception {
                description: "ZeroDivisionError: division by zero".to_string()
            })
        );
        assert_eq!(adapter.parse_stop(&lines("(Pdb) ")), None);
    }

    #[test]
    fn test_parse_stack_innermost_first() {
        let adapter = PdbAdapter::new();
        let output = lines(
            "  /usr/lib/python3.11/bdb.py(600)run()\n-> exec(cmd, globals, locals)\n  <string>(1)<module>()\n  /tmp/app.py(12)<module>()\n-> main()\n> /tmp/app.py(5)main()\n-> x = compute()\n(Pdb) ",
        );
        let frames = adapter.parse_stack(&output);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function_name, "main");
        assert_eq!(frames[0].line, 5);
        assert!(frames[0].is_current);
        assert_eq!(frames[1].function_name, "<module>");
        assert!(!frames[1].is_current);
    }

    #[test]
    fn test_parse_values() {
        let adapter = PdbAdapter::new();
        let output = vec![
            "@var\tcount\tint\t-\t3".to_string(),
            "@var\titems\tlist\t12\t[1, 2, 3]".to_string(),
            "@var\t__n\tstr\t1\t'x'".to_string(),
            "@var\tos\tmodule\t-\t<module 'os'>".to_string(),
            "@var\tPoint\ttype\t-\t<class 'Point'>".to_string(),
            "noise".to_string(),
        ];
        let values = adapter.parse_values(&output);
        assert_eq!(values.len(), 4);
        assert_eq!(values[0].category, TypeCategory::Primitive);
        assert_eq!(values[1].category, TypeCategory::Collection);
        assert_eq!(values[1].size, Some(12));
        assert_eq!(values[2].category, TypeCategory::Module);
        assert_eq!(values[3].category, TypeCategory::Class);
    }

    #[test]
    fn test_breakpoint_commands() {
        let adapter = PdbAdapter::new();
        let mut bp = Breakpoint {
            id: 1,
            session_id: SessionId(1),
            kind: BreakpointKind::Conditional,
            status: BreakpointStatus::Enabled,
            file_path: PathBuf::from("app.py"),
            line: 10,
            function_name: None,
            condition: Some("i > 3".to_string()),
            ignore_count: 0,
            hit_count: 0,
            last_hit: None,
            backend_id: None,
            verified: false,
        };
        assert_eq!(adapter.set_breakpoint_command(&bp).unwrap(), "break app.py:10, i > 3");
        assert_eq!(adapter.clear_breakpoint_command(&bp).unwrap(), "clear app.py:10");
        bp.backend_id = Some(4);
        assert_eq!(adapter.clear_breakpoint_command(&bp).unwrap(), "clear 4");

        bp.kind = BreakpointKind::Exception;
        assert!(adapter.set_breakpoint_command(&bp).is_none());

        let reply = lines("Breakpoint 4 at /tmp/app.py:10\n(Pdb) ");
        assert_eq!(adapter.parse_breakpoint_number(&reply), Some(4));
    }

    #[test]
    fn test_child_expression() {
        let adapter = PdbAdapter::new();
        assert_eq!(adapter.child_expression("items", "0"), "items[0]");
        assert_eq!(adapter.child_expression("cfg", "'name'"), "cfg['name']");
        assert_eq!(adapter.child_expression("point", "x"), "point.x");
    }

    #[test]
    fn test_evaluation_classification() {
        let adapter = PdbAdapter::new();
        let err = lines("*** NameError: name 'undefined_name' is not defined\n(Pdb) ");
        assert!(adapter.classifier().find_error(&err).is_some());
        let ok = lines("2\n(Pdb) ");
        assert!(adapter.classifier().find_error(&ok).is_none());
        assert_eq!(adapter.extract_value(&ok), "2");
    }

    #[test]
    fn test_cprofile_rows() {
        let adapter = PdbAdapter::new();
        let row = "        3    0.000    0.000    1.503    0.501 app.py:4(work)";
        assert_eq!(
            adapter.parse_profile_line(row),
            Some(ProfileEvent::FunctionStats {
                function: "app.py:4(work)".to_string(),
                calls: 3,
                cumulative: Duration::from_secs_f64(1.503),
            })
        );
        let recursive = "      4/1    0.000    0.000    0.010    0.010 {built-in method builtins.exec}";
        assert!(matches!(
            adapter.parse_profile_line(recursive),
            Some(ProfileEvent::FunctionStats { calls: 4, .. })
        ));
        assert!(adapter.parse_profile_line("   ncalls  tottime  percall  cumtime  percall filename:lineno(function)").is_none());
    }
}
