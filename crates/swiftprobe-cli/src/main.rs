/*
 * SwiftProbe - コマンドラインデバッガー
 *
 * デバッグセッションを対話的に操作する `launch` と、
 * 対象を別プロセスで計測して結果をまとめる `profile` を提供します。
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use env_logger::Builder;
use log::{debug, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use swiftprobe_core::profiler::{ProfilePayload, Severity};
use swiftprobe_core::{
    BackendKind, BreakpointRequest, DebugConfiguration, DebugError, DebugSessionRegistry, DebugState, EngineConfig,
    ProfileConfig, ProfileData, ProfileKind, ProfileTarget, ProfilingSessionController, SessionId, SessionRequest,
    StepKind, StopReason, VariableScope,
};

/// SwiftProbe のコマンドライン引数
#[derive(Parser, Debug)]
#[clap(author, version, about = "外部デバッガーを操作するデバッグ・プロファイリングツール")]
struct Cli {
    /// 詳細なログ出力を有効にする
    #[clap(short, long, global = true)]
    verbose: bool,

    /// ログ出力を抑制する
    #[clap(short, long, global = true)]
    quiet: bool,

    /// エンジン設定ファイル（TOML）
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// 結果をJSONで出力する
    #[clap(long, global = true)]
    json: bool,

    /// サブコマンド
    #[clap(subcommand)]
    command: Commands,
}

/// SwiftProbe のサブコマンド
#[derive(Subcommand, Debug)]
enum Commands {
    /// プログラムをデバッガー配下で起動し、対話的に操作する
    Launch {
        /// デバッグ対象のファイル
        #[clap(required = true)]
        target: PathBuf,

        #[clap(flatten)]
        backend: BackendArgs,

        /// 起動前に設定するブレークポイント（file:line[:ignore]）
        #[clap(long = "break", value_name = "LOCATION")]
        breakpoints: Vec<String>,

        /// プログラム引数
        #[clap(last = true)]
        args: Vec<String>,
    },

    /// プログラムを別プロセスで実行して計測する
    Profile {
        /// 計測対象のファイル
        #[clap(required = true)]
        target: PathBuf,

        /// プロファイラーの種類（cpu, memory, call-graph, line-level）
        #[clap(short, long, default_value = "cpu")]
        kind: String,

        #[clap(flatten)]
        backend: BackendArgs,

        /// 報告するボトルネック数
        #[clap(long)]
        top: Option<usize>,

        /// プロファイラー実行コマンドの上書き（空白区切り）
        #[clap(long, value_name = "COMMAND")]
        profiler_command: Option<String>,

        /// プログラム引数
        #[clap(last = true)]
        args: Vec<String>,
    },
}

/// バックエンド関連の共通オプション
#[derive(clap::Args, Debug)]
struct BackendArgs {
    /// バックエンドデバッガー（pdb, gdb）
    #[clap(short, long, default_value = "pdb")]
    backend: String,

    /// 対象の言語
    #[clap(long)]
    language: Option<String>,

    /// 作業ディレクトリ
    #[clap(long)]
    cwd: Option<PathBuf>,

    /// バックエンド起動コマンドの上書き（空白区切り）
    #[clap(long, value_name = "COMMAND")]
    backend_command: Option<String>,
}

impl BackendArgs {
    fn configuration(&self, target: &Path, args: &[String]) -> Result<DebugConfiguration> {
        let backend: BackendKind = self.backend.parse()?;
        let language = self.language.clone().unwrap_or_else(|| match backend {
            BackendKind::Pdb => "python".to_string(),
            BackendKind::Gdb => "c".to_string(),
        });

        let mut config = DebugConfiguration::new(target, language, backend);
        config.working_dir = self.cwd.clone();
        config.args = args.to_vec();
        config.backend_command = self.backend_command.as_deref().map(split_command);
        Ok(config)
    }
}

/// デバッガーのメイン関数
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ログレベルの設定
    setup_logging(cli.verbose, cli.quiet);

    let engine = load_engine_config(cli.config.as_deref())?;
    debug!("エンジン設定: {:?}", engine);

    match cli.command {
        Commands::Launch {
            target,
            backend,
            breakpoints,
            args,
        } => {
            let config = backend.configuration(&target, &args)?;
            launch_program(engine, config, &breakpoints, cli.json).await
        }
        Commands::Profile {
            target,
            kind,
            backend,
            top,
            profiler_command,
            args,
        } => {
            let kind: ProfileKind = kind.parse()?;
            let config = backend.configuration(&target, &args)?;
            let profile = ProfileConfig {
                target: ProfileTarget::Process {
                    command: profiler_command.as_deref().map(split_command),
                },
                top_n: top,
                ..ProfileConfig::default()
            };
            profile_program(engine, config, kind, profile, cli.json).await
        }
    }
}

/// ロギングの設定
fn setup_logging(verbose: bool, quiet: bool) {
    let mut builder = Builder::new();

    let level = if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    builder.filter_level(level);
    builder.format_timestamp_secs();
    builder.init();
}

/// 明示されたファイル、環境変数、デフォルトの順に設定を読み込む
fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("設定ファイルの読み込みに失敗: {}", path.display())),
        None => EngineConfig::from_env().context("環境変数の設定ファイルの読み込みに失敗"),
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

/// `file:line` または `file:line:ignore` を解析する
fn parse_breakpoint(location: &str) -> Result<BreakpointRequest> {
    let invalid = || anyhow!("ブレークポイントの形式が不正です（file:line[:ignore]）: {}", location);

    let (rest, last) = location.rsplit_once(':').ok_or_else(invalid)?;
    let last: u32 = last.parse().map_err(|_| invalid())?;

    if let Some((file, line)) = rest.rsplit_once(':') {
        if let Ok(line) = line.parse::<usize>() {
            if file.is_empty() {
                return Err(invalid());
            }
            return Ok(BreakpointRequest::line(file, line).with_ignore_count(last));
        }
    }
    if rest.is_empty() {
        return Err(invalid());
    }
    Ok(BreakpointRequest::line(rest, last as usize))
}

/// プログラムを起動してデバッグする
async fn launch_program(
    engine: EngineConfig,
    config: DebugConfiguration,
    breakpoints: &[String],
    json: bool,
) -> Result<()> {
    info!("デバッグ対象プログラムを起動: {}", config.target.display());

    let mut request = SessionRequest::from(config);
    for location in breakpoints {
        request.breakpoints.push(parse_breakpoint(location)?);
    }

    let registry = DebugSessionRegistry::new(engine);
    let state = registry
        .create_session(request)
        .await
        .context("デバッグセッションの開始に失敗")?;
    let id = state.session_id;

    if !json {
        println!("{}", "== デバッグセッション開始 ==".green());
    }
    print_state(&state, json)?;

    let result = command_loop(&registry, id, json).await;

    registry.shutdown().await;
    if !json {
        println!("{}", "== デバッグセッション終了 ==".green());
    }
    result
}

/// 標準入力からコマンドを読み、セッションに送る
async fn command_loop(registry: &DebugSessionRegistry, id: SessionId, json: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        if !json {
            let prompt = "(c/n/s/o/r, p <式>, w <式>, bt, vars, x <id>, b <file:line>, d <id>, q) > ".yellow();
            stdout.write_all(prompt.to_string().as_bytes()).await?;
            stdout.flush().await?;
        }

        let Some(input) = lines.next_line().await? else {
            break;
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let (command, argument) = match input.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, argument.trim()),
            None => (input, ""),
        };
        if command == "q" || command == "quit" {
            break;
        }

        match run_command(registry, id, command, argument, json).await {
            Ok(true) => {}
            Ok(false) => println!("不明なコマンドです: {}", command),
            Err(err) => {
                eprintln!("{} {:#}", "エラー:".red(), err);
                if matches!(err.downcast_ref::<DebugError>(), Some(e) if e.is_fatal()) {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

/// 1行分のコマンドを実行する（不明なコマンドなら `false`）
async fn run_command(
    registry: &DebugSessionRegistry,
    id: SessionId,
    command: &str,
    argument: &str,
    json: bool,
) -> Result<bool> {
    match command {
        "c" | "n" | "s" | "o" | "r" => {
            let kind: StepKind = command.parse()?;
            let count = if argument.is_empty() {
                1
            } else {
                argument.parse().with_context(|| format!("回数が不正です: {}", argument))?
            };
            let state = registry.step(id, kind, count).await?;
            print_state(&state, json)?;
        }
        "p" => {
            let result = registry.evaluate(id, argument, None, None).await?;
            if json {
                println!("{}", serde_json::to_string(&result)?);
            } else if result.is_error {
                println!("{}", result.error_message.unwrap_or(result.result).red());
            } else {
                println!("{} {}", result.result, format!("({})", result.type_name).dimmed());
            }
        }
        "w" => {
            let watch = registry.add_watch(id, argument, None).await?;
            println!("ウォッチ #{} を追加しました: {}", watch.id, watch.expression);
        }
        "bt" => {
            let frames = registry.get_call_stack(id).await?;
            if json {
                println!("{}", serde_json::to_string(&frames)?);
            } else {
                println!("{}", "== スタックトレース ==".cyan());
                for frame in &frames {
                    let marker = if frame.is_current { ">" } else { " " };
                    println!(
                        "{}#{} {} ({}:{})",
                        marker,
                        frame.level,
                        frame.function_name,
                        frame.file_path.display(),
                        frame.line
                    );
                }
            }
        }
        "vars" => {
            let scope = if argument.is_empty() {
                VariableScope::Local
            } else {
                argument.parse()?
            };
            let variables = registry.get_variables(id, scope).await?;
            print_variables(&variables, json)?;
        }
        "x" => {
            let variable_id = argument
                .parse()
                .with_context(|| format!("変数IDが不正です: {}", argument))?;
            let children = registry.expand_variable(id, variable_id).await?;
            print_variables(&children, json)?;
        }
        "b" => {
            let request = parse_breakpoint(argument)?;
            let breakpoint = registry.set_breakpoint(id, &request).await?;
            println!(
                "ブレークポイント #{} を設定しました: {}:{}{}",
                breakpoint.id,
                breakpoint.file_path.display(),
                breakpoint.line,
                if breakpoint.verified { "" } else { " (未確認)" }
            );
        }
        "d" => {
            let breakpoint_id = argument
                .parse()
                .with_context(|| format!("ブレークポイントIDが不正です: {}", argument))?;
            if registry.remove_breakpoint(id, breakpoint_id).await? {
                println!("ブレークポイント #{} を削除しました", breakpoint_id);
            } else {
                warn!("ブレークポイント #{} は存在しません", breakpoint_id);
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// 状態変更後のスナップショットを表示
fn print_state(state: &DebugState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(state)?);
        return Ok(());
    }

    for line in &state.output {
        println!("{}", line);
    }

    match &state.stop_reason {
        Some(StopReason::Exited { exit_code }) => {
            let code = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "不明".to_string());
            println!("{}", format!("プログラムが終了しました: 終了コード={}", code).yellow());
            return Ok(());
        }
        Some(reason) => println!("停止しました: {:?}", reason),
        None => println!("状態: {:?}", state.status),
    }

    if let Some(frame) = &state.current_frame {
        println!("{} {} ({}:{})", "->".green(), frame.function_name, frame.file_path.display(), frame.line);
        if let Err(err) = show_source_with_location(&frame.file_path, frame.line, 2) {
            debug!("ソースを表示できません: {}", err);
        }
    }
    Ok(())
}

fn print_variables(variables: &[swiftprobe_core::Variable], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(variables)?);
        return Ok(());
    }
    for variable in variables {
        let expand = if variable.has_children { "+" } else { " " };
        println!(
            "{}[{}] {}: {} = {}",
            expand,
            variable.id,
            variable.name.bold(),
            variable.type_name.dimmed(),
            variable.value
        );
    }
    Ok(())
}

/// 現在行の前後を表示
fn show_source_with_location(source_path: &Path, current_line: usize, context_lines: usize) -> Result<()> {
    let source = fs::read_to_string(source_path)
        .with_context(|| format!("ソースファイルの読み込みに失敗: {}", source_path.display()))?;

    let lines: Vec<&str> = source.lines().collect();
    if current_line == 0 || current_line > lines.len() {
        return Ok(());
    }
    let start_line = current_line.saturating_sub(context_lines + 1);
    let end_line = std::cmp::min(current_line + context_lines, lines.len());

    for (i, line) in lines[start_line..end_line].iter().enumerate() {
        let line_num = start_line + i + 1;
        if line_num == current_line {
            println!("{} {}", format!("{:4}▶", line_num).green().bold(), line);
        } else {
            println!("{} {}", format!("{:4} ", line_num).dimmed(), line);
        }
    }
    Ok(())
}

/// 対象を別プロセスで実行して計測する
async fn profile_program(
    engine: EngineConfig,
    config: DebugConfiguration,
    kind: ProfileKind,
    profile: ProfileConfig,
    json: bool,
) -> Result<()> {
    info!("{:?} プロファイリングを開始: {}", kind, config.target.display());

    let registry = Arc::new(DebugSessionRegistry::new(engine));
    let controller = ProfilingSessionController::new(registry.clone());

    let id = registry
        .prepare_session(SessionRequest::from(config))
        .await
        .context("プロファイリング対象の準備に失敗")?;
    let session = controller.start(id, kind, profile).await?;
    // 対象が最後まで実行されてから集計する
    controller.wait(session.id).await?;
    let data = controller.stop(session.id).await?;
    registry.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_profile(&data);
    }
    Ok(())
}

fn print_profile(data: &ProfileData) {
    println!(
        "{}",
        format!("== {:?} プロファイル ({:?}) ==", data.session.kind, data.session.status).cyan()
    );

    match &data.payload {
        ProfilePayload::Cpu { functions } => println!("関数: {}", functions.len()),
        ProfilePayload::LineLevel { lines } => println!("行: {}", lines.len()),
        ProfilePayload::Memory { snapshots, leaks } => {
            println!("スナップショット: {}, リーク候補: {}", snapshots.len(), leaks.len())
        }
        ProfilePayload::CallGraph { nodes, most_called, .. } => {
            println!("ノード: {}", nodes.len());
            if let Some(function) = most_called {
                println!("最多呼び出し: {}", function);
            }
        }
    }

    for (name, value) in &data.summary.metrics {
        println!("  {}: {}", name, value);
    }

    if !data.summary.bottlenecks.is_empty() {
        println!("{}", "== ボトルネック ==".cyan());
    }
    for bottleneck in &data.summary.bottlenecks {
        let label = match bottleneck.severity {
            Severity::High => "HIGH".red().bold(),
            Severity::Medium => "MEDIUM".yellow(),
            Severity::Low => "LOW".normal(),
        };
        println!("[{}] {} - {}", label, bottleneck.name, bottleneck.description);
    }

    for recommendation in &data.summary.recommendations {
        println!("{} {}: {}", "*".green(), recommendation.target, recommendation.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_breakpoint_forms() {
        let plain = parse_breakpoint("prog.py:10").unwrap();
        assert_eq!(plain.file_path, PathBuf::from("prog.py"));
        assert_eq!(plain.line, 10);
        assert_eq!(plain.ignore_count, None);

        let ignored = parse_breakpoint("src/prog.py:10:2").unwrap();
        assert_eq!(ignored.file_path, PathBuf::from("src/prog.py"));
        assert_eq!(ignored.line, 10);
        assert_eq!(ignored.ignore_count, Some(2));

        assert!(parse_breakpoint("prog.py").is_err());
        assert!(parse_breakpoint(":10").is_err());
        assert!(parse_breakpoint("prog.py:ten").is_err());
    }

    #[test]
    fn test_backend_configuration() {
        let args = BackendArgs {
            backend: "gdb".to_string(),
            language: None,
            cwd: None,
            backend_command: Some("gdb-multiarch --nx".to_string()),
        };
        let config = args.configuration(Path::new("a.out"), &["x".to_string()]).unwrap();
        assert_eq!(config.backend, BackendKind::Gdb);
        assert_eq!(config.language, "c");
        assert_eq!(config.args, vec!["x"]);
        assert_eq!(
            config.backend_command,
            Some(vec!["gdb-multiarch".to_string(), "--nx".to_string()])
        );

        let unknown = BackendArgs {
            backend: "lldb".to_string(),
            language: None,
            cwd: None,
            backend_command: None,
        };
        assert!(unknown.configuration(Path::new("a.out"), &[]).is_err());
    }
}
