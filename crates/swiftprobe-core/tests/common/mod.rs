// 結合テスト用のpdb風バックエンド
//
// Pythonなしでセッションの流れを確認するため、pdbのテキスト形式を真似るshスクリプトを使う。
// 10行目で3回停止したあとプログラムが終了する。
// FAKE_PDB_MODE=nested では next が10行目の inner() に入り、crash では step でバックエンドが落ちる。

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use swiftprobe_core::{BackendKind, BreakpointRequest, DebugConfiguration, EngineConfig, SessionRequest};
use tempfile::TempDir;

pub const LOOP_LINE: usize = 10;

const FAKE_PDB: &str = r#"
target="$1"
hits=0
bp=0
location() {
  printf '> %s(%s)%s()\n-> %s\n' "$target" "$1" "$2" "$3"
}
location 1 '<module>' 'import time'
printf '(Pdb) '
while IFS= read -r line; do
  case "$line" in
    "break "*)
      bp=$((bp + 1))
      loc="${line#break }"
      echo "Breakpoint $bp at ${loc%%,*}"
      ;;
    "clear "*)
      echo "Deleted breakpoint ${line#clear }"
      ;;
    continue)
      if [ "$hits" -lt 3 ]; then
        hits=$((hits + 1))
        echo "tick $hits"
        location 10 loop 'total += i'
      else
        echo "The program finished and will be restarted"
        location 1 '<module>' 'import time'
      fi
      ;;
    next)
      if [ "$FAKE_PDB_MODE" = nested ]; then
        location 10 inner 'x = 1'
      else
        location 11 loop 'i += 1'
      fi
      ;;
    step)
      if [ "$FAKE_PDB_MODE" = crash ]; then
        exit 3
      fi
      sleep 1
      location 5 work 'return 42'
      ;;
    return)
      if [ "$FAKE_PDB_MODE" = nested ]; then
        location 11 loop 'i += 1'
      else
        location 20 main 'loop()'
      fi
      ;;
    restart)
      hits=0
      echo "Restarting $target with arguments:"
      location 1 '<module>' 'import time'
      ;;
    where)
      printf '  /usr/lib/python3/bdb.py(580)run()\n-> exec(cmd)\n'
      printf '  %s(1)<module>()\n-> main()\n' "$target"
      printf '  %s(20)main()\n-> loop()\n' "$target"
      location 10 loop 'total += i'
      ;;
    up*)
      location 20 main 'loop()'
      ;;
    down*)
      location 10 loop 'total += i'
      ;;
    *"'stat'"*)
      echo "@prof stat prog.py:20(main) 1 1500000"
      echo "@prof stat prog.py:5(work) 3 1200000"
      echo "@prof stat prog.py:9(helper) 30 50000"
      ;;
    *"'heap'"*)
      n=$(echo "$line" | sed "s/.*'heap', \([0-9]*\),.*/\1/")
      echo "@prof heap $n prog.py:7 $(( (n + 1) * 2097152 ))"
      echo "@prof heap $n prog.py:3 1024"
      ;;
    *islice*)
      i=0
      while [ "$i" -lt 15 ]; do
        printf '@var\t%s\tint\t-\t%s\n' "$i" "$i"
        i=$((i + 1))
      done
      ;;
    '!for '*)
      printf '@var\ttotal\tint\t-\t%s\n' "$hits"
      printf '@var\titems\tlist\t15\t[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]\n'
      printf '@var\t__builtins__\tdict\t150\t{...}\n'
      ;;
    '!'*)
      ;;
    "p 1+1")
      echo 2
      ;;
    "p total")
      echo "$hits"
      ;;
    "p work()")
      sleep 0.2
      echo None
      ;;
    p*)
      echo "*** NameError: name '${line#p }' is not defined"
      ;;
    quit)
      exit 0
      ;;
  esac
  printf '(Pdb) '
done
"#;

/// 偽バックエンドとデバッグ対象を置いた作業ディレクトリ
pub struct Fixture {
    pub dir: TempDir,
    pub script: PathBuf,
    pub target: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_pdb.sh");
        fs::write(&script, FAKE_PDB).unwrap();
        let target = dir.path().join("prog.py");
        fs::write(&target, "import time\n").unwrap();
        Self { dir, script, target }
    }

    pub fn config(&self) -> DebugConfiguration {
        let mut config = DebugConfiguration::new(&self.target, "python", BackendKind::Pdb);
        config.backend_command = Some(vec!["sh".to_string(), self.script.to_string_lossy().into_owned()]);
        config
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest::from(self.config())
    }

    /// 偽バックエンドの振る舞いを切り替えたリクエスト
    pub fn request_with_mode(&self, mode: &str) -> SessionRequest {
        let mut config = self.config();
        config.env.insert("FAKE_PDB_MODE".to_string(), mode.to_string());
        SessionRequest::from(config)
    }

    pub fn loop_breakpoint(&self) -> BreakpointRequest {
        BreakpointRequest::line(&self.target, LOOP_LINE)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// テスト向けに待ち時間を短くした設定
pub fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.command_timeout_ms = 5_000;
    config.session.shutdown_grace_ms = 500;
    config.profiler.snapshot_interval_ms = 60_000;
    config.profiler.flush_timeout_ms = 5_000;
    config
}

/// プロセスが存在するか（`kill -0`）
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
