#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine_config, Fixture};
use swiftprobe_core::profiler::{ProfilePayload, ProfileStatus, Severity};
use swiftprobe_core::{
    DebugError, DebugSessionRegistry, ProfileConfig, ProfileKind, ProfileTarget, ProfilingSessionController, StepKind,
};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_cpu_profile_ranks_by_cumulative_time() {
    let fixture = Fixture::new();
    let registry = Arc::new(DebugSessionRegistry::new(engine_config()));
    let controller = ProfilingSessionController::new(registry.clone());
    let id = registry.create_session(fixture.request()).await.unwrap().session_id;

    let profile = assert_ok!(controller.start(id, ProfileKind::Cpu, ProfileConfig::default()).await);
    assert_eq!(profile.status, ProfileStatus::Running);

    // 計測中はステップ実行できないため、評価でワークロードを動かす
    assert!(matches!(
        registry.step(id, StepKind::Over, 1).await,
        Err(DebugError::ProfilerConflict { .. })
    ));
    let workload = registry.evaluate(id, "work()", None, None).await.unwrap();
    assert!(!workload.is_error);

    let data = assert_ok!(controller.stop(profile.id).await);
    assert_eq!(data.session.status, ProfileStatus::Stopped);
    assert!(data.session.stopped_at.is_some());

    let ProfilePayload::Cpu { functions } = &data.payload else {
        panic!("CPUの結果ではありません: {:?}", data.payload);
    };
    let slowest = functions.iter().max_by_key(|f| f.cumulative_us).unwrap();
    let top = &data.summary.bottlenecks[0];
    assert_eq!(top.name, slowest.function);
    assert_eq!(top.name, "prog.py:20(main)");
    assert_eq!(top.severity, Severity::High);

    // 停止後はステップ実行できる
    assert_ok!(registry.step(id, StepKind::Over, 1).await);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_cpu_conflicts_with_stepping_but_memory_does_not() {
    let fixture = Fixture::new();
    let registry = Arc::new(DebugSessionRegistry::new(engine_config()));
    let controller = ProfilingSessionController::new(registry.clone());
    let id = registry.create_session(fixture.request()).await.unwrap().session_id;

    // 偽バックエンドの `step` は1秒かかる
    let stepping = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.step(id, StepKind::Into, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = controller
        .start(id, ProfileKind::Cpu, ProfileConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DebugError::ProfilerConflict { .. }));

    let memory = assert_ok!(controller.start(id, ProfileKind::Memory, ProfileConfig::default()).await);
    let state = stepping.await.unwrap().unwrap();
    assert_eq!(state.current_frame.unwrap().function_name, "loop");

    let data = controller.stop(memory.id).await.unwrap();
    let ProfilePayload::Memory { snapshots, leaks } = &data.payload else {
        panic!("メモリの結果ではありません: {:?}", data.payload);
    };
    assert_eq!(snapshots.len(), 2);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].site, "prog.py:7");
    assert_eq!(leaks[0].severity, Severity::Medium);
    assert_eq!(controller.analyze(memory.id).await.unwrap().len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_line_level_is_unsupported_inside_pdb() {
    let fixture = Fixture::new();
    let registry = Arc::new(DebugSessionRegistry::new(engine_config()));
    let controller = ProfilingSessionController::new(registry.clone());
    let id = registry.create_session(fixture.request()).await.unwrap().session_id;

    let err = controller
        .start(id, ProfileKind::LineLevel, ProfileConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DebugError::Unsupported(_)));

    // 失敗した開始は排他スロットを占有しない
    let state = registry.step(id, StepKind::Over, 1).await.unwrap();
    assert!(state.current_frame.is_some());
    registry.shutdown().await;
}

#[tokio::test]
async fn test_separate_process_line_profile() {
    let fixture = Fixture::new();
    let registry = Arc::new(DebugSessionRegistry::new(engine_config()));
    let controller = ProfilingSessionController::new(registry.clone());
    let id = registry.prepare_session(fixture.request()).await.unwrap();

    let config = ProfileConfig {
        target: ProfileTarget::Process {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "for i in 1 2 3; do echo \"@prof line prog.py:4 200000\"; done; echo '@prof line prog.py:9 10'".to_string(),
            ]),
        },
        top_n: Some(1),
        ..ProfileConfig::default()
    };
    let profile = controller.start(id, ProfileKind::LineLevel, config).await.unwrap();
    controller.wait(profile.id).await.unwrap();
    let data = controller.stop(profile.id).await.unwrap();

    let ProfilePayload::LineLevel { lines } = &data.payload else {
        panic!("行単位の結果ではありません: {:?}", data.payload);
    };
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].hits, 3);
    assert_eq!(data.summary.bottlenecks.len(), 1);
    assert_eq!(data.summary.bottlenecks[0].name, "prog.py:4");
    assert_eq!(data.summary.bottlenecks[0].severity, Severity::Medium);

    let listed = controller.list_profiles().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(controller.get_profile(profile.id).await.unwrap().status, ProfileStatus::Stopped);
}
