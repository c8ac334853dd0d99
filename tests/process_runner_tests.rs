//! Process runner behaviour against real child processes

#![cfg(unix)]

use scap_runner::{
    diagnostics::{DiagnosticLevel, DiagnosticsSink},
    process::{CommandSpec, ProcessOutput, ProcessRunner, Termination},
    progress::{Decoded, ProgressParser, RuleResult},
    ScanError,
};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn runner(grace_ms: u64) -> (ProcessRunner, DiagnosticsSink) {
    let sink = DiagnosticsSink::new();
    (ProcessRunner::new(Duration::from_millis(grace_ms), sink.clone()), sink)
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

#[tokio::test]
async fn test_large_output_arrives_in_order() {
    let (runner, _) = runner(500);
    let mut process = runner
        .start(&sh("i=0; while [ $i -lt 2000 ]; do echo \"rule_$i:pass\"; i=$((i+1)); done"))
        .unwrap();

    let mut parser = ProgressParser::new();
    let mut ids = Vec::new();
    while let Some(output) = process.next_output().await {
        if let ProcessOutput::Stdout(bytes) = output {
            for decoded in parser.feed_collect(&bytes).unwrap() {
                if let Decoded::Progress(event) = decoded {
                    assert_eq!(event.result, RuleResult::Pass);
                    ids.push(event.rule_id);
                }
            }
        }
    }

    assert_eq!(ids.len(), 2000);
    assert!(ids.iter().enumerate().all(|(i, id)| *id == format!("rule_{}", i)));
    assert!(parser.finish().is_none());
    assert!(process.wait().await.success());
}

#[tokio::test]
async fn test_stderr_lines_are_separate_from_stdout() {
    let (runner, _) = runner(500);
    let mut process = runner
        .start(&sh("echo 'a:pass'; echo 'W: dangling reference' >&2; echo 'b:fail'"))
        .unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(output) = process.next_output().await {
        match output {
            ProcessOutput::Stdout(bytes) => stdout.extend_from_slice(&bytes),
            ProcessOutput::Stderr(line) => stderr.push(line),
        }
    }

    assert_eq!(stdout, b"a:pass\nb:fail\n");
    assert_eq!(stderr, vec!["W: dangling reference".to_string()]);
}

#[tokio::test]
async fn test_many_waiters_see_the_same_exit() {
    let (runner, _) = runner(500);
    let process = runner.start(&sh("sleep 0.3; exit 2")).unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let control = process.control();
            tokio::spawn(async move { control.wait().await })
        })
        .collect();

    for waiter in waiters {
        let report = waiter.await.unwrap();
        assert_eq!(report.code, Some(2));
        assert_eq!(report.termination, Termination::Exited);
    }
    assert_eq!(process.control().try_exit().and_then(|r| r.code), Some(2));
}

#[tokio::test]
async fn test_cancel_after_exit_is_harmless() {
    let (runner, sink) = runner(500);
    let process = runner.start(&sh("exit 0")).unwrap();
    let report = process.wait().await;

    process.cancel();
    process.cancel();

    assert_eq!(process.wait().await, report);
    assert_eq!(report.termination, Termination::Exited);
    assert_eq!(sink.count(DiagnosticLevel::Warning), 0);
}

#[tokio::test]
async fn test_working_directory_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = runner(500);
    let out = assert_ok!(
        runner
            .output(&sh("pwd -P").current_dir(dir.path()), Duration::from_secs(5))
            .await
    );

    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(out.stdout.trim(), expected.display().to_string());
}

#[tokio::test]
async fn test_start_error_names_the_command() {
    let (runner, _) = runner(500);
    let err = assert_err!(
        runner
            .output(&CommandSpec::new("/nonexistent/oscap").arg("-V"), Duration::from_secs(1))
            .await
    );

    match err {
        ScanError::ProcessStartError { command, .. } => assert!(command.contains("/nonexistent/oscap")),
        other => panic!("unexpected error: {}", other),
    }
}
