mod common;

use std::sync::Arc;

use common::*;
use sandbox_explorer::testing::RecordingSurface;
use sandbox_explorer::{
    InputOutcome, RuntimeError, SandboxError, TerminalSession, TerminalSize, TerminalState,
};

async fn open(test: &TestExplorer, id: &str) -> (TerminalSession, Arc<RecordingSurface>) {
    let surface = RecordingSurface::new();
    let terminal = test
        .explorer
        .open_terminal(Some(id), surface.clone(), TerminalSize::new(120, 40))
        .await
        .expect("open terminal");
    (terminal, surface)
}

#[tokio::test]
async fn dead_pty_is_recreated_and_input_resent_once() {
    let test = TestExplorer::connected(&["S1", "S2"]).await;
    let sandbox = test.sandbox("S2");
    let (terminal, surface) = open(&test, "S2").await;

    let old_pid = terminal.pid().expect("pty");
    assert_eq!(
        terminal.handle_input("echo hi\r").await.expect("input"),
        InputOutcome::Delivered
    );
    sandbox.kill_process(old_pid);

    assert_eq!(
        terminal.handle_input("ls\r").await.expect("input"),
        InputOutcome::Resent
    );

    let new_pid = terminal.pid().expect("new pty");
    assert_ne!(old_pid, new_pid);
    assert_eq!(sandbox.pty_size(new_pid), Some(TerminalSize::new(120, 40)));
    assert_eq!(sandbox.pty_inputs(new_pid), vec![b"ls\r".to_vec()]);
    assert_eq!(sandbox.pty_inputs(old_pid), vec![b"echo hi\r".to_vec()]);
    assert_eq!(terminal.state(), TerminalState::Running);

    let output = surface.output();
    let warning = output.find("reconnecting").expect("warning shown");
    let notice = output.find("Reconnected").expect("success notice shown");
    assert!(warning < notice);
    assert_eq!(surface.exit_code(), None);
    assert_eq!(test.sandbox("S1").pty_count(), 0);
}

#[tokio::test]
async fn input_during_reconnect_is_dropped() {
    let test = TestExplorer::connected(&["S2"]).await;
    let sandbox = test.sandbox("S2");
    let (terminal, _surface) = open(&test, "S2").await;
    let old_pid = terminal.pid().expect("pty");
    sandbox.kill_process(old_pid);
    sandbox.hold_pty_creation();

    let reconnecting = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.handle_input("first\r").await }
    });
    wait_until("reconnect to start", || {
        terminal.state() == TerminalState::Reconnecting
    })
    .await;

    assert_eq!(
        terminal.handle_input("second\r").await.expect("input"),
        InputOutcome::Dropped
    );

    sandbox.release_pty_creation();
    let outcome = reconnecting.await.expect("join").expect("reconnect");
    assert_eq!(outcome, InputOutcome::Resent);

    assert_eq!(sandbox.pty_count(), 2);
    let new_pid = terminal.pid().expect("new pty");
    assert_eq!(sandbox.pty_inputs(new_pid), vec![b"first\r".to_vec()]);
}

#[tokio::test]
async fn rapid_inputs_trigger_a_single_reconnect() {
    let test = TestExplorer::connected(&["S2"]).await;
    let sandbox = test.sandbox("S2");
    let (terminal, _surface) = open(&test, "S2").await;
    sandbox.kill_process(terminal.pid().expect("pty"));
    sandbox.hold_pty_creation();

    let first = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.handle_input("a").await }
    });
    let second = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.handle_input("b").await }
    });
    wait_until("reconnect to start", || {
        terminal.state() == TerminalState::Reconnecting
    })
    .await;
    sandbox.release_pty_creation();

    let mut outcomes = vec![
        first.await.expect("join").expect("first"),
        second.await.expect("join").expect("second"),
    ];
    outcomes.sort_by_key(|outcome| *outcome != InputOutcome::Resent);
    assert_eq!(outcomes, vec![InputOutcome::Resent, InputOutcome::Dropped]);

    assert_eq!(sandbox.pty_count(), 2);
    let inputs = sandbox.pty_inputs(terminal.pid().expect("new pty"));
    assert_eq!(inputs.len(), 1);
}

#[tokio::test]
async fn input_in_flight_during_reconnect_follows_the_new_pty() {
    let test = TestExplorer::connected(&["S2"]).await;
    let sandbox = test.sandbox("S2");
    let (terminal, surface) = open(&test, "S2").await;
    let old_pid = terminal.pid().expect("pty");
    sandbox.kill_process(old_pid);
    let release = sandbox.hold_next_pty_input();

    let late = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.handle_input("b").await }
    });
    wait_until("input to stall", || sandbox.held_pty_inputs() == 1).await;

    assert_eq!(
        terminal.handle_input("a").await.expect("input"),
        InputOutcome::Resent
    );
    let new_pid = terminal.pid().expect("new pty");

    release.notify_one();
    assert_eq!(
        late.await.expect("join").expect("late input"),
        InputOutcome::Resent
    );

    assert_eq!(sandbox.pty_count(), 2);
    assert_eq!(sandbox.live_pty_pids(), vec![new_pid]);
    assert_eq!(terminal.pid(), Some(new_pid));
    assert_eq!(
        sandbox.pty_inputs(new_pid),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
    assert_eq!(surface.output().matches("reconnecting").count(), 1);
}

#[tokio::test]
async fn failed_reconnect_closes_the_terminal() {
    let test = TestExplorer::connected(&["S2"]).await;
    let sandbox = test.sandbox("S2");
    let surface = RecordingSurface::new();
    let terminal = test
        .explorer
        .open_terminal(None, surface.clone(), TerminalSize::default())
        .await
        .expect("open on the only sandbox");
    sandbox.kill_process(terminal.pid().expect("pty"));
    sandbox.fail("create_pty", RuntimeError::other("sandbox was stopped"));

    let err = terminal.handle_input("ls\r").await.expect_err("reconnect fails");
    assert!(matches!(err, SandboxError::RemoteOperation { .. }));
    assert_eq!(terminal.state(), TerminalState::Closed);
    assert_eq!(surface.exit_code(), Some(1));
    assert!(surface.output().contains("sandbox was stopped"));

    assert_eq!(
        terminal.handle_input("ls\r").await.expect("closed"),
        InputOutcome::Dropped
    );
}

#[tokio::test]
async fn opening_on_a_disconnected_sandbox_closes_immediately() {
    let test = TestExplorer::connected(&["S1"]).await;
    let surface = RecordingSurface::new();
    let err = test
        .explorer
        .open_terminal(Some("S9"), surface.clone(), TerminalSize::default())
        .await
        .err()
        .expect("not connected");

    assert!(matches!(err, SandboxError::NotConnected { .. }));
    assert_eq!(surface.exit_code(), Some(1));
    assert!(surface.output().contains("not connected"));
    assert!(test.explorer.terminals("S9").is_empty());
}

#[tokio::test]
async fn terminal_without_id_needs_a_single_sandbox() {
    let test = TestExplorer::connected(&["S1", "S2"]).await;
    let err = test
        .explorer
        .open_terminal(None, RecordingSurface::new(), TerminalSize::default())
        .await
        .err()
        .expect("ambiguous");
    assert!(matches!(err, SandboxError::InvalidRequest { .. }));
}

#[tokio::test]
async fn disconnect_closes_open_terminals() {
    let test = TestExplorer::connected(&["S1", "S2"]).await;
    let (first, first_surface) = open(&test, "S1").await;
    let (_second, _) = open(&test, "S1").await;
    let (other, other_surface) = open(&test, "S2").await;
    assert_eq!(test.explorer.terminals("S1").len(), 2);

    test.explorer.disconnect(Some("S1")).await;

    assert_eq!(first.state(), TerminalState::Closed);
    assert_eq!(first_surface.exit_code(), Some(0));
    assert!(test.sandbox("S1").live_pty_pids().is_empty());
    assert!(test.explorer.terminals("S1").is_empty());

    assert_eq!(other.state(), TerminalState::Running);
    assert_eq!(other_surface.exit_code(), None);
    assert_eq!(test.explorer.terminals("S2").len(), 1);
}

#[tokio::test]
async fn output_reaches_the_surface() {
    let test = TestExplorer::connected(&["S1"]).await;
    let sandbox = test.sandbox("S1");
    let (terminal, surface) = open(&test, "S1").await;
    let pid = terminal.pid().expect("pty");

    assert!(sandbox.emit_pty_output(pid, "naïve\r\n".as_bytes()).await);
    wait_until("output", || surface.output().contains("naïve")).await;
}
