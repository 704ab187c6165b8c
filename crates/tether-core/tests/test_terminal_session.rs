#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;
use tether_common::memory::{duplex, MemoryPeer};
use tether_common::traits::TerminalBackend;
use tether_common::{Frame, Size, TetherError};
use tether_core::{CloseReason, PtyProcess, SessionManager, SessionSummary, ShellConfig, TerminalSession};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn sh() -> ShellConfig {
    ShellConfig::new(Some("/bin/sh".to_string()), Size::new(24, 80))
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

struct Running {
    peer: MemoryPeer,
    pty: Arc<PtyProcess>,
    directory: Arc<SessionManager>,
    handle: JoinHandle<tether_common::Result<SessionSummary>>,
}

fn start_session() -> Running {
    let (conn, peer) = duplex(64);
    let pty = Arc::new(PtyProcess::spawn(&sh()).expect("Failed to spawn shell"));
    let directory = Arc::new(SessionManager::new());

    let backend: Arc<dyn TerminalBackend> = pty.clone();
    let dir = directory.clone();
    let handle = tokio::spawn(async move {
        TerminalSession::attach(conn, Ok(backend), "/bin/sh".to_string(), dir).await
    });

    Running {
        peer,
        pty,
        directory,
        handle,
    }
}

async fn collect_until(peer: &mut MemoryPeer, needle: &str) -> String {
    let mut output = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(200), peer.recv()).await {
            Ok(Some(Frame::Text(text))) => {
                output.push_str(&text);
                if output.contains(needle) {
                    break;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    output
}

async fn finish(handle: JoinHandle<tether_common::Result<SessionSummary>>) -> SessionSummary {
    timeout(Duration::from_secs(10), handle)
        .await
        .expect("Session didn't close in time")
        .expect("Session task panicked")
        .expect("Session returned error")
}

#[tokio::test]
async fn test_echo_over_session() {
    let mut run = start_session();

    run.peer
        .send_text(r#"{"type":"input","data":"echo hi-$((1+1))\n"}"#)
        .await
        .unwrap();
    let output = collect_until(&mut run.peer, "hi-2").await;
    assert!(output.contains("hi-2"), "Output doesn't contain 'hi-2': {}", output);

    run.peer.send(Frame::Close).await.unwrap();
    let summary = finish(run.handle).await;
    assert_eq!(summary.reason, CloseReason::ConnectionClosed);
}

#[tokio::test]
async fn test_resize_over_session() {
    let mut run = start_session();

    run.peer
        .send_text(r#"{"type":"resize","rows":40,"cols":120}"#)
        .await
        .unwrap();
    run.peer
        .send_text(r#"{"type":"input","data":"stty size\n"}"#)
        .await
        .unwrap();
    let output = collect_until(&mut run.peer, "40 120").await;
    assert!(output.contains("40 120"), "stty did not see the new size: {}", output);
    assert_eq!(run.pty.size(), Size::new(40, 120));

    let listed = run.directory.list_sessions().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, Size::new(40, 120));

    run.peer.disconnect();
    finish(run.handle).await;
    assert!(run.directory.is_empty().await);
}

#[tokio::test]
async fn test_shell_exit_closes_connection() {
    let mut run = start_session();
    let pid = run.pty.process_id().unwrap();

    run.peer.send_text("exit\n").await.unwrap();
    let summary = finish(run.handle).await;
    assert_eq!(summary.reason, CloseReason::ProcessExited);
    assert!(run.pty.is_terminated());
    assert!(!process_alive(pid));

    // Whatever output was in flight, the stream ends with a close.
    let mut last = None;
    while let Some(frame) = run.peer.recv().await {
        last = Some(frame);
    }
    assert_eq!(last, Some(Frame::Close));
}

#[tokio::test(flavor = "current_thread")]
async fn test_serve_spawns_shell() {
    let (conn, mut peer) = duplex(64);
    let directory = Arc::new(SessionManager::new());
    let dir = directory.clone();
    let handle = tokio::spawn(async move { TerminalSession::serve(conn, &sh(), dir).await });

    // The single runtime thread keeps serving frames while the shell starts.
    peer.send_text(r#"{"type":"input","data":"echo served-$((2*3))\n"}"#)
        .await
        .unwrap();
    let output = collect_until(&mut peer, "served-6").await;
    assert!(output.contains("served-6"), "Output doesn't contain 'served-6': {}", output);
    assert_eq!(directory.len().await, 1);

    peer.send(Frame::Close).await.unwrap();
    let summary = finish(handle).await;
    assert_eq!(summary.reason, CloseReason::ConnectionClosed);
    assert!(directory.is_empty().await);
}

#[tokio::test]
async fn test_spawn_failure_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ShellConfig::new(
        Some(dir.path().join("missing-shell").display().to_string()),
        Size::default(),
    );
    let (conn, mut peer) = duplex(4);
    let directory = Arc::new(SessionManager::new());

    let result = TerminalSession::serve(conn, &config, directory.clone()).await;
    assert!(matches!(result, Err(TetherError::Spawn(_))));

    match peer.recv().await {
        Some(Frame::Text(text)) => {
            assert!(text.contains(r#""type":"error""#), "{}", text);
            assert!(text.contains("Failed to start terminal"), "{}", text);
        }
        other => panic!("expected error frame, got {:?}", other),
    }
    assert_eq!(peer.recv().await, Some(Frame::Close));
    assert!(directory.is_empty().await);
}

#[tokio::test]
async fn test_no_leaks_across_repeated_sessions() {
    for cycle in 0..100 {
        let mut run = start_session();
        let pid = run.pty.process_id().unwrap();
        assert!(process_alive(pid));

        // Alternate the side that ends the session.
        match cycle % 3 {
            0 => run.peer.send(Frame::Close).await.unwrap(),
            1 => run.peer.disconnect(),
            _ => run.peer.send_text("exit\n").await.unwrap(),
        }

        finish(run.handle).await;
        assert!(run.pty.is_terminated(), "cycle {}: pty not terminated", cycle);
        assert!(!process_alive(pid), "cycle {}: shell {} still running", cycle, pid);
        assert!(run.directory.is_empty().await);

        // A second teardown is a no-op.
        run.pty.terminate().await;
    }
}
