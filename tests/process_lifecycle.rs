//! End-to-end runs of a fake server script through ServerProcess.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proton_core::notify::{NotificationSink, Notifier, NotifyConfig, ServerEvent};
use proton_core::process::{ProcessError, ProcessOptions, ServerProcess, ServerStatus};
use proton_core::registry::{ServerDefinition, ServerType};
use proton_core::runtime::RuntimeResolver;

/// Behaves like a vanilla server: prints the done marker, echoes commands,
/// fakes joins/leaves and exits on `stop`.
const FAKE_SERVER: &str = r#"#!/bin/sh
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server version 1.20.1"
echo "[12:00:00] [Server thread/WARN]: running without a real JVM" >&2
echo "[12:00:01] [Server thread/INFO]: Done (1.234s)! For help, type \"help\""
while read -r line; do
  case "$line" in
    stop)
      echo "[12:00:09] [Server thread/INFO]: Stopping the server"
      exit 0
      ;;
    join\ *)
      echo "[12:00:02] [Server thread/INFO]: ${line#join } joined the game"
      ;;
    leave\ *)
      echo "[12:00:03] [Server thread/INFO]: ${line#leave } left the game"
      ;;
    *)
      echo "[12:00:04] [Server thread/INFO]: echo: $line"
      ;;
  esac
done
"#;

struct FixedRuntime(PathBuf);

#[async_trait]
impl RuntimeResolver for FixedRuntime {
    async fn resolve(&self, _game_version: Option<&str>) -> anyhow::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: &ServerEvent, _config: &NotifyConfig) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn server(base: &Path, script: Option<&str>, notifier: Notifier) -> Arc<ServerProcess> {
    let data_dir = base.join("survival");
    std::fs::create_dir_all(&data_dir).unwrap();
    if let Some(script) = script {
        std::fs::write(data_dir.join("run.sh"), script).unwrap();
    }
    let definition = ServerDefinition {
        name: "survival".into(),
        server_type: ServerType::Fabric,
        game_version: Some("1.20.1".into()),
        server_location: data_dir,
        backup_location: base.join("backups").join("survival"),
        notify: None,
    };
    ServerProcess::new(
        definition,
        notifier,
        Arc::new(FixedRuntime(base.to_path_buf())),
        ProcessOptions {
            output_join_timeout: Duration::from_secs(2),
            ..ProcessOptions::default()
        },
    )
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn console_has(proc: &ServerProcess, needle: &str) -> bool {
    proc.console().iter().any(|l| l.contains(needle))
}

#[tokio::test]
async fn test_full_run_and_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let proc = server(tmp.path(), Some(FAKE_SERVER), Notifier::disabled());

    assert!(proc.run_command("say too early").is_err());
    assert!(proc.start().await.unwrap());
    assert!(!proc.start().await.unwrap(), "second start must be a no-op");
    assert!(proc.pid().is_some());

    assert!(wait_until(|| proc.is_operational()).await);
    assert_eq!(proc.status(), ServerStatus::Running);
    // stderr is merged into the same console
    assert!(wait_until(|| console_has(&proc, "running without a real JVM")).await);
    let head = proc.console();
    assert!(head[0].contains("Starting minecraft server"));
    assert!(head[1].contains("running without a real JVM"));
    assert!(head[2].starts_with("[12:00:01] [Server thread/INFO]: Done"));

    proc.run_command("join Steve").unwrap();
    proc.run_command("join Alex").unwrap();
    assert!(wait_until(|| proc.players() == vec!["Alex", "Steve"]).await);
    proc.run_command("leave Steve").unwrap();
    assert!(wait_until(|| proc.players() == vec!["Alex"]).await);

    for i in 1..=5 {
        proc.run_command(&format!("say {}", i)).unwrap();
    }
    assert!(wait_until(|| console_has(&proc, "echo: say 5")).await);
    let echoes: Vec<String> = proc
        .console()
        .into_iter()
        .filter(|l| l.contains("echo: say"))
        .collect();
    let expected: Vec<String> = (1..=5)
        .map(|i| format!("[12:00:04] [Server thread/INFO]: echo: say {}", i))
        .collect();
    assert_eq!(echoes, expected);

    assert!(proc.stop());
    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();
    assert!(wait_until(|| proc.status() == ServerStatus::Stopped).await);
    assert!(proc.players().is_empty());
    assert!(proc.run_command("say after stop").is_err());
    assert!(!proc.stop());
    // history survives until the next run
    assert!(console_has(&proc, "Stopping the server"));

    assert!(proc.start().await.unwrap());
    assert!(!console_has(&proc, "echo: say 1"), "console must be cleared on restart");
    assert!(wait_until(|| proc.is_operational()).await);
    assert!(proc.stop());
    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_events_reach_sink_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let proc = server(tmp.path(), Some(FAKE_SERVER), Notifier::spawn(sink.clone(), None));

    proc.start().await.unwrap();
    assert!(wait_until(|| proc.is_operational()).await);
    proc.run_command("join Steve").unwrap();
    assert!(wait_until(|| !proc.players().is_empty()).await);
    proc.stop();
    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();

    let stopped = ServerEvent::ServerStopped { server: "survival".into() };
    assert!(wait_until(|| sink.events.lock().unwrap().last() == Some(&stopped)).await);
    let events = sink.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ServerEvent::ServerStarting { server: "survival".into() },
            ServerEvent::ServerStarted { server: "survival".into() },
            ServerEvent::PlayerJoin { server: "survival".into(), player: "Steve".into() },
            stopped,
        ]
    );
}

#[tokio::test]
async fn test_missing_launch_script_fails_start() {
    let tmp = tempfile::tempdir().unwrap();
    let proc = server(tmp.path(), None, Notifier::disabled());

    let err = proc.start().await.unwrap_err();
    assert!(matches!(err, ProcessError::LaunchScriptMissing(_)));
    assert_eq!(err.error_code(), "LAUNCH_SCRIPT_MISSING");
    assert_eq!(proc.status(), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_process_exiting_on_its_own() {
    let tmp = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\necho \"[12:00:00] [Server thread/INFO]: Alex joined the game\"\necho \"crash from 192.168.1.20\"\nexit 1\n";
    let proc = server(tmp.path(), Some(script), Notifier::disabled());

    proc.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();
    assert!(wait_until(|| proc.status() == ServerStatus::Stopped).await);

    // roster cleared on exit, never reached operational
    assert!(proc.players().is_empty());
    assert!(!proc.is_operational());
    let console = proc.console();
    assert_eq!(console.len(), 2);
    assert_eq!(console[1], "crash from ***.***.***.***");
}

#[tokio::test]
async fn test_stderr_lines_keep_emission_order() {
    let tmp = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\ni=0\nwhile [ $i -lt 50 ]; do\n  if [ $((i % 2)) -eq 1 ]; then echo \"L$i\" >&2; else echo \"L$i\"; fi\n  i=$((i + 1))\ndone\n";
    let proc = server(tmp.path(), Some(script), Notifier::disabled());

    proc.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();

    let expected: Vec<String> = (0..50).map(|i| format!("L{}", i)).collect();
    assert_eq!(proc.console(), expected);
}

#[tokio::test]
async fn test_closed_stdin_does_not_end_supervision() {
    let tmp = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\nexec 0<&-\necho \"[12:00:01] [Server thread/INFO]: Done (0.1s)! For help, type \\\"help\\\"\"\ni=0\nwhile [ $i -lt 30 ]; do\n  sleep 0.05\n  echo \"tick $i\"\n  i=$((i + 1))\ndone\n";
    let proc = server(tmp.path(), Some(script), Notifier::disabled());

    proc.start().await.unwrap();
    assert!(wait_until(|| proc.is_operational()).await);

    // the write fails with a broken pipe inside the supervisor
    proc.run_command("say anyone there?").unwrap();
    let seen = proc.console().len();
    assert!(wait_until(|| proc.console().len() > seen + 3).await);
    assert!(proc.is_running());

    tokio::time::timeout(Duration::from_secs(10), proc.wait_for_exit())
        .await
        .unwrap();
    assert!(console_has(&proc, "tick 29"));
    assert!(!console_has(&proc, "anyone there"));
}
