use std::path::{Path, PathBuf};
use std::time::Duration;

use hotplug_core::{Action, DaemonConfig, Device, FileDeviceDb, Terminal};
use hotplug_daemon::paths::{db_root, socket_path};
use hotplug_daemon::{
    monitor, request_ping, request_set_paused, request_settle, request_status, request_stop,
    request_trigger, run, send_request, DaemonError, DaemonRequest,
};
use tempfile::TempDir;

/// Run a blocking client call off the runtime threads.
async fn client<T, F>(home: &Path, call: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> Result<T, DaemonError> + Send + 'static,
{
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || call(home))
        .await
        .expect("client thread")
}

async fn wait_for_socket(home: &Path) {
    let socket = socket_path(home);
    for _ in 0..200 {
        if socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket never appeared at {}", socket.display());
}

fn config() -> DaemonConfig {
    DaemonConfig {
        children_max: 2,
        shutdown_timeout_secs: 1,
        ..DaemonConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_settle_status_and_stop_over_the_socket() {
    let home = TempDir::new().expect("home");
    let daemon = tokio::spawn(run(home.path().to_path_buf(), config(), false));
    wait_for_socket(home.path()).await;

    client(home.path(), |home| request_ping(&home))
        .await
        .expect("ping");

    let device = Device::new("/devices/virtual/block/loop0", Action::Add, "block")
        .with_tag("systemd")
        .with_property("ID_FS_TYPE", "ext4");
    client(home.path(), move |home| request_trigger(&home, device))
        .await
        .expect("trigger");
    client(home.path(), |home| {
        request_settle(&home, Some(Duration::from_secs(5)))
    })
    .await
    .expect("settle");

    let status = client(home.path(), |home| request_status(&home))
        .await
        .expect("status");
    assert_eq!(status["running"], serde_json::json!(true));
    assert_eq!(status["engine"]["workers"], serde_json::json!(2));
    assert_eq!(status["engine"]["stats"]["received"], serde_json::json!(1));
    assert_eq!(status["engine"]["queued"], serde_json::json!(0));

    client(home.path(), |home| request_stop(&home))
        .await
        .expect("stop");
    daemon.await.expect("daemon task").expect("daemon result");

    let db = FileDeviceDb::new(db_root(home.path()));
    let record = db
        .load(&"/devices/virtual/block/loop0".into())
        .expect("load")
        .expect("record persisted");
    assert_eq!(record.terminal, Terminal::Succeeded);
    assert_eq!(db.tagged("systemd").expect("tags").len(), 1);
    assert!(!socket_path(home.path()).exists(), "socket removed on exit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_resume_and_unknown_commands() {
    let home = TempDir::new().expect("home");
    let daemon = tokio::spawn(run(home.path().to_path_buf(), config(), false));
    wait_for_socket(home.path()).await;

    let paused = client(home.path(), |home| request_set_paused(&home, true))
        .await
        .expect("pause");
    assert!(paused);
    client(home.path(), |home| {
        request_trigger(&home, Device::new("/devices/a", Action::Change, "x"))
    })
    .await
    .expect("trigger");

    let err = client(home.path(), |home| {
        request_settle(&home, Some(Duration::from_millis(200)))
    })
    .await
    .expect_err("paused queue cannot settle");
    assert!(err.to_string().contains("did not settle"));

    let resumed = client(home.path(), |home| request_set_paused(&home, false))
        .await
        .expect("resume");
    assert!(!resumed);
    client(home.path(), |home| request_settle(&home, None))
        .await
        .expect("settle after resume");

    let response = client(home.path(), |home| {
        send_request(&home, &DaemonRequest::command("reboot"))
    })
    .await
    .expect("response");
    assert!(!response.ok);
    assert!(response.error.unwrap_or_default().contains("unknown command"));

    let response = client(home.path(), |home| {
        send_request(&home, &DaemonRequest::command("trigger"))
    })
    .await
    .expect("response");
    assert!(!response.ok, "trigger without a device is rejected");

    let err = client(home.path(), |home| {
        request_trigger(
            &home,
            Device::new("/devices/b", Action::Add, "x").with_tag("../../outside"),
        )
    })
    .await
    .expect_err("tag outside the tag index is rejected");
    assert!(err.to_string().contains("invalid tag"), "got: {err}");

    client(home.path(), |home| request_stop(&home))
        .await
        .expect("stop");
    daemon.await.expect("daemon task").expect("daemon result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitor_receives_finalized_devices() {
    let home = TempDir::new().expect("home");
    let daemon = tokio::spawn(run(home.path().to_path_buf(), config(), false));
    wait_for_socket(home.path()).await;

    let watcher = {
        let home = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut seen = Vec::new();
            monitor(&home, |device| {
                seen.push(device);
                false
            })
            .map(|()| seen)
        })
    };

    // The subscription exists once the status reports a monitor.
    for _ in 0..200 {
        let status = client(home.path(), |home| request_status(&home))
            .await
            .expect("status");
        if status["monitors"] == serde_json::json!(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client(home.path(), |home| {
        request_trigger(&home, Device::new("/devices/virtual/net/lo", Action::Add, "net"))
    })
    .await
    .expect("trigger");

    let seen = watcher.await.expect("monitor thread").expect("monitor");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].devpath.as_str(), "/devices/virtual/net/lo");

    client(home.path(), |home| request_stop(&home))
        .await
        .expect("stop");
    daemon.await.expect("daemon task").expect("daemon result");
}
