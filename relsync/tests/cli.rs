use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::{create_dir_all, write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes a config for a local-directory store rooted next to the config file.
fn create_local_config(workspace: &Path) -> PathBuf {
    let config = workspace.join("relsync.yaml");
    write(
        &config,
        "backend:\n  kind: local\n  root: store\nchannel: stable\nprefix: myapp\nretries: 1\n",
    )
    .expect("Writing temp config failed");
    config
}

/// Lays out what the packaging step produces for one release.
fn create_release_dir(workspace: &Path, version: &str) -> PathBuf {
    let dir = workspace.join(format!("out-{version}"));
    create_dir_all(&dir).unwrap();
    let file_name = format!("App-{version}-full.nupkg");
    write(dir.join(&file_name), format!("package {version}")).unwrap();
    write(
        dir.join("releases.stable.json"),
        format!(
            r#"{{"Assets":[{{"PackageId":"App","Version":"{version}","Type":"Full","FileName":"{file_name}"}}]}}"#
        ),
    )
    .unwrap();
    dir
}

fn relsync() -> Command {
    let mut cmd = Command::cargo_bin("relsync").expect("Binary exists");
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn help_lists_subcommands() {
    relsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("publish")
                .and(predicate::str::contains("download"))
                .and(predicate::str::contains("check"))
                .and(predicate::str::contains("list")),
        );
}

#[test]
fn publish_list_check_and_download_against_local_store() {
    let workspace = TempDir::new().unwrap();
    let config = create_local_config(workspace.path());

    relsync()
        .args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No releases published"));

    for version in ["1.0.0", "1.1.0"] {
        let release_dir = create_release_dir(workspace.path(), version);
        relsync()
            .args(["publish", "--config"])
            .arg(&config)
            .arg("--release-dir")
            .arg(&release_dir)
            .assert()
            .success()
            .stdout(predicate::str::contains("Published 1 asset(s)"));
    }
    assert!(workspace
        .path()
        .join("store/myapp/releases.stable.json")
        .exists());

    relsync()
        .args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("App-1.0.0-full.nupkg")
                .and(predicate::str::contains("App-1.1.0-full.nupkg")),
        );

    relsync()
        .args(["check", "--current-version", "1.0.0", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Update available: 1.1.0"));

    relsync()
        .args(["check", "--current-version", "1.1.0", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Up to date"));

    let dest = workspace.path().join("downloads");
    relsync()
        .args(["download", "--config"])
        .arg(&config)
        .arg("--dest")
        .arg(&dest)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(dest.join("App-1.1.0-full.nupkg")).unwrap(),
        "package 1.1.0"
    );

    relsync()
        .args(["download", "--version", "1.0.0", "--config"])
        .arg(&config)
        .arg("--dest")
        .arg(&dest)
        .assert()
        .success();
    assert!(dest.join("App-1.0.0-full.nupkg").exists());
}

#[test]
fn keep_max_releases_flag_prunes_old_packages() {
    let workspace = TempDir::new().unwrap();
    let config = create_local_config(workspace.path());

    for version in ["1.0.0", "2.0.0"] {
        let release_dir = create_release_dir(workspace.path(), version);
        relsync()
            .args(["publish", "--keep-max-releases", "1", "--config"])
            .arg(&config)
            .arg("--release-dir")
            .arg(&release_dir)
            .assert()
            .success();
    }

    let store = workspace.path().join("store/myapp");
    assert!(!store.join("App-1.0.0-full.nupkg").exists());
    assert!(store.join("App-2.0.0-full.nupkg").exists());
    relsync()
        .args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("App-1.0.0-full.nupkg").not());
}

#[test]
fn channel_flag_selects_another_feed() {
    let workspace = TempDir::new().unwrap();
    let config = create_local_config(workspace.path());
    let release_dir = create_release_dir(workspace.path(), "1.0.0");

    // the release dir only carries the stable feed
    relsync()
        .args(["publish", "--channel", "beta", "--config"])
        .arg(&config)
        .arg("--release-dir")
        .arg(&release_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("releases.beta.json"));

    relsync()
        .args(["list", "--channel", "../escape", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid channel name"));
}

#[test]
fn missing_config_fails_with_diagnostic() {
    relsync()
        .args(["list", "--config", "definitely-not-here.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        use std::fmt::Write as FmtWrite;
        let mut msg = String::new();
        let _ = write!(&mut msg, "{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use relsync::cli::{run, Cli, Commands, Target};

    // A missing config is fine; only the first event matters here.
    let cli = Cli {
        command: Commands::List {
            target: Target {
                config: PathBuf::from("dummy.yaml"),
                channel: None,
            },
        },
    };

    let _ = run(cli).await;

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
