//! Shared fixtures for in-crate tests.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use axum::Router;
use shared_types::Notification;

use crate::bridge::Notifier;
use crate::config::Config;

/// Stand-in for the light node. The first argument picks the behaviour.
const FAKE_NODE: &str = r#"#!/bin/sh
PATH=/usr/bin:/bin
case "$1" in
  ready) printf 'ready\n'; exec sleep 30 ;;
  silent) exec sleep 30 ;;
  fail) echo boom >&2; exit 3 ;;
  exit0) exit 0 ;;
  orphan) sleep 4 & exit 0 ;;
  term) kill -TERM $$; sleep 5 ;;
  env)
    printf 'HOME=%s NODE_HOME=%s MANIFEST=%s\n' "$HOME" "$NODE_HOME" "${CARGO_MANIFEST_DIR-unset}"
    exit 0 ;;
  echo) shift; printf '%s' "$*"; exit 0 ;;
  light)
    case "$2" in
      init)
        printf 'NAME: my_celes_key\nADDRESS: celestia1fake0address\nMNEMONIC (save this somewhere safe!!!): \nabandon ability able about\n'
        exit 0 ;;
      start)
        if [ -e "$NODE_HOME/uninstall-on-start" ]; then rm -f "$NODE_HOME/celestia"; fi
        printf 'node started on %s\n' "$6"; exec sleep 30 ;;
      auth) printf 'token-%s' "$5"; exit 0 ;;
    esac ;;
  rpc)
    case "$2" in
      broken) printf 'not json'; exit 0 ;;
      *) printf '{"jsonrpc":"2.0","id":1,"result":"%s.%s"}' "$2" "$3"; exit 0 ;;
    esac ;;
esac
echo "unknown command: $*" >&2
exit 1
"#;

pub fn test_config(dir: &Path) -> Config {
    Config {
        port: 0,
        install_home: dir.join("install"),
        home_dir: dir.join("home"),
        binary_name: "celestia".to_string(),
        release_base_url: "http://127.0.0.1:9".to_string(),
        install_home_env_var: "NODE_HOME".to_string(),
        pid_announce_interval: Duration::from_millis(50),
        download_timeout: Duration::from_secs(30),
        default_network: "mocha-4".to_string(),
    }
}

/// Link the fake node into `config`'s install path.
///
/// The script is written once per test binary and symlinked, so no test
/// execs a file another thread is still writing.
#[cfg(unix)]
pub fn install_fake_node(config: &Config) {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    let script = SCRIPT.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("node-host-fake-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fake-node.sh");
        std::fs::write(&path, FAKE_NODE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    });

    std::fs::create_dir_all(&config.install_home).unwrap();
    std::os::unix::fs::symlink(script, config.binary_path()).unwrap();
}

/// Serve `router` on an ephemeral loopback port; returns the base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}
