//! End-to-end tests driving the shell binary over piped stdin, the same way
//! scripted use does.

use std::io::Write;
use std::process::{Command, Stdio};
use tempfile::tempdir;

fn run_script(data_dir: &std::path::Path, script: &str) -> String {
    let mut child = Command::new(env!("CARGO_BIN_EXE_cli"))
        .env("TIDEPOOL_PATH", data_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cli");

    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(script.as_bytes())
        .expect("write script");

    let output = child.wait_with_output().expect("cli exits");
    assert!(output.status.success(), "cli exited with failure");
    String::from_utf8(output.stdout).expect("utf8 output")
}

#[test]
fn put_get_scan_del_session() {
    let dir = tempdir().unwrap();
    let out = run_script(
        dir.path(),
        "PUT notes n1 {\"title\":\"hello\"}\n\
         GET notes n1\n\
         SCAN notes\n\
         DEL notes n1\n\
         GET notes n1\n\
         EXIT\n",
    );

    assert!(out.contains("OK seq=1"));
    assert!(out.contains("{\"title\":\"hello\"}"));
    assert!(out.contains("(1 documents)"));
    assert!(out.contains("(nil)"));
    assert!(out.contains("bye"));
}

#[test]
fn data_persists_between_sessions() {
    let dir = tempdir().unwrap();
    run_script(dir.path(), "PUT notes n1 42\nEXIT\n");
    let out = run_script(dir.path(), "GET notes n1\nEXIT\n");
    assert!(out.contains("42"));
}

#[test]
fn flush_compact_status_do_not_error() {
    let dir = tempdir().unwrap();
    let out = run_script(
        dir.path(),
        "PUT notes n1 1\nPUT notes n2 2\nFLUSH\nCOMPACT\nSTATUS\nEXIT\n",
    );
    assert!(!out.contains("(error)"), "output: {}", out);
    assert!(out.contains("seq="));
}
