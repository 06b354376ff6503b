use std::io::Write;
use std::process::Command;

fn quill() -> Command {
    Command::new(env!("CARGO_BIN_EXE_quill"))
}

fn script(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write temp script");
    file
}

#[test]
fn runs_a_script_and_prints_to_stdout() {
    let file = script("print 1 + 2 * 3;");
    let out = quill().arg(file.path()).output().expect("failed to run quill");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "7\n");
}

#[test]
fn compile_error_exits_65_and_reports_on_stderr() {
    let file = script("let a;");
    let out = quill().arg(file.path()).output().expect("failed to run quill");
    assert_eq!(out.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("[line 1]"), "stderr: {stderr}");
    assert!(stderr.contains("initializer"), "stderr: {stderr}");
}

#[test]
fn every_compile_error_is_reported() {
    let file = script("var = 1;\nvar = 2;\n");
    let out = quill().arg(file.path()).output().expect("failed to run quill");
    assert_eq!(out.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("[line 1]"), "stderr: {stderr}");
    assert!(stderr.contains("[line 2]"), "stderr: {stderr}");
}

#[test]
fn runtime_error_exits_70_with_backtrace() {
    let file = script("fun f() { return 1 + \"one\"; }\nf();\n");
    let out = quill().arg(file.path()).output().expect("failed to run quill");
    assert_eq!(out.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("two numbers or two strings"), "stderr: {stderr}");
    assert!(stderr.contains("in f"), "stderr: {stderr}");
    assert!(stderr.contains("in script"), "stderr: {stderr}");
}

#[test]
fn failed_assertion_exits_70() {
    let file = script("assert 1 > 2;");
    let out = quill().arg(file.path()).output().expect("failed to run quill");
    assert_eq!(out.status.code(), Some(70));
    assert!(String::from_utf8_lossy(&out.stderr).contains("assertion failed"));
}

#[test]
fn missing_file_exits_74() {
    let out = quill()
        .arg("definitely/not/a/real/path.quill")
        .output()
        .expect("failed to run quill");
    assert_eq!(out.status.code(), Some(74));
    assert!(String::from_utf8_lossy(&out.stderr).contains("could not read"));
}

#[test]
fn bad_flag_exits_64() {
    let out = quill().arg("--no-such-flag").output().expect("failed to run quill");
    assert_eq!(out.status.code(), Some(64));
}

#[test]
fn version_flag_succeeds() {
    let out = quill().arg("--version").output().expect("failed to run quill");
    assert!(out.status.success());
}

#[test]
fn repl_evaluates_lines_from_stdin() {
    use std::process::Stdio;

    let mut child = quill()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn quill");
    child
        .stdin
        .as_mut()
        .expect("stdin piped")
        .write_all(b"print 40 + 2;\nprint \"bye\";\n")
        .expect("write to repl");
    let out = child.wait_with_output().expect("repl run");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "42\nbye\n");
}
