use std::time::Duration;

use core_test_support::TestPool;
use pretty_assertions::assert_eq;
use shellpool_core::ExecError;
use shellpool_core::ExecOptions;
use shellpool_core::InputChannel;
use shellpool_core::Output;
use shellpool_core::ShellPoolConfig;
use shellpool_core::StderrTransport;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_returns_stdout_and_empty_stderr() {
    let pool = TestPool::new();
    let out = pool
        .exec("echo hi", &ExecOptions::new())
        .await
        .expect("echo");
    assert_eq!(out.stdout, "hi\n");
    assert_eq!(out.stderr, "");

    let result = pool
        .run("echo hi", &ExecOptions::new())
        .await
        .expect("run");
    assert_eq!(result.exit_code, 0);
    assert!(result.success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonzero_exit_is_an_error_carrying_the_code() {
    let pool = TestPool::new();
    let err = pool
        .exec("bash -c \"exit 1\"", &ExecOptions::new())
        .await
        .expect_err("exit 1");
    assert_eq!(err.code(), "EEXIT");
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(err.to_string(), "Exit code: 1");
    assert!(!err.is_session_fatal());

    // The session survives a failing command.
    let out = pool
        .exec("echo still here", &ExecOptions::new())
        .await
        .expect("after failure");
    assert_eq!(out.stdout, "still here\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_reports_the_exit_code_as_data() {
    let pool = TestPool::new();
    let result = pool
        .run("echo out; echo err >&2; bash -c \"exit 3\"", &ExecOptions::new())
        .await
        .expect("run");
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, b"out\n");
    assert_eq!(result.stderr, b"err\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_is_ignored_on_success() {
    let pool = TestPool::new();
    let out = pool
        .exec("echo hi >&2", &ExecOptions::new())
        .await
        .expect("success");
    assert_eq!(out.stdout, "");
    assert_eq!(out.stderr, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_stderr_does_not_leak_across_environments() {
    let pool = TestPool::new();
    let first = ExecOptions::new().with_env([("SESSION", "one")]);
    let second = ExecOptions::new().with_env([("SESSION", "two")]);

    let (failed, other) = tokio::join!(
        pool.exec("echo hi >&2; bash -c \"exit 1\"", &first),
        pool.exec("echo other >&2; bash -c \"exit 2\"", &second),
    );

    let failed = failed.expect_err("first fails");
    assert_eq!(failed.exit_code(), Some(1));
    assert_eq!(failed.stderr(), Some(&Output::Text("hi\n".to_string())));

    let other = other.expect_err("second fails");
    assert_eq!(other.exit_code(), Some(2));
    assert_eq!(other.stderr(), Some(&Output::Text("other\n".to_string())));

    assert_ne!(pool.pid(first.env.as_ref()), pool.pid(second.env.as_ref()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_of_an_earlier_failure_does_not_resurface() {
    let pool = TestPool::new();
    let options = ExecOptions::new();
    let err = pool
        .exec("echo first >&2; bash -c \"exit 1\"", &options)
        .await
        .expect_err("first fails");
    assert_eq!(err.stderr(), Some(&Output::Text("first\n".to_string())));

    let err = pool
        .exec("bash -c \"exit 5\"", &options)
        .await
        .expect_err("second fails");
    assert_eq!(err.exit_code(), Some(5));
    assert_eq!(err.stderr(), Some(&Output::Text(String::new())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_output_round_trips_byte_for_byte() {
    let pool = TestPool::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blob.bin");
    // Every byte value, plus runs that look like record headers.
    let mut blob: Vec<u8> = (0..=255u8).cycle().take(64 * 1024 + 7).collect();
    blob.extend_from_slice(b"\n0000000000000000ff\n\r\n");
    std::fs::write(&path, &blob).expect("write blob");

    let command = format!("cat '{}'", path.display());
    let out = pool
        .exec(&command, &ExecOptions::new().with_encoding("buffer"))
        .await
        .expect("cat");
    match out.stdout {
        Output::Bytes(bytes) => assert!(bytes == blob, "binary payload was altered"),
        Output::Text(text) => panic!("expected raw bytes, got text of {} chars", text.len()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_output_is_framed_correctly() {
    let pool = TestPool::new();
    let out = pool
        .exec("seq 1 100000", &ExecOptions::new())
        .await
        .expect("seq");
    let text = out.stdout.as_text().expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 100_000);
    assert_eq!(lines.first(), Some(&"1"));
    assert_eq!(lines.last(), Some(&"100000"));

    let out = pool
        .exec("echo after", &ExecOptions::new())
        .await
        .expect("next command");
    assert_eq!(out.stdout, "after\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encodings_are_applied_to_both_streams() {
    let pool = TestPool::new();
    let out = pool
        .exec("echo hi", &ExecOptions::new().with_encoding("base64"))
        .await
        .expect("base64");
    assert_eq!(out.stdout, "aGkK");

    let out = pool
        .exec("echo hi", &ExecOptions::new().with_encoding("hex"))
        .await
        .expect("hex");
    assert_eq!(out.stdout, "68690a");

    let err = pool
        .exec(
            "printf oops >&2; bash -c \"exit 1\"",
            &ExecOptions::new().with_encoding("HEX"),
        )
        .await
        .expect_err("failure");
    assert_eq!(err.stderr(), Some(&Output::Text("6f6f7073".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_encoding_returns_raw_bytes() {
    let pool = TestPool::new();
    let out = pool
        .exec("echo hi", &ExecOptions::new().with_encoding("test_0x1234"))
        .await
        .expect("raw");
    assert!(out.stdout.is_bytes());
    assert_eq!(out.stdout.as_bytes(), b"hi\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cwd_applies_to_one_call_only() {
    let pool = TestPool::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let expected = dir.path().canonicalize().expect("canonical dir");

    let out = pool
        .exec("pwd -P", &ExecOptions::new().with_cwd(dir.path()))
        .await
        .expect("pwd in dir");
    assert_eq!(
        out.stdout.as_text().map(str::trim_end),
        expected.to_str()
    );

    let host = std::env::current_dir()
        .expect("host cwd")
        .canonicalize()
        .expect("canonical host cwd");
    let out = pool
        .exec("pwd -P", &ExecOptions::new())
        .await
        .expect("pwd");
    assert_eq!(out.stdout.as_text().map(str::trim_end), host.to_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cwd_handles_quotes_in_command_and_path() {
    let pool = TestPool::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("it's here");
    std::fs::create_dir(&nested).expect("mkdir");
    std::fs::write(nested.join("note.txt"), "note\n").expect("write");

    let out = pool
        .exec("cat 'note.txt'", &ExecOptions::new().with_cwd(&nested))
        .await
        .expect("cat");
    assert_eq!(out.stdout, "note\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_environment_is_visible() {
    let pool = TestPool::new();
    let options = ExecOptions::new().with_env([("A", "x"), ("B", "y")]);
    let out = pool
        .exec("echo $A $B", &options)
        .await
        .expect("env");
    assert_eq!(out.stdout, "x y\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_state_persists_within_a_session() {
    let pool = TestPool::new();
    let options = ExecOptions::new().with_env_pairs(["STATE_TEST=1"]);
    pool.exec("export GREETING=hello", &options)
        .await
        .expect("export");
    let out = pool
        .exec("echo $GREETING", &options)
        .await
        .expect("echo");
    assert_eq!(out.stdout, "hello\n");

    // Mutations inside a cwd-scoped call stay in its subshell.
    pool.exec(
        "export SCOPED=yes",
        &options.clone().with_cwd(std::env::temp_dir()),
    )
    .await
    .expect("scoped export");
    let out = pool
        .exec("echo \"[$SCOPED]\"", &options)
        .await
        .expect("echo scoped");
    assert_eq!(out.stdout, "[]\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_syntax_survives_the_round_trip() {
    let pool = TestPool::new();
    let out = pool
        .exec(r#"data=("a" "b" "c");echo "${#data[@]}""#, &ExecOptions::new())
        .await
        .expect("array");
    assert_eq!(out.stdout, "3\n");

    let out = pool
        .exec("echo hi | tr a-z A-Z", &ExecOptions::new())
        .await
        .expect("pipe");
    assert_eq!(out.stdout, "HI\n");

    let out = pool
        .exec("printf 'a\\nb\\n\\n'", &ExecOptions::new())
        .await
        .expect("newlines");
    assert_eq!(out.stdout, "a\nb\n\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_line_command_is_rejected_without_spawning() {
    let pool = TestPool::new();
    let err = pool
        .exec("echo a\necho b", &ExecOptions::new())
        .await
        .expect_err("multi-line");
    assert_eq!(err.code(), "EINVAL");
    assert!(err.is_validation());
    assert!(pool.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn carriage_return_is_passed_through() {
    let pool = TestPool::new();
    let out = pool
        .exec("printf '%s' 'a\rb'", &ExecOptions::new())
        .await
        .expect("carriage return");
    assert_eq!(out.stdout, "a\rb");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inline_stderr_transport() {
    let pool = TestPool::with_config(ShellPoolConfig {
        stderr_transport: StderrTransport::Inline,
        ..ShellPoolConfig::default()
    });
    let err = pool
        .exec("echo inline >&2; bash -c \"exit 7\"", &ExecOptions::new())
        .await
        .expect_err("failure");
    assert_eq!(err.exit_code(), Some(7));
    assert_eq!(err.stderr(), Some(&Output::Text("inline\n".to_string())));

    let out = pool
        .exec("echo quiet >&2", &ExecOptions::new())
        .await
        .expect("success");
    assert_eq!(out.stderr, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fifo_input_channel() {
    let pool = TestPool::with_config(ShellPoolConfig {
        input_channel: InputChannel::Fifo,
        ..ShellPoolConfig::default()
    });
    for idx in 0..3 {
        let out = pool
            .exec(&format!("echo {idx}"), &ExecOptions::new())
            .await
            .expect("echo over fifo");
        assert_eq!(out.stdout, format!("{idx}\n").as_str());
    }
    let staging = pool.staging_dirs();
    assert_eq!(staging.len(), 1);
    assert!(staging[0].join("stdin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_staged_stderr_keeps_the_exit_code() {
    let pool = TestPool::new();
    let command = format!(
        "rm -f '{}'/shellpool.*/stderr; bash -c \"exit 4\"",
        pool.staging_root().display()
    );
    let err = pool
        .exec(&command, &ExecOptions::new())
        .await
        .expect_err("lost stderr");
    match &err {
        ExecError::DiagnosticChannelLost { code, .. } => assert_eq!(*code, 4),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), "ENOERRFILE");

    // Not fatal: the next failure reads its stderr again.
    let err = pool
        .exec("echo back >&2; bash -c \"exit 1\"", &ExecOptions::new())
        .await
        .expect_err("failure");
    assert_eq!(err.stderr(), Some(&Output::Text("back\n".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_timeout_never_fires() {
    let pool = TestPool::new();
    let options = ExecOptions::new().with_timeout(Duration::ZERO);
    let out = pool
        .exec("sleep 0.1; echo done", &options)
        .await
        .expect("no timeout");
    assert_eq!(out.stdout, "done\n");
}
