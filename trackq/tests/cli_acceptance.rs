use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.xdg_data.join("trackq")
    }

    fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.xdg_config.join("trackq/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config directory");
        fs::write(&path, contents).expect("failed to write config");
        path
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("trackq"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute trackq: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "trackq {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_on_fresh_install_reports_empty_queue() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Track domain:    <not set>"), "got:\n{stdout}");
    assert!(stdout.contains("Queue size:      0"), "got:\n{stdout}");
    assert!(stdout.contains("Opted out:       false"), "got:\n{stdout}");
}

#[test]
fn enqueued_requests_survive_between_invocations() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["enqueue", "https://collector.example/111/wt?p=470,0&eor=1"]);
    assert!(stdout.contains("Queue size: 1"), "got:\n{stdout}");
    run_ok(&env, &["enqueue", "https://collector.example/111/wt?p=470,1&eor=1"]);

    let queue_file = env.data_dir().join("tracking-requests");
    let contents = fs::read_to_string(&queue_file).expect("queue file should exist");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(
        lines,
        vec![
            "https://collector.example/111/wt?p=470,0&eor=1",
            "https://collector.example/111/wt?p=470,1&eor=1",
        ]
    );

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queue size:      2"), "got:\n{stdout}");
}

#[test]
fn data_dir_flag_overrides_xdg_location() {
    let env = CliTestEnv::new();
    let custom = env.home.join("custom-data");

    let custom_arg = custom.to_string_lossy().into_owned();
    run_ok(
        &env,
        &["--data-dir", &custom_arg, "enqueue", "https://collector.example/1/wt?p=470,0"],
    );

    assert!(custom.join("tracking-requests").exists());
    assert!(!env.data_dir().join("tracking-requests").exists());

    let stdout = run_ok(&env, &["--data-dir", &custom_arg, "status"]);
    assert!(stdout.contains("Queue size:      1"), "got:\n{stdout}");
}

#[test]
fn clear_removes_queued_requests_and_file() {
    let env = CliTestEnv::new();

    run_ok(&env, &["enqueue", "https://collector.example/1/wt?p=470,0"]);
    run_ok(&env, &["enqueue", "https://collector.example/1/wt?p=470,1"]);

    let stdout = run_ok(&env, &["clear"]);
    assert!(stdout.contains("Removed 2 queued requests"), "got:\n{stdout}");
    assert!(!env.data_dir().join("tracking-requests").exists());

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queue size:      0"), "got:\n{stdout}");
}

#[test]
fn verbose_flag_is_accepted_after_subcommand() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status", "-v"]);
    assert!(stdout.contains("Queue size:      0"), "got:\n{stdout}");

    let log_dir = env.xdg_state.join("trackq");
    let logs: Vec<_> = fs::read_dir(&log_dir)
        .expect("log directory should exist")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("trackq.log"))
        .collect();
    assert!(!logs.is_empty(), "expected a log file in {}", log_dir.display());
}

#[test]
fn flush_on_empty_queue_succeeds() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Flushed 0 queued requests"), "got:\n{stdout}");
}

#[test]
fn send_drops_malformed_requests_without_network() {
    let env = CliTestEnv::new();

    run_ok(&env, &["enqueue", "not a request url"]);

    let stdout = run_ok(&env, &["send"]);
    assert!(stdout.contains("Dropped:   1"), "got:\n{stdout}");
    assert!(stdout.contains("Remaining: 0"), "got:\n{stdout}");
}

#[test]
fn status_reads_tracking_settings_from_config_file() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[tracking]
version = 3
track_domain = "https://collector.example"
track_id = "123451234512345"
send_delay_secs = 120
"#,
    );

    let stdout = run_ok(&env, &["status"]);
    assert!(
        stdout.contains("Track domain:    https://collector.example"),
        "got:\n{stdout}"
    );
    assert!(stdout.contains("Track ID:        123451234512345"), "got:\n{stdout}");
    assert!(stdout.contains("Config version:  3"), "got:\n{stdout}");
    assert!(stdout.contains("Send delay:      120s"), "got:\n{stdout}");
}
