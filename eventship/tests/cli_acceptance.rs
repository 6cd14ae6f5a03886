use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

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

    fn write_config(&self, data_plane_url: &str) {
        let dir = self.xdg_config.join("eventship");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(
            dir.join("config.toml"),
            format!(
                r#"
[client]
write_key = "cli-key"
data_plane_url = "{data_plane_url}"

[backoff]
base_delay_ms = 10
max_delay_ms = 20
"#
            ),
        )
        .expect("failed to write config");
    }

    fn storage_dir(&self) -> PathBuf {
        self.xdg_data.join("eventship/cli-key")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("eventship"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute eventship: {e}"))
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
        "eventship {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn status_without_config_explains_setup() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Write Key:       <not set>"));
    assert!(stdout.contains("Client is not configured"));
}

#[test]
fn status_and_pending_with_empty_storage() {
    let env = CliTestEnv::new();
    env.write_config("http://127.0.0.1:1");

    let status = run_bin(&env, &["status"]);
    assert_success(&["status"], &status);
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("Data Plane URL:  http://127.0.0.1:1"));
    assert!(stdout.contains("Pending Batches: 0"));

    let pending = run_bin(&env, &["pending"]);
    assert_success(&["pending"], &pending);
    assert!(String::from_utf8_lossy(&pending.stdout).contains("No pending batches."));
    assert!(env.storage_dir().is_dir());
}

#[test]
fn verbose_flag_is_accepted_after_subcommand() {
    let env = CliTestEnv::new();
    env.write_config("http://127.0.0.1:1");

    for args in [&["pending", "--verbose"][..], &["status", "-v"][..]] {
        let output = run_bin(&env, args);
        assert_success(args, &output);
    }
    assert!(env.xdg_state.join("eventship").is_dir());
}

#[test]
fn track_rejects_non_object_properties() {
    let env = CliTestEnv::new();
    env.write_config("http://127.0.0.1:1");

    let output = run_bin(&env, &["track", "Signed Up", "--properties", "[1,2]"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must be a JSON object"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn track_uploads_event_to_data_plane() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let env = CliTestEnv::new();
    env.write_config(&server.uri());

    let args = [
        "track",
        "Signed Up",
        "--properties",
        r#"{"plan":"pro"}"#,
        "--anonymous-id",
        "anon-cli",
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Batches uploaded: 1"), "stdout:\n{stdout}");

    let requests = server.received_requests().await.expect("recording enabled");
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains(r#""event":"Signed Up""#));
    assert!(body.contains(r#""anonymousId":"anon-cli""#));
    assert!(!body.contains("RSA_DEF_SENT_AT_TS"));

    let pending = run_bin(&env, &["pending"]);
    assert_success(&["pending"], &pending);
    assert!(String::from_utf8_lossy(&pending.stdout).contains("No pending batches."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_with_rejected_write_key_deletes_local_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid write key"))
        .expect(1)
        .mount(&server)
        .await;

    let env = CliTestEnv::new();
    env.write_config(&server.uri());

    let args = ["track", "Signed Up"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rejected the write key"), "stdout:\n{stdout}");
    assert!(!env.storage_dir().exists());
}
