use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ink2md_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ink2md");
    path
}

/// Temp workspace with one scanned page and a preset pointing at a closed port.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let scans = root.join("scans/notes");
    fs::create_dir_all(&scans).unwrap();

    let img = image::RgbImage::from_pixel(40, 20, image::Rgb([250, 250, 250]));
    img.save(scans.join("page.png")).unwrap();

    let config_content = format!(
        r#"[cache]
path = "{root}/data/ink2md.sqlite"

[[presets]]
id = "local"
provider = "ollama"
model = "llava"
endpoint = "http://127.0.0.1:9"
timeout_secs = 5
max_retries = 0

[[sources]]
id = "scans"
directories = ["{root}/scans"]
output_root = "{root}/vault"
preset = "local"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ink2md.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ink2md(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ink2md_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ink2md binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_cache() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ink2md(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Cache initialized successfully"));
    assert!(tmp.path().join("data/ink2md.sqlite").exists());

    // Idempotent
    let (_, stderr, success) = run_ink2md(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_sources_lists_health() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ink2md(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("SOURCE"));
    assert!(stdout.contains("scans"));
    assert!(stdout.contains("local"));
    assert!(stdout.contains("OK"));
}

#[test]
fn test_import_writes_placeholder_when_provider_unreachable() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_ink2md(&config_path, &["import", "--progress", "off"]);
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("import"));
    assert!(stdout.contains("imported: 1"));
    assert!(stdout.contains("generation failures: 1"));
    assert!(stdout.trim_end().ends_with("ok"));

    let folder = tmp.path().join("vault/notes/page");
    let note = fs::read_to_string(folder.join("page.md")).unwrap();
    assert!(note.contains("generation failed"));
    assert!(note.contains("![Page 1](page-p1.png)"));
    assert!(folder.join("page-p1.png").exists());

    // Unchanged on the second run.
    let (stdout, _, success) = run_ink2md(&config_path, &["import", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("unchanged: 1"));
    assert!(stdout.contains("imported: 0"));
}

#[test]
fn test_cache_list_and_reset() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ink2md(&config_path, &["cache", "list"]);
    assert!(success);
    assert!(stdout.contains("No cached fingerprints"));

    let (_, stderr, success) = run_ink2md(&config_path, &["import", "--progress", "off"]);
    assert!(success, "import failed: {}", stderr);

    let (stdout, _, success) = run_ink2md(&config_path, &["cache", "list"]);
    assert!(success);
    assert!(stdout.starts_with("CONFIG"));
    assert!(stdout.contains("scans:"));
    assert!(stdout.contains("total: 1"));

    let (stdout, _, success) = run_ink2md(&config_path, &["cache", "reset", "--orphans"]);
    assert!(success);
    assert!(stdout.contains("removed: 0"));

    let (stdout, _, success) = run_ink2md(&config_path, &["cache", "reset", "--source", "scans"]);
    assert!(success);
    assert!(stdout.contains("removed: 1"));

    let (_, _, success) =
        run_ink2md(&config_path, &["cache", "reset", "--source", "scans", "--orphans"]);
    assert!(!success);
}

#[test]
fn test_import_without_sources_requires_configuration() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("ink2md.toml");
    fs::write(
        &config_path,
        format!("[cache]\npath = \"{}/ink2md.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();

    let (stdout, stderr, success) = run_ink2md(&config_path, &["import", "--progress", "off"]);
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("configuration required"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ink2md(&tmp.path().join("absent.toml"), &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
