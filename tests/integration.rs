use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

const BWR_T1: &str = "TCRMP20240215_3D_BWR_T1";
const BWR_T2: &str = "TCRMP20240215_3D_BWR_T2";
const FLC_T1: &str = "TCRMP20240216_3D_FLC_T1";

fn tpipe_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tpipe");
    path
}

fn write_config(project: &Path, extra: &str) {
    let config = format!(
        r#"[project]
name = "integration"
video_source = "videos"

[batching]
max_per_batch = 2

[extraction]
frames_per_transect = 4

[publish]
api_token = "test-token"

[engine]
kind = "stub"
{}
"#,
        extra
    );
    fs::write(project.join("pipeline.toml"), config).unwrap();
}

fn setup_project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let videos = tmp.path().join("videos");
    fs::create_dir_all(&videos).unwrap();
    for id in [BWR_T1, BWR_T2, FLC_T1] {
        fs::write(videos.join(format!("{}.mp4", id)), b"video").unwrap();
    }
    write_config(tmp.path(), "");
    tmp
}

/// Run `tpipe <args> <project>`, returning (stdout, stderr, exit code).
fn run_tpipe(project: &Path, args: &[&str]) -> (String, String, i32) {
    let binary = tpipe_binary();
    let output = Command::new(&binary)
        .args(["--progress", "off"])
        .args(args)
        .arg(project)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tpipe binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn run_ok(project: &Path, args: &[&str]) -> String {
    let (stdout, stderr, code) = run_tpipe(project, args);
    assert_eq!(code, 0, "tpipe {:?} failed\nstdout: {}\nstderr: {}", args, stdout, stderr);
    assert!(stdout.trim_end().ends_with("ok"), "stdout: {}", stdout);
    stdout
}

fn status_json(project: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(project.join("pipeline-status.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn stage_of(project: &Path, id: &str) -> String {
    status_json(project)["items"][id]["stage"]
        .as_str()
        .unwrap()
        .to_string()
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn test_full_pipeline_through_publish() {
    let tmp = setup_project();
    let project = tmp.path();

    let stdout = run_ok(project, &["discover"]);
    assert!(stdout.contains("found: 3 items"));
    assert!(stdout.contains("added: 3"));

    for command in ["extract", "reconstruct", "consolidate", "export", "publish"] {
        let stdout = run_ok(project, &[command]);
        assert!(stdout.contains("failed: 0"), "{}: {}", command, stdout);
    }

    for id in [BWR_T1, BWR_T2, FLC_T1] {
        assert_eq!(stage_of(project, id), "published");
        assert!(project.join("output/published").join(format!("{}.json", id)).is_file());
        assert!(project.join("output/reports").join(format!("{}.pdf", id)).is_file());
    }
    assert!(project.join("output/psx/BWR.psx").is_file());
    assert!(project.join("output/psx/FLC.psx").is_file());
    assert_eq!(files_with_extension(&project.join("processing/psxraw"), "psx").len(), 2);
}

#[test]
fn test_rerun_is_a_noop() {
    let tmp = setup_project();
    let project = tmp.path();
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);
    let before = fs::read(project.join("pipeline-status.json")).unwrap();

    let stdout = run_ok(project, &["extract"]);
    assert!(stdout.contains("advanced: 0"));
    let after = fs::read(project.join("pipeline-status.json")).unwrap();
    assert_eq!(before, after);

    let stdout = run_ok(project, &["discover"]);
    assert!(stdout.contains("added: 0"));
    assert!(stdout.contains("unchanged: 3"));
}

#[test]
fn test_member_failure_exits_2_and_retries() {
    let tmp = setup_project();
    let project = tmp.path();
    write_config(project, &format!("stub_failures = [\"extract:{}\"]", BWR_T2));
    run_ok(project, &["discover"]);

    let (stdout, _stderr, code) = run_tpipe(project, &["extract"]);
    assert_eq!(code, 2, "stdout: {}", stdout);
    assert!(stdout.contains("advanced: 2"));
    assert!(stdout.contains("failed: 1"));
    assert!(stdout.contains(&format!("! {}", BWR_T2)));
    assert!(stdout.trim_end().ends_with("finished with failures"));
    assert_eq!(stage_of(project, BWR_T2), "failed");
    assert_eq!(stage_of(project, BWR_T1), "extracted");

    let (status, _, code) = run_tpipe(project, &["status"]);
    assert_eq!(code, 0);
    assert!(status.contains("Failed:"));
    assert!(status.contains(BWR_T2));

    write_config(project, "");
    let stdout = run_ok(project, &["extract"]);
    assert!(stdout.contains("advanced: 1"));
    assert_eq!(stage_of(project, BWR_T2), "extracted");
    assert_eq!(status_json(project)["items"][BWR_T2]["attempts"], 0);
}

#[test]
fn test_earlier_failure_keeps_later_stage_failing() {
    let tmp = setup_project();
    let project = tmp.path();
    write_config(project, &format!("stub_failures = [\"extract:{}\"]", BWR_T2));
    run_ok(project, &["discover"]);
    let (_, _, code) = run_tpipe(project, &["extract"]);
    assert_eq!(code, 2);

    // BWR_T2 shares an early batch with BWR_T1 and is skipped, not retried.
    let (stdout, _stderr, code) = run_tpipe(project, &["reconstruct"]);
    assert_eq!(code, 2, "stdout: {}", stdout);
    assert!(stdout.contains("advanced: 2"));
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.contains("still failed: 1"));
    assert!(stdout.contains(&format!("! {}", BWR_T2)));
    assert!(stdout.contains("(earlier run)"));
    assert!(stdout.trim_end().ends_with("finished with failures"));
    assert_eq!(stage_of(project, BWR_T1), "reconstructed");
    assert_eq!(stage_of(project, BWR_T2), "failed");
}

#[test]
fn test_reset_after_failed_merges_of_a_growing_site() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    let videos = project.join("videos");
    fs::create_dir_all(&videos).unwrap();
    for id in [BWR_T1, BWR_T2] {
        fs::write(videos.join(format!("{}.mp4", id)), b"video").unwrap();
    }
    write_config(project, "stub_failures = [\"merge_by_site:*\"]");
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);
    run_ok(project, &["reconstruct"]);
    let (_, _, code) = run_tpipe(project, &["consolidate"]);
    assert_eq!(code, 2);

    // A third transect arrives, catches up, and the merge fails again.
    const BWR_T3: &str = "TCRMP20240215_3D_BWR_T3";
    fs::write(videos.join(format!("{}.mp4", BWR_T3)), b"video").unwrap();
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);
    run_ok(project, &["reconstruct"]);
    let (_, _, code) = run_tpipe(project, &["consolidate"]);
    assert_eq!(code, 2);
    let site_batches = status_json(project)["batches"]
        .as_object()
        .unwrap()
        .keys()
        .filter(|k| k.starts_with("site-BWR-"))
        .count();
    assert_eq!(site_batches, 1);

    let stdout = run_ok(project, &["reset", "extracted", "--yes"]);
    assert!(stdout.contains("items: 3"), "stdout: {}", stdout);
    for id in [BWR_T1, BWR_T2, BWR_T3] {
        assert_eq!(stage_of(project, id), "extracted");
    }
    assert!(!project.join("output/psx/BWR.psx").exists());
}

#[test]
fn test_second_consolidation_keeps_earlier_transects() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    let videos = project.join("videos");
    fs::create_dir_all(&videos).unwrap();
    fs::write(videos.join(format!("{}.mp4", BWR_T1)), b"video").unwrap();
    write_config(project, "");
    for command in ["discover", "extract", "reconstruct", "consolidate"] {
        run_ok(project, &[command]);
    }

    fs::write(videos.join(format!("{}.mp4", BWR_T2)), b"video").unwrap();
    for command in ["discover", "extract", "reconstruct", "consolidate"] {
        run_ok(project, &[command]);
    }
    assert_eq!(stage_of(project, BWR_T2), "consolidated");
    let merged = fs::read_to_string(project.join("output/psx/BWR.psx")).unwrap();
    assert_eq!(merged.lines().collect::<Vec<_>>(), vec![BWR_T1, BWR_T2]);
}

#[test]
fn test_incomplete_site_is_deferred() {
    let tmp = setup_project();
    let project = tmp.path();
    write_config(project, &format!("stub_failures = [\"align:{}\"]", BWR_T2));
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);
    let (_, _, code) = run_tpipe(project, &["reconstruct"]);
    assert_eq!(code, 2);

    let stdout = run_ok(project, &["consolidate"]);
    assert!(stdout.contains("deferred sites: BWR"));
    assert_eq!(stage_of(project, FLC_T1), "consolidated");
    assert_eq!(stage_of(project, BWR_T1), "reconstructed");

    let stdout = run_ok(project, &["consolidate", "--allow-partial"]);
    assert!(stdout.contains("advanced: 1"));
    assert_eq!(stage_of(project, BWR_T1), "consolidated");
}

#[test]
fn test_missing_config_key_is_fatal() {
    let tmp = setup_project();
    let project = tmp.path();
    fs::write(
        project.join("pipeline.toml"),
        "[project]\nvideo_source = \"videos\"\n\n[batching]\n",
    )
    .unwrap();

    let (_stdout, stderr, code) = run_tpipe(project, &["discover"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("batching.max_per_batch"), "stderr: {}", stderr);
    assert!(!project.join("pipeline-status.json").exists());
}

#[test]
fn test_publish_without_token_changes_nothing() {
    let tmp = setup_project();
    let project = tmp.path();
    fs::write(
        project.join("pipeline.toml"),
        "[project]\nvideo_source = \"videos\"\n\n[batching]\nmax_per_batch = 2\n\n[engine]\nkind = \"stub\"\n",
    )
    .unwrap();
    run_ok(project, &["discover"]);
    let before = fs::read(project.join("pipeline-status.json")).unwrap();

    let (_stdout, stderr, code) = run_tpipe(project, &["publish"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("publish.api_token"), "stderr: {}", stderr);
    assert_eq!(before, fs::read(project.join("pipeline-status.json")).unwrap());
}

#[test]
fn test_bad_video_name_is_fatal() {
    let tmp = setup_project();
    let project = tmp.path();
    fs::write(project.join("videos/holiday.mp4"), b"video").unwrap();

    let (_stdout, stderr, code) = run_tpipe(project, &["discover"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("holiday"), "stderr: {}", stderr);
}

#[test]
fn test_plan_prints_batches_without_recording() {
    let tmp = setup_project();
    let project = tmp.path();
    run_ok(project, &["discover"]);

    let stdout = run_ok(project, &["plan", "early"]);
    assert!(stdout.contains("b001-"));
    assert!(stdout.contains("b002-"));
    assert!(stdout.contains("new batches: 2"));
    assert_eq!(status_json(project)["batches"].as_object().unwrap().len(), 0);
}

#[test]
fn test_reset_keeps_frames_and_removes_batch_projects() {
    let tmp = setup_project();
    let project = tmp.path();
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);
    run_ok(project, &["reconstruct"]);
    let psxraw = project.join("processing/psxraw");
    assert_eq!(files_with_extension(&psxraw, "psx").len(), 2);

    let dry = run_ok(project, &["reset", "extracted", "--dry-run"]);
    assert!(dry.contains("(dry run)"));
    assert_eq!(files_with_extension(&psxraw, "psx").len(), 2);
    assert_eq!(stage_of(project, BWR_T1), "reconstructed");

    let stdout = run_ok(project, &["reset", "extracted", "--yes"]);
    assert!(stdout.contains("items: 3"));
    assert!(files_with_extension(&psxraw, "psx").is_empty());
    for id in [BWR_T1, BWR_T2, FLC_T1] {
        assert_eq!(stage_of(project, id), "extracted");
        assert!(project.join("processing/frames").join(id).is_dir());
    }

    // The next reconstruct rebuilds the projects under their original ids.
    run_ok(project, &["reconstruct"]);
    assert_eq!(files_with_extension(&psxraw, "psx").len(), 2);
}

#[test]
fn test_reset_without_confirmation_is_cancelled() {
    let tmp = setup_project();
    let project = tmp.path();
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);

    let mut child = Command::new(tpipe_binary())
        .args(["--progress", "off", "reset", "discovered"])
        .arg(project)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"no\n").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("reset cancelled"));
    assert_eq!(stage_of(project, BWR_T1), "extracted");
}

#[test]
fn test_full_reset_keeps_configuration() {
    let tmp = setup_project();
    let project = tmp.path();
    run_ok(project, &["discover"]);
    run_ok(project, &["extract"]);

    run_ok(project, &["reset", "full", "--yes"]);
    assert!(!project.join("pipeline-status.json").exists());
    assert!(!project.join("processing/frames").exists());
    assert!(project.join("pipeline.toml").is_file());
    assert!(project.join("videos").join(format!("{}.mp4", BWR_T1)).is_file());
}

#[test]
fn test_project_dir_from_stdin() {
    let tmp = setup_project();
    let project = tmp.path();

    let mut child = Command::new(tpipe_binary())
        .args(["--progress", "off", "discover"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let line = format!("'{}/'\n", project.display());
    child.stdin.take().unwrap().write_all(line.as_bytes()).unwrap();
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("added: 3"));
}
