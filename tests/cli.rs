use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const CAMERA_VARS: [&str; 5] = [
    "CAMERA_USERNAME",
    "CAMERA_PASSWORD",
    "CAMERA_IP",
    "CAMERA_PORT",
    "RTSP_STREAM_PATH",
];

fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        std::process::Command::new(bin)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Runs inside `dir` with no camera or capture settings inherited.
fn phasecap(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("phasecap"));
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    for var in CAMERA_VARS {
        cmd.env_remove(var);
    }
    for var in [
        "CAPTURE_OUTPUT_DIR",
        "CAPTURE_INTERVAL_SECONDS",
        "CAPTURE_JPEG_QUALITY",
        "CAPTURE_DURATION_MINUTES",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_frames(dir: &Path, names: &[&str]) {
    fs::create_dir_all(dir).expect("create frames dir");
    for name in names {
        fs::write(dir.join(name), b"not really a jpeg").expect("write frame");
    }
}

#[test]
fn capture_help_lists_camera_and_timing_flags() {
    let tmp = TempDir::new().expect("tempdir");
    let output = phasecap(tmp.path())
        .arg("capture")
        .arg("--help")
        .output()
        .expect("capture --help runs");

    assert!(output.status.success());
    let text = combined_output(&output);
    for flag in [
        "--interval-seconds",
        "--jpeg-quality",
        "--duration-minutes",
        "--output-dir",
        "--camera-password",
        "--rtsp-stream-path",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn hidden_password_never_reaches_help() {
    let tmp = TempDir::new().expect("tempdir");
    let output = phasecap(tmp.path())
        .env("CAMERA_PASSWORD", "hunter2-secret")
        .arg("capture")
        .arg("--help")
        .output()
        .expect("capture --help runs");
    assert!(output.status.success());
    assert!(!combined_output(&output).contains("hunter2-secret"));
}

#[test]
fn rounds_reports_next_id_from_disk_and_state() {
    let tmp = TempDir::new().expect("tempdir");
    write_frames(
        &tmp.path().join("rtsp_frames"),
        &[
            "round_1_1_20240101_080000.jpg",
            "round_3_12_20240102_080000.jpg",
        ],
    );

    let output = phasecap(tmp.path())
        .arg("rounds")
        .output()
        .expect("rounds runs");
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("next_round=4"), "{stdout}");
    assert!(stdout.contains("state=-"), "{stdout}");

    fs::write(tmp.path().join("round_state.txt"), "9").expect("write state");
    let output = phasecap(tmp.path())
        .arg("rounds")
        .output()
        .expect("rounds runs");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("next_round=10"), "{stdout}");
    assert!(stdout.contains("scanned_max=3"), "{stdout}");
}

#[test]
fn capture_without_camera_settings_names_missing_variables() {
    let tmp = TempDir::new().expect("tempdir");
    let output = phasecap(tmp.path())
        .arg("capture")
        .arg("--camera-ip")
        .arg("10.1.1.1")
        .arg("--progress")
        .arg("quiet")
        .output()
        .expect("capture runs");

    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("CAMERA_PASSWORD"), "{text}");
    assert!(!text.contains("CAMERA_IP,"), "{text}");
    assert!(!tmp.path().join("round_state.txt").exists());
}

#[test]
fn unreachable_source_aborts_without_touching_round_state() {
    let tmp = TempDir::new().expect("tempdir");
    let output = phasecap(tmp.path())
        .arg("capture")
        .arg("--source")
        .arg(tmp.path().join("missing.mkv"))
        .arg("--progress")
        .arg("quiet")
        .output()
        .expect("capture runs");

    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("could not connect"), "{text}");
    assert!(!tmp.path().join("round_state.txt").exists());
    assert!(!tmp.path().join("capture_summary.log").exists());
}

#[test]
fn capture_from_video_file_saves_round_frames_and_report() {
    if !ffmpeg_available() {
        eprintln!("skipping: ffmpeg/ffprobe not on PATH");
        return;
    }
    let tmp = TempDir::new().expect("tempdir");
    let video = tmp.path().join("furnace.mkv");
    let status = std::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg("testsrc=duration=4:size=64x48:rate=10")
        .args(["-c:v", "ffv1"])
        .arg(&video)
        .status()
        .expect("run ffmpeg");
    assert!(status.success());

    let output = phasecap(tmp.path())
        .arg("capture")
        .arg("--source")
        .arg(&video)
        .arg("--interval-seconds")
        .arg("1")
        .arg("--duration-minutes")
        .arg("1")
        .arg("--progress")
        .arg("plain")
        .output()
        .expect("capture runs");
    let text = combined_output(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.contains("Capture summary: round=0"), "{text}");
    assert!(text.contains("termination=source exhausted"), "{text}");

    let frames: Vec<String> = fs::read_dir(tmp.path().join("rtsp_frames"))
        .expect("frames dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|n| n.starts_with("round_0_") && n.ends_with(".jpg")));

    assert_eq!(
        fs::read_to_string(tmp.path().join("round_state.txt")).expect("state"),
        "0"
    );
    let report = fs::read_to_string(tmp.path().join("capture_summary.log")).expect("report");
    assert!(report.contains("--- Round 0 Start"), "{report}");
    assert!(report.contains("JPEG Quality: 90"), "{report}");
}

#[test]
fn scripted_classify_then_stats_and_export() {
    let tmp = TempDir::new().expect("tempdir");
    let frames_dir = tmp.path().join("rtsp_frames");
    write_frames(
        &frames_dir,
        &[
            "round_2_2_20240101_080002.jpg",
            "round_2_1_20240101_080000.jpg",
            "round_2_3_20240101_080004.jpg",
            "notes.txt",
        ],
    );

    let output = phasecap(tmp.path())
        .arg("classify")
        .write_stdin("2\ni 1\nm 2\n")
        .output()
        .expect("classify runs");
    let text = combined_output(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.contains("select a sub-phase"), "{text}");
    assert!(
        text.contains("Classify summary: frames=3 labeled=2 commits=2"),
        "{text}"
    );

    let output = phasecap(tmp.path())
        .arg("stats")
        .output()
        .expect("stats runs");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("classified=2"), "{stdout}");
    assert!(stdout.contains("unclassified=1"), "{stdout}");

    let output = phasecap(tmp.path())
        .arg("export")
        .arg("--dest")
        .arg("sorted")
        .arg("--progress")
        .arg("quiet")
        .output()
        .expect("export runs");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("exported=2"), "{stdout}");
    assert!(tmp
        .path()
        .join("sorted/forno_enchendo/inicio/round_2_1_20240101_080000.jpg")
        .is_file());
    assert!(tmp
        .path()
        .join("sorted/sinterizacao_acontecendo/meio/round_2_2_20240101_080002.jpg")
        .is_file());
    assert!(frames_dir.join("round_2_1_20240101_080000.jpg").is_file());

    let store = fs::read_to_string(tmp.path().join("classifications.json")).expect("store");
    assert!(store.contains("\"destination_path\""), "{store}");
}

#[test]
fn corrupt_store_is_reported_not_replaced() {
    let tmp = TempDir::new().expect("tempdir");
    fs::write(tmp.path().join("classifications.json"), "{ not json").expect("write store");

    let output = phasecap(tmp.path())
        .arg("stats")
        .output()
        .expect("stats runs");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("corrupt"));
    assert_eq!(
        fs::read_to_string(tmp.path().join("classifications.json")).expect("store"),
        "{ not json"
    );
}
