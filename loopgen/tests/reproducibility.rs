// Reproducibility tests for hermetic builds.
//
// These tests verify that the generator produces byte-identical outputs
// for identical requests, and that provenance hashes follow the inputs.

use std::path::PathBuf;
use std::process::Command;

fn loopgen_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_loopgen"))
}

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_str()
        .unwrap()
        .to_string()
}

fn run_loopgen(args: &[&str]) -> String {
    let output = Command::new(loopgen_binary())
        .args(args)
        .output()
        .expect("failed to run loopgen");
    assert!(
        output.status.success(),
        "loopgen failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

/// Generating the same request twice produces byte-identical C.
#[test]
fn same_request_identical_c() {
    let req = fixture("battery.json");
    let first = run_loopgen(&["--emit", "c", &req]);
    let second = run_loopgen(&["--emit", "c", &req]);
    assert_eq!(first, second, "C output should be byte-identical across runs");
    assert!(first.contains("int model_sparse_reverse_one(unsigned long pos"));
}

/// Build info is stable for a request and differs between requests.
#[test]
fn build_info_tracks_request() {
    let battery = fixture("battery.json");
    let diagonal = fixture("diagonal.json");

    let a1 = run_loopgen(&["--emit", "build-info", &battery]);
    let a2 = run_loopgen(&["--emit", "build-info", &battery]);
    let b = run_loopgen(&["--emit", "build-info", &diagonal]);

    assert_eq!(a1, a2);
    assert_ne!(a1, b);

    let info: serde_json::Value = serde_json::from_str(&a1).expect("build-info is JSON");
    assert_eq!(info["request_hash"].as_str().unwrap().len(), 64);
    assert_eq!(info["output_hash"].as_str().unwrap().len(), 64);
    assert_eq!(info["generator_version"], env!("CARGO_PKG_VERSION"));
}

/// `--emit usage` and `--emit dispatch` are the two halves of `--emit c`.
#[test]
fn emit_stages_split_the_unit() {
    let req = fixture("diagonal.json");
    let all = run_loopgen(&["--emit", "c", &req]);
    let dispatch = run_loopgen(&["--emit", "dispatch", &req]);
    let usage = run_loopgen(&["--emit", "usage", &req]);
    assert_eq!(all, format!("{}\n{}", dispatch, usage));
}

/// Contract violations exit with status 1 and report their code.
#[test]
fn invalid_request_reports_code() {
    let dir = std::env::temp_dir().join(format!("loopgen-repro-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bad.json");
    std::fs::write(&path, r#"{"usage": {"user_el_location": {}, "ordered": {}, "nnz": 0, "loop_groups": {"0": {"0": {}}}}}"#).unwrap();

    let output = Command::new(loopgen_binary())
        .arg(path.to_str().unwrap())
        .output()
        .expect("failed to run loopgen");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error[E0305]"));
}
