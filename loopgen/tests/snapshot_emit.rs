// Snapshot tests: lock generated C output to detect unintended behavior changes.
//
// Uses the library API (request → grouping → emission) directly. Snapshots
// are managed by `insta` and stored under `loopgen/tests/snapshots/`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use loopgen::pipeline::{generate, GenRequest};

fn battery() -> GenRequest {
    GenRequest::from_json(include_str!("fixtures/battery.json")).expect("fixture parses")
}

/// Direct, compressed and unrolled groups plus one non-loop row.
#[test]
fn battery_usage() {
    let src = generate(&battery()).expect("generation succeeds");
    insta::assert_snapshot!("battery_usage", src.usage);
}

#[test]
fn battery_dispatch() {
    let src = generate(&battery()).expect("generation succeeds");
    insta::assert_snapshot!("battery_dispatch", src.dispatch);
}
