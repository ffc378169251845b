use stacksnap::export::ProfileJsonExporter;
use stacksnap::profile::ProfileBuilder;
use stacksnap_common::{Frame, Module, ModuleIndex, Sample};
use std::time::Duration;

fn profile_with_two_samples() -> stacksnap::profile::CallStackProfile {
    let mut builder = ProfileBuilder::new();
    builder.metadata_recorder().mark_milestone(2);
    let annotate = builder.annotator();

    for depth in [2usize, 3] {
        let mut sample = Sample::new();
        annotate(&mut sample.annotation);
        for i in 0..depth {
            sample.frames.push(Frame::new(0x1000 + i * 0x10, ModuleIndex(0)));
        }
        builder.on_sample_completed(sample);
    }

    let module = Module {
        base_address: 0x1000,
        size: 0x1000,
        unique_id: "0403020106050807090A0B0C0D0E0F100".to_string(),
        file_path: "/usr/lib/libdemo.so".to_string(),
        load_bias: 0x1000,
    };
    builder.on_profile_completed(vec![module], Duration::from_millis(20), Duration::from_millis(10))
}

#[test]
fn test_export_creates_valid_json_file() {
    let profile = profile_with_two_samples();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("profile.json");

    ProfileJsonExporter::new(&profile).pretty(true).export_to_file(&path).expect("export");

    let content = std::fs::read_to_string(&path).expect("read back");
    let parsed: serde_json::Value = serde_json::from_str(&content).expect("valid JSON");
    assert_eq!(parsed["samples"].as_array().map(Vec::len), Some(2));
    assert_eq!(parsed["samples"][1]["frames"].as_array().map(Vec::len), Some(3));
    assert_eq!(parsed["samples"][0]["milestones"], 4);
    assert_eq!(parsed["modules"][0]["path"], "/usr/lib/libdemo.so");
    assert_eq!(parsed["durationMs"], 20.0);
}

#[test]
fn test_export_to_missing_directory_fails() {
    let profile = profile_with_two_samples();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("missing").join("profile.json");

    let err = ProfileJsonExporter::new(&profile).export_to_file(&path).expect_err("no such directory");
    assert!(err.to_string().contains("Failed to write profile file"));
}

#[test]
fn test_profile_round_trips_through_serde() {
    let profile = profile_with_two_samples();
    let json = serde_json::to_string(&profile).expect("serialize");
    let back: stacksnap::profile::CallStackProfile = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, profile);
}
