//! End-to-end runs of the two binaries inside scratch working directories.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn run(bin: &str, dir: &Path) -> Output {
    Command::new(bin)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn {bin}: {e}"))
}

fn generate(dir: &Path) {
    let out = run(env!("CARGO_BIN_EXE_generate_sample"), dir);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

fn export(dir: &Path) -> Output {
    run(env!("CARGO_BIN_EXE_model-export"), dir)
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn exports_generated_artifacts() {
    let tmp = TempDir::new().unwrap();
    generate(tmp.path());

    let out = export(tmp.path());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Generated model/rfc.json"));
    assert!(stdout.contains("Generated model/trained_pca.json"));

    let rfc = read_json(&tmp.path().join("model/rfc.json"));
    let models = rfc.as_object().unwrap();
    assert_eq!(models.len(), 10);
    for digit in 0..10 {
        let entry = models[&digit.to_string()].as_object().unwrap();
        assert_eq!(entry.len(), 5);
        let n_components = entry["n_components"].as_u64().unwrap() as usize;
        assert_eq!(entry["alpha"].as_array().unwrap().len(), n_components);
    }

    let pca = read_json(&tmp.path().join("model/trained_pca.json"));
    let components = pca["components"].as_array().unwrap();
    assert_eq!(components.len(), 17);
    assert!(components.iter().all(|row| row.as_array().unwrap().len() == 784));
    assert_eq!(pca["mean"].as_array().unwrap().len(), 784);
    assert_eq!(pca["explained_variance"].as_array().unwrap().len(), 17);
}

#[test]
fn repeated_runs_write_identical_bytes() {
    let tmp = TempDir::new().unwrap();
    generate(tmp.path());
    let rfc = tmp.path().join("model/rfc.json");
    let pca = tmp.path().join("model/trained_pca.json");

    assert!(export(tmp.path()).status.success());
    let first = (fs::read(&rfc).unwrap(), fs::read(&pca).unwrap());
    assert!(export(tmp.path()).status.success());
    let second = (fs::read(&rfc).unwrap(), fs::read(&pca).unwrap());
    assert_eq!(first, second);
}

#[test]
fn fresh_directory_gets_model_dir() {
    let tmp = TempDir::new().unwrap();

    let out = export(tmp.path());
    assert!(!out.status.success());
    assert!(tmp.path().join("model").is_dir());
    assert!(String::from_utf8_lossy(&out.stderr).contains("rfc.pkl"));
}

#[test]
fn corrupt_artifact_fails_without_touching_output() {
    let tmp = TempDir::new().unwrap();
    generate(tmp.path());
    let model = tmp.path().join("model");

    // No previous output: nothing is written.
    fs::write(model.join("rfc.pkl"), b"\x80\x04\x95 truncated").unwrap();
    let out = export(tmp.path());
    assert!(!out.status.success());
    assert!(!model.join("rfc.json").exists());

    // Previous output: left exactly as it was.
    fs::write(model.join("rfc.json"), b"{}").unwrap();
    let out = export(tmp.path());
    assert!(!out.status.success());
    assert_eq!(fs::read(model.join("rfc.json")).unwrap(), b"{}");
    assert!(!model.join("trained_pca.json").exists());
}

#[test]
fn missing_projection_artifact_fails() {
    let tmp = TempDir::new().unwrap();
    generate(tmp.path());
    fs::remove_file(tmp.path().join("model/trained_pca.pkl")).unwrap();

    let out = export(tmp.path());
    assert!(!out.status.success());
    assert!(tmp.path().join("model/rfc.json").exists());
    assert!(!tmp.path().join("model/trained_pca.json").exists());
    assert!(String::from_utf8_lossy(&out.stderr).contains("trained_pca.pkl"));
}
