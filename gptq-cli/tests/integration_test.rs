//! Integration tests for gptq-cli using a generated two-block model.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use candle_core::{Device, Tensor};
use tempfile::TempDir;

fn gptq_cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_gptq"))
}

fn pseudo_tensor(shape: &[usize], seed: usize) -> Tensor {
    let n = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|i| {
            let x = ((seed * 7919 + i) as f32 * 12.9898 + 78.233).sin() * 43758.547;
            x - x.floor() - 0.5
        })
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
}

/// Writes `model.safetensors`, `calibration.safetensors` and `config.json`.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();

        let mut model = HashMap::new();
        model.insert("embed.proj.weight".to_string(), pseudo_tensor(&[8, 4], 1));
        for k in 0..2 {
            model.insert(format!("blocks.{k}.fc1.weight"), pseudo_tensor(&[16, 8], 10 * k + 2));
            model.insert(format!("blocks.{k}.fc1.bias"), pseudo_tensor(&[16], 10 * k + 3));
            model.insert(format!("blocks.{k}.fc2.weight"), pseudo_tensor(&[8, 16], 10 * k + 4));
        }
        candle_core::safetensors::save(&model, dir.path().join("model.safetensors")).unwrap();

        let mut calibration = HashMap::new();
        calibration.insert("input".to_string(), pseudo_tensor(&[4, 6, 4], 99));
        candle_core::safetensors::save(&calibration, dir.path().join("calibration.safetensors")).unwrap();

        fs::write(dir.path().join("config.json"), config).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn arg(&self, name: &str) -> String {
        self.path(name).to_str().unwrap().to_string()
    }

    fn quantize(&self, extra: &[&str]) -> Output {
        gptq_cli()
            .args([
                "quantize",
                "--model", self.arg("model.safetensors").as_str(),
                "--calibration", self.arg("calibration.safetensors").as_str(),
                "--config", self.arg("config.json").as_str(),
                "--output", self.arg("out").as_str(),
            ])
            .args(extra)
            .output()
            .expect("Failed to run gptq quantize")
    }
}

const MIXED_CONFIG: &str = r#"{
    "run": {
        "nsamples": 4,
        "weight_config": {
            "blocks.{N}.fc1": { "bits": 4, "group_size": 4 },
            "blocks.{N}.fc2": { "bits": 8, "group_size": -1, "sym": true, "act_order": true }
        }
    }
}"#;

fn assert_success(output: &Output, what: &str) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{} failed:\nstdout: {}\nstderr: {}", what, stdout, stderr);
}

fn read_summary(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_quantize_generate_config() {
    let fixture = Fixture::new("{}");
    let output = gptq_cli()
        .current_dir(fixture.dir.path())
        .args(["quantize", "--model", fixture.arg("model.safetensors").as_str(), "--generate-config"])
        .output()
        .expect("Failed to run gptq");

    assert_success(&output, "quantize --generate-config");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Found 7 tensors"));
    assert!(stdout.contains("Generated quantize_config.json"));

    let config = fs::read_to_string(fixture.path("quantize_config.json")).unwrap();
    assert!(config.contains("blocks.{N}.fc1"));
    assert!(config.contains("blocks.{N}.fc2"));
    assert!(!config.contains("embed"));
}

#[test]
fn test_quantize_resident_model() {
    let fixture = Fixture::new(MIXED_CONFIG);
    let output = fixture.quantize(&[]);
    assert_success(&output, "quantize");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Quantization Complete: 4 quantized, 0 fallback, 0 skipped"));

    let model = candle_core::safetensors::load(fixture.path("out/model.safetensors"), &Device::Cpu).unwrap();
    assert!(model.contains_key("embed.proj.weight"));
    assert!(model.contains_key("blocks.0.fc1.qweight"));
    assert!(model.contains_key("blocks.0.fc1.qzeros"));
    assert!(model.contains_key("blocks.0.fc1.bias"));
    assert!(!model.contains_key("blocks.0.fc1.weight"));
    // symmetric act-order layers: permutation, no stored zeros
    assert!(model.contains_key("blocks.1.fc2.perm"));
    assert!(!model.contains_key("blocks.1.fc2.qzeros"));
    // 4-bit codes: 8 per word
    assert_eq!(model["blocks.0.fc1.qweight"].dims(), &[16, 1]);

    let summary = read_summary(&fixture.path("out/quantization.json"));
    assert_eq!(summary["samples"], 4);
    let fc1 = &summary["layers"]["blocks.0.fc1"];
    assert_eq!(fc1["status"], "quantized");
    assert_eq!(fc1["groups"], 2);
    assert_eq!(fc1["scale"].as_array().unwrap().len(), 16);
    assert_eq!(summary["layers"]["blocks.1.fc2"]["perm"].as_array().unwrap().len(), 16);
}

#[test]
fn test_quantize_layer_wise() {
    let fixture = Fixture::new(MIXED_CONFIG);
    let output = fixture.quantize(&["--layer-wise"]);
    assert_success(&output, "quantize --layer-wise");

    for layer in ["blocks.0.fc1", "blocks.0.fc2", "blocks.1.fc1", "blocks.1.fc2"] {
        let file = fixture.path(&format!("out/layers/{layer}.safetensors"));
        assert!(file.exists(), "{} not written", file.display());
    }
    assert!(!fixture.path("out/model.safetensors").exists());
    // dense tensors are written alongside the packed layers
    assert!(fixture.path("out/layers/embed.proj.safetensors").exists());

    let summary = read_summary(&fixture.path("out/quantization.json"));
    assert!(summary["layers"]["blocks.1.fc1"]["packed_path"].is_string());

    let output = gptq_cli()
        .args(["inspect", "--model", fixture.arg("out/layers").as_str()])
        .output()
        .expect("Failed to run gptq inspect");
    assert_success(&output, "inspect layers");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("4 packed layer(s), 1 dense tensor(s)"));
}

#[test]
fn test_layer_wise_keeps_unquantized_layers() {
    let config = r#"{ "run": { "layer_wise": true, "weight_config": { "blocks.{N}.fc1": {} } } }"#;
    let fixture = Fixture::new(config);
    assert_success(&fixture.quantize(&[]), "quantize layer-wise");

    let fc2 = candle_core::safetensors::load(fixture.path("out/layers/blocks.1.fc2.safetensors"), &Device::Cpu).unwrap();
    assert_eq!(fc2["blocks.1.fc2.weight"].dims(), &[8, 16]);
    let fc1 = candle_core::safetensors::load(fixture.path("out/layers/blocks.1.fc1.safetensors"), &Device::Cpu).unwrap();
    assert!(fc1.contains_key("blocks.1.fc1.qweight"));
    assert!(fc1.contains_key("blocks.1.fc1.bias"));
    assert!(!fc1.contains_key("blocks.1.fc1.weight"));
}

#[test]
fn test_layer_wise_matches_resident() {
    let resident = Fixture::new(MIXED_CONFIG);
    assert_success(&resident.quantize(&[]), "quantize");
    let streamed = Fixture::new(MIXED_CONFIG);
    assert_success(&streamed.quantize(&["--layer-wise"]), "quantize --layer-wise");

    let a = read_summary(&resident.path("out/quantization.json"));
    let b = read_summary(&streamed.path("out/quantization.json"));
    for layer in ["blocks.0.fc1", "blocks.1.fc2"] {
        assert_eq!(a["layers"][layer]["scale"], b["layers"][layer]["scale"]);
        assert_eq!(a["layers"][layer]["zero"], b["layers"][layer]["zero"]);
    }
}

#[test]
fn test_unconfigured_layers_stay_dense() {
    let config = r#"{ "run": { "weight_config": { "blocks.{N}.fc1": {} } } }"#;
    let fixture = Fixture::new(config);
    let output = fixture.quantize(&[]);
    assert_success(&output, "quantize");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 quantized, 0 fallback, 2 skipped"));

    let model = candle_core::safetensors::load(fixture.path("out/model.safetensors"), &Device::Cpu).unwrap();
    assert!(model.contains_key("blocks.0.fc2.weight"));
    assert!(model.contains_key("blocks.0.fc1.qweight"));

    let summary = read_summary(&fixture.path("out/quantization.json"));
    assert_eq!(summary["layers"]["blocks.1.fc2"]["status"], "skipped");
}

#[test]
fn test_inspect_quantized_model() {
    let fixture = Fixture::new(MIXED_CONFIG);
    assert_success(&fixture.quantize(&[]), "quantize");

    let output = gptq_cli()
        .args(["inspect", "--model", fixture.arg("out/model.safetensors").as_str()])
        .output()
        .expect("Failed to run gptq inspect");
    assert_success(&output, "inspect");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("blocks.0.fc1 [16x8] Int bits=4 group_size=4 groups=2"));
    assert!(stdout.contains("blocks.1.fc2 [8x16] Int bits=8 group_size=row groups=1 sym=true act_order=true"));
    assert!(stdout.contains("4 packed layer(s), 1 dense tensor(s)"));
}

#[test]
fn test_quantize_requires_config() {
    let fixture = Fixture::new("{}");
    let output = gptq_cli()
        .args([
            "quantize",
            "--model", fixture.arg("model.safetensors").as_str(),
            "--calibration", fixture.arg("calibration.safetensors").as_str(),
        ])
        .output()
        .expect("Failed to run gptq");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--config is required"), "stderr: {}", stderr);
}

#[test]
fn test_quantize_rejects_non_safetensors_model() {
    let fixture = Fixture::new("{}");
    fs::write(fixture.path("model.bin"), b"not a model").unwrap();
    let output = gptq_cli()
        .args([
            "quantize",
            "--model", fixture.arg("model.bin").as_str(),
            "--calibration", fixture.arg("calibration.safetensors").as_str(),
            "--config", fixture.arg("config.json").as_str(),
        ])
        .output()
        .expect("Failed to run gptq");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Expected .safetensors file"), "stderr: {}", stderr);
}
