use std::fs;
use std::process::Command;

use genben::config::{Configuration, DEFAULT_CONFIG};
use tempfile::tempdir;

const EXE: &str = env!("CARGO_BIN_EXE_genben");

#[test]
fn config_command_writes_a_loadable_default_and_respects_force() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("conf").join("genben.toml");

    let status = Command::new(EXE)
        .args(["config", "--output-config", path.to_str().expect("path str")])
        .status()
        .expect("run genben config");
    assert!(status.success(), "CLI exited with status {status:?}");
    assert_eq!(fs::read_to_string(&path).expect("config"), DEFAULT_CONFIG);
    let config = Configuration::load(&path).expect("default configuration loads");
    assert_eq!(config.run.iterations, 5);

    fs::write(&path, "# edited\n").expect("edit config");
    let status = Command::new(EXE)
        .args(["config", "--output-config", path.to_str().expect("path str")])
        .status()
        .expect("run genben config");
    assert!(status.success());
    assert_eq!(fs::read_to_string(&path).expect("config"), "# edited\n");

    let status = Command::new(EXE)
        .args(["config", "--output-config", path.to_str().expect("path str"), "--force"])
        .status()
        .expect("run genben config --force");
    assert!(status.success());
    assert_eq!(fs::read_to_string(&path).expect("config"), DEFAULT_CONFIG);
}

#[test]
fn exec_reports_configuration_errors_and_exits_nonzero() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("bad.toml");
    fs::write(&path, "[benchmark]\ninput = \"raw-source\"\ndataset = \"*\"\n").expect("write");

    let output = Command::new(EXE)
        .current_dir(tmp.path())
        .args(["exec", "--config-file", path.to_str().expect("path str")])
        .output()
        .expect("run genben exec");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("benchmark.dataset"), "stderr: {stderr}");
    assert!(!tmp.path().join("results").exists());
}
