#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const CATALOG: &str = r#"
[[types]]
name = "Person"
short = "P"

[[types.attrs]]
name = "Name"
kind = "string"
short = "N"
propagate = true

[[types.attrs]]
name = "Age"
kind = "int"
short = "A"
propagate = true

[[types.attrs]]
name = "Friends"
kind = "uid"
short = "F"
target = "Person"
"#;

const NODES: &str = "id,type,Name,Age
ann,Person,Ann,31
bob,Person,Bob,
cy,Person,Cy,7
dee,Person,Dee,52
";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(edges: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("catalog.toml"), CATALOG).unwrap();
        fs::write(dir.path().join("config.toml"), "embedded_threshold = 1\n").unwrap();
        fs::write(dir.path().join("nodes.csv"), NODES).unwrap();
        fs::write(dir.path().join("edges.csv"), edges).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("rowgraph");
        cmd.env_remove("ROWGRAPH_CONFIG")
            .env("RUST_LOG", "off")
            .arg("--config")
            .arg(self.path("config.toml"))
            .arg("--catalog")
            .arg(self.path("catalog.toml"))
            .arg("--nodes")
            .arg(self.path("nodes.csv"))
            .arg("--edges")
            .arg(self.path("edges.csv"))
            .arg("--quiet");
        cmd
    }
}

#[test]
fn summary_counts_attached_and_rejected_edges() {
    let fixture = Fixture::new(
        "child,parent,predicate
bob,ann,Friends
cy,ann,Friends
dee,ann,Friends
bob,ann,Friends
",
    );
    let output = fixture
        .cmd()
        .args(["--format", "json", "--show", "ann:Friends"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["nodes"], 4);
    assert_eq!(json["edges"], 4);
    assert_eq!(json["attached"], 3);
    assert_eq!(json["rejected"], 1);
    assert_eq!(json["failed"], 0);
    assert_eq!(json["overflow_rows"], 1);
    let children: Vec<&str> = json["children"][0]["children"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(children, vec!["bob", "cy", "dee"]);
}

#[test]
fn text_summary_is_default() {
    let fixture = Fixture::new("child,parent,predicate\nbob,ann,Friends\n");
    let output = fixture.cmd().assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("attached:       1"), "{text}");
    assert!(text.contains("rejected:       0"), "{text}");
}

#[test]
fn unknown_predicate_counts_as_failure() {
    let fixture = Fixture::new("child,parent,predicate\nbob,ann,Enemies\n");
    let output = fixture
        .cmd()
        .args(["--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["failed"], 1);
    assert_eq!(json["attached"], 0);
}

#[test]
fn unknown_node_id_is_an_error() {
    let fixture = Fixture::new("child,parent,predicate\nzed,ann,Friends\n");
    let output = fixture.cmd().assert().failure().get_output().stderr.clone();
    let stderr = String::from_utf8(output).unwrap();
    assert!(stderr.contains("unknown node id zed"), "{stderr}");
}

#[test]
fn bad_catalog_is_reported_with_path() {
    let fixture = Fixture::new("child,parent,predicate\n");
    fs::write(fixture.path("catalog.toml"), "[[types]]\nname = 3\n").unwrap();
    let output = fixture.cmd().assert().failure().get_output().stderr.clone();
    let stderr = String::from_utf8(output).unwrap();
    assert!(stderr.contains("catalog.toml"), "{stderr}");
}
