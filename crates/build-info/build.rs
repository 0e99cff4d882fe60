use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=CELLBLOCK_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=.git/HEAD");

    if let Some(path) = git_ref_path() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("CELLBLOCK_BUILD_ID_OVERRIDE")
        .ok()
        .unwrap_or_else(|| format!("{} | {}", revision, build_time));

    println!("cargo:rustc-env=CELLBLOCK_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=CELLBLOCK_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=CELLBLOCK_BUILD_REV={}", revision);
}

fn git_ref_path() -> Option<String> {
    let head = fs::read_to_string(".git/HEAD").ok()?;
    let reference = head.strip_prefix("ref: ")?.trim();
    let path = format!(".git/{}", reference);
    Path::new(&path).exists().then_some(path)
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!rev.is_empty()).then_some(rev)
}
