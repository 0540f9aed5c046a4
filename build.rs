//! Build script for the DMQ node
//!
//! Embeds the git revision, build time, target and compiler version so
//! `dmq-node version` can report exactly what is running.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let rustc_version = command_output("rustc", &["--version"]);

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    for (key, value) in [
        ("DMQ_GIT_HASH", git_hash.as_str()),
        ("DMQ_GIT_BRANCH", git_branch.as_str()),
        ("DMQ_GIT_DIRTY", git_dirty.as_str()),
        ("DMQ_BUILD_TIMESTAMP", build_timestamp.as_str()),
        ("DMQ_TARGET", target.as_str()),
        ("DMQ_PROFILE", profile.as_str()),
        ("DMQ_RUSTC_VERSION", rustc_version.as_str()),
    ] {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// First line of a command's stdout, or "unknown"
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
