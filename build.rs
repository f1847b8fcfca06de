use std::process::Command;

/// CI systems that export the commit under their own name.
const COMMIT_ENV_VARS: [&str; 3] = ["SOURCE_COMMIT_HASH", "GITHUB_SHA", "CI_COMMIT_SHA"];

fn main() {
    for name in COMMIT_ENV_VARS {
        println!("cargo:rerun-if-env-changed={name}");
    }
    println!("cargo:rerun-if-changed=.git/HEAD");

    let commit_hash = COMMIT_ENV_VARS
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.trim().is_empty()))
        .or_else(git_head)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=SEGMENTER_GIT_COMMIT_HASH={}", commit_hash.trim());
}

fn git_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let hash = String::from_utf8(output.stdout).ok()?;
    Some(hash.trim().to_string()).filter(|hash| !hash.is_empty())
}
