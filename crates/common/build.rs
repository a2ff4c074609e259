use std::{env, fs, path::PathBuf, process::Command};

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-env-changed=RELAY_GIT_SHA");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let version = env::var("CARGO_PKG_VERSION")?;
    let git_sha = env::var("RELAY_GIT_SHA")
        .ok()
        .filter(|sha| !sha.trim().is_empty())
        .or_else(|| git(&["rev-parse", "--short", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_string());
    let dirty = git(&["status", "--porcelain"]).is_some_and(|out| !out.is_empty());
    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let dest = PathBuf::from(env::var("OUT_DIR")?).join("version.rs");
    fs::write(
        dest,
        format!(
            "pub const VERSION: &str = {version:?};\n\
             pub const GIT_SHA: &str = {git_sha:?};\n\
             pub const GIT_DIRTY: bool = {dirty};\n\
             pub const BUILD_TIMESTAMP: &str = {built_at:?};\n"
        ),
    )?;
    Ok(())
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
