use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Build identifier baked into the binary as `GIT_HASH`.
/// Container builds have no `.git`, so they pass `LEDGER_BUILD_REV` instead.
fn build_rev() -> String {
    if let Ok(rev) = std::env::var("LEDGER_BUILD_REV") {
        if !rev.is_empty() {
            return rev;
        }
    }
    let Some(hash) = git(&["rev-parse", "--short=10", "HEAD"]) else {
        return "unknown".to_string();
    };
    // Tracked changes only; scratch files do not mark a build dirty
    match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(changes) if !changes.is_empty() => format!("{hash}+dirty"),
        _ => hash,
    }
}

fn main() {
    println!("cargo:rustc-env=GIT_HASH={}", build_rev());
    println!("cargo:rerun-if-env-changed=LEDGER_BUILD_REV");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
