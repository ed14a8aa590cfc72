use std::process::Command;

fn git(args: &[&str]) -> Option<std::process::Output> {
    Command::new("git").args(args).output().ok().filter(|o| o.status.success())
}

fn main() {
    let git_hash = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(out) => {
            let mut hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if git(&["diff", "--quiet"]).is_none() {
                hash.push_str("-dirty");
            }
            hash
        }
        // Builds from a source tarball have no repository
        None => "unknown".to_string(),
    };

    println!("cargo:rustc-env=GIT_HASH={git_hash}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
