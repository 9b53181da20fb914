//! Embeds the git short hash for the version string and fails fast when a
//! GPU feature is enabled without its toolkit installed.

use std::process::Command;

fn main() {
    if let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        && output.status.success()
    {
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");

    if cfg!(feature = "cuda") && !tool_available("nvcc", &["--version"]) {
        panic!(
            "`nvcc` not found: the cuda feature needs the CUDA toolkit \
             (https://developer.nvidia.com/cuda-downloads), or build without it"
        );
    }
    if cfg!(feature = "vulkan") && !tool_available("vulkaninfo", &["--summary"]) {
        panic!(
            "`vulkaninfo` not found: the vulkan feature needs the Vulkan SDK \
             (https://vulkan.lunarg.com/), or build without it"
        );
    }
}

fn tool_available(program: &str, args: &[&str]) -> bool {
    Command::new(program).args(args).output().is_ok()
}
