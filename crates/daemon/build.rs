// Stamps the binary with the commit it was built from (`BRIDGE_COMMIT=$(git rev-parse --short HEAD)`)

fn main() {
    println!("cargo:rerun-if-env-changed=BRIDGE_COMMIT");

    let commit = std::env::var("BRIDGE_COMMIT")
        .ok()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=BRIDGE_COMMIT={}", commit);
}
