static NETWORKS: &[(&[&str], &[&str])] = &[
    (&["mainnet"], &[]),
    (&["calibrationnet"], &["fast-confidence"]),
    (&["devnet", "testing"], &["short-durations", "fast-confidence"]),
];
const NETWORK_ENV: &str = "BUILD_FIL_NETWORK";

/// Enables _local_ compile features selecting the policy defaults of a network. These features
/// do not affect the dependency graph, they only drive conditional compilation in this crate.
fn main() {
    let network = std::env::var(NETWORK_ENV).ok();
    println!("cargo:rerun-if-env-changed={}", NETWORK_ENV);

    let network = network.as_deref().unwrap_or("mainnet");
    let features = NETWORKS.iter().find(|(k, _)| k.contains(&network)).expect("unknown network").1;
    for feature in features {
        println!("cargo:rustc-cfg=feature=\"{}\"", feature);
    }
}
