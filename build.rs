//! Build script for portly
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `portly --version`.

fn main() {
    // Re-run build if the packager overrides the default state directory
    println!("cargo:rerun-if-env-changed=PORTLY_SYSTEM_STATE_DIR");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
