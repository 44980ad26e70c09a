use std::env;

use vergen_git2::Emitter;
use vergen_git2::Git2Builder;

fn main() {
    // builds from a source tarball have no git metadata, the version then
    // falls back to "unknown"
    if let Err(err) = emit_commit() {
        println!("cargo:warning=no git metadata: {err}");
    }

    println!(
        "cargo:rustc-env=IMAGE_VERSION={}",
        env::var("VERSION").unwrap_or_else(|_| "latest".to_string())
    );
    println!("cargo:rerun-if-env-changed=VERSION");
}

/// Emits `VERGEN_GIT_SHA` and `VERGEN_GIT_DIRTY`.
fn emit_commit() -> anyhow::Result<()> {
    let git = Git2Builder::default().sha(true).dirty(true).build()?;

    Emitter::default()
        .fail_on_error()
        .add_instructions(&git)?
        .emit()
}
