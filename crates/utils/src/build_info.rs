use std::fmt;

/// Git state of the tree the binary was built from.
pub(crate) struct BuildInfo {
    commit_sha1: Option<&'static str>,
    git_dirty: bool,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: match option_env!("VERGEN_GIT_DIRTY") {
        Some(dirty) => matches!(dirty.as_bytes(), b"true"),
        None => false,
    },
};

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.commit_sha1.unwrap_or("unknown"))?;
        if self.git_dirty {
            f.write_str("-dirty")?;
        }
        Ok(())
    }
}
