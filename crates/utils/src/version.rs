use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// `<image version>-<commit>[-dirty]`, printed by `--version` and at startup.
pub static VERSION: LazyLock<String> =
    LazyLock::new(|| format!("{}-{BUILD_INFO}", env!("IMAGE_VERSION")));
