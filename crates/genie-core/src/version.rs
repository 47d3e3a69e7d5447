/// Crate version shared by every Genie binary.
pub const PACKAGE: &str = env!("CARGO_PKG_VERSION");

/// `<version>+git.<count>.<sha>[.dirty]`, stamped by `build.rs`.
pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("GENIE_GIT_COUNT"),
    ".",
    env!("GENIE_GIT_SHA"),
    env!("GENIE_GIT_DIRTY")
);
