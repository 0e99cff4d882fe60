//! Compile-time build identification for the cellblock binaries.

use once_cell::sync::Lazy;

struct BuildMeta {
    build_id: &'static str,
    build_time: &'static str,
    revision: &'static str,
}

static META: Lazy<BuildMeta> = Lazy::new(|| BuildMeta {
    build_id: option_env!("CELLBLOCK_BUILD_ID").unwrap_or("unknown build"),
    build_time: option_env!("CELLBLOCK_BUILD_TIME").unwrap_or("unknown time"),
    revision: option_env!("CELLBLOCK_BUILD_REV").unwrap_or("unknown"),
});

/// Full build identifier, e.g. `"3f9a1c02be | 2026-10-05 15:47:12 UTC"`.
pub fn build_id() -> &'static str {
    META.build_id
}

pub fn build_timestamp() -> &'static str {
    META.build_time
}

/// Short git revision the binary was built from.
pub fn revision() -> &'static str {
    META.revision
}

/// One-line banner for `--version` output and startup logs.
pub fn banner(package: &str, version: &str) -> String {
    format!("{} {} ({})", package, version, build_id())
}
