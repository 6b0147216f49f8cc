//! Symlink remapping policy.
//!
//! When a tree containing symlinks is copied, links that point back into the
//! copied tree ("internal" links) would otherwise keep referencing the
//! original location. The resolver computes the replacement link value for
//! the copy under the session policy.

/// Session-scoped remapping policy, chosen once per transfer (or per-symlink
/// when `Ask`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Remap internal links to the corresponding location in the destination
    /// tree; keep external links pointing at their original target.
    #[default]
    Target,
    /// Keep every link value byte-identical.
    NoChange,
    /// Point internal links at their fully resolved target in the source
    /// tree; keep external links unchanged.
    Source,
    /// Prompt per symlink.
    Ask,
}

impl SymlinkPolicy {
    /// The concrete rewrite for this policy, or `None` for `Ask`.
    #[must_use]
    pub fn as_rewrite(self) -> Option<LinkRewrite> {
        match self {
            SymlinkPolicy::Target => Some(LinkRewrite::Target),
            SymlinkPolicy::NoChange => Some(LinkRewrite::NoChange),
            SymlinkPolicy::Source => Some(LinkRewrite::Source),
            SymlinkPolicy::Ask => None,
        }
    }
}

/// A concrete (non-`Ask`) remapping decision for one symlink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkRewrite {
    Target,
    NoChange,
    Source,
}

/// Compute the link value to create at the destination.
///
/// * `link_value` - the original link value, verbatim
/// * `resolved_target` - absolute resolved target of the original link
/// * `is_internal` - whether `resolved_target` lies inside `source_root`
/// * `source_root` / `dest_root` - the roots of the whole transfer, not of
///   the current recursion level
/// * `dst_link` - the path of the link being created
/// * `same_device` - whether `resolved_target` and the destination share a
///   filesystem volume; when they don't, relative values fall back to
///   absolute ones
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn resolve_link(
    rewrite: LinkRewrite,
    link_value: &std::path::Path,
    resolved_target: &std::path::Path,
    is_internal: bool,
    source_root: &std::path::Path,
    dest_root: &std::path::Path,
    dst_link: &std::path::Path,
    same_device: bool,
) -> std::path::PathBuf {
    match rewrite {
        LinkRewrite::NoChange => link_value.to_path_buf(),
        LinkRewrite::Source => {
            if is_internal {
                resolved_target.to_path_buf()
            } else {
                // a link pointing outside the copied tree is assumed still
                // valid at its original location
                link_value.to_path_buf()
            }
        }
        LinkRewrite::Target => {
            let link_dir = dst_link.parent().unwrap_or(dest_root);
            if is_internal {
                let mapped = match resolved_target.strip_prefix(source_root) {
                    Ok(relative) => dest_root.join(relative),
                    Err(_) => resolved_target.to_path_buf(),
                };
                if link_value.is_absolute() {
                    mapped
                } else {
                    relative_from(&mapped, link_dir)
                }
            } else if link_value.is_absolute() {
                link_value.to_path_buf()
            } else if same_device {
                // relative link to an external target: recompute the hop from
                // the new link location to the unchanged target
                relative_from(resolved_target, link_dir)
            } else {
                resolved_target.to_path_buf()
            }
        }
    }
}

/// Express `target` relative to the directory `base`. Both must be absolute.
#[must_use]
pub fn relative_from(target: &std::path::Path, base: &std::path::Path) -> std::path::PathBuf {
    let mut target_parts = target.components().peekable();
    let mut base_parts = base.components().peekable();
    while let (Some(t), Some(b)) = (target_parts.peek(), base_parts.peek()) {
        if t != b {
            break;
        }
        target_parts.next();
        base_parts.next();
    }
    let mut relative = std::path::PathBuf::new();
    for _ in base_parts {
        relative.push("..");
    }
    for part in target_parts {
        relative.push(part);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Resolve `value` against the directory containing `link`, lexically
/// (no filesystem access). Used for dangling links that `canonicalize`
/// cannot resolve.
#[must_use]
pub fn lexical_resolve(link: &std::path::Path, value: &std::path::Path) -> std::path::PathBuf {
    let joined = if value.is_absolute() {
        value.to_path_buf()
    } else {
        link.parent()
            .unwrap_or_else(|| std::path::Path::new("/"))
            .join(value)
    };
    let mut resolved = std::path::PathBuf::new();
    for part in joined.components() {
        match part {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn resolve(
        rewrite: LinkRewrite,
        link_value: &str,
        resolved_target: &str,
        is_internal: bool,
    ) -> PathBuf {
        resolve_link(
            rewrite,
            Path::new(link_value),
            Path::new(resolved_target),
            is_internal,
            Path::new("/a"),
            Path::new("/b"),
            Path::new("/b/x"),
            true,
        )
    }

    #[test]
    fn no_change_is_byte_identical() {
        assert_eq!(
            resolve(LinkRewrite::NoChange, "../a/y", "/a/y", true),
            PathBuf::from("../a/y")
        );
    }

    #[test]
    fn source_pins_internal_links_to_the_original_tree() {
        assert_eq!(
            resolve(LinkRewrite::Source, "y", "/a/y", true),
            PathBuf::from("/a/y")
        );
        assert_eq!(
            resolve(LinkRewrite::Source, "../etc/hosts", "/etc/hosts", false),
            PathBuf::from("../etc/hosts")
        );
    }

    #[test]
    fn target_remaps_internal_relative_links() {
        // /a/x -> ../a/y copied to /b/x must resolve to /b/y
        let value = resolve(LinkRewrite::Target, "../a/y", "/a/y", true);
        assert_eq!(value, PathBuf::from("y"));
        assert_eq!(lexical_resolve(Path::new("/b/x"), &value), PathBuf::from("/b/y"));
    }

    #[test]
    fn target_remaps_internal_absolute_links() {
        assert_eq!(
            resolve(LinkRewrite::Target, "/a/sub/y", "/a/sub/y", true),
            PathBuf::from("/b/sub/y")
        );
    }

    #[test]
    fn target_keeps_external_absolute_links() {
        assert_eq!(
            resolve(LinkRewrite::Target, "/etc/hosts", "/etc/hosts", false),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn target_recomputes_external_relative_links() {
        // link /a/x -> ../etc/hosts, copy lands at /b/x
        let value = resolve(LinkRewrite::Target, "../etc/hosts", "/etc/hosts", false);
        assert_eq!(lexical_resolve(Path::new("/b/x"), &value), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn target_falls_back_to_absolute_across_volumes() {
        let value = resolve_link(
            LinkRewrite::Target,
            Path::new("../etc/hosts"),
            Path::new("/etc/hosts"),
            false,
            Path::new("/a"),
            Path::new("/mnt/usb/b"),
            Path::new("/mnt/usb/b/x"),
            false,
        );
        assert_eq!(value, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn relative_from_walks_up_and_down() {
        assert_eq!(
            relative_from(Path::new("/a/b/c"), Path::new("/a/d")),
            PathBuf::from("../b/c")
        );
        assert_eq!(
            relative_from(Path::new("/a/b"), Path::new("/a/b")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn lexical_resolve_handles_dot_segments() {
        assert_eq!(
            lexical_resolve(Path::new("/a/x"), Path::new("./sub/../y")),
            PathBuf::from("/a/y")
        );
    }

    #[test]
    fn ask_has_no_rewrite() {
        assert_eq!(SymlinkPolicy::Ask.as_rewrite(), None);
        assert_eq!(SymlinkPolicy::Target.as_rewrite(), Some(LinkRewrite::Target));
    }
}
