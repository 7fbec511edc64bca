//! Project-path escaping for the Claude store.
//!
//! Claude Code names project directories by replacing every
//! non-alphanumeric character of the absolute project path with `-`. The
//! mapping is lossy (`/a/b` and `/a-b` collide), so readers must prefer
//! the `projectPath` field stored inside `sessions-index.json`;
//! [`unescape_lossy`] exists for display fallbacks only.

/// Escape a project path the way the store does. Idempotent after the
/// first application: escaping an escaped path returns it unchanged.
pub fn escape_project_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Best-effort inverse for display purposes. Dashes become `/`, which is
/// wrong for paths that contained literal dashes; never use this to
/// locate files.
pub fn unescape_lossy(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    for c in escaped.chars() {
        out.push(if c == '-' { '/' } else { c });
    }
    // Collapse the leading run produced by the root slash.
    while out.starts_with("//") {
        out.remove(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_non_alphanumerics() {
        assert_eq!(escape_project_path("/home/u/my proj"), "-home-u-my-proj");
        assert_eq!(escape_project_path("/a/b_c.d"), "-a-b-c-d");
    }

    #[test]
    fn escape_is_idempotent_after_first_application() {
        for path in ["/home/u/proj", "/tmp/x-y", "C:\\work\\repo", "already-escaped"] {
            let once = escape_project_path(path);
            assert_eq!(escape_project_path(&once), once);
            // The round-trip law: escape(unescape(escape(p))) == escape(p).
            assert_eq!(escape_project_path(&unescape_lossy(&once)), once);
        }
    }

    #[test]
    fn unescape_is_lossy_by_design() {
        // A dash in the original path cannot be distinguished from a
        // separator; this is exactly why the index's projectPath wins.
        let escaped = escape_project_path("/srv/my-app");
        assert_eq!(unescape_lossy(&escaped), "/srv/my/app");
    }
}
