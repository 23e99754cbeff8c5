//! Request path helpers.

/// Rewrites a request path for the upstream by stripping the mount point.
///
/// `/solr/x` under mount `/solr` becomes `/x`; `/solr` exactly strips to the
/// empty path, which serialises as `/` on the wire.
pub fn strip_mount_prefix(path: &str, mount_point: &str) -> String {
    let stripped = path.strip_prefix(mount_point).unwrap_or(path);
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

/// Builds the upstream path-and-query for a request under a mount point.
pub fn upstream_path_and_query(path: &str, query: Option<&str>, mount_point: &str) -> String {
    let mut out = strip_mount_prefix(path, mount_point);
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Escapes `& < > " '` so untrusted paths can be embedded in error messages.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            _ => out.push(c),
        }
    }
    out
}
