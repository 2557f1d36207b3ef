//! Lexical path handling and canonicalization.
//!
//! Nothing here touches the tree. All results are clean absolute paths.

/// Token in the home template replaced by the session's username.
pub const USER_PLACEHOLDER: &str = "{}";

/// Default home template.
pub const DEFAULT_HOME_TEMPLATE: &str = "/home/{}";

/// Non-empty segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Lexically clean a path as if rooted at `/`.
///
/// Collapses `//`, `.` and `..`. `..` at the root stays at the root.
pub fn clean(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in segments(path) {
        match segment {
            "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    if stack.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in stack {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Join `rel` onto the absolute `base` and clean the result.
pub fn join(base: &str, rel: &str) -> String {
    clean(&format!("{base}/{rel}"))
}

/// Split a clean absolute path into parent and base name.
///
/// `/` has no base name and yields `("/", "")`.
pub fn split_parent(abs: &str) -> (String, String) {
    match abs.rfind('/') {
        Some(0) => ("/".to_string(), abs[1..].to_string()),
        Some(idx) => (abs[..idx].to_string(), abs[idx + 1..].to_string()),
        None => ("/".to_string(), abs.to_string()),
    }
}

/// Make a username safe to splice into a path.
pub fn sanitize_username(username: &str) -> String {
    match username {
        "" | "." | ".." => "_".to_string(),
        name => name.replace('/', "_"),
    }
}

/// The literal home directory of `username` under `template`.
pub fn home_for(template: &str, username: &str) -> String {
    clean(&template.replace(USER_PLACEHOLDER, &sanitize_username(username)))
}

/// If `path` equals `prefix` or lies below it, return the remainder (`""` or `/rest`).
fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') || prefix == "/" {
        Some(rest)
    } else {
        None
    }
}

/// Resolve a raw path to its canonical absolute form.
///
/// `cwd` must already be canonical. The session user's literal home is
/// rewritten to the template so every session addresses one shared home node.
pub fn canonicalize(raw: &str, cwd: &str, username: &str, template: &str) -> String {
    if raw.is_empty() {
        return "/".to_string();
    }

    let mut p = raw;
    if p.len() > 1 && p.ends_with('/') {
        p = &p[..p.len() - 1];
    }

    let joined = if let Some(tilde) = p.strip_prefix('~') {
        let (who, rest) = match tilde.find('/') {
            Some(idx) => (&tilde[..idx], &tilde[idx..]),
            None => (tilde, ""),
        };
        let user = if who.is_empty() { username } else { who };
        format!("{}{}", home_for(template, user), rest)
    } else if !p.starts_with('/') {
        // `.`, `./x`, `..`, `../x` and bare names all hang off cwd
        format!("{cwd}/{p}")
    } else {
        p.to_string()
    };

    let cleaned = clean(&joined);
    if cleaned == "/" {
        return cleaned;
    }

    let canonical_home = clean(template);
    let literal_home = home_for(template, username);
    if literal_home != canonical_home {
        if let Some(rest) = strip_dir_prefix(&cleaned, &literal_home) {
            return format!("{canonical_home}{rest}");
        }
    }
    cleaned
}

/// Reverse of the home rewrite: show a canonical path the way the user would see it.
pub fn display(canonical: &str, username: &str, template: &str) -> String {
    let canonical_home = clean(template);
    match strip_dir_prefix(canonical, &canonical_home) {
        Some(rest) if canonical_home != "/" => format!("{}{}", home_for(template, username), rest),
        _ => canonical.to_string(),
    }
}

/// Prompt form: the user's home collapses to `~`.
pub fn tilde_display(canonical: &str, username: &str, template: &str) -> String {
    let canonical_home = clean(template);
    if canonical_home == "/" {
        return canonical.to_string();
    }
    match strip_dir_prefix(canonical, &canonical_home) {
        Some(rest) => format!("~{rest}"),
        None => display(canonical, username, template),
    }
}
