//! POSIX path helpers for paths inside a sandbox.
//!
//! Sandbox paths are always `/`-separated regardless of the host platform, so
//! these never go through `std::path`.

use sandbox_explorer_error::SandboxError;

pub const ROOT: &str = "/";

/// Strips trailing slashes, keeping `/` itself.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        ROOT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validates a user-chosen root directory.
pub fn normalize_root(path: &str) -> Result<String, SandboxError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(SandboxError::invalid("directory path cannot be empty"));
    }
    if !path.starts_with('/') {
        return Err(SandboxError::invalid("directory path must start with /"));
    }
    Ok(normalize(path))
}

pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(index) => Some(path[..index].to_string()),
        None => None,
    }
}

/// `path` followed by each of its ancestors, ending with `/` for absolute paths.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut chain = vec![normalize(path)];
    while let Some(next) = chain.last().and_then(|last| parent(last)) {
        chain.push(next);
    }
    chain
}

pub fn join(directory: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    let directory = normalize(directory);
    if name.is_empty() {
        directory
    } else if directory == ROOT {
        format!("/{name}")
    } else {
        format!("{directory}/{name}")
    }
}

pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// `directory/name` for a single user-supplied entry name.
pub fn child(directory: &str, name: &str) -> Result<String, SandboxError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SandboxError::invalid("name cannot be empty"));
    }
    if name.contains('/') {
        return Err(SandboxError::invalid("name cannot contain \"/\""));
    }
    Ok(join(directory, name))
}

/// Path of `path` after renaming it to `new_name` within the same directory.
pub fn sibling(path: &str, new_name: &str) -> Result<String, SandboxError> {
    let directory = parent(path).unwrap_or_else(|| ROOT.to_string());
    child(&directory, new_name)
}

/// Wraps `value` in single quotes for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_walk_up_to_root() {
        assert_eq!(ancestors("/a/b/c"), vec!["/a/b/c", "/a/b", "/a", "/"]);
        assert_eq!(ancestors("/a/b/"), vec!["/a/b", "/a", "/"]);
        assert_eq!(ancestors("/"), vec!["/"]);
    }

    #[test]
    fn root_normalization_rejects_relative_paths() {
        assert_eq!(normalize_root("/home/user/").expect("valid"), "/home/user");
        assert_eq!(normalize_root("/").expect("valid"), "/");
        assert!(normalize_root("home").is_err());
        assert!(normalize_root("  ").is_err());
    }

    #[test]
    fn join_and_parent() {
        assert_eq!(join("/", "a.txt"), "/a.txt");
        assert_eq!(join("/home/user/", "sub/b.txt"), "/home/user/sub/b.txt");
        assert_eq!(parent("/a.txt").as_deref(), Some("/"));
        assert_eq!(parent("/home/user/a.txt").as_deref(), Some("/home/user"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/home/user/a.txt"), "a.txt");
    }

    #[test]
    fn sibling_rejects_nested_names() {
        assert_eq!(sibling("/w/old.txt", "new.txt").expect("rename"), "/w/new.txt");
        assert_eq!(sibling("/old.txt", "new.txt").expect("rename"), "/new.txt");
        assert!(sibling("/w/old.txt", "a/b").is_err());
        assert!(sibling("/w/old.txt", "").is_err());
        assert_eq!(child("/w", " new.txt ").expect("child"), "/w/new.txt");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/it's"), r"'/tmp/it'\''s'");
    }
}
