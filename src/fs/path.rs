//! 虚拟路径工具。所有路径都按 `/` 分隔，`.` 和空段被丢弃，`..` 在根目录处停住。

/// 规范化为路径分量列表，根目录为空列表
pub fn normalize(path: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            name => stack.push(name.to_string()),
        }
    }
    stack
}

pub fn to_absolute<S: AsRef<str>>(components: &[S]) -> String {
    let mut out = String::from("/");
    let joined = components
        .iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join("/");
    out.push_str(&joined);
    out
}

/// 规范化为绝对路径
pub fn absolute(path: &str) -> String {
    to_absolute(&normalize(path))
}

/// 相对 `cwd` 解析路径，`~` 展开为 `home`
pub fn resolve(path: &str, cwd: &str, home: &str) -> String {
    if path.is_empty() {
        return absolute(cwd);
    }
    let expanded = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("{}{}", home, rest),
        _ => path.to_string(),
    };
    if expanded.starts_with('/') {
        absolute(&expanded)
    } else {
        absolute(&format!("{}/{}", cwd, expanded))
    }
}

/// 拆成 (父路径, 名字)，根目录没有父路径
pub fn split_parent(path: &str) -> Option<(String, String)> {
    let mut components = normalize(path);
    let name = components.pop()?;
    Some((to_absolute(&components), name))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert!(normalize("/").is_empty());
        assert!(normalize("").is_empty());
        assert_eq!(normalize("/a//b/./c/"), vec!["a", "b", "c"]);
        assert_eq!(normalize("/a/b/../c"), vec!["a", "c"]);
        assert!(normalize("/../..").is_empty());
        assert_eq!(absolute("a/b/.."), "/a");
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("docs", "/home/guest", "/home/guest"), "/home/guest/docs");
        assert_eq!(resolve("../x", "/home/guest", "/home/guest"), "/home/x");
        assert_eq!(resolve("/etc", "/home/guest", "/home/guest"), "/etc");
        assert_eq!(resolve("~", "/", "/home/amy"), "/home/amy");
        assert_eq!(resolve("~/notes", "/", "/home/amy"), "/home/amy/notes");
        assert_eq!(resolve("~bob", "/tmp", "/home/amy"), "/tmp/~bob");
        assert_eq!(resolve("", "/var/", "/home/amy"), "/var");
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_parent("/a/b/c.txt"), Some(("/a/b".to_string(), "c.txt".to_string())));
        assert_eq!(split_parent("/a"), Some(("/".to_string(), "a".to_string())));
        assert_eq!(split_parent("/"), None);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
