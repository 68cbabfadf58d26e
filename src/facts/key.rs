use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Identity of one function occurrence across translation units.
///
/// Two occurrences are the same function iff all four fields are equal. No
/// normalization happens here; `unit_path` must already be root-relative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub unit_path: String,
    pub signature: String,
    pub begin_line: u32,
    pub end_line: u32,
}

impl FunctionKey {
    pub fn new(
        unit_path: impl Into<String>,
        signature: impl Into<String>,
        begin_line: u32,
        end_line: u32,
    ) -> Self {
        Self {
            unit_path: unit_path.into(),
            signature: signature.into(),
            begin_line,
            end_line,
        }
    }

    /// The absent key. Never persisted.
    pub fn sentinel() -> Self {
        Self {
            unit_path: String::new(),
            signature: String::new(),
            begin_line: 1,
            end_line: 0,
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.begin_line <= self.end_line
    }

    /// Rewrites an absolute path under `root` to its root-relative form.
    /// Absolute paths outside `root` turn the key into the sentinel; relative
    /// paths are kept as they are.
    pub fn rebased(self, root: &Path) -> Self {
        if !self.is_concrete() {
            return self;
        }
        let path = Path::new(&self.unit_path);
        if !path.is_absolute() {
            return self;
        }
        match path.strip_prefix(root) {
            Ok(rest) if !rest.as_os_str().is_empty() => Self {
                unit_path: rest.to_string_lossy().into_owned(),
                ..self
            },
            _ => Self::sentinel(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{} `{}`",
            self.unit_path, self.begin_line, self.end_line, self.signature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::FunctionKey;
    use std::path::Path;

    #[test]
    fn concrete_requires_ordered_lines() {
        assert!(FunctionKey::new("a.cpp", "f()", 3, 3).is_concrete());
        assert!(FunctionKey::new("a.cpp", "f()", 3, 9).is_concrete());
        assert!(!FunctionKey::new("a.cpp", "f()", 9, 3).is_concrete());
        assert!(!FunctionKey::sentinel().is_concrete());
    }

    #[test]
    fn equality_is_exact_on_all_fields() {
        let base = FunctionKey::new("a.cpp", "f()", 1, 5);
        assert_eq!(base, FunctionKey::new("a.cpp", "f()", 1, 5));
        assert_ne!(base, FunctionKey::new("a.cpp", "f() const", 1, 5));
        assert_ne!(base, FunctionKey::new("b.cpp", "f()", 1, 5));
        assert_ne!(base, FunctionKey::new("a.cpp", "f()", 1, 6));
    }

    #[test]
    fn rebase_strips_root_and_drops_outsiders() {
        let root = Path::new("/src/tree");
        let inside = FunctionKey::new("/src/tree/dom/base.cpp", "f()", 1, 2).rebased(root);
        assert_eq!(inside.unit_path, "dom/base.cpp");
        assert!(inside.is_concrete());

        let outside = FunctionKey::new("/usr/include/vector", "g()", 1, 2).rebased(root);
        assert!(!outside.is_concrete());

        let relative = FunctionKey::new("dom/base.cpp", "f()", 1, 2).rebased(root);
        assert_eq!(relative.unit_path, "dom/base.cpp");
    }
}
