use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute, slash-separated namespace path. Always starts with `/`, never
/// ends with one except for the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NsPath(String);

impl NsPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let trimmed = path.as_ref().trim_end_matches('/');
        if trimmed.is_empty() {
            return Self::root();
        }
        if trimmed.starts_with('/') {
            Self(trimmed.to_string())
        } else {
            Self(format!("/{}", trimmed))
        }
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn join(&self, name: &str) -> NsPath {
        if self.is_root() {
            NsPath(format!("/{}", name))
        } else {
            NsPath(format!("{}/{}", self.0, name))
        }
    }

    /// Last path component, empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn split_parent_name(&self) -> Option<(NsPath, String)> {
        if self.is_root() {
            return None;
        }
        let idx = self.0.rfind('/')?;
        let parent = if idx == 0 {
            NsPath::root()
        } else {
            NsPath(self.0[..idx].to_string())
        };
        Some((parent, self.0[idx + 1..].to_string()))
    }
}

impl fmt::Display for NsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NsPath {
    fn from(value: String) -> Self {
        NsPath::new(value)
    }
}

impl From<NsPath> for String {
    fn from(value: NsPath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(NsPath::new("").as_str(), "/");
        assert_eq!(NsPath::new("/").as_str(), "/");
        assert_eq!(NsPath::new("a/b/").as_str(), "/a/b");
        assert_eq!(NsPath::new("/a/b").as_str(), "/a/b");
    }

    #[test]
    fn test_join_and_split() {
        let root = NsPath::root();
        let a = root.join("a");
        assert_eq!(a.as_str(), "/a");
        let b = a.join("b.txt");
        assert_eq!(b.as_str(), "/a/b.txt");
        assert_eq!(b.name(), "b.txt");

        let (parent, name) = b.split_parent_name().unwrap();
        assert_eq!(parent, a);
        assert_eq!(name, "b.txt");

        let (parent, name) = a.split_parent_name().unwrap();
        assert!(parent.is_root());
        assert_eq!(name, "a");
        assert!(root.split_parent_name().is_none());
    }
}
