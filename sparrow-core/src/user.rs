//! Local user and share description. The file list is plain data; no listing format is parsed here.

use serde::{Deserialize, Serialize};

/// Share size announced when nothing else is configured (95 GiB).
pub const DEFAULT_SHARE_SIZE: u64 = 95 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub nick: String,
    pub share_size: u64,
    #[serde(default)]
    pub file_list: Option<FileList>,
}

impl User {
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            share_size: DEFAULT_SHARE_SIZE,
            file_list: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub directories: Vec<Directory>,
    #[serde(default)]
    pub files: Vec<File>,
}

impl FileList {
    /// Sum of all file sizes, recursively.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.directories.iter().map(Directory::total_size).sum::<u64>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub directories: Vec<Directory>,
}

impl Directory {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.directories.iter().map(Directory::total_size).sum::<u64>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub size: u64,
    /// Tiger tree hash, base32.
    pub tth: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_has_default_share() {
        let u = User::new("alice");
        assert_eq!(u.share_size, DEFAULT_SHARE_SIZE);
        assert!(u.file_list.is_none());
    }

    #[test]
    fn total_size_recurses() {
        let file = |name: &str, size| File {
            name: name.into(),
            size,
            tth: String::new(),
        };
        let list = FileList {
            files: vec![file("a", 1)],
            directories: vec![Directory {
                name: "music".into(),
                files: vec![file("b", 10)],
                directories: vec![Directory {
                    name: "live".into(),
                    files: vec![file("c", 100)],
                    directories: vec![],
                }],
            }],
        };
        assert_eq!(list.total_size(), 111);
    }
}
