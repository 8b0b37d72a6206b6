// ABOUTME: File classification, transport encoding, and directory listing helpers
// ABOUTME: Binary files travel as base64, text as lossy UTF-8; listings are parsed from find output

use base64::Engine;
use std::path::Path;

use super::{quote, relative_to_home};
use crate::error::Result;
use crate::types::{FileContent, FileKind, FileMetadata};

/// Extensions treated as binary for transport encoding
pub const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "lib", "obj", "o", "zip", "tar", "gz", "bz2", "xz", "7z",
    "rar", "jpg", "jpeg", "png", "gif", "bmp", "ico", "tiff", "webp", "svg", "mp4", "avi", "mkv",
    "mov", "wmv", "flv", "webm", "mp3", "wav", "flac", "ogg", "wma", "aac", "pdf", "doc", "docx",
    "xls", "xlsx", "ppt", "pptx", "bin", "dat", "db", "sqlite", "sqlite3", "woff", "woff2", "ttf",
    "otf", "eot", "class", "jar", "war", "ear", "pyc", "pyo", "pyd",
];

/// Paths hidden from `list_files` (find `-path`/`-name` patterns)
pub const LIST_EXCLUDED_PATHS: &[&str] = &[
    "*/node_modules/*",
    "*/node_modules",
    "*/.*",
    "*/__pycache__/*",
    "*/__pycache__",
    "*.pyc",
    "*.log",
    "*/dist/*",
    "*/dist",
    "*/build/*",
    "*/build",
    "package-lock.json",
    "*/package-lock.json",
    "bun.lock",
    "*/bun.lock",
];

pub fn is_binary_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            BINARY_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Encode raw bytes for the client according to the path's classification.
pub fn encode_file_content(path: &str, bytes: &[u8]) -> FileContent {
    let is_binary = is_binary_path(path);
    let content = if is_binary {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    FileContent {
        path: path.to_string(),
        content,
        is_binary,
    }
}

/// Build the `find` invocation that lists `root` with size and mtime.
pub fn list_files_command(root: &str, excluded: &[&str]) -> Result<String> {
    let mut parts = vec!["find".to_string(), quote(root)?];
    for pattern in excluded {
        let test = if pattern.starts_with("*.") {
            "-name"
        } else {
            "-path"
        };
        parts.push(format!("-not {} {}", test, quote(pattern)?));
    }
    parts.push("-printf '%p\\t%y\\t%s\\t%T@\\n'".to_string());
    Ok(parts.join(" "))
}

/// Parse tab-separated `find -printf` output into home-relative metadata.
pub fn parse_find_output(stdout: &str, home: &str) -> Vec<FileMetadata> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let full_path = fields.next()?;
            let kind = fields.next()?;
            let size = fields.next()?;
            let mtime = fields.next()?;

            let path = relative_to_home(full_path, home);
            if path.is_empty() {
                return None;
            }

            let kind = match kind {
                "f" => FileKind::File,
                "d" => FileKind::Directory,
                _ => return None,
            };
            let modified = mtime.parse::<f64>().unwrap_or(0.0);

            Some(FileMetadata {
                path: path.to_string(),
                kind,
                size: if kind == FileKind::File {
                    size.parse().unwrap_or(0)
                } else {
                    0
                },
                modified,
                is_binary: kind == FileKind::File && is_binary_path(path),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_binary_classification() {
        assert!(is_binary_path("assets/logo.PNG"));
        assert!(is_binary_path("/home/user/db.sqlite3"));
        assert!(!is_binary_path("src/main.rs"));
        assert!(!is_binary_path("Makefile"));
    }

    #[test]
    fn test_encode_file_content() {
        let text = encode_file_content("notes.txt", b"hi \xff there");
        assert!(!text.is_binary);
        assert_eq!(text.content, "hi \u{fffd} there");

        let bin = encode_file_content("pic.png", &[0, 1, 2, 255]);
        assert!(bin.is_binary);
        assert_eq!(bin.content, "AAEC/w==");
    }

    #[test]
    fn test_list_files_command_uses_name_for_extension_patterns() {
        let cmd = list_files_command("/home/user", &["*.pyc", "*/dist"]).unwrap();
        assert!(cmd.starts_with("find /home/user "));
        assert!(cmd.contains("-not -name '*.pyc'"));
        assert!(cmd.contains("-not -path '*/dist'"));
        assert!(cmd.ends_with("-printf '%p\\t%y\\t%s\\t%T@\\n'"));
    }

    #[test]
    fn test_parse_find_output() {
        let stdout = "/home/user\td\t4096\t1700000000.5\n\
                      /home/user/app\td\t4096\t1700000001.0\n\
                      /home/user/app/index.ts\tf\t120\t1700000002.25\n\
                      /home/user/app/logo.png\tf\t900\tbogus\n\
                      /home/user/link\tl\t10\t1700000003.0\n\
                      short line\n";
        let items = parse_find_output(stdout, "/home/user");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].path, "app");
        assert_eq!(items[0].kind, FileKind::Directory);
        assert_eq!(items[0].size, 0);
        assert_eq!(items[1].path, "app/index.ts");
        assert_eq!(items[1].size, 120);
        assert!(!items[1].is_binary);
        assert!(items[2].is_binary);
        assert_eq!(items[2].modified, 0.0);
    }
}
