//! Filesystem adapter
//!
//! Path and file helpers behind the download pipeline: sanitizing server
//! supplied filenames, discovering the platform download folder, mapping MIME
//! types to extensions, measuring partial files and replacing destinations
//! atomically.

use std::path::{Path, PathBuf};

/// Characters never allowed in a filename on any supported platform.
const INVALID_CHARS: &str = "<>:\"/\\|?*";

/// Replaces control characters and reserved filename characters with `_`.
pub fn remove_invalid_chars(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_CHARS.contains(c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    sanitized.trim().to_string()
}

/// Platform download folder, when the platform exposes one.
pub fn download_folder() -> Option<PathBuf> {
    dirs::download_dir()
}

/// Preferred file extension for a MIME type, without the leading dot.
pub fn extension_for_mime(media_type: &str) -> Option<&'static str> {
    mime_guess::get_mime_extensions_str(media_type)
        .and_then(|exts| exts.first())
        .copied()
}

/// Length of the file at `path`, or 0 when it does not exist.
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Moves `src` over `dst`, replacing any existing file.
pub async fn atomic_move(src: &Path, dst: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(dst).await.unwrap_or(false) {
        tokio::fs::remove_file(dst).await?;
    }
    tokio::fs::rename(src, dst).await
}

/// Picks a name that collides with nothing in `dir` or `temp_dir`, counting
/// up through `name(1).ext`, `name(2).ext`, …
pub fn free_file_name(dir: &Path, temp_dir: &Path, name: &str) -> String {
    let taken = |candidate: &str| {
        dir.join(candidate).exists() || temp_dir.join(part_name(candidate)).exists()
    };
    if !taken(name) {
        return name.to_string();
    }

    let (stem, ext) = split_name(name);
    for i in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{}({}).{}", stem, i, ext),
            None => format!("{}({})", stem, i),
        };
        if !taken(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// Temporary-part filename for a single-stream download.
pub fn part_name(file_name: &str) -> String {
    format!("{}.part", file_name)
}

/// Temporary-part filename for chunk `index` of a chunked download.
pub fn chunk_name(file_name: &str, index: usize) -> String {
    format!("{}_{}.chunk", file_name, index)
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_invalid_chars() {
        assert_eq!(remove_invalid_chars("movie: part 1/2?.mkv"), "movie_ part 1_2_.mkv");
        assert_eq!(remove_invalid_chars("plain.txt"), "plain.txt");
        assert_eq!(remove_invalid_chars("tab\there"), "tab_here");
    }

    #[test]
    fn test_extension_for_mime() {
        assert!(extension_for_mime("text/html").is_some());
        assert_eq!(extension_for_mime("application/x-not-a-thing"), None);
    }

    #[test]
    fn test_part_and_chunk_names() {
        assert_eq!(part_name("video.mp4"), "video.mp4.part");
        assert_eq!(chunk_name("video.mp4", 2), "video.mp4_2.chunk");
    }

    #[test]
    fn test_free_file_name_counts_up() {
        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("data(1).bin"), b"x").unwrap();
        assert_eq!(
            free_file_name(dir.path(), temp.path(), "data.bin"),
            "data(2).bin"
        );
        assert_eq!(
            free_file_name(dir.path(), temp.path(), "other.bin"),
            "other.bin"
        );
    }

    #[test]
    fn test_free_file_name_sees_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("data.bin.part"), b"x").unwrap();
        assert_eq!(
            free_file_name(dir.path(), temp.path(), "data.bin"),
            "data(1).bin"
        );
    }

    #[tokio::test]
    async fn test_atomic_move_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        tokio::fs::write(&src, b"new").await.unwrap();
        tokio::fs::write(&dst, b"old").await.unwrap();

        atomic_move(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new");
        assert!(!src.exists());
    }
}
