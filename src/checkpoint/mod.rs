//! Checkpoint module for resumable stage execution.
//!
//! Provides:
//! - `TableStore`: loading (with resume) and atomic per-row persistence of record tables
//! - `write_atomic`: replace a file so readers see either the old or the new content

mod table;

pub use table::*;

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `content` through a uniquely named temp file in the
/// same directory, so concurrent writers never share a temp file.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::Barrier;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs_x.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_writers_never_install_mixed_content() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("jobs_x.json"));
        let barrier = Arc::new(Barrier::new(4));

        let writers: Vec<_> = (0..4u8)
            .map(|n| {
                let path = Arc::clone(&path);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let content = vec![b'a' + n; 64 * 1024];
                    barrier.wait();
                    for _ in 0..20 {
                        write_atomic(&path, &content).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let content = fs::read(&*path).unwrap();
        assert_eq!(content.len(), 64 * 1024);
        assert!(content.iter().all(|b| *b == content[0]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
