//! Destination paths and content hashing

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ferry_security::strip_bidi_controls;

/// Suffix for bytes still in transit.
pub const PARTIAL_SUFFIX: &str = ".part";

const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Reduce a server- or page-supplied name to a single safe path component.
pub fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = strip_bidi_controls(file_name)
        .chars()
        .map(|c| {
            if RESERVED.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let name = cleaned
        .trim_start_matches(|c: char| c.is_whitespace() || c == '.')
        .trim_end_matches(|c: char| c.is_whitespace() || c == '.');
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// First of `name`, `stem (1).ext`, `stem (2).ext`, ... in `dir` that is
/// neither on disk nor in `taken`.
pub fn unique_destination(dir: &Path, name: &str, taken: &HashSet<PathBuf>) -> PathBuf {
    let is_free = |candidate: &Path| {
        !taken.contains(candidate) && !candidate.exists() && !partial_path(candidate).exists()
    };

    let first = dir.join(name);
    if is_free(&first) {
        return first;
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if is_free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub async fn compute_sha256_hex(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];

        loop {
            let n = std::io::Read::read(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        Ok(out)
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::other(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a:b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_file_name("invoice\u{202E}fdp.exe"), "invoicefdp.exe");
        assert_eq!(sanitize_file_name("   "), "download");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("payload.scr."), "payload.scr");
        assert_eq!(sanitize_file_name("invoice.pdf.exe . "), "invoice.pdf.exe");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/file.zip")),
            PathBuf::from("/tmp/file.zip.part")
        );
    }

    #[test]
    fn test_unique_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut taken = HashSet::new();

        let first = unique_destination(dir.path(), "file.zip", &taken);
        assert_eq!(first, dir.path().join("file.zip"));

        std::fs::write(&first, b"x").unwrap();
        let second = unique_destination(dir.path(), "file.zip", &taken);
        assert_eq!(second, dir.path().join("file (1).zip"));

        taken.insert(second.clone());
        let third = unique_destination(dir.path(), "file.zip", &taken);
        assert_eq!(third, dir.path().join("file (2).zip"));

        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "README", &taken),
            dir.path().join("README (1)")
        );
    }

    #[tokio::test]
    async fn test_compute_sha256_hex() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("abc.txt");
        std::fs::write(&file, b"abc").unwrap();

        assert_eq!(
            compute_sha256_hex(file).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(compute_sha256_hex(dir.path().join("missing")).await.is_err());
    }
}
