//! Session directory snapshots and archives.
//!
//! Saving copies the live directory first (the chat client keeps writing to it),
//! then packs the copy as a gzip-compressed tar. Restoring goes through
//! [`safe_extract_archive`], which refuses anything that could land outside the
//! destination:
//! - Path traversal (`../`, absolute paths, Windows drive prefixes)
//! - Symlink/hardlink entries
//! - Resource exhaustion (too many files / too much total content)

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Component, Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder};
use zip::ZipArchive;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct ExtractLimits {
    /// Maximum number of regular files extracted.
    pub max_files: usize,
    /// Maximum total bytes extracted across all regular files.
    pub max_total_bytes: u64,
    /// Maximum bytes extracted per file.
    pub max_file_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        // Browser profiles are large and file-heavy.
        Self {
            max_files: 50_000,
            max_total_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            max_file_bytes: 512 * 1024 * 1024,       // 512MB per file
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub extracted_files: Vec<PathBuf>, // relative paths
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

/// Sniff the archive format from its first bytes.
///
/// Archives written by older deployments were zips; current ones are `.tar.gz`.
pub fn detect_archive_kind(head: &[u8]) -> Option<ArchiveKind> {
    if head.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveKind::TarGz);
    }
    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        return Some(ArchiveKind::Zip);
    }
    if head.len() >= 262 && &head[257..262] == b"ustar" {
        return Some(ArchiveKind::Tar);
    }
    None
}

/// Copy the regular files and directories of `src` into a fresh `dst`.
///
/// Symlinks, sockets and other special files are skipped: Chromium keeps its
/// `Singleton*` locks as symlinks and they are meaningless on another host.
/// Returns the number of files copied.
pub fn snapshot_dir(src: &Path, dst: &Path) -> Result<usize> {
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    fs::create_dir_all(dst)?;
    copy_tree(src, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0usize;
    for ent in fs::read_dir(src)? {
        let ent = ent?;
        let ty = ent.file_type()?;
        let to = dst.join(ent.file_name());
        if ty.is_dir() {
            fs::create_dir_all(&to)?;
            copied += copy_tree(&ent.path(), &to)?;
        } else if ty.is_file() {
            match fs::copy(ent.path(), &to) {
                Ok(_) => copied += 1,
                // The client may delete files while we walk; a vanished file is not an error.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
    Ok(copied)
}

/// Pack `src_dir` into a gzip-compressed tar at `archive_path`.
///
/// Entry names are relative to `src_dir`, directories sorted for stable output.
pub fn pack_tar_gz(src_dir: &Path, archive_path: &Path) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let f = File::create(archive_path)?;
    let enc = GzEncoder::new(f, Compression::best());
    let mut builder = Builder::new(enc);
    builder.follow_symlinks(false);

    append_tree(&mut builder, src_dir, Path::new(""))?;

    let enc = builder.into_inner()?;
    let mut f = enc.finish()?;
    f.flush()?;
    Ok(())
}

fn append_tree<W: Write>(builder: &mut Builder<W>, dir: &Path, rel: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for ent in entries {
        let ty = ent.file_type()?;
        let name = rel.join(ent.file_name());
        if ty.is_dir() {
            builder.append_dir(&name, ent.path())?;
            append_tree(builder, &ent.path(), &name)?;
        } else if ty.is_file() {
            builder.append_path_with_name(ent.path(), &name)?;
        }
    }
    Ok(())
}

pub fn safe_extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let mut head = [0u8; 512];
    let n = read_head(archive_path, &mut head)?;

    fs::create_dir_all(dest_dir)?;

    match detect_archive_kind(&head[..n]) {
        Some(ArchiveKind::Zip) => safe_extract_zip(archive_path, dest_dir, limits),
        Some(ArchiveKind::Tar) => {
            safe_extract_tar_reader(File::open(archive_path)?, dest_dir, limits)
        }
        Some(ArchiveKind::TarGz) => {
            let gz = GzDecoder::new(File::open(archive_path)?);
            safe_extract_tar_reader(gz, dest_dir, limits)
        }
        None => Err(Error::External(format!(
            "unrecognized archive format: {}",
            archive_path.display()
        ))),
    }
}

fn read_head(path: &Path, buf: &mut [u8]) -> Result<usize> {
    let mut f = File::open(path)?;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Running totals shared by the zip and tar walkers.
struct Budget {
    limits: ExtractLimits,
    files: usize,
    total: u64,
}

impl Budget {
    fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            files: 0,
            total: 0,
        }
    }

    fn admit(&mut self, rel: &Path, size: u64) -> Result<()> {
        self.files += 1;
        if self.files > self.limits.max_files {
            return Err(Error::Security(format!(
                "archive exceeds max_files limit ({})",
                self.limits.max_files
            )));
        }
        if size > self.limits.max_file_bytes {
            return Err(Error::Security(format!(
                "archive file too large: {} bytes (max {}) for {}",
                size,
                self.limits.max_file_bytes,
                rel.display()
            )));
        }
        if self.total.saturating_add(size) > self.limits.max_total_bytes {
            return Err(Error::Security(format!(
                "archive exceeds max_total_bytes limit ({})",
                self.limits.max_total_bytes
            )));
        }
        Ok(())
    }

    /// Copy at most `max_file_bytes` even if the header lies about the size.
    fn write_entry(&mut self, entry: impl Read, out_path: &Path, rel: &Path) -> Result<u64> {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(out_path)?;
        let mut limited = entry.take(self.limits.max_file_bytes + 1);
        let copied = std::io::copy(&mut limited, &mut out)?;
        if copied > self.limits.max_file_bytes {
            return Err(Error::Security(format!(
                "archive entry exceeds max_file_bytes while extracting: {}",
                rel.display()
            )));
        }
        self.total += copied;
        Ok(copied)
    }
}

fn safe_extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let f = File::open(archive_path)?;
    let mut zip = ZipArchive::new(f).map_err(|e| Error::External(format!("zip error: {e}")))?;

    let mut report = ExtractReport::default();
    let mut budget = Budget::new(limits);

    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| Error::External(format!("zip error: {e}")))?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }

        // Zip symlinks are encoded via unix mode bits.
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                return Err(Error::Security(format!(
                    "archive contains symlink entry: {name}"
                )));
            }
        }

        let Some(rel) = sanitize_rel_path(Path::new(&name))? else {
            continue;
        };
        let out_path = dest_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        budget.admit(&rel, entry.size())?;
        budget.write_entry(entry, &out_path, &rel)?;

        report.extracted_files.push(rel);
        report.total_bytes = budget.total;
    }

    Ok(report)
}

fn safe_extract_tar_reader<R: Read>(
    r: R,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let mut archive = Archive::new(r);
    let mut report = ExtractReport::default();
    let mut budget = Budget::new(limits);

    for entry in archive.entries()? {
        let entry = entry?;
        let entry_type = entry.header().entry_type();

        // Disallow symlinks/hardlinks/devices/etc.
        if !entry_type.is_file() && !entry_type.is_dir() {
            let p = entry
                .path()
                .ok()
                .and_then(|p| p.to_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(Error::Security(format!(
                "archive contains non-file/non-dir entry: {p}"
            )));
        }

        let Some(rel) = sanitize_rel_path(&entry.path()?)? else {
            continue;
        };
        let out_path = dest_dir.join(&rel);

        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        let size = entry.header().size().unwrap_or(0);
        budget.admit(&rel, size)?;
        budget.write_entry(entry, &out_path, &rel)?;

        report.extracted_files.push(rel);
        report.total_bytes = budget.total;
    }

    Ok(report)
}

/// Returns `None` for entries that name the archive root itself (`./`).
fn sanitize_rel_path(p: &Path) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(os) => out.push(os),
            Component::ParentDir => {
                return Err(Error::Security(format!(
                    "archive contains path traversal: {}",
                    p.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Security(format!(
                    "archive contains absolute path: {}",
                    p.display()
                )));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn pack_then_extract_preserves_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("Default/Cookies"), b"cookie-jar");
        write(&src.join("Default/Local Storage/leveldb/000003.log"), b"level");
        write(&src.join("Local State"), b"{}");
        fs::create_dir_all(src.join("Default/empty")).unwrap();

        let archive = tmp.path().join("out/session.tar.gz");
        pack_tar_gz(&src, &archive).unwrap();

        let dest = tmp.path().join("dest");
        let report = safe_extract_archive(&archive, &dest, ExtractLimits::default()).unwrap();

        assert_eq!(report.extracted_files.len(), 3);
        assert_eq!(fs::read(dest.join("Default/Cookies")).unwrap(), b"cookie-jar");
        assert_eq!(
            fs::read(dest.join("Default/Local Storage/leveldb/000003.log")).unwrap(),
            b"level"
        );
        assert_eq!(fs::read(dest.join("Local State")).unwrap(), b"{}");
        assert!(dest.join("Default/empty").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_skips_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("Default/Preferences"), b"prefs");
        std::os::unix::fs::symlink("host-1234", src.join("SingletonLock")).unwrap();

        let dst = tmp.path().join("copy");
        let copied = snapshot_dir(&src, &dst).unwrap();

        assert_eq!(copied, 1);
        assert_eq!(fs::read(dst.join("Default/Preferences")).unwrap(), b"prefs");
        assert!(fs::symlink_metadata(dst.join("SingletonLock")).is_err());
    }

    #[test]
    fn snapshot_replaces_stale_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a"), b"1");
        let dst = tmp.path().join("copy");
        write(&dst.join("stale"), b"old");

        snapshot_dir(&src, &dst).unwrap();
        assert!(!dst.join("stale").exists());
        assert!(dst.join("a").exists());
    }

    #[test]
    fn detects_formats_by_magic() {
        assert_eq!(detect_archive_kind(&[0x1f, 0x8b, 8, 0]), Some(ArchiveKind::TarGz));
        assert_eq!(detect_archive_kind(b"PK\x03\x04rest"), Some(ArchiveKind::Zip));
        let raw = build_raw_tar_bytes("a.txt", b"x");
        assert_eq!(detect_archive_kind(&raw[..512]), Some(ArchiveKind::Tar));
        assert_eq!(detect_archive_kind(b"hello"), None);
    }

    #[test]
    fn legacy_zip_archive_is_extracted() {
        use zip::write::{FileOptions, ZipWriter};

        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("session.zip");
        let f = File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.add_directory("Default/", FileOptions::default()).unwrap();
        zw.start_file("Default/Cookies", FileOptions::default())
            .unwrap();
        zw.write_all(b"legacy").unwrap();
        zw.finish().unwrap();

        let dest = tmp.path().join("dest");
        safe_extract_archive(&zip_path, &dest, ExtractLimits::default()).unwrap();
        assert_eq!(fs::read(dest.join("Default/Cookies")).unwrap(), b"legacy");
    }

    #[test]
    fn zip_blocks_path_traversal() {
        use zip::write::{FileOptions, ZipWriter};

        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("a.zip");
        let f = File::create(&zip_path).unwrap();
        let mut zw = ZipWriter::new(f);
        zw.start_file("../evil.txt", FileOptions::default())
            .unwrap();
        zw.write_all(b"x").unwrap();
        zw.finish().unwrap();

        let err = safe_extract_archive(&zip_path, &tmp.path().join("out"), ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn tar_gz_blocks_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let tgz_path = tmp.path().join("a.tar.gz");

        let raw = build_raw_tar_bytes("../evil.txt", b"x");
        let f = File::create(&tgz_path).unwrap();
        let mut enc = GzEncoder::new(f, Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();

        let err = safe_extract_archive(&tgz_path, &tmp.path().join("out"), ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[test]
    fn plain_tar_blocks_absolute_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let tar_path = tmp.path().join("a.tar");
        fs::write(&tar_path, build_raw_tar_bytes("/etc/evil", b"x")).unwrap();

        let err = safe_extract_archive(&tar_path, &tmp.path().join("out"), ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn enforces_file_limits() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a.txt"), b"hello");
        write(&src.join("b.txt"), b"world");
        let archive = tmp.path().join("a.tar.gz");
        pack_tar_gz(&src, &archive).unwrap();

        let per_file = ExtractLimits {
            max_files: 10,
            max_total_bytes: 100,
            max_file_bytes: 4,
        };
        let err = safe_extract_archive(&archive, &tmp.path().join("o1"), per_file).unwrap_err();
        assert!(matches!(err, Error::Security(_)));

        let total = ExtractLimits {
            max_files: 10,
            max_total_bytes: 9,
            max_file_bytes: 10,
        };
        let err = safe_extract_archive(&archive, &tmp.path().join("o2"), total).unwrap_err();
        assert!(matches!(err, Error::Security(_)));

        let count = ExtractLimits {
            max_files: 1,
            max_total_bytes: 100,
            max_file_bytes: 10,
        };
        let err = safe_extract_archive(&archive, &tmp.path().join("o3"), count).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("junk.bin");
        fs::write(&p, b"definitely not an archive").unwrap();
        let err = safe_extract_archive(&p, &tmp.path().join("out"), ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::External(_)));
    }

    /// `tar::Builder` refuses `..` and absolute names, so hostile archives are
    /// assembled by hand: one ustar header, padded data, end-of-archive blocks.
    fn build_raw_tar_bytes(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];

        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[0..n].copy_from_slice(&name_bytes[0..n]);

        put_octal(&mut header[100..108], 0o644, 7);
        put_octal(&mut header[108..116], 0, 7);
        put_octal(&mut header[116..124], 0, 7);
        put_octal(&mut header[124..136], data.len() as u64, 11);
        put_octal(&mut header[136..148], 0, 11);

        header[148..156].fill(b' ');
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");

        let sum: u32 = header.iter().map(|b| *b as u32).sum();
        let cks = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(cks.as_bytes());

        let mut out = Vec::with_capacity(512 * 4);
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let pad = (512 - (data.len() % 512)) % 512;
        out.resize(out.len() + pad + 1024, 0);
        out
    }

    fn put_octal(dst: &mut [u8], val: u64, digits: usize) {
        let s = format!("{val:0digits$o}\0");
        dst[..s.len()].copy_from_slice(s.as_bytes());
    }
}
