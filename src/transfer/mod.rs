//! Checksum-verified file transfer over an established session's SFTP channel.
//!
//! Single-file operations report failures as data (`TransferResult`) so batch
//! callers can keep going; directory transfers collect per-file failures and
//! never abort the walk.

use crate::error::{AppError, AppResult};
use crate::ssh::TransportSession;
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::{FileStat, Sftp};
use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Copy and hash buffer size
const CHUNK_SIZE: usize = 8192;

/// Outcome of one file transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub success: bool,
    pub local_path: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub verified: bool,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

impl TransferResult {
    fn failed(local_path: &str, remote_path: &str, error: String) -> Self {
        Self {
            success: false,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            size_bytes: 0,
            verified: false,
            checksum: None,
            error: Some(error),
        }
    }
}

/// Tally of a directory transfer
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirTransferReport {
    pub files_transferred: usize,
    pub files_failed: usize,
    pub failed_files: Vec<(String, String)>,
}

impl DirTransferReport {
    fn record_failure(&mut self, path: impl Into<String>, error: impl Into<String>) {
        self.files_failed += 1;
        self.failed_files.push((path.into(), error.into()));
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub mode: String,
    pub mtime: Option<u64>,
}

/// File and directory copy on top of one connected session.
pub struct TransferEngine<'a> {
    session: &'a TransportSession,
}

impl<'a> TransferEngine<'a> {
    pub fn new(session: &'a TransportSession) -> Self {
        Self { session }
    }

    /// Upload one file, optionally verifying it end to end with SHA-256.
    ///
    /// A verification mismatch produces a failed result, never a silent
    /// partial success.
    pub fn upload(&self, local_path: &Path, remote_path: &str, verify: bool) -> TransferResult {
        let local_str = local_path.display().to_string();

        let metadata = match std::fs::metadata(local_path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                return TransferResult::failed(
                    &local_str,
                    remote_path,
                    format!("not a regular file: {}", local_str),
                )
            }
            Err(e) => {
                return TransferResult::failed(
                    &local_str,
                    remote_path,
                    format!("local file not found: {}: {}", local_str, e),
                )
            }
        };
        let size_bytes = metadata.len();

        let local_checksum = if verify {
            match sha256_file(local_path) {
                Ok(sum) => Some(sum),
                Err(e) => {
                    return TransferResult::failed(
                        &local_str,
                        remote_path,
                        format!("failed to hash {}: {}", local_str, e),
                    )
                }
            }
        } else {
            None
        };

        let sftp = match self.session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => return TransferResult::failed(&local_str, remote_path, e.to_string()),
        };

        if let Err(e) = copy_local_to_remote(&sftp, local_path, remote_path) {
            return TransferResult::failed(&local_str, remote_path, e.to_string());
        }

        if let Some(expected) = local_checksum.as_deref() {
            let remote_sum = match self.remote_checksum(remote_path) {
                Ok(sum) => sum,
                Err(e) => return TransferResult::failed(&local_str, remote_path, e.to_string()),
            };
            if remote_sum != expected {
                let err = AppError::Integrity(format!(
                    "checksum mismatch after upload of {}: local {} != remote {}",
                    local_str, expected, remote_sum
                ));
                tracing::error!("{}", err);
                return TransferResult::failed(&local_str, remote_path, err.to_string());
            }
        }

        tracing::info!(
            "Uploaded {} -> {} ({} bytes, verified={})",
            local_str,
            remote_path,
            size_bytes,
            verify
        );
        TransferResult {
            success: true,
            local_path: local_str,
            remote_path: remote_path.to_string(),
            size_bytes,
            verified: verify,
            checksum: local_checksum,
            error: None,
        }
    }

    /// Download one file; symmetric to `upload`. The remote file is stat'd
    /// and hashed before the copy, the local copy re-hashed after.
    pub fn download(&self, remote_path: &str, local_path: &Path, verify: bool) -> TransferResult {
        let local_str = local_path.display().to_string();

        let sftp = match self.session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => return TransferResult::failed(&local_str, remote_path, e.to_string()),
        };

        let stat = match sftp.stat(Path::new(remote_path)) {
            Ok(stat) => stat,
            Err(e) => {
                return TransferResult::failed(
                    &local_str,
                    remote_path,
                    format!("remote file not found: {}: {}", remote_path, e),
                )
            }
        };
        let size_bytes = stat.size.unwrap_or(0);

        let remote_sum = if verify {
            match self.remote_checksum(remote_path) {
                Ok(sum) => Some(sum),
                Err(e) => return TransferResult::failed(&local_str, remote_path, e.to_string()),
            }
        } else {
            None
        };

        if let Err(e) = copy_remote_to_local(&sftp, remote_path, local_path) {
            return TransferResult::failed(&local_str, remote_path, e.to_string());
        }

        if let Some(expected) = remote_sum.as_deref() {
            let local_sum = match sha256_file(local_path) {
                Ok(sum) => sum,
                Err(e) => {
                    return TransferResult::failed(
                        &local_str,
                        remote_path,
                        format!("failed to hash {}: {}", local_str, e),
                    )
                }
            };
            if local_sum != expected {
                let err = AppError::Integrity(format!(
                    "checksum mismatch after download of {}: remote {} != local {}",
                    remote_path, expected, local_sum
                ));
                tracing::error!("{}", err);
                return TransferResult::failed(&local_str, remote_path, err.to_string());
            }
        }

        tracing::info!(
            "Downloaded {} -> {} ({} bytes, verified={})",
            remote_path,
            local_str,
            size_bytes,
            verify
        );
        TransferResult {
            success: true,
            local_path: local_str,
            remote_path: remote_path.to_string(),
            size_bytes,
            verified: verify,
            checksum: remote_sum,
            error: None,
        }
    }

    /// Upload a directory tree, mirroring its structure remotely.
    ///
    /// Per-file failures are recorded and the walk continues. Files are
    /// copied without per-file verification; directory batches trade
    /// integrity checking for throughput.
    pub fn upload_directory(&self, local_dir: &Path, remote_dir: &str) -> AppResult<DirTransferReport> {
        let metadata = std::fs::metadata(local_dir)?;
        if !metadata.is_dir() {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a directory: {}", local_dir.display()),
            )));
        }

        let sftp = self.session.sftp()?;
        let mut report = DirTransferReport::default();

        ensure_remote_dir(&sftp, remote_dir);

        for entry in walkdir::WalkDir::new(local_dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| local_dir.display().to_string());
                    report.record_failure(path, e.to_string());
                    continue;
                }
            };

            let rel = match entry.path().strip_prefix(local_dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if rel.as_os_str().is_empty() {
                // The root itself, already created above
                continue;
            }
            let remote_target = remote_join(remote_dir, rel);

            if entry.file_type().is_dir() {
                ensure_remote_dir(&sftp, &remote_target);
            } else if entry.file_type().is_file() {
                let result = self.upload(entry.path(), &remote_target, false);
                if result.success {
                    report.files_transferred += 1;
                } else {
                    report.record_failure(
                        entry.path().display().to_string(),
                        result.error.unwrap_or_else(|| "unknown error".to_string()),
                    );
                }
            }
        }

        tracing::info!(
            "Directory upload {} -> {}: {} transferred, {} failed",
            local_dir.display(),
            remote_dir,
            report.files_transferred,
            report.files_failed
        );
        Ok(report)
    }

    /// Download a remote directory tree; symmetric to `upload_directory`.
    pub fn download_directory(&self, remote_dir: &str, local_dir: &Path) -> AppResult<DirTransferReport> {
        let sftp = self.session.sftp()?;
        std::fs::create_dir_all(local_dir)?;

        let mut report = DirTransferReport::default();
        self.download_tree(&sftp, remote_dir, local_dir, &mut report);

        tracing::info!(
            "Directory download {} -> {}: {} transferred, {} failed",
            remote_dir,
            local_dir.display(),
            report.files_transferred,
            report.files_failed
        );
        Ok(report)
    }

    fn download_tree(
        &self,
        sftp: &Sftp,
        remote_dir: &str,
        local_dir: &Path,
        report: &mut DirTransferReport,
    ) {
        let entries = match sftp.readdir(Path::new(remote_dir)) {
            Ok(entries) => entries,
            Err(e) => {
                report.record_failure(remote_dir, format!("failed to list {}: {}", remote_dir, e));
                return;
            }
        };

        for (path, stat) in entries {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            if name == "." || name == ".." {
                continue;
            }

            let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
            let local_path = local_dir.join(&name);

            if stat.is_dir() {
                if let Err(e) = std::fs::create_dir_all(&local_path) {
                    report.record_failure(remote_path, e.to_string());
                    continue;
                }
                self.download_tree(sftp, &remote_path, &local_path, report);
            } else {
                let result = self.download(&remote_path, &local_path, false);
                if result.success {
                    report.files_transferred += 1;
                } else {
                    report.record_failure(
                        remote_path,
                        result.error.unwrap_or_else(|| "unknown error".to_string()),
                    );
                }
            }
        }
    }

    /// List a remote directory: directories first, then by name.
    pub fn list_remote_directory(&self, remote_path: &str) -> AppResult<Vec<RemoteEntry>> {
        let sftp = self.session.sftp()?;
        let entries = sftp
            .readdir(Path::new(remote_path))
            .map_err(|e| AppError::Ssh(format!("failed to list {}: {}", remote_path, e)))?;

        let mut result = Vec::new();
        for (path, stat) in entries {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            if name == "." || name == ".." {
                continue;
            }

            result.push(RemoteEntry {
                name,
                size: stat.size.unwrap_or(0),
                is_directory: stat.is_dir(),
                mode: format_permissions(&stat),
                mtime: stat.mtime,
            });
        }

        result.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(result)
    }

    /// Hash a remote file by running a hash command over the session.
    ///
    /// `sha256sum` first, `shasum -a 256` as the fallback for systems
    /// without coreutils.
    fn remote_checksum(&self, remote_path: &str) -> AppResult<String> {
        let quoted = shell_escape::unix::escape(Cow::from(remote_path));

        let mut output = self
            .session
            .execute_command(&format!("sha256sum {}", quoted), None)?;
        if output.exit_code != 0 {
            output = self
                .session
                .execute_command(&format!("shasum -a 256 {}", quoted), None)?;
        }
        if output.exit_code != 0 {
            return Err(AppError::Ssh(format!(
                "remote checksum of {} failed: {}",
                remote_path,
                output.stderr.trim()
            )));
        }

        parse_checksum_output(&output.stdout).ok_or_else(|| {
            AppError::Ssh(format!(
                "unparseable remote checksum output for {}",
                remote_path
            ))
        })
    }
}

/// Streamed SHA-256 of a local file, as lowercase hex.
fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// First field of `sha256sum`/`shasum` output, if it looks like a digest.
fn parse_checksum_output(stdout: &str) -> Option<String> {
    let digest = stdout.split_whitespace().next()?.to_ascii_lowercase();
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(digest)
    } else {
        None
    }
}

fn copy_local_to_remote(sftp: &Sftp, local: &Path, remote: &str) -> AppResult<u64> {
    let mut src = File::open(local)?;
    let mut dst = sftp
        .create(Path::new(remote))
        .map_err(|e| AppError::Ssh(format!("failed to create remote file {}: {}", remote, e)))?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| AppError::Ssh(format!("failed to write remote file {}: {}", remote, e)))?;
        written += n as u64;
    }
    Ok(written)
}

fn copy_remote_to_local(sftp: &Sftp, remote: &str, local: &Path) -> AppResult<u64> {
    let mut src = sftp
        .open(Path::new(remote))
        .map_err(|e| AppError::Ssh(format!("failed to open remote file {}: {}", remote, e)))?;
    let mut dst = File::create(local)?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = src
            .read(&mut buf)
            .map_err(|e| AppError::Ssh(format!("failed to read remote file {}: {}", remote, e)))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }
    Ok(written)
}

/// Create a remote directory if it does not already exist. Pre-existing
/// directories are not an error; real failures surface on the file writes.
fn ensure_remote_dir(sftp: &Sftp, path: &str) {
    if sftp.stat(Path::new(path)).is_err() {
        let _ = sftp.mkdir(Path::new(path), 0o755);
    }
}

/// Join a relative local path onto a remote base with forward slashes.
fn remote_join(base: &str, rel: &Path) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for component in rel.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Format file permissions as a string like "rwxr-xr-x"
fn format_permissions(stat: &FileStat) -> String {
    let perms = stat.perm.unwrap_or(0);

    let mut s = String::with_capacity(10);

    if stat.is_dir() {
        s.push('d');
    } else {
        s.push('-');
    }

    s.push(if perms & 0o400 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o200 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o100 != 0 { 'x' } else { '-' });

    s.push(if perms & 0o040 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o020 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o010 != 0 { 'x' } else { '-' });

    s.push(if perms & 0o004 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o002 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o001 != 0 { 'x' } else { '-' });

    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceProfile;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn disconnected_session() -> TransportSession {
        let mut profile = DeviceProfile::new("testbox", "127.0.0.1", "tester");
        profile.password = Some("hunter2".to_string());
        TransportSession::new("conn-1".into(), profile)
    }

    #[test]
    fn test_sha256_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert_eq!(sha256_file(&path).unwrap(), EMPTY_SHA256);
    }

    #[test]
    fn test_sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"hello world\n").unwrap();
        drop(file);

        // sha256sum of "hello world\n"
        assert_eq!(
            sha256_file(&path).unwrap(),
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
    }

    #[test]
    fn test_parse_checksum_output_sha256sum() {
        let out = format!("{}  /tmp/file.bin\n", EMPTY_SHA256);
        assert_eq!(parse_checksum_output(&out).as_deref(), Some(EMPTY_SHA256));
    }

    #[test]
    fn test_parse_checksum_output_rejects_garbage() {
        assert!(parse_checksum_output("").is_none());
        assert!(parse_checksum_output("sha256sum: missing operand\n").is_none());
        assert!(parse_checksum_output("deadbeef  short-digest\n").is_none());
    }

    #[test]
    fn test_parse_checksum_output_normalizes_case() {
        let out = format!("{}  f\n", EMPTY_SHA256.to_uppercase());
        assert_eq!(parse_checksum_output(&out).as_deref(), Some(EMPTY_SHA256));
    }

    #[test]
    fn test_remote_join_uses_forward_slashes() {
        assert_eq!(
            remote_join("/srv/backup/", Path::new("photos/cat.jpg")),
            "/srv/backup/photos/cat.jpg"
        );
        assert_eq!(remote_join("/srv", Path::new("a")), "/srv/a");
    }

    #[test]
    fn test_format_permissions() {
        let stat = FileStat {
            size: Some(0),
            uid: None,
            gid: None,
            perm: Some(0o100644),
            atime: None,
            mtime: None,
        };
        assert_eq!(format_permissions(&stat), "-rw-r--r--");

        let dir_stat = FileStat {
            size: Some(0),
            uid: None,
            gid: None,
            perm: Some(0o040755),
            atime: None,
            mtime: None,
        };
        assert_eq!(format_permissions(&dir_stat), "drwxr-xr-x");
    }

    #[test]
    fn test_upload_missing_local_file_reports_failure() {
        let session = disconnected_session();
        let engine = TransferEngine::new(&session);
        let result = engine.upload(Path::new("/no/such/file"), "/tmp/out", true);

        assert!(!result.success);
        assert!(!result.verified);
        let error = result.error.unwrap_or_default();
        assert!(error.contains("not found"), "unexpected error: {}", error);
    }

    #[test]
    fn test_upload_on_disconnected_session_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"data").unwrap();

        let session = disconnected_session();
        let engine = TransferEngine::new(&session);
        let result = engine.upload(&path, "/tmp/payload", true);

        assert!(!result.success);
        let error = result.error.unwrap_or_default();
        assert!(
            error.contains("not connected"),
            "unexpected error: {}",
            error
        );
    }

    #[test]
    fn test_download_on_disconnected_session_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let session = disconnected_session();
        let engine = TransferEngine::new(&session);
        let result = engine.download("/tmp/payload", &dir.path().join("out"), false);

        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_upload_directory_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flat");
        std::fs::write(&file, b"x").unwrap();

        let session = disconnected_session();
        let engine = TransferEngine::new(&session);
        assert!(engine.upload_directory(&file, "/tmp/dest").is_err());
        assert!(engine
            .upload_directory(&dir.path().join("missing"), "/tmp/dest")
            .is_err());
    }
}
