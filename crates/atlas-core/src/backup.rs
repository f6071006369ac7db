//! Signed zip archives of the content tree, database and history.
//!
//! Every archive gets a sidecar `<archive>.sig` holding the hex HMAC-SHA256
//! of the archive bytes under a per-installation secret. An archive without a
//! matching sidecar never verifies.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::document::format_timestamp;
use crate::error::BackupError;
use crate::paths::ContentPaths;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_SUFFIX: &str = ".sig";
pub const CONTENT_PREFIX: &str = "content";
pub const HISTORY_PREFIX: &str = "history";
const SECRET_LEN: usize = 32;
const STAGING_PREFIX: &str = "tmp_restore_";
const MAX_UPLOAD_SUFFIX: usize = 1000;

#[derive(Clone, Debug, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub signature: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackupListing {
    pub name: String,
    pub size: u64,
    pub modified: String,
    pub signed: bool,
}

#[derive(Clone, Debug)]
pub struct BackupEngine {
    paths: ContentPaths,
}

impl BackupEngine {
    pub fn new(paths: ContentPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ContentPaths {
        &self.paths
    }

    pub fn backups_dir(&self) -> &Path {
        &self.paths.backups_dir
    }

    /// Load the signing secret, creating a fresh 32-byte one on first use.
    pub fn ensure_secret(&self) -> Result<Vec<u8>, BackupError> {
        if let Some(secret) = self.load_secret()? {
            return Ok(secret);
        }
        let path = &self.paths.secret_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        match create_private(path) {
            Ok(mut file) => {
                file.write_all(&secret)?;
                file.sync_all()?;
                tracing::info!("Generated backup signing secret at {}", path.display());
                Ok(secret)
            }
            // Another caller created it first; use theirs.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => self
                .load_secret()?
                .ok_or_else(|| BackupError::Secret {
                    path: path.clone(),
                    reason: "secret vanished after creation".to_string(),
                }),
            Err(e) => Err(e.into()),
        }
    }

    fn load_secret(&self) -> Result<Option<Vec<u8>>, BackupError> {
        match std::fs::read(&self.paths.secret_file) {
            Ok(secret) if secret.is_empty() => Err(BackupError::Secret {
                path: self.paths.secret_file.clone(),
                reason: "file is empty".to_string(),
            }),
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a new archive of content, database and history, then sign it.
    ///
    /// The archive is assembled under a dot-prefixed temporary name and only
    /// renamed into place once complete.
    pub fn create_backup(&self) -> Result<BackupInfo, BackupError> {
        let dir = self.backups_dir();
        std::fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut name = format!("backup_{stamp}.zip");
        let mut attempt = 1;
        while dir.join(&name).exists() {
            name = format!("backup_{stamp}_{attempt}.zip");
            attempt += 1;
        }
        let path = dir.join(&name);
        let partial = dir.join(format!(".{name}.partial"));

        if let Err(e) = self.write_archive(&partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &path)?;

        let signature = self.sign(&path)?;
        tracing::info!("Created backup {}", path.display());
        Ok(BackupInfo {
            name,
            path,
            signature,
        })
    }

    fn write_archive(&self, target: &Path) -> Result<(), BackupError> {
        let file = File::create(target)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        add_tree(&mut zip, &self.paths.content_root, CONTENT_PREFIX, options)?;
        if self.paths.database.is_file() {
            let mut db = File::open(&self.paths.database)?;
            zip.start_file(self.paths.database_file_name(), options)?;
            io::copy(&mut db, &mut zip)?;
        }
        if self.paths.history_dir.is_dir() {
            add_tree(&mut zip, &self.paths.history_dir, HISTORY_PREFIX, options)?;
        }

        let file = zip.finish()?;
        file.sync_all()?;
        Ok(())
    }

    /// Sign `archive` and write the hex signature to its sidecar.
    pub fn sign(&self, archive: &Path) -> Result<String, BackupError> {
        let secret = self.ensure_secret()?;
        let signature = hex::encode(mac_file(&secret, archive)?.finalize().into_bytes());
        let sidecar = signature_path(archive);
        let mut file = open_private(&sidecar)?;
        file.write_all(signature.as_bytes())?;
        file.sync_all()?;
        Ok(signature)
    }

    /// Check an archive against its sidecar in constant time.
    ///
    /// A missing archive, sidecar or secret, or an undecodable signature, is
    /// a verification failure.
    pub fn verify_backup(&self, archive: &Path) -> Result<bool, BackupError> {
        if !archive.is_file() {
            tracing::warn!("Backup {} does not exist", archive.display());
            return Ok(false);
        }
        let sidecar = signature_path(archive);
        let recorded = match std::fs::read_to_string(&sidecar) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("Backup {} has no signature file", archive.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let Ok(expected) = hex::decode(recorded.trim()) else {
            tracing::warn!("Signature for {} is not valid hex", archive.display());
            return Ok(false);
        };
        let Some(secret) = self.load_secret()? else {
            tracing::warn!("No signing secret; cannot verify {}", archive.display());
            return Ok(false);
        };
        Ok(mac_file(&secret, archive)?.verify_slice(&expected).is_ok())
    }

    /// Archives in the backups directory, newest name first. Sidecars,
    /// directories and temporary files are skipped.
    pub fn list_backups(&self) -> Result<Vec<BackupListing>, BackupError> {
        let dir = self.backups_dir();
        std::fs::create_dir_all(dir)?;
        let mut listings = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !meta.is_file() || name.starts_with('.') || name.ends_with(SIGNATURE_SUFFIX) {
                continue;
            }
            listings.push(BackupListing {
                signed: signature_path(&entry.path()).is_file(),
                modified: meta.modified().map(format_timestamp).unwrap_or_default(),
                size: meta.len(),
                name,
            });
        }
        listings.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(listings)
    }

    /// Confine a caller-supplied archive name to the backups directory.
    pub fn resolve_backup_file(&self, name: &str) -> Result<PathBuf, BackupError> {
        let name = name.trim();
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..")
            && !name.ends_with(SIGNATURE_SUFFIX);
        if !plain {
            return Err(BackupError::InvalidFileName(name.to_string()));
        }
        Ok(self.backups_dir().join(name))
    }

    /// Store an uploaded archive (and its signature, when supplied) in the
    /// backups directory. The upload still has to verify before a restore.
    ///
    /// An existing archive is never replaced: the upload lands under the
    /// first free `<stem>_<n>` name instead.
    pub fn save_uploaded_backup(
        &self,
        name: &str,
        mut src: impl Read,
        signature: Option<&str>,
    ) -> Result<PathBuf, BackupError> {
        let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
        let base = if base.is_empty() {
            format!("upload_{}.zip", Utc::now().format("%Y%m%d_%H%M%S"))
        } else {
            base.to_string()
        };
        self.resolve_backup_file(&base)?;
        std::fs::create_dir_all(self.backups_dir())?;

        let partial = self.backups_dir().join(format!(".{base}.partial"));
        let mut out = File::create(&partial)?;
        if let Err(e) = io::copy(&mut src, &mut out).and_then(|_| out.sync_all()) {
            let _ = std::fs::remove_file(&partial);
            return Err(e.into());
        }
        let linked = self.link_unused_name(&partial, &base);
        let _ = std::fs::remove_file(&partial);
        let dest = linked?;

        if let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) {
            let mut file = open_private(&signature_path(&dest))?;
            file.write_all(signature.as_bytes())?;
        }
        tracing::info!("Stored uploaded backup {}", dest.display());
        Ok(dest)
    }

    /// Hard-link `partial` to the first backup name not yet taken. Linking
    /// fails on an existing target, so a concurrent upload cannot be clobbered.
    fn link_unused_name(&self, partial: &Path, base: &str) -> Result<PathBuf, BackupError> {
        for n in 0..MAX_UPLOAD_SUFFIX {
            let dest = self.resolve_backup_file(&numbered_name(base, n))?;
            if signature_path(&dest).exists() {
                continue;
            }
            match std::fs::hard_link(partial, &dest) {
                Ok(()) => return Ok(dest),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free backup name for {base}"),
        )
        .into())
    }

    /// A fresh, empty quarantine directory for staging one restore.
    pub fn new_staging_dir(&self) -> Result<PathBuf, BackupError> {
        std::fs::create_dir_all(self.backups_dir())?;
        let mut suffix = [0u8; 4];
        OsRng.fill_bytes(&mut suffix);
        let dir = self.backups_dir().join(format!(
            "{STAGING_PREFIX}{}_{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            hex::encode(suffix)
        ));
        std::fs::create_dir(&dir)?;
        Ok(dir)
    }
}

/// `<archive>.sig`
/// `copy.zip` -> `copy_<n>.zip`; `n == 0` keeps the name.
fn numbered_name(base: &str, n: usize) -> String {
    if n == 0 {
        return base.to_string();
    }
    match base.rfind('.').filter(|&dot| dot > 0) {
        Some(dot) => format!("{}_{n}{}", &base[..dot], &base[dot..]),
        None => format!("{base}_{n}"),
    }
}

pub fn signature_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

fn mac_file(secret: &[u8], path: &Path) -> Result<HmacSha256, BackupError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| BackupError::Secret {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    Ok(mac)
}

/// Add every file under `root` as `<prefix>/<relative path>`, with explicit
/// directory entries so empty trees survive a round trip.
fn add_tree(
    zip: &mut ZipWriter<File>,
    root: &Path,
    prefix: &str,
    options: SimpleFileOptions,
) -> Result<(), BackupError> {
    zip.add_directory(format!("{prefix}/"), options)?;
    if !root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Some(rel) = archive_name(root, entry.path()) else {
            tracing::warn!("Skipping non UTF-8 path {}", entry.path().display());
            continue;
        };
        let name = format!("{prefix}/{rel}");
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_file() {
            let mut file = File::open(entry.path())?;
            zip.start_file(name, options)?;
            io::copy(&mut file, zip)?;
        }
    }
    Ok(())
}

/// Forward-slash relative name regardless of host separator.
fn archive_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    restrict(&mut options);
    options.open(path)
}

fn open_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    restrict(&mut options);
    options.open(path)
}

#[cfg(unix)]
fn restrict(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
}

#[cfg(not(unix))]
fn restrict(_options: &mut OpenOptions) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn engine() -> (tempfile::TempDir, ContentPaths, BackupEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ContentPaths::new(tmp.path().join("content"), tmp.path().join("data"));
        paths.ensure_dirs().unwrap();
        let engine = BackupEngine::new(paths.clone());
        (tmp, paths, engine)
    }

    fn entry_names(archive: &Path) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn secret_is_created_once_with_private_mode() {
        let (_tmp, paths, engine) = engine();
        let first = engine.ensure_secret().unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(engine.ensure_secret().unwrap(), first);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&paths.secret_file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn empty_secret_is_an_error() {
        let (_tmp, paths, engine) = engine();
        fs::write(&paths.secret_file, b"").unwrap();
        assert!(matches!(engine.ensure_secret(), Err(BackupError::Secret { .. })));
    }

    #[test]
    fn backup_contains_content_database_and_history() {
        let (_tmp, paths, engine) = engine();
        fs::create_dir_all(paths.published_root.join("guides")).unwrap();
        fs::write(paths.published_root.join("guides/setup.md"), "# Setup").unwrap();
        fs::write(&paths.database, b"sqlite").unwrap();
        fs::create_dir_all(paths.history_dir.join("20240101_000000")).unwrap();
        fs::write(paths.history_dir.join("20240101_000000/a.md"), "old").unwrap();

        let info = engine.create_backup().unwrap();
        assert!(info.name.starts_with("backup_") && info.name.ends_with(".zip"));
        assert_eq!(info.signature.len(), 64);

        let names = entry_names(&info.path);
        assert!(names.contains(&"content/published/guides/setup.md".to_string()), "{names:?}");
        assert!(names.contains(&"content/unlisted/".to_string()), "{names:?}");
        assert!(names.contains(&"app.db".to_string()));
        assert!(names.contains(&"history/20240101_000000/a.md".to_string()));
        assert!(names.iter().all(|n| !n.contains('\\')));

        let sidecar = fs::read_to_string(signature_path(&info.path)).unwrap();
        assert_eq!(sidecar, info.signature);
        assert!(engine.verify_backup(&info.path).unwrap());
    }

    #[test]
    fn tampering_breaks_verification() {
        let (_tmp, paths, engine) = engine();
        fs::write(paths.published_root.join("a.md"), "# A").unwrap();
        let info = engine.create_backup().unwrap();

        let mut bytes = fs::read(&info.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&info.path, &bytes).unwrap();
        assert!(!engine.verify_backup(&info.path).unwrap());
    }

    #[test]
    fn tampered_signature_breaks_verification() {
        let (_tmp, _paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        let sidecar = signature_path(&info.path);

        let mut sig = info.signature.clone().into_bytes();
        sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
        fs::write(&sidecar, &sig).unwrap();
        assert!(!engine.verify_backup(&info.path).unwrap());

        fs::write(&sidecar, "not hex").unwrap();
        assert!(!engine.verify_backup(&info.path).unwrap());

        // Trailing whitespace is tolerated.
        fs::write(&sidecar, format!("{}\n", info.signature)).unwrap();
        assert!(engine.verify_backup(&info.path).unwrap());
    }

    #[test]
    fn missing_pieces_never_verify() {
        let (_tmp, paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        assert!(!engine.verify_backup(&paths.backups_dir.join("nope.zip")).unwrap());

        fs::remove_file(signature_path(&info.path)).unwrap();
        assert!(!engine.verify_backup(&info.path).unwrap());
    }

    #[test]
    fn other_secret_does_not_verify() {
        let (_tmp, paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        fs::write(&paths.secret_file, [7u8; 32]).unwrap();
        assert!(!engine.verify_backup(&info.path).unwrap());
    }

    #[test]
    fn listing_skips_sidecars_and_temporaries() {
        let (_tmp, paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        fs::write(paths.backups_dir.join(".partial.zip.partial"), b"x").unwrap();
        engine.new_staging_dir().unwrap();

        let listing = engine.list_backups().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, info.name);
        assert!(listing[0].signed);
    }

    #[test]
    fn backup_names_are_confined() {
        let (_tmp, paths, engine) = engine();
        assert_eq!(
            engine.resolve_backup_file("backup_1.zip").unwrap(),
            paths.backups_dir.join("backup_1.zip")
        );
        for bad in ["", "../secret.key", "a/b.zip", "..", ".hidden", "x.zip.sig"] {
            assert!(engine.resolve_backup_file(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn uploaded_backup_keeps_signature() {
        let (_tmp, _paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        let bytes = fs::read(&info.path).unwrap();

        let stored = engine
            .save_uploaded_backup("C:\\Users\\me\\copy.zip", bytes.as_slice(), Some(&info.signature))
            .unwrap();
        assert_eq!(stored.file_name().unwrap(), "copy.zip");
        assert!(engine.verify_backup(&stored).unwrap());

        let unsigned = engine
            .save_uploaded_backup("unsigned.zip", bytes.as_slice(), None)
            .unwrap();
        assert!(!engine.verify_backup(&unsigned).unwrap());
    }

    #[test]
    fn upload_never_replaces_an_existing_archive() {
        let (_tmp, paths, engine) = engine();
        let info = engine.create_backup().unwrap();
        let original = fs::read(&info.path).unwrap();

        let stored = engine
            .save_uploaded_backup(&info.name, &b"not a zip"[..], Some("00"))
            .unwrap();
        assert_ne!(stored, info.path);
        assert_eq!(fs::read(&info.path).unwrap(), original);
        assert!(engine.verify_backup(&info.path).unwrap());
        assert_eq!(fs::read(&stored).unwrap(), b"not a zip");

        let again = engine
            .save_uploaded_backup(&info.name, &b"second"[..], None)
            .unwrap();
        assert_ne!(again, stored);
        let leftovers: Vec<_> = fs::read_dir(&paths.backups_dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn numbered_names_keep_the_extension() {
        assert_eq!(numbered_name("copy.zip", 0), "copy.zip");
        assert_eq!(numbered_name("copy.zip", 2), "copy_2.zip");
        assert_eq!(numbered_name("archive", 1), "archive_1");
        assert_eq!(numbered_name("backup.2024.zip", 1), "backup.2024_1.zip");
    }

    #[test]
    fn staging_dirs_are_unique_and_empty() {
        let (_tmp, _paths, engine) = engine();
        let a = engine.new_staging_dir().unwrap();
        let b = engine.new_staging_dir().unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read_dir(&a).unwrap().count(), 0);
    }
}
