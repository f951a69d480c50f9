//! TLS identity bootstrap: self-signed key/certificate generation and
//! persistence.
//!
//! Layout (paths come from `[tls]` in the config):
//! ```text
//! key.pem        (RSA-2048 PKCS#8 private key, unencrypted, mode 0600)
//! cert.pem       (self-signed X.509 certificate)
//! cert.pem.lock  (present only while a generator holds the guard)
//! ```
//!
//! [`ensure`] never overwrites an identity that is already complete. When
//! either file is missing, the survivor is removed under the lock and a
//! fresh pair is generated, written to temporaries and renamed into place. Generation is serialised by an in-process mutex
//! plus an exclusive lock file, so concurrent first runs (threads or
//! processes) produce exactly one identity.
//!
//! The result is a value, not an error: the caller starts the TLS listener
//! on [`TlsIdentity::Ready`] and skips it on [`TlsIdentity::Absent`].

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::{Duration, SystemTime},
};

use rand_core::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::AppError;

/// Subject alternative names baked into generated certificates.
const LOOPBACK_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

const RSA_BITS: usize = 2048;

/// Certificate validity starts this many days in the past (clock skew).
const BACKDATE_DAYS: i64 = 1;
/// Certificate validity ends this many days after generation.
const VALIDITY_DAYS: i64 = 365;

/// How long a loser waits for a concurrent generator to finish.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);
/// Lock files older than this are assumed to belong to a crashed generator.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

static GENERATION_GUARD: Mutex<()> = Mutex::new(());

/// Where the identity lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl IdentityPaths {
    pub fn new(key_path: impl Into<PathBuf>, cert_path: impl Into<PathBuf>) -> Self {
        Self { key_path: key_path.into(), cert_path: cert_path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.cert_path, "lock")
    }

    fn complete(&self) -> bool {
        self.key_path.is_file() && self.cert_path.is_file()
    }
}

/// PEM-encoded identity read back from disk.
#[derive(Clone)]
pub struct TlsMaterial {
    pub paths: IdentityPaths,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("paths", &self.paths)
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ensure`].
#[derive(Debug, Clone)]
pub enum TlsIdentity {
    /// Both files exist and were read.
    Ready(TlsMaterial),
    /// No usable identity; `reason` is what went wrong.
    Absent { reason: String },
}

impl TlsIdentity {
    pub fn is_ready(&self) -> bool {
        matches!(self, TlsIdentity::Ready(_))
    }
}

/// Make sure a TLS identity exists at `paths`, generating one if needed.
///
/// Blocking (key generation and file I/O); call from `spawn_blocking` in
/// async code.
pub fn ensure(paths: &IdentityPaths) -> TlsIdentity {
    match try_ensure(paths) {
        Ok(material) => {
            info!(
                cert = %material.paths.cert_path.display(),
                key = %material.paths.key_path.display(),
                "tls identity ready"
            );
            TlsIdentity::Ready(material)
        }
        Err(e) => {
            warn!("tls identity unavailable: {e}");
            TlsIdentity::Absent { reason: e.to_string() }
        }
    }
}

fn try_ensure(paths: &IdentityPaths) -> Result<TlsMaterial, AppError> {
    if paths.complete() {
        return load(paths);
    }

    let _in_process = GENERATION_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _lock = LockFile::acquire(&paths.lock_path(), || paths.complete())?;

    // Another generator may have finished while we waited.
    if paths.complete() {
        debug!("tls identity appeared while waiting for the generation guard");
        return load(paths);
    }

    // A lone survivor must be gone before the new key is renamed in, or a
    // reader on the fast path could pair it with the other half.
    discard_partial(paths)?;

    info!(
        cert = %paths.cert_path.display(),
        key = %paths.key_path.display(),
        "tls identity missing: generating self-signed certificate"
    );
    let (cert_pem, key_pem) = generate()?;
    persist(paths, &cert_pem, &key_pem)?;

    Ok(TlsMaterial { paths: paths.clone(), cert_pem: cert_pem.into_bytes(), key_pem: key_pem.into_bytes() })
}

/// Read both files. Either being unreadable makes the whole identity absent.
fn load(paths: &IdentityPaths) -> Result<TlsMaterial, AppError> {
    let cert_pem = fs::read(&paths.cert_path).map_err(|e| {
        AppError::Identity(format!("cannot read {}: {e}", paths.cert_path.display()))
    })?;
    let key_pem = fs::read(&paths.key_path).map_err(|e| {
        AppError::Identity(format!("cannot read {}: {e}", paths.key_path.display()))
    })?;
    Ok(TlsMaterial { paths: paths.clone(), cert_pem, key_pem })
}

/// Remove whichever half of an incomplete identity is on disk.
fn discard_partial(paths: &IdentityPaths) -> Result<(), AppError> {
    for path in [&paths.cert_path, &paths.key_path] {
        match fs::remove_file(path) {
            Ok(()) => warn!(path = %path.display(), "discarding half of an incomplete tls identity"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::Identity(format!("cannot remove {}: {e}", path.display())));
            }
        }
    }
    Ok(())
}

/// Generate a self-signed certificate for the loopback names.
/// Returns `(certificate_pem, private_key_pem)`.
fn generate() -> Result<(String, String), AppError> {
    let names: Vec<String> = LOOPBACK_NAMES.iter().map(|n| n.to_string()).collect();
    let mut params = CertificateParams::new(names)
        .map_err(|e| AppError::Identity(format!("invalid certificate names: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "devprobe");
    dn.push(DnType::LocalityName, "Localhost");
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(BACKDATE_DAYS);
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| AppError::Identity(format!("key generation failed: {e}")))?;
    let key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Identity(format!("cannot encode private key: {e}")))?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| AppError::Identity(format!("rsa key rejected for signing: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AppError::Identity(format!("self-signing failed: {e}")))?;

    Ok((cert.pem(), key_pem.to_string()))
}

/// Write both files via temporaries and rename them into place. On failure
/// every file this call created is removed again.
fn persist(paths: &IdentityPaths, cert_pem: &str, key_pem: &str) -> Result<(), AppError> {
    let key_tmp = with_suffix(&paths.key_path, "tmp");
    let cert_tmp = with_suffix(&paths.cert_path, "tmp");

    let result = (|| -> Result<(), AppError> {
        write_file(&key_tmp, key_pem.as_bytes(), true)?;
        write_file(&cert_tmp, cert_pem.as_bytes(), false)?;
        fs::rename(&key_tmp, &paths.key_path).map_err(|e| {
            AppError::Identity(format!("cannot install {}: {e}", paths.key_path.display()))
        })?;
        if let Err(e) = fs::rename(&cert_tmp, &paths.cert_path) {
            let _ = fs::remove_file(&paths.key_path);
            return Err(AppError::Identity(format!(
                "cannot install {}: {e}",
                paths.cert_path.display()
            )));
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&key_tmp);
        let _ = fs::remove_file(&cert_tmp);
    }
    result
}

fn write_file(path: &Path, bytes: &[u8], secret: bool) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::Identity(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file = options
        .open(path)
        .map_err(|e| AppError::Identity(format!("cannot write {}: {e}", path.display())))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| AppError::Identity(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// ── cross-process guard ───────────────────────────────────────────────────────

/// Exclusive lock file, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create `path` exclusively, waiting for a concurrent holder to release
    /// it. Stops waiting without taking ownership once `done` reports that
    /// the holder has already produced the identity.
    fn acquire(path: &Path, done: impl Fn() -> bool) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Identity(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let deadline = SystemTime::now() + LOCK_WAIT;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => return Ok(Self { path: path.to_path_buf() }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if done() {
                        // Holder finished but has not removed its lock yet;
                        // proceed without owning it.
                        return Ok(Self { path: PathBuf::new() });
                    }
                    if lock_is_stale(path) {
                        warn!(lock = %path.display(), "removing stale identity lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if SystemTime::now() >= deadline {
                        return Err(AppError::Identity(format!(
                            "timed out waiting for {}",
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(AppError::Identity(format!(
                        "cannot create lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn paths_in(dir: &Path) -> IdentityPaths {
        IdentityPaths::new(dir.join("key.pem"), dir.join("cert.pem"))
    }

    #[test]
    fn generates_both_files_when_absent() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());

        let identity = ensure(&paths);

        let TlsIdentity::Ready(material) = identity else { panic!("expected Ready") };
        assert!(paths.key_path.is_file());
        assert!(paths.cert_path.is_file());
        assert!(String::from_utf8_lossy(&material.cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&material.key_pem).contains("PRIVATE KEY"));
        assert!(!paths.lock_path().exists());
        assert!(!with_suffix(&paths.key_path, "tmp").exists());
    }

    #[test]
    fn existing_identity_is_never_modified() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        assert!(ensure(&paths).is_ready());

        let key_before = fs::read(&paths.key_path).unwrap();
        let cert_before = fs::read(&paths.cert_path).unwrap();

        assert!(ensure(&paths).is_ready());

        assert_eq!(fs::read(&paths.key_path).unwrap(), key_before);
        assert_eq!(fs::read(&paths.cert_path).unwrap(), cert_before);
    }

    #[test]
    fn arbitrary_existing_material_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        fs::write(&paths.key_path, b"operator key").unwrap();
        fs::write(&paths.cert_path, b"operator cert").unwrap();

        let TlsIdentity::Ready(material) = ensure(&paths) else { panic!("expected Ready") };

        assert_eq!(material.key_pem, b"operator key");
        assert_eq!(fs::read(&paths.cert_path).unwrap(), b"operator cert");
    }

    #[test]
    fn lone_key_is_replaced_by_a_full_pair() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        fs::write(&paths.key_path, b"orphan").unwrap();

        assert!(ensure(&paths).is_ready());

        assert_ne!(fs::read(&paths.key_path).unwrap(), b"orphan");
        assert!(paths.cert_path.is_file());
    }

    #[test]
    fn lone_certificate_is_replaced_by_a_matching_pair() {
        // A certificate from some other identity, without its key.
        let other = TempDir::new().unwrap();
        let TlsIdentity::Ready(foreign) = ensure(&paths_in(other.path())) else { panic!("expected Ready") };

        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        fs::write(&paths.cert_path, &foreign.cert_pem).unwrap();

        let TlsIdentity::Ready(material) = ensure(&paths) else { panic!("expected Ready") };

        assert_ne!(material.cert_pem, foreign.cert_pem);
        assert_eq!(fs::read(&paths.cert_path).unwrap(), material.cert_pem);
        crate::subsystems::comms::tls::server_config(&material).expect("key and certificate belong together");
    }

    #[test]
    fn discard_partial_clears_the_survivor() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        fs::write(&paths.cert_path, b"stale").unwrap();

        discard_partial(&paths).unwrap();

        assert!(!paths.cert_path.exists());
        assert!(!paths.key_path.exists());
        assert!(!paths.complete());
    }

    #[test]
    fn generated_key_is_rsa_2048() {
        use rsa::pkcs8::DecodePrivateKey;
        use rsa::traits::PublicKeyParts;

        let tmp = TempDir::new().unwrap();
        let TlsIdentity::Ready(material) = ensure(&paths_in(tmp.path())) else { panic!("expected Ready") };
        let pem = String::from_utf8(material.key_pem).unwrap();

        let key_pair = KeyPair::from_pem(&pem).unwrap();
        assert_eq!(key_pair.algorithm(), &rcgen::PKCS_RSA_SHA256);

        let rsa_key = RsaPrivateKey::from_pkcs8_pem(&pem).unwrap();
        assert!(rsa_key.size() * 8 >= RSA_BITS);
    }

    #[test]
    fn unwritable_location_is_absent_without_partial_files() {
        let tmp = TempDir::new().unwrap();
        // A regular file where a directory is expected makes every write fail.
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let paths = paths_in(&blocker.join("tls"));

        let identity = ensure(&paths);

        assert!(matches!(identity, TlsIdentity::Absent { .. }));
        assert!(!paths.key_path.exists());
        assert!(!paths.cert_path.exists());
    }

    #[test]
    fn generated_certificate_covers_loopback_names() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        let TlsIdentity::Ready(material) = ensure(&paths) else { panic!("expected Ready") };

        let pem = String::from_utf8(material.cert_pem).unwrap();
        let params = CertificateParams::from_ca_cert_pem(&pem).unwrap();
        let sans: Vec<String> = params
            .subject_alt_names
            .iter()
            .map(|san| match san {
                rcgen::SanType::DnsName(name) => name.as_str().to_string(),
                rcgen::SanType::IpAddress(ip) => ip.to_string(),
                other => format!("{other:?}"),
            })
            .collect();
        assert!(sans.contains(&"localhost".to_string()));
        assert!(sans.contains(&"127.0.0.1".to_string()));

        let now = OffsetDateTime::now_utc();
        assert!(params.not_before < now - time::Duration::hours(23));
        assert!(params.not_after > now + time::Duration::days(364));
    }

    #[test]
    fn concurrent_first_runs_produce_one_identity() {
        let tmp = TempDir::new().unwrap();
        let paths = Arc::new(paths_in(tmp.path()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let paths = paths.clone();
                thread::spawn(move || match ensure(&paths) {
                    TlsIdentity::Ready(m) => m.cert_pem,
                    TlsIdentity::Absent { reason } => panic!("absent: {reason}"),
                })
            })
            .collect();
        let certs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(certs.windows(2).all(|w| w[0] == w[1]), "all callers must see the same certificate");
        assert_eq!(fs::read(&paths.cert_path).unwrap(), certs[0]);
    }

    #[test]
    fn waits_out_a_foreign_lock_holder() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        fs::write(paths.lock_path(), b"").unwrap();

        let lock = paths.lock_path();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            fs::remove_file(lock).unwrap();
        });

        assert!(ensure(&paths).is_ready());
        releaser.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn private_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(tmp.path());
        assert!(ensure(&paths).is_ready());
        let mode = fs::metadata(&paths.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
