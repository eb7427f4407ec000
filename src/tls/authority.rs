//! Per-host leaf certificates for TLS interception.
//!
//! The authority wraps a root CA loaded from disk. Leaves reuse the CA key
//! pair, copy the CA subject and validity window with the common name
//! replaced by the target host, and are cached both in memory and as DER
//! files under the cache directory. A single lock covers the whole
//! lookup-or-generate-and-persist sequence.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    #[error("Failed to load CA: {0}")]
    Load(String),

    #[error("Failed to persist certificate to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid host for certificate: {0:?}")]
    InvalidHost(String),

    #[error("CA key does not match certificate: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A forged leaf and the TLS server configuration that presents it.
pub struct CertRecord {
    pub common_name: String,
    pub leaf: CertificateDer<'static>,
    pub key: Arc<KeyPair>,
    pub server_config: Arc<ServerConfig>,
}

pub struct CertAuthority {
    ca_params: CertificateParams,
    /// CA re-issued from `ca_params`; rcgen signs leaves against this.
    issuer: Certificate,
    ca_der: CertificateDer<'static>,
    ca_key: Arc<KeyPair>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<CertRecord>>>,
}

impl CertAuthority {
    /// Loads a PEM CA certificate and PEM PKCS#8 key, caching leaves in `dir`.
    pub fn load(
        ca_cert_path: impl AsRef<Path>,
        ca_key_path: impl AsRef<Path>,
        dir: impl Into<PathBuf>,
    ) -> Result<Self, CertError> {
        let ca_cert_path = ca_cert_path.as_ref();
        let cert_pem = fs::read(ca_cert_path)
            .map_err(|e| CertError::Load(format!("{}: {e}", ca_cert_path.display())))?;
        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .next()
            .ok_or_else(|| CertError::Load(format!("no certificate in {}", ca_cert_path.display())))?
            .map_err(|e| CertError::Load(e.to_string()))?;

        let ca_key_path = ca_key_path.as_ref();
        let key_pem = fs::read_to_string(ca_key_path)
            .map_err(|e| CertError::Load(format!("{}: {e}", ca_key_path.display())))?;
        let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Load(e.to_string()))?;

        tracing::info!(ca_cert = %ca_cert_path.display(), "Loaded CA certificate");
        Self::new(ca_der, ca_key, dir)
    }

    pub fn new(
        ca_der: CertificateDer<'static>,
        ca_key: KeyPair,
        dir: impl Into<PathBuf>,
    ) -> Result<Self, CertError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&ca_der)
            .map_err(|e| CertError::Load(e.to_string()))?;
        if parsed.public_key().raw != ca_key.public_key_der().as_slice() {
            return Err(CertError::InvalidKey(
                "public key of CA certificate differs from the private key".into(),
            ));
        }
        let not_before = parsed.validity().not_before.to_datetime();
        let not_after = parsed.validity().not_after.to_datetime();

        let ca_params = CertificateParams::from_ca_cert_der(&ca_der)
            .map_err(|e| CertError::Load(e.to_string()))?;
        let issuer = ca_params
            .clone()
            .self_signed(&ca_key)
            .map_err(|e| CertError::Load(e.to_string()))?;

        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            ca_params,
            issuer,
            ca_der,
            ca_key: Arc::new(ca_key),
            not_before,
            not_after,
            dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a self-signed root CA and writes it as PEM.
    pub fn generate_root(
        common_name: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), CertError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "egress");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::Generation(e.to_string()))?;

        for path in [cert_path.as_ref(), key_path.as_ref()] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        write_file(cert_path.as_ref(), cert.pem().as_bytes())?;
        write_file(key_path.as_ref(), key_pair.serialize_pem().as_bytes())?;

        tracing::info!(
            ca_cert_path = %cert_path.as_ref().display(),
            ca_key_path = %key_path.as_ref().display(),
            "Generated root CA"
        );
        Ok(())
    }

    /// Returns the leaf for `host`: memory cache, then disk cache, then a
    /// freshly generated and persisted one.
    pub fn get(&self, host: &str) -> Result<Arc<CertRecord>, CertError> {
        validate_host(host)?;
        let mut cache = self.lock();

        if let Some(record) = cache.get(host) {
            return Ok(record.clone());
        }

        let path = self.leaf_path(host);
        let leaf = match self.load_cached(&path) {
            Some(der) => {
                tracing::debug!(host, "Using leaf certificate from disk");
                der
            }
            None => {
                let der = self.generate_leaf(host)?;
                write_file(&path, der.as_ref())?;
                tracing::info!(host, path = %path.display(), "Generated leaf certificate");
                der
            }
        };

        let record = Arc::new(self.build_record(host, leaf)?);
        cache.insert(host.to_string(), record.clone());
        Ok(record)
    }

    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        Ok(self.get(host)?.server_config.clone())
    }

    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    fn leaf_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}.crt"))
    }

    /// A cached leaf is only trusted if it carries the CA public key.
    fn load_cached(&self, path: &Path) -> Option<CertificateDer<'static>> {
        let der = fs::read(path).ok()?;
        let matches = match x509_parser::parse_x509_certificate(&der) {
            Ok((_, cert)) => cert.public_key().raw == self.ca_key.public_key_der().as_slice(),
            Err(_) => false,
        };
        if !matches {
            tracing::warn!(path = %path.display(), "Discarding cached leaf that does not pair with the CA");
            return None;
        }
        Some(CertificateDer::from(der))
    }

    fn generate_leaf(&self, host: &str) -> Result<CertificateDer<'static>, CertError> {
        let mut params = CertificateParams::default();

        let mut dn = self.ca_params.distinguished_name.clone();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.serial_number = Some(serial_for(host));
        params.not_before = self.not_before;
        params.not_after = self.not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.to_string()
                    .try_into()
                    .map_err(|e| CertError::Generation(format!("invalid DNS name {host}: {e}")))?,
            ),
        };
        params.subject_alt_names = vec![san];

        let cert = params
            .signed_by(self.ca_key.as_ref(), &self.issuer, &self.ca_key)
            .map_err(|e| CertError::Generation(e.to_string()))?;
        Ok(cert.der().clone())
    }

    fn build_record(&self, host: &str, leaf: CertificateDer<'static>) -> Result<CertRecord, CertError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.ca_key.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.clone(), self.ca_der.clone()], key)
            .map_err(|e| CertError::Config(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(CertRecord {
            common_name: host.to_string(),
            leaf,
            key: self.ca_key.clone(),
            server_config: Arc::new(config),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CertRecord>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Deterministic, positive serial derived from the host name.
fn serial_for(host: &str) -> SerialNumber {
    let digest = Sha256::digest(host.as_bytes());
    let mut serial = digest[..16].to_vec();
    serial[0] &= 0x7f;
    SerialNumber::from_slice(&serial)
}

fn validate_host(host: &str) -> Result<(), CertError> {
    let bad = host.is_empty()
        || host == "."
        || host.contains("..")
        || host.contains(['/', '\\', '\0']);
    if bad {
        return Err(CertError::InvalidHost(host.to_string()));
    }
    Ok(())
}

/// Writes `data`, removing the file again if the write does not complete.
fn write_file(path: &Path, data: &[u8]) -> Result<(), CertError> {
    fs::write(path, data).map_err(|source| {
        let _ = fs::remove_file(path);
        CertError::Persist {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::prelude::*;

    pub(crate) fn test_authority(dir: &TempDir) -> CertAuthority {
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        CertAuthority::generate_root("egress test CA", &cert_path, &key_path)
            .expect("Failed to generate CA");
        CertAuthority::load(&cert_path, &key_path, dir.path().join("certs"))
            .expect("Failed to load CA")
    }

    fn common_name(name: &X509Name<'_>) -> String {
        name.iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_generate_root_writes_pem() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        CertAuthority::generate_root("egress test CA", &cert_path, &key_path).unwrap();

        let pem = fs::read_to_string(&cert_path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        let key_pem = fs::read_to_string(&key_path).unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_leaf_is_stable_and_cached() {
        let dir = TempDir::new().unwrap();
        let authority = test_authority(&dir);

        let first = authority.get("api.example.com").unwrap();
        let second = authority.get("api.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.leaf.as_ref(), second.leaf.as_ref());
        assert_eq!(first.common_name, "api.example.com");
        assert!(dir.path().join("certs").join("api.example.com.crt").exists());
    }

    #[test]
    fn test_leaf_copies_ca_subject_and_validity() {
        let dir = TempDir::new().unwrap();
        let authority = test_authority(&dir);
        let record = authority.get("www.example.org").unwrap();

        let (_, ca) = parse_x509_certificate(authority.ca_der()).unwrap();
        let (_, leaf) = parse_x509_certificate(&record.leaf).unwrap();

        assert_eq!(common_name(leaf.subject()), "www.example.org");
        assert_eq!(leaf.issuer().to_string(), ca.subject().to_string());
        assert_eq!(leaf.validity().not_before, ca.validity().not_before);
        assert_eq!(leaf.validity().not_after, ca.validity().not_after);
        assert_eq!(leaf.public_key().raw, ca.public_key().raw);
        assert!(!leaf.is_ca());
    }

    #[test]
    fn test_disk_cache_survives_restart() {
        let dir = TempDir::new().unwrap();
        let first = test_authority_reload(&dir, true).get("disk.example").unwrap();
        let second = test_authority_reload(&dir, false).get("disk.example").unwrap();
        assert_eq!(first.leaf.as_ref(), second.leaf.as_ref());
    }

    fn test_authority_reload(dir: &TempDir, init: bool) -> CertAuthority {
        if init {
            return test_authority(dir);
        }
        CertAuthority::load(
            dir.path().join("ca.crt"),
            dir.path().join("ca.key"),
            dir.path().join("certs"),
        )
        .unwrap()
    }

    #[test]
    fn test_corrupt_disk_entry_is_regenerated() {
        let dir = TempDir::new().unwrap();
        let authority = test_authority(&dir);
        let path = dir.path().join("certs").join("broken.example.crt");
        fs::write(&path, b"not a certificate").unwrap();

        let record = authority.get("broken.example").unwrap();
        assert_eq!(fs::read(&path).unwrap(), record.leaf.as_ref());
    }

    #[test]
    fn test_serial_is_deterministic_per_host() {
        assert_eq!(serial_for("a.example"), serial_for("a.example"));
        assert_ne!(serial_for("a.example"), serial_for("b.example"));
    }

    #[test]
    fn test_ip_literal_gets_ip_san() {
        let dir = TempDir::new().unwrap();
        let authority = test_authority(&dir);
        let record = authority.get("192.0.2.10").unwrap();

        let (_, leaf) = parse_x509_certificate(&record.leaf).unwrap();
        let san = leaf.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [192, 0, 2, 10])));
    }

    #[test]
    fn test_rejects_path_like_hosts() {
        let dir = TempDir::new().unwrap();
        let authority = test_authority(&dir);
        assert!(matches!(
            authority.get("../escape"),
            Err(CertError::InvalidHost(_))
        ));
        assert!(matches!(authority.get(""), Err(CertError::InvalidHost(_))));
    }

    #[test]
    fn test_mismatched_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("ca.crt");
        CertAuthority::generate_root("one", &cert_path, dir.path().join("one.key")).unwrap();
        CertAuthority::generate_root("two", dir.path().join("two.crt"), dir.path().join("two.key"))
            .unwrap();

        let result = CertAuthority::load(&cert_path, dir.path().join("two.key"), dir.path());
        assert!(matches!(result, Err(CertError::InvalidKey(_))));
    }
}
