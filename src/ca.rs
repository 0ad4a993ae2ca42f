//! Certificate authority: loads root CA material from disk and mints
//! short-lived leaf certificates per intercepted host, grounded on
//! `original_source/proxy/certificates.go`. Uses `rcgen` directly rather
//! than a MITM framework so the leaf lifetime and key usages stay under
//! this crate's control.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::error::CertError;

/// Leaf certs within this margin of expiry are treated as already
/// expired, so a connection never hands out a cert that dies mid-request.
const EXPIRY_MARGIN: StdDuration = StdDuration::from_secs(60);

struct CachedLeaf {
    config: Arc<ServerConfig>,
    not_after: OffsetDateTime,
}

/// A loaded root CA, able to mint and cache per-host leaf certificates.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    lifetime: RwLock<StdDuration>,
    cache: RwLock<HashMap<String, CachedLeaf>>,
}

pub fn cert_path_from_env() -> PathBuf {
    std::env::var("PROXY_CACERT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("certs/ca.crt"))
}

pub fn key_path_from_env() -> PathBuf {
    std::env::var("PROXY_CAKEY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("certs/ca.key"))
}

impl CertificateAuthority {
    /// Loads the root certificate and key from PEM files on disk. The
    /// lifetime given here governs every leaf minted afterwards; it can
    /// be changed at runtime via `set_lifetime`.
    pub fn load(cert_path: &Path, key_path: &Path, lifetime_hours: i64) -> Result<Self, CertError> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|source| CertError::ReadFile {
            path: cert_path.display().to_string(),
            source,
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|source| CertError::ReadFile {
            path: key_path.display().to_string(),
            source,
        })?;

        let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Parse(e.to_string()))?;
        let ca_params =
            CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| CertError::Parse(e.to_string()))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| CertError::Parse(e.to_string()))?;

        Ok(Self {
            ca_cert,
            ca_key,
            lifetime: RwLock::new(lifetime_to_duration(lifetime_hours)),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Applies a new leaf lifetime to future mints and drops every cached
    /// leaf, so a config replace takes effect immediately rather than
    /// once existing cache entries happen to expire.
    pub async fn set_lifetime_hours(&self, hours: i64) {
        *self.lifetime.write().await = lifetime_to_duration(hours);
        self.cache.write().await.clear();
    }

    /// Returns a TLS server config presenting a leaf certificate for
    /// `host`, minting and caching one if needed. Concurrent misses for
    /// the same host race harmlessly; the last writer wins.
    pub async fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        if let Some(cached) = self.cache.read().await.get(host) {
            if cached.not_after - OffsetDateTime::now_utc() > EXPIRY_MARGIN {
                return Ok(cached.config.clone());
            }
        }

        let lifetime = *self.lifetime.read().await;
        let config = self.mint(host, lifetime)?;
        let not_after = OffsetDateTime::now_utc() + lifetime;
        self.cache.write().await.insert(
            host.to_string(),
            CachedLeaf {
                config: config.clone(),
                not_after,
            },
        );
        Ok(config)
    }

    fn mint(&self, host: &str, lifetime: StdDuration) -> Result<Arc<ServerConfig>, CertError> {
        let mut params =
            CertificateParams::new(vec![host.to_string()]).map_err(|e| CertError::Mint(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::hours(2);
        params.not_after = OffsetDateTime::now_utc() + lifetime;

        let leaf_key =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| CertError::Mint(e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| CertError::Mint(e.to_string()))?;

        let leaf_der: CertificateDer<'static> = leaf_cert.der().clone();
        let ca_der: CertificateDer<'static> = self.ca_cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf_der, ca_der], key_der)
            .map_err(|e| CertError::Mint(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Non-positive lifetimes mint leaves that are already expired, a
/// deliberate testing aid rather than a parse error.
fn lifetime_to_duration(hours: i64) -> StdDuration {
    if hours <= 0 {
        StdDuration::ZERO
    } else {
        StdDuration::from_secs((hours as u64) * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, Ia5String, SanType};

    fn write_test_ca(dir: &Path) -> (PathBuf, PathBuf) {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(3650);
        let cert = params.self_signed(&key).unwrap();

        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca-key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        let _ = SanType::Rfc822Name(Ia5String::try_from("unused@example.test".to_string()).unwrap());
        (cert_path, key_path)
    }

    #[tokio::test]
    async fn mints_and_caches_a_leaf_for_a_host() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_test_ca(dir.path());
        let ca = CertificateAuthority::load(&cert_path, &key_path, 24).unwrap();

        let first = ca.server_config_for_host("example.test").await.unwrap();
        let second = ca.server_config_for_host("example.test").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second), "cached leaf should be reused");
    }

    #[tokio::test]
    async fn distinct_hosts_get_distinct_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_test_ca(dir.path());
        let ca = CertificateAuthority::load(&cert_path, &key_path, 24).unwrap();

        let a = ca.server_config_for_host("a.example.test").await.unwrap();
        let b = ca.server_config_for_host("b.example.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn non_positive_lifetime_mints_already_expired_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_test_ca(dir.path());
        let ca = CertificateAuthority::load(&cert_path, &key_path, 0).unwrap();
        // A second fetch should re-mint rather than reuse, because the
        // cached entry is immediately past the expiry margin.
        let first = ca.server_config_for_host("expiring.test").await.unwrap();
        let second = ca.server_config_for_host("expiring.test").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
