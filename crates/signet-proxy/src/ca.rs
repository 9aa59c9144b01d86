//! Certificate Authority management for the intercepting proxy.
//!
//! Holds the root key/certificate pair and signs per-host leaf certificates
//! on demand, caching them by hostname for the process lifetime. The root
//! is ephemeral by default; [`RootAuthority::load_or_generate`] persists it
//! to disk so it can be installed in a client trust store once.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};

pub use crate::error::CertificateError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "signet-ca.crt";
const CA_KEY_FILENAME: &str = "signet-ca.key";

/// Root certificate validity.
const CA_VALIDITY_DAYS: i64 = 30;

/// Leaf certificate validity; expired cache entries are re-signed.
const LEAF_VALIDITY_HOURS: i64 = 12;

/// Margin applied to expiry checks and `not_before` for clock skew.
const CLOCK_SKEW_MINUTES: i64 = 5;

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

/// The root CA: signs per-host leaf certificates and caches them.
///
/// The private key never leaves this value; clients only ever see the leaf
/// chain. The leaf cache is the sole state shared across connections.
pub struct RootAuthority {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    cache: RwLock<HashMap<String, CachedLeaf>>,
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("cached_leaves", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Generates a fresh ephemeral root for this process.
    pub fn generate() -> Result<Self, CertificateError> {
        let key_pair = KeyPair::generate()?;
        let cert = Self::ca_params().self_signed(&key_pair)?;
        let authority = Self::from_pem_parts(cert.pem(), key_pair.serialize_pem())?;
        tracing::debug!("generated ephemeral root certificate");
        Ok(authority)
    }

    /// Loads the root from `dir`, generating and persisting one if absent.
    pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CA_CERT_FILENAME);
        let key_path = dir.join(CA_KEY_FILENAME);

        if cert_path.exists() && key_path.exists() {
            let authority = Self::from_pem_parts(
                fs::read_to_string(&cert_path)?,
                fs::read_to_string(&key_path)?,
            )?;
            tracing::info!("loaded root certificate from {:?}", cert_path);
            Ok(authority)
        } else {
            let authority = Self::generate()?;
            authority.persist(dir)?;
            tracing::info!("generated new root certificate at {:?}", cert_path);
            Ok(authority)
        }
    }

    /// Writes the root certificate and key as PEM files under `dir`.
    pub fn persist(&self, dir: impl AsRef<Path>) -> Result<(), CertificateError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CA_CERT_FILENAME), &self.cert_pem)?;
        fs::write(dir.join(CA_KEY_FILENAME), &self.key_pem)?;
        Ok(())
    }

    /// Returns the root certificate in PEM format (for trust-store install).
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the root certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns a certificate chain for `host`, signing a new leaf on a cache
    /// miss or after expiry.
    ///
    /// The same hostname yields the identical cached entry (same serial and
    /// key) until the leaf nears expiry. Lookup and insert each hold the
    /// cache lock briefly; signing itself runs outside it, so distinct
    /// hostnames can sign concurrently.
    pub fn sign_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let now = OffsetDateTime::now_utc();
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(host) {
                if entry.not_after - Duration::minutes(CLOCK_SKEW_MINUTES) > now {
                    return Ok(Arc::clone(&entry.key));
                }
            }
        }

        let (key, not_after) = self.sign_leaf_uncached(host, now)?;
        let key = Arc::new(key);
        self.cache.write().insert(
            host.to_string(),
            CachedLeaf {
                key: Arc::clone(&key),
                not_after,
            },
        );
        tracing::debug!(host, "signed leaf certificate");
        Ok(key)
    }

    fn sign_leaf_uncached(
        &self,
        host: &str,
        now: OffsetDateTime,
    ) -> Result<(CertifiedKey, OffsetDateTime), CertificateError> {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CertificateError::InvalidHost(host.to_string()))?,
            ),
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let not_after = now + Duration::hours(LEAF_VALIDITY_HOURS);
        params.not_before = now - Duration::minutes(CLOCK_SKEW_MINUTES);
        params.not_after = not_after;

        let leaf_key = KeyPair::generate()?;
        let cert = params.signed_by(&leaf_key, &self.issuer)?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CertificateError::SigningKey)?;

        // Serve leaf + root so clients that want the full chain can build it.
        let chain = vec![cert_der, self.cert_der.clone()];
        Ok((CertifiedKey::new(chain, signing_key), not_after))
    }

    fn ca_params() -> CertificateParams {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Signet Root CA");
        dn.push(DnType::OrganizationName, "Signet");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(CLOCK_SKEW_MINUTES);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        params
    }

    fn from_pem_parts(cert_pem: String, key_pem: String) -> Result<Self, CertificateError> {
        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let block =
            pem::parse(&cert_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;
        let cert_der = CertificateDer::from(block.into_contents());

        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            issuer,
            cache: RwLock::new(HashMap::new()),
        })
    }
}
