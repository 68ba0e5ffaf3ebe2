//! Serving certificates for the webhook
//!
//! The API server only calls webhooks over TLS and verifies them against the
//! CA bundle in the MutatingWebhookConfiguration. On startup the webhook
//! either loads an existing CA and serving pair from its certificate
//! directory or generates a fresh self-signed CA and signs a serving
//! certificate for the service DNS names, writing all three files back.

use std::fs;
use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::info;

/// File name of the CA certificate inside the certificate directory
pub const CA_CERT_FILE: &str = "ca.crt";
/// File name of the serving certificate
pub const TLS_CERT_FILE: &str = "tls.crt";
/// File name of the serving private key
pub const TLS_KEY_FILE: &str = "tls.key";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Self-signed CA that signs the webhook serving certificate
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM
    ca_key_pem: String,
    /// PEM-encoded CA certificate, published as the webhook CA bundle
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("faketime-injector".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Generate a TLS server certificate for the given SANs, signed by this CA
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(&self, common_name: &str, sans: &[String]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;
        let server_key_pem = server_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key_pem))
    }
}

/// CA bundle plus serving pair used by the HTTPS listener
#[derive(Clone)]
pub struct TlsMaterial {
    /// CA certificate PEM, published in the webhook configuration
    pub ca_cert_pem: String,
    /// Serving certificate PEM
    pub cert_pem: String,
    /// Serving private key PEM
    pub key_pem: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the private key in debug output
        f.debug_struct("TlsMaterial")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Generate a new CA and serving pair for `common_name` and `sans`
    pub fn generate(common_name: &str, sans: &[String]) -> Result<Self> {
        let ca = CertificateAuthority::new("faketime-injector CA")?;
        let (cert_pem, key_pem) = ca.generate_server_cert(common_name, sans)?;
        Ok(Self {
            ca_cert_pem: ca.ca_cert_pem().to_string(),
            cert_pem,
            key_pem,
        })
    }

    /// Load previously written material from `dir`
    ///
    /// Returns `Ok(None)` when any of the three files is missing.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let paths = [
            dir.join(CA_CERT_FILE),
            dir.join(TLS_CERT_FILE),
            dir.join(TLS_KEY_FILE),
        ];
        if !paths.iter().all(|p| p.exists()) {
            return Ok(None);
        }

        let material = Self {
            ca_cert_pem: fs::read_to_string(&paths[0])?,
            cert_pem: fs::read_to_string(&paths[1])?,
            key_pem: fs::read_to_string(&paths[2])?,
        };
        material.validate()?;
        Ok(Some(material))
    }

    /// Write the material into `dir`, creating it if needed
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CA_CERT_FILE), &self.ca_cert_pem)?;
        fs::write(dir.join(TLS_CERT_FILE), &self.cert_pem)?;
        fs::write(dir.join(TLS_KEY_FILE), &self.key_pem)?;
        Ok(())
    }

    /// Load material from `dir`, or generate and persist it when absent
    pub fn ensure(dir: &Path, common_name: &str, sans: &[String]) -> Result<Self> {
        if let Some(existing) = Self::load(dir)? {
            info!(dir = %dir.display(), "Loaded webhook certificates");
            return Ok(existing);
        }

        let material = Self::generate(common_name, sans)?;
        material.write(dir)?;
        info!(dir = %dir.display(), common_name = %common_name, "Generated webhook certificates");
        Ok(material)
    }

    /// Check that every PEM block parses and the key is usable
    pub fn validate(&self) -> Result<()> {
        parse_pem(&self.ca_cert_pem)?;
        parse_pem(&self.cert_pem)?;
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse server key: {}", e)))?;
        Ok(())
    }
}
