//! # Per-launch PKI
//!
//! Every launch mints a throwaway CA and two leaf certificates signed by it:
//! one for the plugin's server, one for the launcher. Both sides trust only
//! that CA, so the transport is mutually authenticated and scoped to a
//! single subprocess.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use time::OffsetDateTime;

use super::PLUGIN_SERVER_NAME;
use crate::errors::TlsError;
use crate::secrets::SecretString;

/// Allowance for clock skew between certificate creation and first use.
const BACKDATE: Duration = Duration::from_secs(300);

/// PEM material for one TLS endpoint.
#[derive(Clone)]
pub struct TlsBundle {
    pub certificate: String,
    pub private_key: SecretString,
    pub ca_certificate: String,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// CA plus the plugin and launcher bundles of one launch.
#[derive(Debug, Clone)]
pub struct PluginPki {
    pub ca_certificate: String,
    pub plugin: TlsBundle,
    pub launcher: TlsBundle,
}

impl PluginPki {
    pub fn generate(ttl: Duration) -> Result<Self, TlsError> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - BACKDATE;
        let not_after = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or(TlsError::Validity {
                ttl_secs: ttl.as_secs(),
            })?;

        let ca_key = KeyPair::generate().map_err(|source| TlsError::Generation {
            what: "CA key pair",
            source,
        })?;
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = common_name("dbplugin launch CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|source| TlsError::Generation {
                what: "CA certificate",
                source,
            })?;
        let ca_certificate = ca_cert.pem();

        let plugin = leaf("dbplugin plugin", &ca_cert, &ca_key, not_before, not_after)?;
        let launcher = leaf("dbplugin launcher", &ca_cert, &ca_key, not_before, not_after)?;

        Ok(Self {
            plugin: TlsBundle {
                certificate: plugin.0,
                private_key: plugin.1,
                ca_certificate: ca_certificate.clone(),
            },
            launcher: TlsBundle {
                certificate: launcher.0,
                private_key: launcher.1,
                ca_certificate: ca_certificate.clone(),
            },
            ca_certificate,
        })
    }
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

// Leaves are valid for both server and client auth: the launcher's leaf also
// serves the wrapping callback endpoint.
fn leaf(
    name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(String, SecretString), TlsError> {
    let key = KeyPair::generate().map_err(|source| TlsError::Generation {
        what: "leaf key pair",
        source,
    })?;
    let mut params =
        CertificateParams::new(vec![PLUGIN_SERVER_NAME.to_string(), "127.0.0.1".to_string()])
            .map_err(|source| TlsError::Generation {
                what: "leaf certificate parameters",
                source,
            })?;
    params.distinguished_name = common_name(name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .map_err(|source| TlsError::Generation {
            what: "leaf certificate",
            source,
        })?;

    Ok((cert.pem(), SecretString::new(key.serialize_pem())))
}

/// Install ring as the process-wide rustls provider if none is set yet.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_certificates(pem: &str, what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::InvalidCertificatePem { what, source })?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertificateChain { what });
    }
    Ok(certs)
}

fn parse_private_key(pem: &SecretString, what: &'static str) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem.expose_secret().as_bytes()).map_err(|source| {
        TlsError::InvalidPrivateKey {
            what,
            source: Some(source),
        }
    })
}

fn root_store(ca_pem: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem, "CA certificate")? {
        roots
            .add(cert)
            .map_err(|source| TlsError::TrustAnchor { source })?;
    }
    Ok(roots)
}

/// Server configuration for `bundle`. With `require_client_auth`, peers must
/// present a certificate issued by the bundle's CA.
pub fn server_config(bundle: &TlsBundle, require_client_auth: bool) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let chain = parse_certificates(&bundle.certificate, "server certificate")?;
    let key = parse_private_key(&bundle.private_key, "server private key")?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Config { source })?;

    let builder = if require_client_auth {
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(root_store(&bundle.ca_certificate)?),
            provider,
        )
        .build()
        .map_err(|source| TlsError::ClientVerifier { source })?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    builder
        .with_single_cert(chain, key)
        .map_err(|source| TlsError::Config { source })
}

/// Client configuration presenting `bundle` and trusting only its CA.
pub fn client_config(bundle: &TlsBundle) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let chain = parse_certificates(&bundle.certificate, "client certificate")?;
    let key = parse_private_key(&bundle.private_key, "client private key")?;

    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Config { source })?
        .with_root_certificates(root_store(&bundle.ca_certificate)?)
        .with_client_auth_cert(chain, key)
        .map_err(|source| TlsError::Config { source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_material_parses() {
        let pki = PluginPki::generate(Duration::from_secs(3600)).unwrap();

        assert!(pki.ca_certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(pki.plugin.ca_certificate, pki.ca_certificate);
        assert_eq!(pki.launcher.ca_certificate, pki.ca_certificate);
        assert_ne!(pki.plugin.certificate, pki.launcher.certificate);

        assert_eq!(parse_certificates(&pki.plugin.certificate, "plugin").unwrap().len(), 1);
        assert!(parse_private_key(&pki.plugin.private_key, "plugin").is_ok());
    }

    #[test]
    fn test_each_launch_gets_a_fresh_ca() {
        let first = PluginPki::generate(Duration::from_secs(3600)).unwrap();
        let second = PluginPki::generate(Duration::from_secs(3600)).unwrap();
        assert_ne!(first.ca_certificate, second.ca_certificate);
    }

    #[test]
    fn test_tls_configs_build() {
        let pki = PluginPki::generate(Duration::from_secs(3600)).unwrap();
        assert!(server_config(&pki.plugin, true).is_ok());
        assert!(server_config(&pki.launcher, false).is_ok());
        assert!(client_config(&pki.launcher).is_ok());
    }

    #[test]
    fn test_invalid_material_is_rejected() {
        let pki = PluginPki::generate(Duration::from_secs(3600)).unwrap();
        let broken = TlsBundle {
            certificate: "not a certificate".to_string(),
            ..pki.plugin.clone()
        };
        assert!(matches!(
            server_config(&broken, true),
            Err(TlsError::EmptyCertificateChain { .. })
        ));

        let no_key = TlsBundle {
            private_key: SecretString::new(""),
            ..pki.plugin
        };
        assert!(matches!(
            client_config(&no_key),
            Err(TlsError::InvalidPrivateKey { .. })
        ));
    }

    #[test]
    fn test_unrepresentable_lifetime_is_an_error() {
        let err = PluginPki::generate(Duration::from_secs(u64::MAX)).unwrap_err();
        assert!(matches!(err, TlsError::Validity { .. }));

        let err = PluginPki::generate(Duration::from_secs(100_000_000_000 * 3600)).unwrap_err();
        assert!(matches!(err, TlsError::Validity { .. }));
    }

    #[test]
    fn test_bundle_debug_hides_key() {
        let pki = PluginPki::generate(Duration::from_secs(3600)).unwrap();
        let debug = format!("{:?}", pki.plugin);
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("[REDACTED]"));
    }
}
