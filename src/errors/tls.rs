use rustls::pki_types::pem;
use thiserror::Error;

/// Errors raised while minting per-launch certificates or building TLS configurations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Key pair or certificate generation failed.
    #[error("Failed to generate {what}: {source}")]
    Generation {
        what: &'static str,
        #[source]
        source: rcgen::Error,
    },

    /// No certificates were found in the supplied PEM.
    #[error("{what} does not contain any certificates")]
    EmptyCertificateChain { what: &'static str },

    /// The certificate PEM contents were invalid or unreadable.
    #[error("{what} is not a valid PEM: {source}")]
    InvalidCertificatePem {
        what: &'static str,
        #[source]
        source: pem::Error,
    },

    /// The private key PEM contents were invalid or unsupported.
    #[error("{what} does not contain a supported private key")]
    InvalidPrivateKey {
        what: &'static str,
        #[source]
        source: Option<pem::Error>,
    },

    /// The CA certificate could not be added to a trust store.
    #[error("Failed to trust CA certificate: {source}")]
    TrustAnchor {
        #[source]
        source: rustls::Error,
    },

    /// rustls rejected the assembled configuration.
    #[error("Failed to build TLS configuration: {source}")]
    Config {
        #[source]
        source: rustls::Error,
    },

    /// The client certificate verifier could not be built.
    #[error("Failed to build client certificate verifier: {source}")]
    ClientVerifier {
        #[source]
        source: rustls::server::VerifierBuilderError,
    },

    /// The requested certificate lifetime cannot be represented.
    #[error("Certificate lifetime of {ttl_secs}s is out of range")]
    Validity { ttl_secs: u64 },
}
