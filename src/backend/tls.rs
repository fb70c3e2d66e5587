//! TLS connector construction for the two backends.

use crate::config::Config;
use crate::error::SpamdError;

/// Host portion of a `host:port` address, brackets stripped for IPv6
/// literals. Used as the TLS server name.
pub(crate) fn extract_host(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => address,
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(feature = "async")]
pub(crate) mod rustls {
    use std::sync::Arc;

    use tokio_rustls::rustls::crypto::{aws_lc_rs as provider, CryptoProvider};
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
    use tokio_rustls::TlsConnector;

    use super::*;

    /// AES-256-GCM members of the configured cipher set. rustls implements
    /// neither CBC nor static-RSA key exchange, so those suites cannot be
    /// offered here.
    fn cipher_suites() -> Vec<SupportedCipherSuite> {
        vec![
            provider::cipher_suite::TLS13_AES_256_GCM_SHA384,
            provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ]
    }

    pub(crate) fn build_connector(config: &Config) -> Result<TlsConnector, SpamdError> {
        let provider = Arc::new(CryptoProvider {
            cipher_suites: cipher_suites(),
            ..provider::default_provider()
        });

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
            .map_err(|e| SpamdError::Tls(e.to_string()))?;

        let client_config = if config.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    danger::NoCertificateVerification::new(provider),
                ))
                .with_no_client_auth()
        } else if let Some(path) = &config.root_ca {
            builder
                .with_root_certificates(load_root_store(path)?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    rustls_platform_verifier::Verifier::new().with_provider(provider),
                ))
                .with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(client_config)))
    }

    /// Certificate pool populated from the configured PEM file. Read once
    /// per request that opens a TLS connection.
    fn load_root_store(path: &std::path::Path) -> Result<RootCertStore, SpamdError> {
        let data = std::fs::read(path)?;
        let certs = rustls_pemfile::certs(&mut data.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SpamdError::Tls(format!("{}: {e}", path.display())))?;
        let mut store = RootCertStore::empty();
        store.add_parsable_certificates(certs);
        Ok(store)
    }

    pub(crate) fn server_name(address: &str) -> Result<ServerName<'static>, SpamdError> {
        let host = extract_host(address);
        ServerName::try_from(host.to_string())
            .map_err(|_| SpamdError::Tls(format!("{host} is not a valid server name")))
    }

    mod danger {
        use std::sync::Arc;

        use tokio_rustls::rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use tokio_rustls::rustls::crypto::{
            verify_tls12_signature, verify_tls13_signature, CryptoProvider,
        };
        use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use tokio_rustls::rustls::DigitallySignedStruct;

        /// Verifier behind the insecure-skip-verify flag: accepts any server
        /// certificate while still checking the handshake signatures.
        #[derive(Debug)]
        pub(crate) struct NoCertificateVerification(Arc<CryptoProvider>);

        impl NoCertificateVerification {
            pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
                Self(provider)
            }
        }

        impl ServerCertVerifier for NoCertificateVerification {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                verify_tls12_signature(
                    message,
                    cert,
                    dss,
                    &self.0.signature_verification_algorithms,
                )
            }

            fn verify_tls13_signature(
                &self,
                message: &[u8],
                cert: &CertificateDer<'_>,
                dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                verify_tls13_signature(
                    message,
                    cert,
                    dss,
                    &self.0.signature_verification_algorithms,
                )
            }

            fn supported_verify_schemes(
                &self,
            ) -> Vec<tokio_rustls::rustls::SignatureScheme> {
                self.0.signature_verification_algorithms.supported_schemes()
            }
        }
    }
}

#[cfg(feature = "sync")]
pub(crate) mod native {
    use super::*;

    pub(crate) fn build_connector(config: &Config) -> Result<native_tls::TlsConnector, SpamdError> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.danger_accept_invalid_certs(config.insecure_skip_verify);

        if let Some(path) = &config.root_ca {
            let data = std::fs::read(path)?;
            let cert = native_tls::Certificate::from_pem(&data)
                .map_err(|e| SpamdError::Tls(format!("{}: {e}", path.display())))?;
            builder.add_root_certificate(cert);
        }

        builder.build().map_err(|e| SpamdError::Tls(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("spamd.example.com:783"), "spamd.example.com");
        assert_eq!(extract_host("127.0.0.1:783"), "127.0.0.1");
        assert_eq!(extract_host("[::1]:783"), "::1");
        assert_eq!(extract_host("spamd.example.com"), "spamd.example.com");
    }
}
