//! TLS 1.3 for peer links, with trust-on-first-use on both ends.
//!
//! There is no certificate authority: every node generates a self-signed
//! certificate once and keeps it under its data directory. Both the client
//! and the server hand certificate acceptance to the [`TrustStore`];
//! handshake signatures are still checked with the ring provider.

use crate::trust::{fingerprint, TrustStore};
use peerswitch_types::error::NetworkError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

const CERT_FILE: &str = "identity.crt.der";
const KEY_FILE: &str = "identity.key.der";

/// SNI name used on every outbound link. Peers are identified by certificate
/// fingerprint, never by name.
const PEER_SERVER_NAME: &str = "peerswitch.local";

fn tls_err(e: impl std::fmt::Display) -> NetworkError {
    NetworkError::Tls(e.to_string())
}

/// This node's certificate and private key.
#[derive(Clone)]
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key_pkcs8: Vec<u8>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity.
    pub fn generate(host_name: &str) -> Result<Self, NetworkError> {
        let names = vec![host_name.to_string(), PEER_SERVER_NAME.to_string()];
        let certified = rcgen::generate_simple_self_signed(names).map_err(tls_err)?;
        Ok(Self {
            cert: certified.cert.der().clone(),
            key_pkcs8: certified.key_pair.serialize_der(),
        })
    }

    /// Load the identity stored in `dir`, generating and saving one if absent.
    pub fn load_or_generate(dir: &Path, host_name: &str) -> Result<Self, NetworkError> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            match (std::fs::read(&cert_path), std::fs::read(&key_path)) {
                (Ok(cert), Ok(key)) if !cert.is_empty() && !key.is_empty() => {
                    return Ok(Self {
                        cert: CertificateDer::from(cert),
                        key_pkcs8: key,
                    });
                }
                _ => warn!(dir = %dir.display(), "Unreadable TLS identity, regenerating"),
            }
        }

        let identity = Self::generate(host_name)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(&cert_path, identity.cert.as_ref())?;
        std::fs::write(&key_path, &identity.key_pkcs8)?;
        restrict_file_permissions(&key_path);
        info!(fingerprint = %identity.fingerprint(), "Generated new TLS identity");
        Ok(identity)
    }

    /// Fingerprint peers will record for this node.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.cert.as_ref())
    }

    fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert.clone()]
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(error = %e, path = %path.display(), "Failed to restrict key file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

/// Verifier that accepts exactly what the trust store accepts.
#[derive(Debug)]
struct TofuVerifier {
    trust: TrustStore,
    provider: Arc<CryptoProvider>,
}

impl TofuVerifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        if self.trust.verify_certificate(end_entity.as_ref()) {
            Ok(())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity).map(|_| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for TofuVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity).map(|_| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

/// Ready-made client and server configurations for peer links.
#[derive(Clone)]
pub struct TlsSettings {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsSettings { tls13, tofu }")
    }
}

impl TlsSettings {
    /// Build TLS 1.3-only configurations that present `identity` and defer
    /// peer acceptance to `trust`.
    pub fn new(identity: &TlsIdentity, trust: TrustStore) -> Result<Self, NetworkError> {
        let provider = Arc::new(ring::default_provider());
        let verifier = Arc::new(TofuVerifier {
            trust,
            provider: Arc::clone(&provider),
        });

        let client = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err)?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_client_auth_cert(identity.cert_chain(), identity.private_key())
            .map_err(tls_err)?;

        let server = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.cert_chain(), identity.private_key())
            .map_err(tls_err)?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }

    /// Server name presented on outbound links.
    pub fn server_name() -> Result<ServerName<'static>, NetworkError> {
        ServerName::try_from(PEER_SERVER_NAME).map_err(tls_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_identity_persisted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = TlsIdentity::load_or_generate(dir.path(), "desk").unwrap();
        let second = TlsIdentity::load_or_generate(dir.path(), "desk").unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(dir.path().join(CERT_FILE).exists());
        assert!(dir.path().join(KEY_FILE).exists());
    }

    #[tokio::test]
    async fn test_mutual_tofu_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let server_id = TlsIdentity::generate("server").unwrap();
        let client_id = TlsIdentity::generate("client").unwrap();
        let server_trust = TrustStore::open(dir.path().join("server.json"));
        let client_trust = TrustStore::open(dir.path().join("client.json"));
        let server_tls = TlsSettings::new(&server_id, server_trust.clone()).unwrap();
        let client_tls = TlsSettings::new(&client_id, client_trust.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = server_tls.acceptor();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 13];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = client_tls
            .connector()
            .connect(TlsSettings::server_name().unwrap(), tcp)
            .await
            .unwrap();
        tls.write_all(b"HEALTH_CHECK\n").await.unwrap();
        tls.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"HEALTH_CHECK\n");
        assert!(client_trust.is_trusted(&server_id.fingerprint()));
        assert!(server_trust.is_trusted(&client_id.fingerprint()));
    }
}
