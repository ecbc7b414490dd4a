//! # Transport identity
//!
//! Every connection between PeerBox nodes is TLS 1.3 with a self-signed
//! certificate on both ends. The certificate's key *is* the account's Ed25519
//! primary key, so reducing the peer certificate's key to a fingerprint yields
//! the same [`Fingerprint`] the peer has in our keyring. No certificate
//! authority is involved: the TLS handshake proves possession of the key and
//! the application decides what that identity may do.

use crate::account::Account;
use crate::crypto::SIGNING_ALGORITHM;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use chrono::{Datelike, Duration, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, CommonState, DigitallySignedStruct, DistinguishedName,
    ServerConfig, SignatureScheme,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;
use x509_parser::oid_registry::OID_SIG_ED25519;

/// DNS suffix of the name every certificate carries for its own fingerprint.
pub const LOCAL_DOMAIN: &str = "peerbox.local";

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Certificate and key presented by this node.
pub struct TlsIdentity {
    fingerprint: Fingerprint,
    certificate: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Issues a short-lived certificate for `account`.
    ///
    /// `names` are extra subject alternative names: entries that parse as IP
    /// addresses become IP SANs, the rest DNS SANs.
    pub fn for_account(account: &Account, names: &[String]) -> Result<Self> {
        let fingerprint = account.fingerprint();
        let pkcs8 = account
            .secret_keys()
            .signing_key()
            .to_pkcs8_der()
            .map_err(|e| Error::Certificate(e.to_string()))?;
        let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes()).map_err(certificate_error)?;

        let mut params = rcgen::CertificateParams::default();
        let not_before = Utc::now() - Duration::days(1);
        let not_after = Utc::now() + Duration::days(2);
        params.not_before =
            rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

        let own_name = format!("{}.{}", fingerprint.to_hex(), LOCAL_DOMAIN);
        let mut sans = vec![rcgen::SanType::DnsName(
            own_name.try_into().map_err(certificate_error)?,
        )];
        for name in names {
            match name.parse::<IpAddr>() {
                Ok(ip) => sans.push(rcgen::SanType::IpAddress(ip)),
                Err(_) => sans.push(rcgen::SanType::DnsName(
                    name.clone().try_into().map_err(certificate_error)?,
                )),
            }
        }
        params.subject_alt_names = sans;

        let mut distinguished_name = rcgen::DistinguishedName::new();
        distinguished_name.push(rcgen::DnType::CommonName, account.primary_user_id().to_string());
        distinguished_name.push(rcgen::DnType::OrganizationName, "PeerBox");
        params.distinguished_name = distinguished_name;

        let cert = params.self_signed(&key_pair).map_err(certificate_error)?;
        debug!("Issued TLS certificate for {}", fingerprint);

        Ok(Self {
            fingerprint,
            certificate: CertificateDer::from(cert.der().to_vec()),
            key: PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec()),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    /// Listener configuration. Client certificates are requested but not
    /// required; any well-formed Ed25519 certificate is accepted.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert {
                provider: self.provider.clone(),
            }))
            .with_single_cert(vec![self.certificate.clone()], self.private_key())?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(Arc::new(config))
    }

    /// Dialer configuration presenting this identity. With `expected` set the
    /// handshake fails unless the server's key reduces to that fingerprint.
    pub fn client_config(&self, expected: Option<Fingerprint>) -> Result<ClientConfig> {
        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerKeyVerifier {
                expected,
                provider: self.provider.clone(),
            }))
            .with_client_auth_cert(vec![self.certificate.clone()], self.private_key())?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(config)
    }

    /// HTTP client that presents this identity and pins `expected`.
    pub fn http_client(&self, expected: Fingerprint, timeout: std::time::Duration) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(self.client_config(Some(expected))?)
            .timeout(timeout)
            .build()?)
    }
}

fn certificate_error(e: rcgen::Error) -> Error {
    Error::Certificate(e.to_string())
}

/// Reduces the Ed25519 key of a DER certificate to a fingerprint.
pub fn fingerprint_from_certificate(der: &[u8]) -> Result<Fingerprint> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Certificate(e.to_string()))?;
    let spki = cert.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(Error::Certificate(format!(
            "unsupported key algorithm {}",
            spki.algorithm.algorithm
        )));
    }
    let key = &spki.subject_public_key.data;
    if key.len() != 32 {
        return Err(Error::Certificate(format!(
            "ed25519 key has {} bytes",
            key.len()
        )));
    }
    Ok(Fingerprint::derive(SIGNING_ALGORITHM, key))
}

/// Fingerprint of the certificate the peer presented, if any.
pub fn peer_fingerprint(state: &CommonState) -> Option<Fingerprint> {
    state
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| fingerprint_from_certificate(cert).ok())
}

/// Access rule for every file served: the peer must be one of its recipients.
pub fn is_permitted(peer: Option<&Fingerprint>, recipients: &[Fingerprint]) -> bool {
    match peer {
        Some(peer) => recipients.contains(peer),
        None => false,
    }
}

fn check_certificate(der: &CertificateDer<'_>) -> std::result::Result<Fingerprint, rustls::Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
    if !cert.validity().is_valid() {
        return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
    }
    fingerprint_from_certificate(der)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
}

#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        check_certificate(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

#[derive(Debug)]
struct PeerKeyVerifier {
    expected: Option<Fingerprint>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PeerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fingerprint = check_certificate(end_entity)?;
        if let Some(expected) = self.expected {
            if fingerprint != expected {
                debug!("Server presented {}, expected {}", fingerprint, expected);
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountOptions;
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn account(dir: &TempDir) -> Account {
        Account::create(dir.path(), "Node", "node@example.com", "pw", &AccountOptions::fast()).unwrap()
    }

    #[test]
    fn test_certificate_key_reduces_to_account_fingerprint() {
        let dir = TempDir::new().unwrap();
        let account = account(&dir);
        let identity =
            TlsIdentity::for_account(&account, &["node.example.com".into(), "127.0.0.1".into()]).unwrap();

        let fp = fingerprint_from_certificate(identity.certificate()).unwrap();
        assert_eq!(fp, account.fingerprint());
        assert_eq!(identity.fingerprint(), account.fingerprint());
    }

    #[test]
    fn test_garbage_certificate_is_rejected() {
        assert_matches!(fingerprint_from_certificate(b"not a cert"), Err(Error::Certificate(_)));
    }

    #[test]
    fn test_is_permitted_requires_membership() {
        let a = Fingerprint::from_bytes([1; 20]);
        let b = Fingerprint::from_bytes([2; 20]);
        assert!(is_permitted(Some(&a), &[a, b]));
        assert!(!is_permitted(Some(&a), &[b]));
        assert!(!is_permitted(None, &[a]));
        assert!(!is_permitted(Some(&a), &[]));
    }

    async fn handshake(
        server: &TlsIdentity,
        client_config: ClientConfig,
    ) -> std::io::Result<Option<Fingerprint>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(server.server_config().unwrap());

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut tls = acceptor.accept(stream).await?;
            let peer = peer_fingerprint(tls.get_ref().1);
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(peer)
        });

        let connector = TlsConnector::from(Arc::new(client_config));
        let stream = TcpStream::connect(addr).await?;
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, stream).await?;
        tls.write_all(b"ping").await?;
        tls.flush().await?;

        server_task.await.unwrap()
    }

    #[tokio::test]
    async fn test_mutual_handshake_reveals_client_fingerprint() {
        let (s_dir, c_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let server = TlsIdentity::for_account(&account(&s_dir), &[]).unwrap();
        let client = TlsIdentity::for_account(&account(&c_dir), &[]).unwrap();

        let config = client.client_config(Some(server.fingerprint())).unwrap();
        let peer = handshake(&server, config).await.unwrap();
        assert_eq!(peer, Some(client.fingerprint()));
    }

    #[tokio::test]
    async fn test_pinned_fingerprint_mismatch_fails() {
        let (s_dir, c_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let server = TlsIdentity::for_account(&account(&s_dir), &[]).unwrap();
        let client = TlsIdentity::for_account(&account(&c_dir), &[]).unwrap();

        let config = client
            .client_config(Some(Fingerprint::from_bytes([9; 20])))
            .unwrap();
        assert!(handshake(&server, config).await.is_err());
    }
}
