//! Wraps a connected byte stream in TLS client-mode authentication (§4.7).
//!
//! The game backend's certificate policy is "accept any, encryption
//! required": this client never validates the chain, hostname, or
//! expiration, because the backend's own transport-security posture
//! (documented at the call site) relies only on the connection being
//! encrypted, not on PKI trust. A custom [`rustls::client::danger::ServerCertVerifier`]
//! makes that explicit rather than silently disabling verification through
//! some less visible knob.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::future::{self, Either};
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::sync::CancellationToken;

use crate::{
    abandon::{self, AbandonSource},
    error::TlsAttachError,
};

/// A certificate verifier that accepts any certificate presented by the
/// server. This client's threat model requires the link to be encrypted but
/// places no trust in the backend's certificate chain (see module docs).
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Wrap `stream` in a TLS client session authenticating as `host`, racing
/// the handshake against `cancel`.
///
/// # Errors
///
/// [`TlsAttachError::NotAuthenticated`] if `cancel` fires before the
/// handshake completes; [`TlsAttachError::FailureWhileAuthenticating`] if
/// the handshake itself fails (bad ALPN, protocol mismatch, stream reset).
pub async fn attach<S>(
    stream: S,
    host: &str,
    cancel: &CancellationToken,
) -> Result<TlsStream<S>, TlsAttachError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connector = TlsConnector::from(Arc::new(client_config()));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TlsAttachError::FailureWhileAuthenticating(e.to_string()))?;

    let started_at = Instant::now();
    let handshake: Pin<Box<dyn Future<Output = std::io::Result<TlsStream<S>>> + Send>> =
        Box::pin(connector.connect(server_name, stream));

    match future::select(handshake, std::pin::pin!(cancel.cancelled())).await {
        Either::Left((result, _cancelled)) => {
            result.map_err(|e| TlsAttachError::FailureWhileAuthenticating(e.to_string()))
        }
        Either::Right((_cancelled, handshake)) => {
            spawn_abandon_on_late_authentication(handshake, started_at);
            Err(TlsAttachError::NotAuthenticated)
        }
    }
}

/// The handshake lost the cancel race but was left running rather than
/// dropped. If it connects anyway, send the abandon message over the now
/// authenticated stream and close it (§4.7, §9).
fn spawn_abandon_on_late_authentication<S>(
    handshake: Pin<Box<dyn Future<Output = std::io::Result<TlsStream<S>>> + Send>>,
    started_at: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Ok(tls_stream) = handshake.await {
            abandon::send_and_close(tls_stream, AbandonSource::TlsAttach, Duration::ZERO, started_at.elapsed())
                .await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_verifier_approves_an_empty_certificate() {
        let verifier = AcceptAnyServerCert;
        let cert = CertificateDer::from(Vec::new());
        let name = ServerName::try_from("example.test").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_before_handshake_reports_not_authenticated() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = attach(client, "example.test", &cancel).await.unwrap_err();
        assert!(matches!(err, TlsAttachError::NotAuthenticated));
    }
}
