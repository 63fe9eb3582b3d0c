use std::io::{Read, Write};
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned,
};

use crate::app::apple::usbmux::PairRecord;
use crate::app::error::WireError;

/// A lockdown/service channel, plaintext or wrapped in the session TLS that
/// `StartSession` negotiates.
pub enum SecuredStream<S: Read + Write> {
    Plain(S),
    Tls(Box<StreamOwned<ClientConnection, S>>),
}

impl<S: Read + Write> SecuredStream<S> {
    /// Client-authenticated TLS using the host identity from the pair
    /// record. The device presents a certificate chained to the pair-record
    /// root, not to any public CA, so chain verification is disabled.
    pub fn secure(stream: S, pair: &PairRecord) -> Result<Self, WireError> {
        let config = client_config(pair)?;
        let server_name = ServerName::try_from("apple-device".to_string())
            .map_err(|_| WireError::invalid("bad TLS server name"))?;
        let connection = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|err| WireError::ProtocolFail(format!("tls client: {err}")))?;
        Ok(SecuredStream::Tls(Box::new(StreamOwned::new(
            connection, stream,
        ))))
    }
}

impl<S: Read + Write> Read for SecuredStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SecuredStream::Plain(s) => s.read(buf),
            SecuredStream::Tls(s) => s.read(buf),
        }
    }
}

impl<S: Read + Write> Write for SecuredStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SecuredStream::Plain(s) => s.write(buf),
            SecuredStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SecuredStream::Plain(s) => s.flush(),
            SecuredStream::Tls(s) => s.flush(),
        }
    }
}

fn client_config(pair: &PairRecord) -> Result<ClientConfig, WireError> {
    let certs = parse_certificates(&pair.host_certificate)?;
    let key = parse_private_key(&pair.host_private_key)?;

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeviceCertVerifier))
        .with_client_auth_cert(certs, key)
        .map_err(|err| WireError::ProtocolFail(format!("tls config: {err}")))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, WireError> {
    let mut reader = pem;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| WireError::invalid(format!("pair record certificate: {err}")))?;
    if certs.is_empty() {
        return Err(WireError::invalid("pair record has no host certificate"));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, WireError> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| WireError::invalid(format!("pair record private key: {err}")))?
        .ok_or_else(|| WireError::invalid("pair record has no host private key"))
}

/// The device-side certificate is self-issued from the pairing root; there
/// is nothing in the public PKI to chain it to.
#[derive(Debug)]
struct DeviceCertVerifier;

impl ServerCertVerifier for DeviceCertVerifier {
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
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
