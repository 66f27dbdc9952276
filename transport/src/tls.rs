//! [SecurityContext] backed by a rustls server session.

use crate::{
    security::{Overhead, Progress, SecurityContext},
    stream_buffer::StreamBuffer,
    Error, TlsConfig,
};
use rustls::{
    crypto::ring,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    ServerConfig, ServerConnection,
};
use std::{
    io::{self, Read, Write},
    path::Path,
    sync::Arc,
};

/// Record header of TLS.
const RECORD_HEADER: usize = 5;

/// AEAD tag plus the inner content type of a TLS 1.3 record.
const RECORD_TRAILER: usize = 17;

/// Builds a server configuration from a certificate chain and its key.
pub fn server_config(
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, Error> {
    if certificates.is_empty() {
        return Err(Error::MissingCertificate);
    }
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates, key)?;
    Ok(Arc::new(config))
}

fn pem_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::InvalidConfig(format!("{}: {err}", path.display()))
}

/// Loads the PEM certificate chain and private key named by `config`.
pub fn load_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, Error> {
    let certificates = CertificateDer::pem_file_iter(&config.certificate)
        .map_err(|err| pem_error(&config.certificate, err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| pem_error(&config.certificate, err))?;
    let key = PrivateKeyDer::from_pem_file(&config.private_key)
        .map_err(|err| pem_error(&config.private_key, err))?;
    server_config(certificates, key)
}

/// A server-side TLS session.
pub struct TlsContext {
    session: ServerConnection,
}

impl TlsContext {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, Error> {
        Ok(Self {
            session: ServerConnection::new(config)?,
        })
    }

    fn flush_records(&mut self, out: &mut StreamBuffer) -> Result<usize, Error> {
        let mut written = 0;
        while self.session.wants_write() {
            written += self.session.write_tls(out)?;
        }
        Ok(written)
    }
}

impl SecurityContext for TlsContext {
    fn overhead(&self) -> Overhead {
        Overhead {
            header: RECORD_HEADER,
            trailer: RECORD_TRAILER,
        }
    }

    fn receive(&mut self, mut ciphertext: &[u8]) -> Result<Progress, Error> {
        while !ciphertext.is_empty() {
            self.session.read_tls(&mut ciphertext)?;
            let state = self.session.process_new_packets()?;
            if state.peer_has_closed() {
                return Err(Error::Closed);
            }
        }
        Ok(Progress {
            established: !self.session.is_handshaking(),
            token: self.session.wants_write(),
        })
    }

    fn read_plaintext(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        match self.session.reader().read(out) {
            Ok(read) => Ok(read),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn pending_token(&mut self, out: &mut StreamBuffer) -> Result<usize, Error> {
        self.flush_records(out)
    }

    fn seal(&mut self, plaintext: &[u8], out: &mut StreamBuffer) -> Result<(), Error> {
        self.session.writer().write_all(plaintext)?;
        self.flush_records(out)?;
        Ok(())
    }

    fn is_established(&self) -> bool {
        !self.session.is_handshaking()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use rustls::{
        pki_types::{PrivatePkcs8KeyDer, ServerName},
        ClientConfig, ClientConnection, RootCertStore,
    };

    /// Returns a server configuration for a fresh self-signed `localhost`
    /// certificate and a client configuration that trusts it.
    pub(crate) fn test_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate = certified.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        let server = server_config(vec![certificate.clone()], key.into()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certificate).unwrap();
        let client = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (server, Arc::new(client))
    }

    /// Writes a fresh self-signed `localhost` certificate to `dir` and returns
    /// its [TlsConfig] plus a client configuration that trusts it.
    pub(crate) fn write_test_certificate(dir: &Path) -> (TlsConfig, Arc<ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::create_dir_all(dir).unwrap();
        let config = TlsConfig {
            certificate: dir.join("cert.pem"),
            private_key: dir.join("key.pem"),
        };
        std::fs::write(&config.certificate, certified.cert.pem()).unwrap();
        std::fs::write(&config.private_key, certified.key_pair.serialize_pem()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let client = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (config, Arc::new(client))
    }

    fn client_records(client: &mut ClientConnection) -> Vec<u8> {
        let mut records = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut records).unwrap();
        }
        records
    }

    #[test]
    fn test_handshake_and_exchange() {
        let context = test_context();
        let (server_config, client_config) = test_configs();
        let mut server = TlsContext::new(server_config).unwrap();
        let mut client =
            ClientConnection::new(client_config, ServerName::try_from("localhost").unwrap())
                .unwrap();
        let mut outgoing = StreamBuffer::new(context.allocator().clone());

        for _ in 0..10 {
            if !client.is_handshaking() && server.is_established() {
                break;
            }
            let records = client_records(&mut client);
            if !records.is_empty() {
                server.receive(&records).unwrap();
            }
            if server.pending_token(&mut outgoing).unwrap() > 0 {
                client.read_tls(&mut outgoing.as_slice()).unwrap();
                client.process_new_packets().unwrap();
                outgoing.clear();
            }
        }
        assert!(server.is_established());
        assert!(!client.is_handshaking());

        client.writer().write_all(b"hello").unwrap();
        let records = client_records(&mut client);
        let progress = server.receive(&records).unwrap();
        assert!(progress.established);
        let mut plaintext = [0u8; 64];
        let read = server.read_plaintext(&mut plaintext).unwrap();
        assert_eq!(&plaintext[..read], b"hello");
        assert_eq!(server.read_plaintext(&mut plaintext).unwrap(), 0);

        server.seal(b"world", &mut outgoing).unwrap();
        assert!(outgoing.len() >= 5 + server.overhead().total());
        client.read_tls(&mut outgoing.as_slice()).unwrap();
        client.process_new_packets().unwrap();
        let mut received = [0u8; 5];
        client.reader().read_exact(&mut received).unwrap();
        assert_eq!(&received, b"world");
    }

    #[test]
    fn test_garbage_fails_negotiation() {
        let (server_config, _) = test_configs();
        let mut server = TlsContext::new(server_config).unwrap();
        assert!(server.receive(b"GET / HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_load_from_pem_files() {
        let dir = std::env::temp_dir().join(format!("turnstone-tls-{}", std::process::id()));
        let (config, _) = write_test_certificate(&dir);
        assert!(load_server_config(&config).is_ok());

        std::fs::write(&config.certificate, "").unwrap();
        assert!(load_server_config(&config).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
