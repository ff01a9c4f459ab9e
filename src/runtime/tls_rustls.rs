use std::{
    convert::TryFrom,
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ClientConfig, ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate,
    Error as TlsError,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    error::{Error, ErrorKind, Result},
    options::TlsOptions,
};

fn invalid_config(message: impl Into<String>) -> Error {
    ErrorKind::InvalidTlsConfig {
        message: message.into(),
    }
    .into()
}

/// A reusable TLS connector derived from the client's TLS options. Building one involves
/// file I/O and certificate parsing, so it happens once per client rather than per
/// connection.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let roots = trust_roots(options.ca_file_path.as_deref())?;

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        let mut config = match options.cert_key_file_path {
            Some(ref path) => {
                let (certificate_chain, key) = client_identity(path)?;
                builder
                    .with_single_cert(certificate_chain, key)
                    .map_err(|error| invalid_config(error.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        config.enable_sni = true;

        if options.allow_invalid_certificates == Some(true) {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
        }

        Ok(TlsConfig {
            connector: Arc::new(config).into(),
        })
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host).map_err(|e| ErrorKind::DnsResolve {
            message: format!("could not resolve {:?}: {}", host, e),
        })?;

        self.connector
            .connect(name, tcp_stream)
            .await
            .map_err(Error::network)
    }
}

/// The root certificates connections verify servers against: the given CA file when one was
/// configured, the bundled webpki roots otherwise.
fn trust_roots(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let ders =
                rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).map_err(|_| {
                    invalid_config(format!(
                        "Unable to parse PEM-encoded root certificate from {}",
                        path.display()
                    ))
                })?;
            roots.add_parsable_certificates(&ders);
        }
        None => {
            roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(
                |anchor| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        anchor.subject,
                        anchor.spki,
                        anchor.name_constraints,
                    )
                },
            ));
        }
    }

    Ok(roots)
}

/// Reads the client certificate chain and its private key out of the single PEM file the
/// options point at.
fn client_identity(path: &Path) -> Result<(Vec<Certificate>, PrivateKey)> {
    let mut file = BufReader::new(File::open(path)?);

    let certificate_chain: Vec<Certificate> = rustls_pemfile::certs(&mut file)
        .map_err(|error| {
            invalid_config(format!(
                "Unable to parse PEM-encoded client certificate from {}: {}",
                path.display(),
                error,
            ))
        })?
        .into_iter()
        .map(Certificate)
        .collect();

    // The key may sit before or after the certificates, so scan the file again.
    file.seek(SeekFrom::Start(0))?;
    loop {
        use rustls_pemfile::Item;

        let item = rustls_pemfile::read_one(&mut file).map_err(|_| {
            invalid_config(format!(
                "Unable to parse PEM-encoded item from {}",
                path.display()
            ))
        })?;

        match item {
            Some(Item::PKCS8Key(bytes)) | Some(Item::RSAKey(bytes)) => {
                return Ok((certificate_chain, PrivateKey(bytes)))
            }
            Some(_) => continue,
            None => {
                return Err(invalid_config(format!(
                    "No PEM-encoded keys in {}",
                    path.display()
                )))
            }
        }
    }
}

/// A verifier that waves every server certificate through, installed when the options ask
/// for invalid certificates to be tolerated.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
