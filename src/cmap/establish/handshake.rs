use bson::{doc, Bson, Document};
use once_cell::sync::Lazy;

use crate::{
    client::auth::{ClientFirst, Credential, FirstRound},
    cmap::{conn::StreamDescription, Command, Connection},
    error::Result,
    hello::{hello_command, HelloReply},
    options::ClientOptions,
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::options::Compressor;

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    architecture: String,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name,
                "version": metadata.driver.version,
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": metadata.os.os_type,
                "architecture": metadata.os.architecture,
            },
        );

        Bson::Document(metadata_doc)
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the hello command.
static BASE_CLIENT_METADATA: Lazy<ClientMetadata> = Lazy::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: "ferro-rust-driver".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
});

/// The inputs to the handshake that are derived once from the client options.
#[derive(Debug)]
pub(crate) struct HandshakerOptions {
    app_name: Option<String>,
    load_balanced: bool,
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    compressors: Option<Vec<Compressor>>,
}

impl HandshakerOptions {
    pub(crate) fn from_client_options(opts: &ClientOptions) -> Self {
        Self {
            app_name: opts.app_name.clone(),
            load_balanced: opts.load_balanced.unwrap_or(false),
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: opts.compressors.clone(),
        }
    }
}

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(super) struct Handshaker {
    /// The hello or legacy hello command to send when handshaking. This will always be
    /// identical given the same options, so it can be created at the time the Handshaker is
    /// created.
    command: Command,

    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    compressors: Option<Vec<Compressor>>,
}

/// The successful result of a handshake: the hello reply itself and the first round of
/// speculative authentication, if the server engaged in it.
#[derive(Debug)]
pub(super) struct HelloResult {
    pub(super) hello_reply: HelloReply,
    pub(super) first_round: Option<FirstRound>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(super) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        let load_balanced = if options.load_balanced {
            Some(true)
        } else {
            None
        };
        let mut command = hello_command(load_balanced, None, None);

        if let Some(app_name) = options.app_name {
            metadata.application = Some(AppMetadata { name: app_name });
        }

        if options.load_balanced {
            command.body.insert("loadBalanced", true);
        }

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        if let Some(ref compressors) = options.compressors {
            command.body.insert(
                "compression",
                compressors
                    .iter()
                    .map(|compressor| Bson::String(compressor.name().to_string()))
                    .collect::<Vec<Bson>>(),
            );
        }

        command.body.insert("client", metadata);

        Self {
            command,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: options.compressors,
        }
    }

    /// Handshakes a connection: sends the hello command (with a speculative authentication
    /// payload when credentials are present), populates the connection's stream description,
    /// and negotiates compression.
    pub(super) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloResult> {
        let mut command = self.command.clone();

        let client_first: Option<ClientFirst> = match credential {
            Some(credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);
                command.target_db = credential.resolved_source().to_string();

                let client_first = credential.build_speculative_client_first()?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .insert("speculativeAuthenticate", client_first.to_document());
                }
                client_first
            }
            None => None,
        };

        let response = conn.send_command(command, None).await?;
        let hello_reply = response.into_hello_reply()?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(
            conn.address().clone(),
            &hello_reply,
        ));

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        {
            // Take the first client-specified compressor that the server also supports.
            conn.compressor = match (
                self.compressors.as_ref(),
                hello_reply.command_response.compressors.as_ref(),
            ) {
                (Some(client_compressors), Some(server_compressors)) => client_compressors
                    .iter()
                    .find(|c| server_compressors.iter().any(|name| name == c.name()))
                    .cloned(),
                _ => None,
            };
        }

        let first_round = client_first.and_then(|client_first| {
            hello_reply
                .command_response
                .speculative_authenticate
                .clone()
                .map(|doc| client_first.into_first_round(doc))
        });

        Ok(HelloResult {
            hello_reply,
            first_round,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handshake_command_includes_metadata() {
        let options = ClientOptions::builder()
            .app_name("inventory-service".to_string())
            .build();
        let handshaker = Handshaker::new(HandshakerOptions::from_client_options(&options));

        let client = handshaker.command.body.get_document("client").unwrap();
        assert_eq!(
            client
                .get_document("application")
                .unwrap()
                .get_str("name")
                .unwrap(),
            "inventory-service"
        );
        assert_eq!(
            client.get_document("driver").unwrap().get_str("name").unwrap(),
            "ferro-rust-driver"
        );
        assert!(client.get_document("os").unwrap().get_str("type").is_ok());

        // A fresh handshake doesn't know whether the server supports `hello`, so it uses the
        // legacy command and advertises helloOk.
        assert!(handshaker.command.body.contains_key("isMaster"));
        assert_eq!(handshaker.command.body.get_bool("helloOk"), Ok(true));
    }
}
