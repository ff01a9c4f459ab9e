use hickory_resolver::{
    error::{ResolveError, ResolveErrorKind},
    lookup::{SrvLookup, TxtLookup},
    Name,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::{ConnectionString, ServerAddress},
    sdam::description::topology::choose_n,
};

const DEFAULT_SRV_SERVICE_NAME: &str = "mongodb";

impl Error {
    fn from_resolve_error(error: ResolveError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }

    fn from_resolve_proto_error(error: hickory_proto::error::ProtoError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }
}

/// Resolves the seed list (and extra options) for an SRV-style URI via DNS SRV and TXT
/// lookups.
pub(crate) struct SrvResolver {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl SrvResolver {
    pub(crate) async fn new() -> Result<Self> {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .map_err(Error::from_resolve_error)?;

        Ok(Self { resolver })
    }

    async fn srv_lookup(&self, query: &str) -> Result<SrvLookup> {
        let name = Name::from_str_relaxed(query).map_err(Error::from_resolve_proto_error)?;
        self.resolver
            .srv_lookup(name)
            .await
            .map_err(Error::from_resolve_error)
    }

    async fn txt_lookup(&self, query: &str) -> Result<Option<TxtLookup>> {
        let name = Name::from_str_relaxed(query).map_err(Error::from_resolve_proto_error)?;
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                _ => Err(Error::from_resolve_error(e)),
            },
        }
    }

    /// Resolves the seed list for the given lookup hostname, applying any options found in TXT
    /// records (URI options take precedence) and subsampling the hosts if `srvMaxHosts` was
    /// given.
    pub(crate) async fn resolve_seedlist(
        &self,
        hostname: &str,
        conn_str: &mut ConnectionString,
    ) -> Result<Vec<ServerAddress>> {
        let hostname_parts: Vec<_> = hostname.split('.').collect();

        if hostname_parts.len() < 3 {
            return Err(ErrorKind::InvalidArgument {
                message: "a 'mongodb+srv' hostname must have at least three '.'-delimited parts"
                    .into(),
            }
            .into());
        }

        // The returned records must all share the original hostname's domain.
        let domain_name = &hostname_parts[1..];

        let service_name = conn_str
            .srv_service_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SRV_SERVICE_NAME.to_string());
        let lookup_hostname = format!("_{}._tcp.{}", service_name, hostname);

        let srv_lookup = self.srv_lookup(lookup_hostname.as_str()).await?;
        let mut hosts = Vec::new();

        for record in srv_lookup.iter() {
            let target = record.target().to_utf8();
            let port = Some(record.port());

            let mut target_parts: Vec<_> = target.split('.').collect();
            // Remove the empty root label, if present.
            if target_parts.last().map(|s| s.is_empty()).unwrap_or(false) {
                target_parts.pop();
            }

            if target_parts.len() < 2 || target_parts[1..] != domain_name[..] {
                return Err(ErrorKind::DnsResolve {
                    message: format!(
                        "SRV lookup for {} returned result {}, which does not match domain \
                         name {}",
                        hostname,
                        target_parts.join("."),
                        domain_name.join(".")
                    ),
                }
                .into());
            }

            hosts.push(ServerAddress::Tcp {
                host: target_parts.join(".").to_lowercase(),
                port,
            });
        }

        if hosts.is_empty() {
            return Err(ErrorKind::DnsResolve {
                message: format!("SRV lookup for {} returned no records", hostname),
            }
            .into());
        }

        if let Some(txt_lookup) = self.txt_lookup(hostname).await? {
            let mut records = txt_lookup.iter();
            if let Some(txt) = records.next() {
                if records.next().is_some() {
                    return Err(ErrorKind::DnsResolve {
                        message: format!(
                            "TXT lookup for {} returned more than one record, but more than \
                             one are not allowed",
                            hostname
                        ),
                    }
                    .into());
                }

                let txt_data: Vec<_> = txt
                    .txt_data()
                    .iter()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .collect();
                conn_str.apply_txt_options(&txt_data.join(""))?;
            }
        }

        Ok(subsample(conn_str, hosts))
    }
}

fn subsample(conn_str: &ConnectionString, hosts: Vec<ServerAddress>) -> Vec<ServerAddress> {
    match conn_str.srv_max_hosts {
        Some(max) if max > 0 && (max as usize) < hosts.len() => {
            choose_n(&hosts, max as usize).cloned().collect()
        }
        _ => hosts,
    }
}
