use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use ldap_front::ber::BerNode;
use ldap_front::handler::{BindHandler, OperationError, SearchHandler};
use ldap_front::protocol::{self, Control, ResultCode};
use ldap_front::server::ClientConn;
use ldap_front::{run_stats_server, Config, HandlerRegistry, LdapFrontend, ServiceIdentity, Stats};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-front")]
#[command(about = "LDAP v3 front end with transparent service-bind forwarding")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Reference bind handler: accepts anonymous binds and the configured
/// service identity, rejects everything else. Real deployments register
/// their own chain.
struct ServiceBind {
    identity: Arc<ServiceIdentity>,
}

#[async_trait]
impl BindHandler for ServiceBind {
    async fn bind(&self, request: &BerNode, _conn: &mut ClientConn) -> Result<ResultCode> {
        let dn = request
            .children
            .get(1)
            .and_then(BerNode::as_text)
            .unwrap_or("");
        if dn.is_empty() {
            return Ok(ResultCode::Success);
        }
        let password_ok = request
            .children
            .get(2)
            .map(|c| c.content == self.identity.password.as_bytes())
            .unwrap_or(false);
        if dn == self.identity.bind_dn && password_ok {
            Ok(ResultCode::Success)
        } else {
            Ok(ResultCode::InvalidCredentials)
        }
    }
}

/// Reference search handler: answers every search with a single root-DSE
/// style entry.
struct RootDseSearch;

#[async_trait]
impl SearchHandler for RootDseSearch {
    async fn search(
        &self,
        _request: &BerNode,
        _controls: &[Control],
        message_id: u64,
        bound_dn: &str,
        conn: &mut ClientConn,
    ) -> Result<ResultCode, OperationError> {
        let entry = protocol::search_entry(
            message_id,
            "",
            &[
                ("objectClass".to_string(), vec!["top".to_string()]),
                ("supportedLDAPVersion".to_string(), vec!["3".to_string()]),
                ("whoami".to_string(), vec![bound_dn.to_string()]),
            ],
        );
        conn.send(&entry)
            .await
            .map_err(|e| OperationError::new(ResultCode::Other, e.to_string()))?;
        Ok(ResultCode::Success)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_front={},info", log_level))
        .init();

    info!("Starting LDAP front end");

    let config = match args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(&path)?
        }
        None => {
            info!("No --config given, using built-in defaults");
            Config::default()
        }
    };

    let listen_url = args.listen.unwrap_or_else(|| config.listen.url.clone());
    let identity = Arc::new(config.service_identity());

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Service bind DN: {}", identity.bind_dn);

    let registry = Arc::new(
        HandlerRegistry::new()
            .on_bind(Arc::new(ServiceBind {
                identity: Arc::clone(&identity),
            }))
            .on_search(Arc::new(RootDseSearch)),
    );
    let stats = Arc::new(Stats::new());

    if let Some(addr) = config.stats_listen.clone() {
        let stats_for_http = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = run_stats_server(&addr, stats_for_http).await {
                error!("Stats server error: {}", e);
            }
        });
    }

    let frontend = LdapFrontend::new(listen_url, registry, stats, identity);

    frontend.start().await?;

    Ok(())
}
