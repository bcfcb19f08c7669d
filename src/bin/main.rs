//! busauth binary.
//!
//! Runs the access-control layer end to end on the in-process transport,
//! and generates key pairs for certificate logins.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use busauth_core::{
    config::Args,
    crypto::generate_signing_keypair,
    BusClient, BusConfig, BusContext, BusService, Connection, InMemoryAccessControl, InvocationContext, LocalTransport,
    LoginInfo, ObjectRef, ServiceEndpoint, SharedAuthSecret,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the delegation and shared-auth scenario in one process
    Demo,
    /// Write a hex-encoded Ed25519 key pair for certificate logins
    Keygen {
        /// Output file (secret key on the first line, public key on the second)
        #[arg(long)]
        out: PathBuf,
    },
}

/// Identity summary returned by the echo service.
#[derive(Debug, Serialize, Deserialize)]
struct Observed {
    caller: String,
    originators: Vec<String>,
}

struct EchoService;

#[async_trait]
impl BusService for EchoService {
    async fn handle_request(&self, ctx: &mut InvocationContext, operation: &str, _payload: &[u8]) -> Result<Vec<u8>> {
        match operation {
            "whoami" => {
                let chain = ctx.caller_chain().ok_or_else(|| anyhow!("no caller chain"))?;
                let observed = Observed {
                    caller: chain.caller().to_string(),
                    originators: chain.originators().iter().map(LoginInfo::to_string).collect(),
                };
                Ok(serde_json::to_vec(&observed)?)
            }
            other => Err(anyhow!("echo: unsupported operation '{other}'")),
        }
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Forwards `relay` to the echo service on behalf of its caller.
struct ForwarderService {
    client: BusClient,
    echo: ObjectRef,
}

#[async_trait]
impl BusService for ForwarderService {
    async fn handle_request(&self, ctx: &mut InvocationContext, operation: &str, payload: &[u8]) -> Result<Vec<u8>> {
        if operation != "relay" {
            return Err(anyhow!("forwarder: unsupported operation '{operation}'"));
        }
        let guard = ctx.join_caller_chain().ok_or_else(|| anyhow!("no caller chain to join"))?;
        let reply = self.client.call(&guard, &self.echo, "whoami", payload).await?;
        guard.exit_chain();
        Ok(reply)
    }

    fn name(&self) -> &str {
        "forwarder"
    }
}

/// One simulated process: its own bus context and a logged-in connection.
async fn process(config: &BusConfig, access: &Arc<InMemoryAccessControl>, entity: &str) -> Result<(Arc<BusContext>, Connection)> {
    let context = BusContext::new(config.connection.clone());
    let connection = context.create_connection(access.clone());
    let password = config
        .access_control
        .users
        .iter()
        .find(|u| u.entity == entity)
        .map(|u| u.password.clone())
        .ok_or_else(|| anyhow!("no configured password for '{entity}'"))?;
    connection
        .login_by_password(entity, password.as_bytes(), "")
        .await
        .with_context(|| format!("login as {entity}"))?;
    context.set_default_connection(Some(connection.clone()));
    Ok((context, connection))
}

async fn run_demo(config: BusConfig) -> Result<()> {
    let access = InMemoryAccessControl::shared(config.access_control.clone());
    let transport = LocalTransport::new();

    let (alice_ctx, alice) = process(&config, &access, "alice").await?;
    let (forwarder_ctx, forwarder) = process(&config, &access, "forwarder").await?;
    let (echo_ctx, echo) = process(&config, &access, "echo").await?;

    let echo_ref = ObjectRef::new("proc-echo", "echo");
    let echo_endpoint = ServiceEndpoint::new("proc-echo", echo_ctx);
    echo_endpoint.register("echo", Arc::new(EchoService));
    transport.bind(echo_endpoint);

    let forwarder_endpoint = ServiceEndpoint::new("proc-forwarder", forwarder_ctx.clone());
    forwarder_endpoint.register(
        "forwarder",
        Arc::new(ForwarderService {
            client: BusClient::new(forwarder_ctx, transport.clone()),
            echo: echo_ref.clone(),
        }),
    );
    transport.bind(forwarder_endpoint);

    let client = BusClient::new(alice_ctx, transport.clone());
    let invocation = InvocationContext::new();

    let direct: Observed = serde_json::from_slice(&client.call(&invocation, &echo_ref, "whoami", b"").await?)?;
    println!("direct call:    {}", serde_json::to_string(&direct)?);

    let forwarder_ref = ObjectRef::new("proc-forwarder", "forwarder");
    let relayed: Observed = serde_json::from_slice(&client.call(&invocation, &forwarder_ref, "relay", b"").await?)?;
    println!("forwarded call: {}", serde_json::to_string(&relayed)?);

    // Hand alice's login to a fresh connection through a file.
    let handoff = alice.start_shared_auth().await?;
    let path = std::env::temp_dir().join(format!("busauth-{}.secret", uuid::Uuid::new_v4()));
    handoff.write_to(&path)?;
    let secret = SharedAuthSecret::consume(&path)?;
    let heir = Connection::new(access.clone(), config.connection.clone());
    heir.login_by_shared_auth(&secret).await?;
    println!(
        "shared auth:    {} -> {}",
        alice.login().map(|l| l.to_string()).unwrap_or_default(),
        heir.login().map(|l| l.to_string()).unwrap_or_default()
    );

    for connection in [&heir, &alice, &forwarder, &echo] {
        connection.logout().await?;
    }
    info!(logins = access.login_count(), "demo finished");
    Ok(())
}

fn run_keygen(out: &Path) -> Result<()> {
    let (signing, verifying) = generate_signing_keypair();
    let contents = zeroize::Zeroizing::new(format!(
        "{}\n{}\n",
        hex::encode(signing.to_bytes()),
        hex::encode(verifying.to_bytes())
    ));
    write_private(out, contents.as_bytes()).with_context(|| format!("writing {}", out.display()))?;
    println!("{}", hex::encode(verifying.to_bytes()));
    Ok(())
}

/// Create or truncate `path`, readable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // an existing file keeps its mode through open()
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BusConfig::from_args(&cli.args)?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.logging.level.parse().unwrap_or(Level::INFO).into())
                .parse_lossy(config.logging.filter.as_deref().unwrap_or("busauth_core=debug")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!(bus = %config.access_control.bus_id, "busauth starting up");

    match cli.command {
        Commands::Demo => run_demo(config).await,
        Commands::Keygen { out } => run_keygen(&out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_writes_owner_only_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bus.key");
        std::fs::write(&path, "stale")?;
        run_keygen(&path)?;

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.len() == 64 && hex::decode(l).is_ok()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o077, 0, "key file readable by others: {mode:o}");

            let fresh = dir.path().join("fresh.key");
            run_keygen(&fresh)?;
            let mode = std::fs::metadata(&fresh)?.permissions().mode();
            assert_eq!(mode & 0o077, 0, "key file readable by others: {mode:o}");
        }
        Ok(())
    }
}
