//! Zentinel WS-Security command line tool.
//!
//! Run with: `zentinel-wssec secure --input request.xml --key <base64> --context-id <uri>`
//!
//! Secures or verifies SOAP envelopes with a pre-shared session key.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_wssec::crypto::b64_decode;
use zentinel_wssec::tokens::security_context_token;
use zentinel_wssec::{
    soap_fault_response, EndpointAddress, Message, ProtocolVariant, SecurityProtocol,
    SecurityProtocolFactory, SecurityToken, SoapVersion, StaticTokenProvider, SymmetricKey,
    WsSecurityConfig,
};

/// WS-Security message protection for SOAP envelopes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Secure an outgoing envelope and print it
    Secure(SessionArgs),
    /// Verify an incoming envelope and print it, or print a SOAP fault
    Verify(SessionArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Envelope to process
    #[arg(short, long)]
    input: PathBuf,

    /// Session key, base64
    #[arg(short, long)]
    key: String,

    /// Session context identifier
    #[arg(long)]
    context_id: String,

    /// Address of the service the envelope is for
    #[arg(long, default_value = "urn:zentinel:wssec")]
    target: String,
}

impl SessionArgs {
    fn token(&self) -> Result<Arc<SecurityToken>> {
        let key = b64_decode(self.key.trim()).context("Session key is not valid base64")?;
        Ok(security_context_token(self.context_id.clone(), SymmetricKey::new(key)))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = cli.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel WS-Security v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            info!("Config file: {}", path.display());
            WsSecurityConfig::load(path).context("Failed to load config file")?
        }
        None => WsSecurityConfig::default(),
    };

    match cli.command {
        Command::Secure(args) => secure(&config, &args).await,
        Command::Verify(args) => verify(&config, &args).await,
    }
}

async fn secure(config: &WsSecurityConfig, args: &SessionArgs) -> Result<ExitCode> {
    let xml = read_input(args).await?;
    let message = Message::from_xml(&xml).context("Failed to parse input envelope")?;

    let mut factory = factory(config)?;
    if config.protocol.variant == ProtocolVariant::SymmetricSessionKey {
        factory.set_token_provider(Arc::new(StaticTokenProvider::new(args.token()?)))?;
    }
    let protocol = open(&mut factory, args)?;

    let (secured, _) = protocol
        .secure_outgoing_message(message, Duration::from_secs(config.negotiation.timeout_secs))
        .await
        .context("Failed to secure envelope")?;
    println!("{}", secured.to_xml());
    info!(context_id = %args.context_id, "Envelope secured");
    Ok(ExitCode::SUCCESS)
}

async fn verify(config: &WsSecurityConfig, args: &SessionArgs) -> Result<ExitCode> {
    let xml = read_input(args).await?;

    let mut factory = factory(config)?;
    if config.protocol.variant == ProtocolVariant::SymmetricSessionKey {
        let cache = Arc::new(config.build_token_cache());
        cache.add_context(args.token()?)?;
        factory.set_token_cache(cache)?;
    }
    let protocol = open(&mut factory, args)?;

    match protocol.verify_incoming_xml(&xml, None) {
        Ok(processed) => {
            println!("{}", processed.message.to_xml());
            info!(
                action = ?processed.message.action(),
                claims = processed.security.claims.len(),
                "Envelope verified"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let version = Message::from_xml(&xml)
                .map(|m| m.version())
                .unwrap_or(SoapVersion::Soap12);
            warn!(error = %e, fault = e.fault_code().as_str(), "Envelope rejected");
            println!("{}", soap_fault_response(&e, version.fault_version()));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn factory(config: &WsSecurityConfig) -> Result<SecurityProtocolFactory> {
    let mut factory = SecurityProtocolFactory::new(config.protocol.variant);
    factory.set_settings(config.protocol_settings())?;
    factory.set_standards(config.standards)?;
    factory.set_algorithm_suite(config.algorithm_suite)?;
    Ok(factory)
}

fn open(factory: &mut SecurityProtocolFactory, args: &SessionArgs) -> Result<Arc<SecurityProtocol>> {
    factory.open().context("Invalid security configuration")?;
    let protocol = factory.create_security_protocol(EndpointAddress::new(args.target.clone()), None)?;
    Ok(protocol)
}

async fn read_input(args: &SessionArgs) -> Result<String> {
    tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))
}
