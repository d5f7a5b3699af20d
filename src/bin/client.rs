use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regmaster::{Bundle, ClientConfig, SubmitterInfo, SubmitterSession};

#[derive(Parser, Debug)]
#[clap(name = "regmaster-client", version)]
#[clap(about = "Submit an identity document to the operator", long_about = None)]
struct Cli {
    /// TOML file with client settings
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,

    /// Operator address, e.g. 10.0.0.5:55000
    #[clap(long, short = 's', env = "REGMASTER_SERVER")]
    server: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a document and wait for the operator's answer
    Submit {
        #[clap(long)]
        name: String,

        #[clap(long)]
        organization: String,

        #[clap(long)]
        phone: String,

        /// Scan or photo of the identity document
        document: PathBuf,
    },
    /// Connect and immediately withdraw
    Withdraw,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path).with_context(|| {
                format!("Failed to load config file: {}", path.display())
            })?,
            None => ClientConfig::default(),
        };
        if let Some(server) = &self.server {
            config.server_addr = server.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn"),
    )
    .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let mut session = SubmitterSession::new(config);

    match cli.command {
        Command::Submit {
            name,
            organization,
            phone,
            document,
        } => {
            let bundle = Bundle::from_path(
                &document,
                SubmitterInfo::new(name, organization, phone),
            )
            .with_context(|| {
                format!("Failed to read document: {}", document.display())
            })?;

            session.connect().await?;
            println!(
                "Connected. Waiting for the operator to verify you... \
                 (Ctrl-C to withdraw)"
            );
            let withdraw = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::warn!("cannot listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            };
            let response = session
                .submit_until(&bundle, withdraw)
                .await
                .context("No answer from the operator")?;
            match response {
                Some(response) => println!("{response}"),
                None => println!("Withdrawn."),
            }
        }
        Command::Withdraw => {
            session.connect().await?;
            session.disconnect().await?;
            println!("Disconnected.");
        }
    }
    Ok(())
}
