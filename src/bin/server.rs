use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use regmaster::{
    AcceptPolicy, Credentials, OperatorHandle, Server, ServerConfig,
    ServerEvent, ServerSubscriber, SessionId,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[clap(name = "regmaster-server", version)]
#[clap(about = "Receive identity documents and issue credentials", long_about = None)]
struct Cli {
    /// TOML file with server settings
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,

    #[clap(long, short = 'p', env = "REGMASTER_PORT")]
    port: Option<u16>,

    /// Full listen address, e.g. 0.0.0.0:55000
    #[clap(long)]
    bind: Option<SocketAddr>,

    /// Where received documents are stored. Emptied at startup!
    #[clap(long)]
    docs_dir: Option<PathBuf>,

    /// Accept new connections without waiting for registration
    #[clap(long, action)]
    immediate_accept: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).with_context(|| {
                format!("Failed to load config file: {}", path.display())
            })?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(docs_dir) = &self.docs_dir {
            config.docs_dir = docs_dir.clone();
        }
        if self.immediate_accept {
            config.accept_policy = AcceptPolicy::Immediate;
        }
        Ok(config)
    }
}

struct ConsoleSubscriber;

impl ServerSubscriber for ConsoleSubscriber {
    fn get_id(&self) -> String {
        "console".to_owned()
    }

    fn log(&self, _message: String) {}

    fn notify(&self, event: ServerEvent) {
        if !matches!(event, ServerEvent::Progress { .. }) {
            println!("----------\n{event}");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    List,
    Show(SessionId),
    Issue(SessionId, Credentials),
    Send(SessionId, String),
    Drop(SessionId),
    Help,
    Quit,
}

fn parse_id(word: Option<&str>) -> Result<SessionId> {
    let word = word.ok_or_else(|| anyhow!("missing user number"))?;
    word.trim_start_matches('#')
        .parse()
        .with_context(|| format!("'{word}' is not a user number"))
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("list" | "ls") => ConsoleCommand::List,
            Some("show") => ConsoleCommand::Show(parse_id(words.next())?),
            Some("issue") => {
                let id = parse_id(words.next())?;
                let login = words.next().unwrap_or_default();
                let password = words.next().unwrap_or_default();
                ConsoleCommand::Issue(id, Credentials::new(login, password)?)
            }
            Some("send") => {
                let id = parse_id(words.next())?;
                let text = words.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    return Err(anyhow!("nothing to send"));
                }
                ConsoleCommand::Send(id, text)
            }
            Some("drop") => ConsoleCommand::Drop(parse_id(words.next())?),
            Some("help") | None => ConsoleCommand::Help,
            Some("quit" | "exit") => ConsoleCommand::Quit,
            Some(other) => return Err(anyhow!("unknown command '{other}'")),
        };
        Ok(command)
    }
}

const HELP: &str = "\
Commands:
  list                         show connected users
  show <n>                     details of user <n> as JSON
  issue <n> <login> <password> send credentials to user <n> and disconnect
  send <n> <text...>           send free-form text to user <n> and disconnect
  drop <n>                     disconnect user <n> without an answer
  quit                         disconnect everybody and exit";

fn print_sessions(operator: &OperatorHandle) {
    let sessions = operator.list();
    if sessions.is_empty() {
        println!("No users connected.");
        return;
    }
    for session in sessions {
        let who = session
            .submitter
            .as_ref()
            .map(|s| s.full_name.as_str())
            .unwrap_or("-");
        println!(
            "#{:<4} {:<14} {:>10}/{:<10} {:<22} {}",
            session.id,
            session.phase.to_string(),
            session.received_size,
            session.announced_size,
            session.peer,
            who
        );
    }
}

async fn execute(
    operator: &OperatorHandle,
    command: ConsoleCommand,
) -> Result<bool> {
    match command {
        ConsoleCommand::List => print_sessions(operator),
        ConsoleCommand::Show(id) => {
            let snapshot = operator
                .get(id)
                .ok_or_else(|| anyhow!("no user #{id}"))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        ConsoleCommand::Issue(id, credentials) => {
            operator.issue_credentials(id, &credentials).await?
        }
        ConsoleCommand::Send(id, text) => operator.respond(id, &text).await?,
        ConsoleCommand::Drop(id) => operator.disconnect(id).await?,
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn console(operator: OperatorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        let keep_going = match line.parse::<ConsoleCommand>() {
            Ok(command) => execute(&operator, command).await,
            Err(e) => Err(e),
        };
        match keep_going {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cli = Cli::parse();
    let config = cli.server_config()?;
    let docs_dir = config.docs_dir.clone();

    let server = Server::bind(config)
        .await
        .context("Failed to start the server")?;
    let operator = server.handle();
    operator.subscribe(Arc::new(ConsoleSubscriber));

    println!(
        "Operator! Move received documents out of '{}' when you are done; \
         the directory is emptied on every start.",
        docs_dir.display()
    );

    let accept_loop = tokio::spawn(server.run());
    tokio::select! {
        result = console(operator.clone()) => result?,
        _ = tokio::signal::ctrl_c() => println!(),
    }

    operator.shutdown().await;
    accept_loop
        .await
        .context("Accept loop panicked")?
        .context("Accept loop failed")?;
    Ok(())
}
