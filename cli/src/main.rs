// linkwire — single-peer duplex session from the command line
//
// Listens for one inbound TCP connection or dials a peer, then turns the
// terminal into a line console over the active session.

mod config;
mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use console::ConsoleCommand;
use linkwire_core::transport::{DialMode, MemoryTransport, TcpTransport};
use linkwire_core::{
    EventChannel, PeerId, SessionEvent, SessionManager, SessionState, Stream,
};
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "linkwire")]
#[command(about = "linkwire — one duplex session, inbound or outbound", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a peer to connect
    Listen {
        /// Override the configured listen address
        #[arg(short, long)]
        addr: Option<SocketAddr>,
    },
    /// Connect to a peer (host:port) while staying reachable
    Dial {
        peer: String,
        /// Override the configured listen address
        #[arg(short, long)]
        addr: Option<SocketAddr>,
    },
    /// List known peers
    Peers,
    /// Run a session against an in-process echo peer
    Demo,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Listen { addr } => cmd_session(addr, None).await,
        Commands::Dial { peer, addr } => cmd_session(addr, Some(peer)).await,
        Commands::Peers => cmd_peers(),
        Commands::Demo => cmd_demo().await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { old, new } => {
            println!("\n{} {} → {}", "•".dimmed(), old.to_string().dimmed(), new.to_string().bold());
        }
        SessionEvent::Connected { peer } => {
            println!("\n{} Connected to {}", "✓".green(), peer.to_string().bright_cyan());
        }
        SessionEvent::ConnectionFailed => {
            println!("\n{} Connection failed; listening again", "✗".red());
        }
        SessionEvent::ConnectionLost => {
            println!("\n{} Connection lost; listening again", "✗".red());
        }
        SessionEvent::Read(data) => {
            println!("\n{} {}", "←".bright_blue(), String::from_utf8_lossy(data).trim_end());
        }
        SessionEvent::Write(_) => return,
    }
    prompt();
}

fn build_manager(addr: Option<SocketAddr>) -> Result<(Arc<SessionManager>, UnboundedReceiver<SessionEvent>)> {
    let config = config::Config::load()?;
    let transport = TcpTransport::new(config.tcp_config(addr)).with_known_peers(config.known_peer_ids());
    let (events, rx) = EventChannel::new();
    let manager = SessionManager::new(Arc::new(transport), Arc::new(events), config.session)
        .context("Failed to create session manager")?;
    tracing::info!(
        "Session manager ready, listen address {}",
        addr.unwrap_or(config.listen_addr)
    );
    Ok((Arc::new(manager), rx))
}

/// Run a blocking manager call off the async runtime
async fn blocking<T, F>(manager: &Arc<SessionManager>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SessionManager) -> T + Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(manager.as_ref()))
        .await
        .context("Session task panicked")
}

async fn cmd_session(addr: Option<SocketAddr>, dial: Option<String>) -> Result<()> {
    let (manager, mut event_rx) = build_manager(addr)?;

    println!("{}", "linkwire — Starting...".bold());
    println!();

    match dial {
        Some(peer) => {
            let peer = PeerId::new(peer).context("Invalid peer")?;
            println!("{} Dialing {}", "→".bright_green(), peer.to_string().bright_cyan());
            blocking(&manager, move |m| m.dial(&peer))
                .await?
                .context("Failed to dial")?;
        }
        None => {
            blocking(&manager, |m| m.listen()).await?.context("Failed to listen")?;
        }
    }
    println!("{} Session {}", "✓".green(), manager.state().to_string().bold());
    println!();
    print_help();
    println!();

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let mut lines = spawn_stdin_reader()?;
    let console_manager = manager.clone();
    let console_task = tokio::spawn(async move {
        prompt();
        while let Some(line) = lines.recv().await {
            match run_console_command(&console_manager, console::parse_line(&line)).await {
                Ok(true) => prompt(),
                Ok(false) => break,
                Err(e) => {
                    println!("{} {:#}", "✗".red(), e);
                    prompt();
                }
            }
        }
    });

    tokio::select! {
        _ = console_task => {}
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    println!("Shutting down...");
    tracing::info!("Stopping session in state {}", manager.state());
    blocking(&manager, |m| m.stop()).await?;
    event_task.abort();
    Ok(())
}

/// Read stdin lines on a plain thread; it is left behind on exit
fn spawn_stdin_reader() -> Result<UnboundedReceiver<String>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("linkwire-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start stdin reader")?;
    Ok(rx)
}

/// Returns `false` when the console should exit
async fn run_console_command(manager: &Arc<SessionManager>, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Send(text) => {
            if manager.state() != SessionState::Connected {
                println!("{}", "Not connected; line dropped.".dimmed());
            } else {
                let mut line = text.into_bytes();
                line.push(b'\n');
                blocking(manager, move |m| m.write(&line)).await??;
            }
        }
        ConsoleCommand::Dial(peer) => {
            let peer = PeerId::new(peer)?;
            blocking(manager, move |m| m.dial(&peer)).await??;
        }
        ConsoleCommand::Listen => blocking(manager, |m| m.listen()).await??,
        ConsoleCommand::Stop => blocking(manager, |m| m.stop()).await?,
        ConsoleCommand::State => {
            let snapshot = manager.snapshot();
            println!("  State:  {}", snapshot.state.to_string().bold());
            if let Some(peer) = snapshot.peer {
                println!("  Peer:   {}", peer.to_string().bright_cyan());
            }
            println!(
                "  Units:  listener={} dialer={} worker={}",
                snapshot.listener_active, snapshot.dialer_active, snapshot.worker_active
            );
        }
        ConsoleCommand::Peers => print_peers(&manager.discoverable_peers()?),
        ConsoleCommand::Help => print_help(),
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Unknown(line) => {
            println!("{} Unknown command: {}", "?".yellow(), line);
        }
    }
    Ok(true)
}

fn print_help() {
    println!("{}", "Commands:".bold());
    for (usage, description) in console::HELP {
        println!("  {:<14} {}", usage.bright_green(), description);
    }
}

fn print_peers<'a>(peers: impl IntoIterator<Item = &'a PeerId>) {
    let mut any = false;
    for peer in peers {
        any = true;
        println!("  • {}", peer.to_string().bright_cyan());
    }
    if !any {
        println!("{}", "No known peers. Add some: linkwire config set known_peers host:port,...".dimmed());
    }
}

fn cmd_peers() -> Result<()> {
    let config = config::Config::load()?;
    println!("{}", "Known Peers".bold());
    print_peers(&config.known_peer_ids());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<30} {}", key.bright_cyan(), value);
            }
            println!();
            println!("File: {}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

async fn cmd_demo() -> Result<()> {
    const TIMEOUT: Duration = Duration::from_secs(5);

    println!("{}", "linkwire demo — memory transport".bold());
    println!();

    let transport = MemoryTransport::new();
    let echo_peer = PeerId::new("echo").context("Invalid peer")?;
    transport.add_peer(echo_peer.clone(), DialMode::Accept);

    let (events, mut event_rx) = EventChannel::new();
    let manager = Arc::new(
        SessionManager::new(
            Arc::new(transport.clone()),
            Arc::new(events),
            Default::default(),
        )
        .context("Failed to create session manager")?,
    );

    let dial_peer = echo_peer.clone();
    blocking(&manager, move |m| m.dial(&dial_peer)).await??;

    let remote = tokio::task::spawn_blocking(move || transport.take_remote(&echo_peer, TIMEOUT))
        .await?
        .context("Echo peer never saw the connection")?;

    // Echo everything back until the session closes the stream.
    let echo = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        while let Ok(n) = remote.read(&mut buf) {
            if n == 0 || remote.write_all(&buf[..n]).is_err() {
                break;
            }
        }
    });

    let greeting = b"hello from linkwire";
    let mut sent = false;
    let mut echoed = Vec::new();

    let outcome = tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = event_rx.recv().await {
            print_event_line(&event);
            match event {
                SessionEvent::Connected { .. } if !sent => {
                    blocking(&manager, move |m| m.write(greeting)).await??;
                    sent = true;
                }
                SessionEvent::Read(data) => {
                    echoed.extend_from_slice(&data);
                    if echoed.len() >= greeting.len() {
                        break;
                    }
                }
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;

    blocking(&manager, |m| m.stop()).await?;
    let _ = echo.await;
    while let Ok(event) = event_rx.try_recv() {
        print_event_line(&event);
    }

    outcome.context("Demo timed out")??;
    println!();
    if echoed == greeting {
        println!("{} Round trip complete", "✓".green());
        Ok(())
    } else {
        anyhow::bail!("Echo mismatch: {:?}", String::from_utf8_lossy(&echoed))
    }
}

fn print_event_line(event: &SessionEvent) {
    let text = match event {
        SessionEvent::Read(data) => format!("Read {:?}", String::from_utf8_lossy(data)),
        SessionEvent::Write(data) => format!("Write {:?}", String::from_utf8_lossy(data)),
        other => other.to_string(),
    };
    println!("  {} {}", "•".dimmed(), text);
}
