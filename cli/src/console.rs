// Interactive console input
//
// Plain lines are sent over the session; lines starting with `/` are
// commands.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Empty,
    Send(String),
    Dial(String),
    Listen,
    Stop,
    State,
    Peers,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_line(line: &str) -> ConsoleCommand {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return ConsoleCommand::Empty;
    }

    let Some(command) = line.trim_start().strip_prefix('/') else {
        return ConsoleCommand::Send(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("dial"), Some(peer)) => ConsoleCommand::Dial(peer.to_string()),
        (Some("listen"), None) => ConsoleCommand::Listen,
        (Some("stop"), None) => ConsoleCommand::Stop,
        (Some("state"), None) => ConsoleCommand::State,
        (Some("peers"), None) => ConsoleCommand::Peers,
        (Some("help"), None) => ConsoleCommand::Help,
        (Some("quit"), None) | (Some("exit"), None) => ConsoleCommand::Quit,
        _ => ConsoleCommand::Unknown(line.trim().to_string()),
    }
}

pub const HELP: &[(&str, &str)] = &[
    ("<text>", "send a line to the connected peer"),
    ("/dial <peer>", "connect to host:port"),
    ("/listen", "drop the connection and wait for inbound"),
    ("/stop", "stop everything"),
    ("/state", "show session state"),
    ("/peers", "list known peers"),
    ("/quit", "exit"),
];
