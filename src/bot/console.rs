use log::{debug, warn};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Operator commands read from the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Connect when idle, disconnect when connected or connecting
    Toggle,
    Connect,
    Disconnect,
    /// Flip the greeted flag of a chatter
    Ack(String),
    Reset,
    List,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),
    #[error("'{0}' needs a username")]
    MissingArgument(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split_whitespace();
        let verb = parts.next().ok_or(ConsoleError::Empty)?.to_lowercase();

        let command = match verb.as_str() {
            "toggle" | "t" => ConsoleCommand::Toggle,
            "connect" | "c" => ConsoleCommand::Connect,
            "disconnect" | "d" => ConsoleCommand::Disconnect,
            "ack" | "greet" | "a" => {
                let username = parts.next().ok_or(ConsoleError::MissingArgument("ack"))?;
                ConsoleCommand::Ack(username.to_string())
            }
            "reset" => ConsoleCommand::Reset,
            "list" | "ls" => ConsoleCommand::List,
            "status" | "s" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            _ => return Err(ConsoleError::Unknown(verb)),
        };
        Ok(command)
    }
}

pub const HELP: &str = "\
commands:
  toggle | t          connect, or disconnect if already connected
  connect | c         connect to the configured channel
  disconnect | d      drop the connection
  ack <user>          mark or unmark a chatter as greeted
  reset               clear today's chatters and greetings
  list | ls           show today's first-time chatters
  status | s          show the connection state
  quit | q            exit";

/// Read commands from stdin until EOF, forwarding them to `tx`
pub fn spawn_stdin_reader(tx: mpsc::Sender<ConsoleCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => {
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(ConsoleError::Empty) => {}
                    Err(e) => println!("{}", e),
                },
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }
    })
}
