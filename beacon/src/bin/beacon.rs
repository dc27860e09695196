//! Beacon command-line tool.
//!
//! Listens for signals or sends one status change, for wiring checks between
//! hosts. Payloads are strings.
//!
//! # Usage
//!
//! ```sh
//! beacon listen --bind 0.0.0.0:9100 --signal CD1.X --signal CD1.Y
//! beacon send --connect 127.0.0.1:9100 --signal CD1.X --emit hello --duration 200
//! ```

use std::io::{self, BufRead};
use std::time::Duration;

use beacon::control::{AnonymousClient, AnonymousServer, NamedClient, NamedServer, ServerHandshake};
use beacon::{
    AcceptorConfig, AcceptorError, ConnectionError, EmitterConfig, Endpoint, InputSignal,
    OutputSignal, ShutdownError, SignalError, SignalRegistry, SignalServer, delivery,
};

/// Extra wait after an emit's duration so the decay reaches the peer.
const DECAY_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Acceptor(#[from] AcceptorError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("stdin: {0}")]
    Stdin(#[from] io::Error),
}

enum Action {
    Emit { value: String, duration: Duration },
    Sustain(Option<String>),
    Deactivate,
}

enum Command {
    Listen {
        bind: Endpoint,
        signals: Vec<String>,
        max_workers: usize,
    },
    Send {
        connect: Endpoint,
        signal: Option<String>,
        action: Action,
    },
}

fn main() {
    beacon::init_tracing();

    if let Err(e) = run() {
        eprintln!("beacon: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    match parse_args(&args)? {
        Command::Listen {
            bind,
            signals,
            max_workers,
        } => listen(bind, signals, max_workers),
        Command::Send {
            connect,
            signal,
            action,
        } => send(connect, signal, action),
    }
}

fn listen(bind: Endpoint, signals: Vec<String>, max_workers: usize) -> Result<(), CliError> {
    let config = AcceptorConfig {
        max_workers,
        ..AcceptorConfig::default()
    };

    if signals.is_empty() {
        let handshake = AnonymousServer::<String>::with_delivery(delivery(|active, value| {
            println!("* active={active} value={value:?}");
        }));
        let input = InputSignal::open(bind, handshake, config)?;
        eprintln!("beacon: listening on {} (anonymous)", input.local_endpoint());
        return serve(&input);
    }

    let registry = SignalRegistry::<String>::new();
    for name in &signals {
        let label = name.clone();
        registry.register_qualified(
            name.as_str(),
            delivery(move |active, value| {
                println!("{label} active={active} value={value:?}");
            }),
        );
    }
    let input: SignalServer<String> =
        InputSignal::open(bind, NamedServer::new(registry), config)?;
    eprintln!(
        "beacon: listening on {} for {}",
        input.local_endpoint(),
        signals.join(", ")
    );
    serve(&input)
}

/// Runs until stdin reaches end of input, then closes the endpoint.
fn serve<H: ServerHandshake>(input: &InputSignal<H>) -> Result<(), CliError> {
    for line in io::stdin().lock().lines() {
        line?;
    }
    eprintln!("beacon: stdin closed, shutting down");
    input.close()?;
    eprintln!("beacon: stopped");
    Ok(())
}

fn send(connect: Endpoint, signal: Option<String>, action: Action) -> Result<(), CliError> {
    let config = EmitterConfig::default();
    let output: OutputSignal<String> = match &signal {
        Some(name) => {
            let handshake = NamedClient::new(name.as_str()).with_ack_timeout(config.ack_timeout);
            OutputSignal::open(connect, &handshake, config)?
        }
        None => OutputSignal::open(connect, &AnonymousClient, config)?,
    };
    eprintln!("beacon: connected to {}", output.peer());

    match action {
        Action::Emit { value, duration } => {
            output.emit(value, duration)?;
            std::thread::sleep(duration.saturating_add(DECAY_MARGIN));
        }
        Action::Sustain(Some(value)) => output.sustain_with(value)?,
        Action::Sustain(None) => output.sustain()?,
        Action::Deactivate => output.deactivate()?,
    }

    output.close()?;
    Ok(())
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn parse_endpoint(s: &str) -> Result<Endpoint, CliError> {
    if let Ok(endpoint) = s.parse::<Endpoint>() {
        return Ok(endpoint);
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| CliError::Usage(format!("invalid address: {s}")))?;
    let port = port
        .parse()
        .map_err(|_| CliError::Usage(format!("invalid port in {s}")))?;
    Endpoint::resolve(host, port).map_err(|e| CliError::Usage(format!("cannot resolve {s}: {e}")))
}

/// Parses command line arguments into a command.
fn parse_args(args: &[String]) -> Result<Command, CliError> {
    let Some(mode) = args.get(1) else {
        print_usage();
        return Err(CliError::Usage("missing command".into()));
    };

    let mut endpoint: Option<Endpoint> = None;
    let mut signals: Vec<String> = Vec::new();
    let mut max_workers = AcceptorConfig::default().max_workers;
    let mut emit: Option<String> = None;
    let mut duration: Option<Duration> = None;
    let mut sustain: Option<Option<String>> = None;
    let mut deactivate = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" | "--connect" | "-c" => {
                i += 1;
                endpoint = Some(parse_endpoint(value_of(args, i, "address")?)?);
            }
            "--signal" | "-s" => {
                i += 1;
                signals.push(value_of(args, i, "--signal")?.to_owned());
            }
            "--max-workers" => {
                i += 1;
                max_workers = value_of(args, i, "--max-workers")?
                    .parse()
                    .map_err(|_| CliError::Usage("invalid --max-workers".into()))?;
            }
            "--emit" => {
                i += 1;
                emit = Some(value_of(args, i, "--emit")?.to_owned());
            }
            "--duration" | "-d" => {
                i += 1;
                let ms: u64 = value_of(args, i, "--duration")?
                    .parse()
                    .map_err(|_| CliError::Usage("invalid --duration".into()))?;
                duration = Some(Duration::from_millis(ms));
            }
            "--sustain" => {
                let value = args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
                if value.is_some() {
                    i += 1;
                }
                sustain = Some(value);
            }
            "--deactivate" => deactivate = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    match mode.as_str() {
        "listen" => Ok(Command::Listen {
            bind: endpoint.ok_or_else(|| CliError::Usage("listen requires --bind".into()))?,
            signals,
            max_workers,
        }),
        "send" => {
            if signals.len() > 1 {
                return Err(CliError::Usage("send takes at most one --signal".into()));
            }
            let action = match (emit, sustain, deactivate) {
                (Some(value), None, false) => Action::Emit {
                    value,
                    duration: duration
                        .ok_or_else(|| CliError::Usage("--emit requires --duration".into()))?,
                },
                (None, Some(value), false) => Action::Sustain(value),
                (None, None, true) => Action::Deactivate,
                _ => {
                    return Err(CliError::Usage(
                        "send takes exactly one of --emit, --sustain, --deactivate".into(),
                    ));
                }
            };
            Ok(Command::Send {
                connect: endpoint
                    .ok_or_else(|| CliError::Usage("send requires --connect".into()))?,
                signal: signals.pop(),
                action,
            })
        }
        "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        other => Err(CliError::Usage(format!("unknown command: {other}"))),
    }
}

fn print_usage() {
    eprintln!(
        r#"beacon - boolean signal transport

USAGE:
    beacon listen --bind <ADDR> [--signal <DOMAIN.SIGNAL>]... [--max-workers <N>]
    beacon send --connect <ADDR> [--signal <DOMAIN.SIGNAL>] <ACTION>

ACTIONS:
    --emit <VALUE> --duration <MS>   Activate with VALUE, revert after MS
    --sustain [VALUE]                Activate until changed
    --deactivate                     Deactivate

OPTIONS:
    -b, --bind <ADDR>        Listen address
    -c, --connect <ADDR>     Peer address
    -s, --signal <NAME>      Qualified signal name; listen accepts several,
                             none means anonymous
        --max-workers <N>    Concurrent connections (default: 64)
    -h, --help               Print this help message

Listening stops when stdin closes.

EXAMPLE:
    beacon listen --bind 0.0.0.0:9100 --signal CD1.X
    beacon send --connect 127.0.0.1:9100 --signal CD1.X --emit hello --duration 200
"#
    );
}
