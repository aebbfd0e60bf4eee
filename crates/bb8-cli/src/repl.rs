//! Bench REPL – drive the bridge by hand.
//!
//! Each input line is either a slash-command or `<topic> <json>`, injected
//! into the in-process bus as if a remote client had published it.  A topic
//! without `/` is shorthand for `<base>/cmd/<topic>`, and a missing payload
//! means `{}`.  Everything the bridge publishes in response is printed.
//!
//! Slash-commands:
//!   /help         – show this list
//!   /status       – connection, estop, lighting, and link state
//!   /drop         – simulate a transport drop
//!   /link on|off  – connect or disconnect the simulated robot
//!   /quit | /exit – stop the bridge and exit

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bb8_hal::{BleLink, SimBleLink};
use bb8_middleware::{BusMessage, InMemoryBus, Topics};
use bb8_runtime::BridgeStatus;
use colored::Colorize;
use tokio::sync::watch;

/// Time allowed for the dispatcher to react before outbound traffic is shown.
const SETTLE: Duration = Duration::from_millis(120);

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Empty,
    Slash(String),
    Inject { topic: String, payload: String },
}

/// Classify one input line.
pub fn parse_line(line: &str, topics: &Topics) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line.starts_with('/') {
        return Input::Slash(line.to_string());
    }
    let (topic, payload) = match line.split_once(char::is_whitespace) {
        Some((topic, payload)) => (topic, payload.trim()),
        None => (line, ""),
    };
    let topic = if topic.contains('/') {
        topic.to_string()
    } else {
        format!("{}/cmd/{topic}", topics.base())
    };
    let payload = if payload.is_empty() { "{}" } else { payload };
    Input::Inject {
        topic,
        payload: payload.to_string(),
    }
}

/// One outbound message, as printed.
pub fn format_publish(message: &BusMessage) -> String {
    let marker = if message.retain { " (retained)" } else { "" };
    format!("← {}{} {}", message.topic, marker, message.payload)
}

pub struct Bench {
    bus: InMemoryBus,
    link: Arc<SimBleLink>,
    status: watch::Receiver<BridgeStatus>,
    topics: Topics,
    printed: usize,
}

impl Bench {
    pub fn new(
        bus: InMemoryBus,
        link: Arc<SimBleLink>,
        status: watch::Receiver<BridgeStatus>,
        topics: Topics,
    ) -> Self {
        Self {
            bus,
            link,
            status,
            topics,
            printed: 0,
        }
    }

    /// Print everything published since the last call.
    fn flush_outbound(&mut self) {
        let published = self.bus.published();
        for message in published.iter().skip(self.printed) {
            let line = format_publish(message);
            if message.topic.contains("/ack/") {
                println!("  {}", line.cyan());
            } else {
                println!("  {}", line.dimmed());
            }
        }
        self.printed = published.len();
    }
}

/// Read lines until EOF, `/quit`, or `quit` is set.
pub fn run(bench: &mut Bench, quit: &AtomicBool) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    std::thread::sleep(SETTLE);
    bench.flush_outbound();

    loop {
        if quit.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "bb8>".bold().yellow());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {e}", "Read error".red());
                break;
            }
        }

        match parse_line(&line, &bench.topics) {
            Input::Empty => continue,
            Input::Slash(cmd) => {
                if !slash_command(bench, &cmd) {
                    quit.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Input::Inject { topic, payload } => {
                println!("  → {topic} {payload}");
                if !bench.bus.deliver(&topic, &payload) {
                    println!("  {}", "(not delivered: bus offline or topic not subscribed)".yellow());
                }
            }
        }

        std::thread::sleep(SETTLE);
        bench.flush_outbound();
    }
}

/// Returns `false` when the REPL should exit.
fn slash_command(bench: &mut Bench, cmd: &str) -> bool {
    let mut words = cmd.split_whitespace();
    match (words.next().unwrap_or_default(), words.next()) {
        ("/help", _) => cmd_help(),
        ("/status", _) => cmd_status(bench),
        ("/drop", _) => {
            bench.bus.drop_connection();
            println!("  {}", "Transport dropped; the bridge will reconnect.".yellow());
        }
        ("/link", Some("on")) => {
            bench.link.set_connected(true);
            println!("  Simulated robot {}", "connected".green());
        }
        ("/link", Some("off")) => {
            bench.link.set_connected(false);
            println!("  Simulated robot {}", "disconnected".red());
        }
        ("/quit" | "/exit", _) => {
            println!("{}", "Goodbye.".green());
            return false;
        }
        _ => {
            println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                cmd.yellow(),
                "/help".bold()
            );
        }
    }
    true
}

fn cmd_help() {
    println!();
    println!("{}", "Bench Commands".bold().underline());
    println!("  {}  – inject a message, e.g. {}", "<topic> <json>".bold().cyan(), "led {\"r\":255}".dimmed());
    println!("  {}         – bridge and robot state", "/status".bold().cyan());
    println!("  {}           – simulate a transport drop", "/drop".bold().cyan());
    println!("  {}   – connect / disconnect the robot", "/link on|off".bold().cyan());
    println!("  {}    – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(bench: &Bench) {
    let status = bench.status.borrow().clone();
    println!();
    println!("{}", "Bridge Status".bold().underline());
    println!("  device       {}", status.device_id.bold());
    println!("  bus          {}", status.connection);
    println!(
        "  estop        {}",
        if status.estop_active { "ACTIVE".red().bold() } else { "clear".green() }
    );
    let rgb = status.lighting.rgb;
    println!(
        "  led          {} ({}, {}, {})",
        status.lighting.mode.label(),
        rgb.r,
        rgb.g,
        rgb.b
    );
    println!(
        "  robot link   {}",
        if bench.link.is_connected() { "connected".green() } else { "disconnected".red() }
    );
    println!("  commands     {}", status.commands_processed);
    println!("  subscribed   {}", bench.bus.subscriptions().join(", "));
    println!();
}
