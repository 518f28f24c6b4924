//! Run a few show commands against a switch.
//!
//! Usage:
//!   cargo run --example show_commands -- --host 192.168.1.1 --user admin --password secret
//!   cargo run --example show_commands -- --host 10.0.0.5 --telnet --enable secret "show vlan"

use std::env;
use std::time::Duration;

use switchline::{CliSession, HostKeyVerification, SessionBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    println!(
        "Connecting to {}@{} over {}...",
        args.user,
        args.host,
        if args.telnet { "telnet" } else { "ssh" }
    );

    let mut builder = if args.telnet {
        SessionBuilder::telnet(&args.host)
    } else {
        SessionBuilder::ssh(&args.host)
    };
    builder = builder
        .username(&args.user)
        .password(&args.password)
        .command_timeout(Duration::from_secs(args.timeout));
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(secret) = &args.enable {
        builder = builder.enable_secret(secret);
    }
    if args.insecure {
        builder = builder.host_key_verification(HostKeyVerification::Disabled);
    }

    let session = builder.build()?;
    session.connect().await?;

    let stats = session.stats();
    println!(
        "Connected (prompt: {}, elevated: {})",
        stats.learned_prompt.as_deref().unwrap_or("-"),
        stats.elevated
    );

    let commands: Vec<&str> = args.commands.iter().map(String::as_str).collect();
    let outputs = session.execute_multiple_commands(&commands, None).await;
    for (command, output) in commands.iter().zip(&outputs) {
        println!("\n=== {command} ===");
        if output.is_empty() {
            println!("(no output)");
        } else {
            println!("{output}");
        }
    }

    println!("\nHealthy: {}", session.health_check().await);
    println!("{}", serde_json::to_string_pretty(&session.stats())?);

    session.disconnect().await;
    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    port: Option<u16>,
    user: String,
    password: String,
    enable: Option<String>,
    telnet: bool,
    insecure: bool,
    timeout: u64,
    commands: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut host = "localhost".to_string();
        let mut port = None;
        let mut user = env::var("USER").unwrap_or_else(|_| "admin".to_string());
        let mut password = String::new();
        let mut enable = None;
        let mut telnet = false;
        let mut insecure = false;
        let mut timeout = 30u64;
        let mut commands = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    i += 1;
                    if i < args.len() {
                        host = args[i].clone();
                    }
                }
                "--port" | "-p" => {
                    i += 1;
                    if i < args.len() {
                        port = args[i].parse().ok();
                    }
                }
                "--user" | "-u" => {
                    i += 1;
                    if i < args.len() {
                        user = args[i].clone();
                    }
                }
                "--password" | "-P" => {
                    i += 1;
                    if i < args.len() {
                        password = args[i].clone();
                    }
                }
                "--enable" | "-e" => {
                    i += 1;
                    if i < args.len() {
                        enable = Some(args[i].clone());
                    }
                }
                "--timeout" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        timeout = args[i].parse().unwrap_or(30);
                    }
                }
                "--telnet" => telnet = true,
                "--insecure" => insecure = true,
                "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                other => commands.push(other.to_string()),
            }
            i += 1;
        }

        if commands.is_empty() {
            commands = vec!["show version".to_string(), "show clock".to_string()];
        }

        Self {
            host,
            port,
            user,
            password,
            enable,
            telnet,
            insecure,
            timeout,
            commands,
        }
    }

    fn print_help() {
        println!(
            r#"switchline show_commands example

USAGE:
    cargo run --example show_commands -- [OPTIONS] [COMMAND]...

OPTIONS:
    -h, --host <HOST>        Target switch [default: localhost]
    -p, --port <PORT>        Port [default: 22 for SSH, 23 for Telnet]
    -u, --user <USER>        Username [default: $USER]
    -P, --password <PASS>    Login password
    -e, --enable <SECRET>    Enable secret (Telnet elevation)
    -t, --timeout <SECS>     Per-command timeout [default: 30]
    --telnet                 Use Telnet instead of SSH
    --insecure               Skip SSH host key verification
    --help                   Print this help message

Commands default to "show version" and "show clock"."#
        );
    }
}
