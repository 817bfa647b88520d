//! Tether CLI
//!
//! Talks to a device debugging daemon over TCP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::config::Config;
use client::services::sync::PushOptions;
use client::{Device, DeviceOptions, FileCredentialStore, Shell, ShellEvent, ShellOptions};
use protocol::SyncStat;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

/// Tether - host client for device debugging daemons.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Daemon address (host:port), overrides the configuration
    #[arg(short, long, global = true, value_name = "ADDR")]
    pub address: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect and print the device banner
    Devices {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run a command on the device
    Shell {
        /// Allocate a pseudo-terminal
        #[arg(long, short)]
        pty: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a local file to the device
    Push {
        /// Local file
        local: PathBuf,
        /// Destination path on the device
        remote: String,
    },

    /// Copy a file from the device
    Pull {
        /// Source path on the device
        remote: String,
        /// Local destination
        local: PathBuf,
    },

    /// List a directory on the device
    Ls {
        /// Directory path
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show file metadata
    Stat {
        /// File path
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Read a system property
    Getprop {
        /// Property name
        key: String,
    },

    /// Save a raw screen capture
    Screencap {
        /// Output file
        output: PathBuf,
    },

    /// Restart the device daemon listening on TCP
    Tcpip {
        /// Port to listen on
        port: u16,
    },

    /// Restart the device daemon on USB
    Usb,

    /// Generate a new key in the key directory
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Some(address) = &cli.address {
        config.connection.address = address.clone();
    }
    config.validate()?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.client.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    let store = FileCredentialStore::from_config(&config);
    if let Commands::Keygen = cli.command {
        let key = store
            .generate_and_save()
            .context("Failed to generate key")?;
        println!(
            "Generated key in {} ({})",
            store.dir().display(),
            key.public_key().fingerprint()
        );
        return Ok(());
    }

    let device = connect(&config, store).await?;
    let exit_code = run(&device, cli.command).await;
    device.close().await;

    match exit_code {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => Err(e),
    }
}

async fn connect(config: &Config, store: FileCredentialStore) -> anyhow::Result<Device> {
    let address = &config.connection.address;
    tracing::debug!("Connecting to {}", address);

    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("Failed to connect to {address}"))?;
    stream.set_nodelay(true)?;

    Device::connect(stream, Arc::new(store), DeviceOptions::from_config(config))
        .await
        .with_context(|| format!("Failed to authenticate with {address}"))
}

/// Runs one command, returning the process exit code.
async fn run(device: &Device, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Devices { json } => {
            let banner = device.banner();
            if json {
                println!("{}", serde_json::to_string_pretty(banner)?);
            } else {
                println!("{}", banner);
            }
        }
        Commands::Shell { pty, command } => {
            let options = if pty {
                ShellOptions::pty(std::env::var("TERM").ok())
            } else {
                ShellOptions::raw()
            };
            let shell = device.shell().spawn(&command.join(" "), &options).await?;
            return stream_shell(shell).await;
        }
        Commands::Push { local, remote } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let size = data.len();
            let options: PushOptions = device.push_options(remote.clone(), data);

            let sync = device.sync().await?;
            sync.push(options)
                .await
                .with_context(|| format!("Failed to push to {remote}"))?;
            sync.close().await?;
            println!("{}: {} bytes pushed", local.display(), size);
        }
        Commands::Pull { remote, local } => {
            let sync = device.sync().await?;
            let mut file = tokio::fs::File::create(&local)
                .await
                .with_context(|| format!("Failed to create {}", local.display()))?;
            let size = sync
                .pull_to_writer(&remote, &mut file)
                .await
                .with_context(|| format!("Failed to pull {remote}"))?;
            sync.close().await?;
            println!("{}: {} bytes pulled", remote, size);
        }
        Commands::Ls { path, json } => {
            let sync = device.sync().await?;
            let mut entries = sync.list(&path).await?;
            sync.close().await?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{:06o} {:>10} {:>10} {}",
                        entry.stat.mode, entry.stat.size, entry.stat.mtime, entry.name
                    );
                }
            }
        }
        Commands::Stat { path, json } => {
            let sync = device.sync().await?;
            let stat = sync.lstat(&path).await?;
            sync.close().await?;

            match stat {
                Some(stat) if json => println!("{}", serde_json::to_string_pretty(&stat)?),
                Some(stat) => print_stat(&path, &stat),
                None => {
                    eprintln!("{path}: No such file or directory");
                    return Ok(1);
                }
            }
        }
        Commands::Getprop { key } => {
            println!("{}", device.getprop(&key).await?);
        }
        Commands::Screencap { output } => {
            let capture = device.framebuffer().await?;
            tokio::fs::write(&output, &capture.data)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "{}: {}x{} {} bpp",
                output.display(),
                capture.header.width,
                capture.header.height,
                capture.header.bpp
            );
        }
        Commands::Tcpip { port } => {
            device.tcpip(port).await?;
            println!("restarting in TCP mode port: {port}");
        }
        Commands::Usb => {
            device.usb().await?;
            println!("restarting in USB mode");
        }
        Commands::Keygen => anyhow::bail!("keygen runs without a device connection"),
    }
    Ok(0)
}

/// Copies shell output to stdout/stderr and returns the remote exit code.
async fn stream_shell(shell: Shell) -> anyhow::Result<i32> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    match shell {
        Shell::V2(mut shell) => {
            shell.close_stdin().await?;
            while let Some(event) = shell.next_event().await? {
                match event {
                    ShellEvent::Stdout(data) => stdout.write_all(&data).await?,
                    ShellEvent::Stderr(data) => stderr.write_all(&data).await?,
                    ShellEvent::Exit(_) => {}
                }
            }
            stdout.flush().await?;
            Ok(shell.exit_code().map(i32::from).unwrap_or(1))
        }
        Shell::Raw(mut shell) => {
            while let Some(data) = shell.read().await {
                stdout.write_all(&data).await?;
            }
            stdout.flush().await?;
            Ok(0)
        }
    }
}

fn print_stat(path: &str, stat: &SyncStat) {
    println!("  File: {path}");
    println!("  Size: {}", stat.size);
    println!("  Mode: {:06o} ({:?})", stat.mode, stat.file_type());
    println!(" Mtime: {}", stat.mtime);
    if let (Some(uid), Some(gid)) = (stat.uid, stat.gid) {
        println!("   Uid: {uid}  Gid: {gid}");
    }
}
