use std::{error::Error, io, path::PathBuf};

use botlink::{
    Command, CommandError, ConnectionManager, LinkConfig, ProximityGuard, RobotCommand,
    TcpConnector, prompt,
};
use clap::Parser;
use log::{error, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML link configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Robot address, overrides the configuration
    #[arg(short, long)]
    address: Option<String>,
    /// Service identifier the robot advertises
    #[arg(long)]
    service_id: Option<Uuid>,
    /// Longest inbound frame accepted, in bytes
    #[arg(long)]
    max_frame_len: Option<usize>,
}

impl Cli {
    fn link_config(&self) -> Result<LinkConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => LinkConfig::load(path)?,
            None => LinkConfig::default(),
        };
        if let Some(address) = &self.address {
            config.peer.address = address.clone();
        }
        if let Some(service_id) = self.service_id {
            config.peer.service_id = service_id;
        }
        if self.max_frame_len.is_some() {
            config.link.max_frame_len = self.max_frame_len;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.link_config()?;
    let manager = ConnectionManager::new(TcpConnector::from_config(&config.peer), &config);

    let guard = ProximityGuard::default();
    let weak = manager.downgrade();
    manager.on_frame(move |frame| {
        println!("< {frame}");
        let Some(stop) = guard.react(&frame) else {
            return;
        };
        if let Some(manager) = weak.upgrade() {
            if let Err(e) = manager.send(&stop) {
                warn!("failed to stop robot: {e}");
            }
        }
    });
    manager.on_state_change(|state| println!("link is {state}"));

    let interrupted = manager.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = interrupted.send(&RobotCommand::Stop.into()) {
            warn!("failed to stop robot: {e}");
        }
        interrupted.close();
        std::process::exit(130);
    })?;

    manager.connect()?;

    loop {
        let cmd = match prompt(io::stdin().lock(), io::stdout().lock()) {
            Ok(c) => c,
            Err(CommandError::Empty) => continue,
            Err(CommandError::Io(e)) => {
                error!("console input failed: {e}");
                break;
            }
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        let sent = match cmd {
            Command::Exit => break,
            Command::Connect => manager.connect(),
            Command::Close => {
                manager.close();
                Ok(())
            }
            Command::State => {
                println!("link is {}", manager.state());
                Ok(())
            }
            Command::Raw(frames) => manager.send_raw(frames.as_bytes()),
            Command::Robot(command) => manager.send(&command.into()),
        };
        if let Err(e) = sent {
            eprintln!("error: {e}");
        }
    }

    manager.close();
    Ok(())
}
