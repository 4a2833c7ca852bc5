use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use cowrite_collab::{CommandPolicy, EditorServer, JoinPolicy, ServerConfig};

#[derive(Parser)]
#[command(version, about = "CoWrite - collaborative plain-text editing server", long_about = None)]
struct Cli {
    /// Document name (".txt" is appended when missing)
    #[arg(default_value = "test")]
    document: String,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// WebSocket endpoint path
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Directory holding the document file
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Keep the document in memory only
    #[arg(long, conflicts_with = "dir")]
    in_memory: bool,

    /// Commands buffered ahead of the processor
    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    /// Frames buffered per client before it is dropped
    #[arg(long, default_value_t = 512)]
    outbound_capacity: usize,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value_t = 60)]
    pong_timeout: u64,

    /// Largest accepted frame, in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    max_frame_size: usize,

    /// What to do when a name that is already connected joins again
    #[arg(long, value_enum, default_value_t = OnDuplicate::Replace)]
    on_duplicate: OnDuplicate,

    /// Silently skip unknown commands instead of logging them as errors
    #[arg(long)]
    lenient: bool,

    /// Do not broadcast REMOVECLIENT when a client leaves
    #[arg(long)]
    quiet_departures: bool,

    /// Send ERROR events to clients whose commands are dropped
    #[arg(long)]
    report_errors: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnDuplicate {
    Replace,
    Reject,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let pong_timeout = Duration::from_secs(self.pong_timeout.max(1));
        ServerConfig {
            bind_addr: self.bind,
            ws_path: self.path,
            document_dir: (!self.in_memory).then_some(self.dir),
            document_name: self.document,
            command_queue_capacity: self.queue_capacity,
            outbound_capacity: self.outbound_capacity,
            pong_timeout,
            ping_interval: pong_timeout * 9 / 10,
            max_frame_size: self.max_frame_size,
            join_policy: match self.on_duplicate {
                OnDuplicate::Replace => JoinPolicy::Replace,
                OnDuplicate::Reject => JoinPolicy::Reject,
            },
            command_policy: if self.lenient {
                CommandPolicy::Lenient
            } else {
                CommandPolicy::Strict
            },
            announce_departures: !self.quiet_departures,
            report_errors: self.report_errors,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    let server = match EditorServer::new(config) {
        Ok(server) => std::sync::Arc::new(server),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted");
            signal_server.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}
