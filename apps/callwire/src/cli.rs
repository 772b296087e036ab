use clap::{Args, Parser};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "callwire",
    about = "Headless audio/video call agent for a signaling relay",
    version
)]
pub struct Cli {
    #[arg(long, value_name = "URL", help = "Relay websocket URL (ws, wss, http or https)")]
    pub relay_url: Option<String>,

    #[arg(long, value_name = "ID", help = "User id presented to the relay")]
    pub user_id: Option<String>,

    #[arg(long, value_name = "TOKEN", help = "Bearer token presented to the relay")]
    pub token: Option<String>,

    #[arg(long, value_name = "PEER", help = "Place a call to this user once connected")]
    pub call: Option<String>,

    #[arg(long, help = "Answer incoming calls without prompting")]
    pub auto_answer: bool,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "ICE server URL; repeat for several (overrides CALLWIRE__ICE_SERVERS)"
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, help = "Send synthetic audio only")]
    pub audio_only: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CALLWIRE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CALLWIRE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    /// `fallback_file` comes from `CALLWIRE__LOG_PATH` and loses to the flag.
    pub fn to_config(&self, fallback_file: Option<&str>) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self
                .file
                .clone()
                .or_else(|| fallback_file.map(PathBuf::from)),
        }
    }
}
