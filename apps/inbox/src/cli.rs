use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "inbox",
    about = "Browse livechat conversations from the terminal",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "INBOX_CONFIG",
        value_name = "PATH",
        help = "Config file (defaults to ~/.inbox/config.toml when present)"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "INBOX_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "INBOX_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "trace-deps",
        global = true,
        env = "INBOX_TRACE_DEPS",
        help = "Also raise the HTTP and websocket crates to the chosen log level"
    )]
    pub trace_deps: bool,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            trace_deps: self.trace_deps,
        }
    }
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List recent conversations, optionally searching or filtering by agent
    Conversations(ConversationsArgs),
    /// List active agents
    Agents,
    /// Show the latest messages of a conversation
    Open(OpenArgs),
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationsArgs {
    #[arg(long, short = 's', value_name = "TERM")]
    pub search: Option<String>,

    #[arg(long, short = 'a', value_name = "AGENT_ID")]
    pub agent: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct OpenArgs {
    /// Contact id or user id of the conversation
    pub contact: String,

    /// Keep running and print new messages as they arrive
    #[arg(long, short = 'f')]
    pub follow: bool,
}
