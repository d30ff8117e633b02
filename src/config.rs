use std::path::PathBuf;

use clap::Parser;

use crate::gateway::GatewayConfig;

/// Real-time chat delivery service: websocket gateway, relay fanout,
/// durable ingestion and read receipts.
///
/// Every option can also be set through its environment variable; a `.env`
/// file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatgate", version, about)]
pub struct Config {
    /// HTTP and websocket listen address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:4000")]
    pub bind: String,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://chat.db")]
    pub database_url: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 16)]
    pub db_max_connections: u32,

    /// Redis URL for the relay bus and presence store; in-process when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// AMQP URL for the durable queues; in-process when unset
    #[arg(long, env = "AMQP_URL")]
    pub amqp_url: Option<String>,

    /// Concurrent ingestion partitions, keyed by chat id
    #[arg(long, env = "INGEST_PARTITIONS", default_value_t = 1)]
    pub ingest_partitions: usize,

    /// Unacked deliveries the ingestion consumer may hold
    #[arg(long, env = "AMQP_PREFETCH", default_value_t = 32)]
    pub prefetch: u16,

    /// Run the gateway without consuming message_queue
    #[arg(long, env = "NO_WORKER")]
    pub no_worker: bool,

    /// Refuse join_chat for users the store does not list in the chat
    #[arg(long, env = "VERIFY_MEMBERSHIP")]
    pub verify_membership: bool,

    /// Frames buffered per connection before frames are dropped
    #[arg(long, env = "OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long, env = "LOG")]
    pub log: Option<String>,

    /// Directory for daily rolling log files
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            outbound_buffer: self.outbound_buffer,
            verify_membership: self.verify_membership,
        }
    }
}
