use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listener, for per-connection limits and for logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub connection: ConnectionSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the address the server binds to, the WebSocket endpoint path and
/// how long shutdown waits for open connections.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub shutdown_grace_secs: u64,
}

/// Per-connection limits.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    /// Frames queued for one peer before further broadcasts to it are dropped.
    pub outbound_queue_capacity: usize,
    /// Upper bound for the HTTP upgrade request head.
    pub max_request_bytes: usize,
    /// Upper bound for a single inbound WebSocket message.
    pub max_message_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectionSettings {
    pub outbound_queue_capacity: Option<usize>,
    pub max_request_bytes: Option<usize>,
    pub max_message_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8888,
                path: "/websocket".to_string(),
                shutdown_grace_secs: 5,
            },
            connection: ConnectionSettings {
                outbound_queue_capacity: 256,
                max_request_bytes: 65536,
                max_message_bytes: 65536,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge_over(self, default: Settings) -> Settings {
        let server = self.server;
        let connection = self.connection;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                path: server
                    .as_ref()
                    .and_then(|s| s.path.clone())
                    .unwrap_or(default.server.path),
                shutdown_grace_secs: server
                    .as_ref()
                    .and_then(|s| s.shutdown_grace_secs)
                    .unwrap_or(default.server.shutdown_grace_secs),
            },
            connection: ConnectionSettings {
                outbound_queue_capacity: connection
                    .as_ref()
                    .and_then(|c| c.outbound_queue_capacity)
                    .unwrap_or(default.connection.outbound_queue_capacity),
                max_request_bytes: connection
                    .as_ref()
                    .and_then(|c| c.max_request_bytes)
                    .unwrap_or(default.connection.max_request_bytes),
                max_message_bytes: connection
                    .as_ref()
                    .and_then(|c| c.max_message_bytes)
                    .unwrap_or(default.connection.max_message_bytes),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}

impl ServerSettings {
    /// `host:port` as handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
