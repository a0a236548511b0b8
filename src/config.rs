use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const GATEWAY_SOCKET_NAME: &str = "gateway.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub http_port: u16,
    /// gRPC ingress is off unless a port is configured.
    pub grpc_port: Option<u16>,
    pub func_config_file: String,
    /// Directory holding the gateway's IPC socket.
    pub ipc_root: String,
    /// Cap on concurrently dispatched external requests; 0 = unlimited.
    pub max_running_external_requests: u64,
    pub disable_monitor: bool,
    pub listen_backlog: i32,
    pub num_http_workers: usize,
    pub num_ipc_workers: usize,
    /// When set, HTTP and IPC share one pool of this many threads.
    pub num_io_workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_string(),
            http_port: 8084,
            grpc_port: None,
            func_config_file: String::new(),
            ipc_root: "/tmp/faasgate".to_string(),
            max_running_external_requests: 0,
            disable_monitor: false,
            listen_backlog: 1024,
            num_http_workers: 2,
            num_ipc_workers: 2,
            num_io_workers: None,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.parse::<IpAddr>().is_err() {
            return Err(anyhow::anyhow!("invalid listen address: {}", self.address));
        }
        if self.func_config_file.is_empty() {
            return Err(anyhow::anyhow!("func_config_file is required"));
        }
        if self.listen_backlog <= 0 {
            return Err(anyhow::anyhow!(
                "listen_backlog must be positive, got {}",
                self.listen_backlog
            ));
        }
        match self.num_io_workers {
            Some(0) => return Err(anyhow::anyhow!("num_io_workers must be positive")),
            Some(_) => {}
            None => {
                if self.num_http_workers == 0 || self.num_ipc_workers == 0 {
                    return Err(anyhow::anyhow!(
                        "num_http_workers and num_ipc_workers must be positive"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Size of the shared tokio pool serving HTTP and IPC connections.
    pub fn io_worker_threads(&self) -> usize {
        self.num_io_workers
            .unwrap_or(self.num_http_workers + self.num_ipc_workers)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.address.parse()?, self.http_port))
    }

    pub fn grpc_addr(&self) -> Result<Option<SocketAddr>> {
        match self.grpc_port {
            Some(port) => Ok(Some(SocketAddr::new(self.address.parse()?, port))),
            None => Ok(None),
        }
    }

    pub fn gateway_socket_path(&self) -> PathBuf {
        PathBuf::from(&self.ipc_root).join(GATEWAY_SOCKET_NAME)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "http_port: 9000\nfunc_config_file: /etc/faasgate/funcs.json\nmax_running_external_requests: 2"
        )
        .unwrap();
        let config = ServerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.max_running_external_requests, 2);
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.io_worker_threads(), 4);
    }

    #[test]
    fn func_config_file_is_required() {
        let config = ServerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_io_pool_overrides_split_counts() {
        let config = ServerConfig {
            func_config_file: "funcs.json".to_string(),
            num_io_workers: Some(8),
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.io_worker_threads(), 8);
    }
}
