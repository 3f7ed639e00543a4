//! Command-line and environment configuration of `aetherd`.
//!
//! Every flag can also be given through the environment variable named in
//! its help text. Directory flags left unset fall back to locations under
//! the user's data and config directories.

use std::net::SocketAddr;
use std::path::PathBuf;

use aether_compute::{HostConfig, SitePrefix};
use clap::{Parser, Subcommand};

/// Single-host VM orchestrator driven over AMQP.
#[derive(Parser, Debug)]
#[command(name = "aetherd", version, about, long_about = None)]
pub struct Settings {
    /// AMQP broker to consume commands from
    #[arg(long, env = "AETHER_AMQP_URL", default_value = "amqp://localhost:5672/%2f")]
    pub amqp_url: String,

    /// Directory holding `<name>.qcow2` base images
    #[arg(long, env = "AETHER_BASE_IMAGE_DIR")]
    pub base_image_dir: Option<PathBuf>,

    /// Directory for per-VM copy-on-write images
    #[arg(long, env = "AETHER_USER_IMAGE_DIR")]
    pub user_image_dir: Option<PathBuf>,

    /// Directory holding one tinc configuration per VPN
    #[arg(long, env = "AETHER_VPN_CONFIG_DIR")]
    pub vpn_config_dir: Option<PathBuf>,

    /// Directory for control, switch and mount sockets
    #[arg(long, env = "AETHER_SOCKET_DIR", default_value = "/tmp")]
    pub socket_dir: PathBuf,

    /// systemd user unit directory
    #[arg(long, env = "AETHER_UNIT_DIR")]
    pub unit_dir: Option<PathBuf>,

    /// Number of VPN interfaces this instance may hand out
    #[arg(long, env = "AETHER_VPN_POOL_SIZE", default_value_t = 2)]
    pub vpn_pool_size: usize,

    /// tinc port of the first VPN; later ones count up from here
    #[arg(long, env = "AETHER_VPN_BASE_PORT", default_value_t = 20000)]
    pub vpn_base_port: u16,

    /// tinc node name of this host
    #[arg(long, env = "AETHER_NODE_NAME", default_value = "localhost")]
    pub node_name: String,

    /// Run network changes through sudo
    #[arg(long, env = "AETHER_SUDO")]
    pub sudo: bool,

    /// /48 site prefix (e.g. `2001:db8:0`) to advertise one /64 per VPN from
    #[arg(long, env = "AETHER_IPV6_PREFIX")]
    pub ipv6_prefix: Option<SitePrefix>,

    /// User radvd drops privileges to
    #[arg(long, env = "AETHER_RADVD_USER", default_value = "nobody")]
    pub radvd_user: String,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Consume commands from the message bus (default)
    Serve,

    /// Serve the REST API instead of the message bus
    Http {
        #[arg(long, env = "AETHER_LISTEN_ADDR", default_value = "127.0.0.1:5000")]
        listen: SocketAddr,
    },

    /// Move a physical interface into a bridge and exit
    SetupNetwork {
        bridge: String,
        phys: String,
        /// Address (with prefix) to move onto the bridge
        #[arg(long)]
        ip: Option<String>,
        /// Default gateway to route through the bridge
        #[arg(long)]
        gateway: Option<String>,
    },
}

impl Settings {
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode.clone().unwrap_or(Mode::Serve)
    }

    /// The host layout these settings describe.
    #[must_use]
    pub fn host_config(&self) -> HostConfig {
        let data = data_dir();
        let mut config = HostConfig::new(
            self.base_image_dir.clone().unwrap_or_else(|| data.join("base_images")),
            self.user_image_dir.clone().unwrap_or_else(|| data.join("user_images")),
            self.vpn_config_dir.clone().unwrap_or_else(|| data.join("vpn")),
            self.socket_dir.clone(),
        );
        config.vpn_base_port = self.vpn_base_port;
        config.node_name.clone_from(&self.node_name);
        config
    }

    #[must_use]
    pub fn unit_dir(&self) -> PathBuf {
        self.unit_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join("systemd")
                .join("user")
        })
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("aether")
}
