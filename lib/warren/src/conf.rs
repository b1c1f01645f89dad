use crate::error::CoreError;
use sett::logging::LogConf;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MTU: usize = 1280;
pub const DEFAULT_PAYLOAD_BLOCK_SIZE: usize = 8192;
pub const DEFAULT_UDP4_PORT: u16 = 9001;
pub const DEFAULT_SEED_WINDOW_SEC: u64 = 3600;
pub const DEFAULT_LIVENESS_WINDOW_SEC: u64 = 30;

/// One peer record as configured. Addresses and endpoints stay in text form
/// here; the registry parses them at startup.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConf {
    pub uuid: u64,
    pub tun_addr4: String,
    pub tun_addr6: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Static endpoints, `ip:port`.
    pub endpoints: Vec<String>,
    /// Subnets this node forwards for, `a.b.c.d/8|16|24`.
    pub subnets: Vec<String>,
    /// Preferred relay uuids, in order, for reaching this node.
    pub relays: Vec<u64>,
}

impl Default for NodeConf {
    fn default() -> NodeConf {
        NodeConf {
            uuid: 0,
            tun_addr4: String::new(),
            tun_addr6: "::".to_string(),
            public_key: String::new(),
            endpoints: Vec::new(),
            subnets: Vec::new(),
            relays: Vec::new(),
        }
    }
}

/// Engine configuration. Field names are the recognized option names.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub ifname: String,
    pub if_drv: String,
    pub if_dump: bool,
    pub mtu: usize,
    pub lite_mode: bool,
    pub public_index_service: bool,
    pub safe_index: bool,
    pub daemon: bool,
    pub quiet: bool,

    pub local_uuid: u64,

    pub pf_worker_num: usize,
    pub payload_block_size: usize,

    pub crypto_seed_window_sec: u64,
    pub liveness_window_sec: u64,

    pub zip_enable: bool,
    pub zip_level: u32,

    pub activate_tun: bool,
    pub activate_node_worker: bool,
    pub activate_index_worker: bool,
    pub activate_index_service_worker: bool,
    pub activate_detect_worker: bool,

    pub console_log_level: u8,
    pub file_log_level: u8,
    pub udp_log_level: u8,
    pub core_log_level: u8,
    pub pf_log_level: u8,
    pub main_log_level: u8,
    pub node_log_level: u8,
    pub index_log_level: u8,
    pub index_service_log_level: u8,
    pub detect_log_level: u8,

    pub log_path: String,
    pub log_udp_sockaddress4: String,
    pub log_udp_type: u8,

    pub conf_dir: String,
    pub binary_dir: String,
    pub map_file: String,

    pub udp4_ports: Vec<u16>,
    pub udp6_ports: Vec<u16>,
    pub udp4_socket_num: usize,
    pub udp6_socket_num: usize,

    pub nodes: Vec<NodeConf>,
}

impl Default for Conf {
    fn default() -> Conf {
        Conf {
            ifname: "warren0".to_string(),
            if_drv: "mem".to_string(),
            if_dump: false,
            mtu: DEFAULT_MTU,
            lite_mode: false,
            public_index_service: false,
            safe_index: false,
            daemon: false,
            quiet: false,
            local_uuid: 0,
            pf_worker_num: 0,
            payload_block_size: DEFAULT_PAYLOAD_BLOCK_SIZE,
            crypto_seed_window_sec: DEFAULT_SEED_WINDOW_SEC,
            liveness_window_sec: DEFAULT_LIVENESS_WINDOW_SEC,
            zip_enable: false,
            zip_level: 6,
            activate_tun: true,
            activate_node_worker: true,
            activate_index_worker: false,
            activate_index_service_worker: false,
            activate_detect_worker: false,
            console_log_level: 1,
            file_log_level: 1,
            udp_log_level: 1,
            core_log_level: 1,
            pf_log_level: 1,
            main_log_level: 1,
            node_log_level: 1,
            index_log_level: 1,
            index_service_log_level: 1,
            detect_log_level: 1,
            log_path: String::new(),
            log_udp_sockaddress4: String::new(),
            log_udp_type: 0,
            conf_dir: ".".to_string(),
            binary_dir: ".".to_string(),
            map_file: String::new(),
            udp4_ports: vec![DEFAULT_UDP4_PORT],
            udp6_ports: Vec::new(),
            udp4_socket_num: 1,
            udp6_socket_num: 0,
            nodes: Vec::new(),
        }
    }
}

impl Conf {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Conf, CoreError> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| CoreError::Config(format!("{}: {}", path.as_ref().display(), err)))
    }

    /// Raises every component threshold to debug; the CLI `--verbose` flag.
    pub fn apply_verbose(&mut self) {
        self.set_all_levels(2);
    }

    /// Raises every component threshold to trace; the CLI `--trace` flag.
    pub fn apply_trace(&mut self) {
        self.set_all_levels(3);
    }

    fn set_all_levels(&mut self, level: u8) {
        self.console_log_level = level;
        self.core_log_level = level;
        self.pf_log_level = level;
        self.main_log_level = level;
        self.node_log_level = level;
        self.index_log_level = level;
        self.index_service_log_level = level;
        self.detect_log_level = level;
    }

    /// Sink-level settings for the logging bootstrap.
    pub fn log_conf(&self) -> LogConf {
        LogConf {
            console_level: self.console_log_level,
            file_level: self.file_log_level,
            path: match self.log_path.is_empty() {
                true => None,
                false => Some(PathBuf::from(&self.log_path)),
            },
            quiet: self.daemon || self.quiet,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.mtu < 576 || self.mtu > 9000 {
            return Err(CoreError::Config(format!("mtu {} out of range", self.mtu)));
        }

        if self.payload_block_size < self.mtu + 512 {
            return Err(CoreError::Config(format!(
                "payload_block_size {} too small for mtu {}",
                self.payload_block_size, self.mtu
            )));
        }

        if self.udp4_socket_num > self.udp4_ports.len() {
            return Err(CoreError::Config(format!(
                "udp4_socket_num {} exceeds configured ports ({})",
                self.udp4_socket_num,
                self.udp4_ports.len()
            )));
        }

        if self.udp6_socket_num > self.udp6_ports.len() {
            return Err(CoreError::Config(format!(
                "udp6_socket_num {} exceeds configured ports ({})",
                self.udp6_socket_num,
                self.udp6_ports.len()
            )));
        }

        if self.udp4_socket_num + self.udp6_socket_num == 0 {
            return Err(CoreError::Config("no UDP sockets configured".to_string()));
        }

        if !self.public_index_service && !self.nodes.iter().any(|n| n.uuid == self.local_uuid) {
            return Err(CoreError::Config(format!(
                "local node {} missing from node table",
                self.local_uuid
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Conf {
        let mut conf = Conf::default();
        conf.local_uuid = 100;
        conf.nodes.push(NodeConf {
            uuid: 100,
            tun_addr4: "10.1.0.1".to_string(),
            public_key: sett::encoding::base64::encode(&[1u8; 32]),
            ..NodeConf::default()
        });
        conf
    }

    #[test]
    fn test_minimal_conf_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_missing_local_node() {
        let mut conf = minimal();
        conf.local_uuid = 999;

        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_mtu_bounds() {
        let mut conf = minimal();
        conf.mtu = 100;
        assert!(conf.validate().is_err());

        conf.mtu = 64 * 1024;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_block_size_must_cover_mtu() {
        let mut conf = minimal();
        conf.payload_block_size = conf.mtu;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_socket_count_vs_ports() {
        let mut conf = minimal();
        conf.udp4_socket_num = 2;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_trace_raises_levels() {
        let mut conf = minimal();
        conf.apply_trace();

        assert_eq!(conf.console_log_level, 3);
        assert_eq!(conf.pf_log_level, 3);
        assert_eq!(conf.node_log_level, 3);
    }
}
