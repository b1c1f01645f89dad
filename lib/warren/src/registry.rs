use crate::conf::{Conf, NodeConf};
use crate::error::CoreError;
use crate::node::Node;
use hashbrown::HashMap;
use sett::crypto;
use sett::keys::Identity;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

const SUBNET_A_MASK: u32 = 0xff00_0000;
const SUBNET_B_MASK: u32 = 0xffff_0000;
const SUBNET_C_MASK: u32 = 0xffff_ff00;

/// The node registry: a packed array built once at startup plus four
/// read-only secondary indexes. Lookups hand out shared borrows; endpoint
/// mutation goes through `record_observation`, whose only caller in steady
/// state is the node worker.
pub struct Registry {
    nodes: Box<[Node]>,
    local_idx: usize,
    uuid_idx: HashMap<u64, usize>,
    ipv4_idx: HashMap<u32, usize>,
    subnet_a_idx: HashMap<u32, usize>,
    subnet_b_idx: HashMap<u32, usize>,
    subnet_c_idx: HashMap<u32, usize>,
}

impl Registry {
    /// Materializes every configured node and builds the indexes. One-shot;
    /// nothing is inserted after startup.
    pub fn build(conf: &Conf, identity: &Identity) -> Result<Registry, CoreError> {
        let mut nodes = Vec::with_capacity(conf.nodes.len());
        let mut uuid_idx = HashMap::new();
        let mut ipv4_idx = HashMap::new();
        let mut subnet_a_idx = HashMap::new();
        let mut subnet_b_idx = HashMap::new();
        let mut subnet_c_idx = HashMap::new();

        for node_conf in &conf.nodes {
            let idx = nodes.len();
            let node = Self::materialize(node_conf, conf.local_uuid, identity)?;

            if uuid_idx.insert(node.uuid, idx).is_some() {
                return Err(CoreError::Config(format!("duplicate node uuid {}", node.uuid)));
            }

            ipv4_idx.insert(u32::from(node.tun_addr4), idx);

            for subnet in &node_conf.subnets {
                let (key, prefix) = parse_subnet(subnet)
                    .ok_or_else(|| CoreError::Config(format!("bad subnet '{}' on node {}", subnet, node.uuid)))?;

                let index = match prefix {
                    8 => &mut subnet_a_idx,
                    16 => &mut subnet_b_idx,
                    _ => &mut subnet_c_idx,
                };

                index.insert(key, idx);
            }

            for endpoint in &node_conf.endpoints {
                let addr: SocketAddr = endpoint.parse().map_err(|_| {
                    CoreError::Config(format!("bad endpoint '{}' on node {}", endpoint, node.uuid))
                })?;
                node.record_endpoint(addr, 0);
            }

            nodes.push(node);
        }

        let local_idx = *uuid_idx
            .get(&conf.local_uuid)
            .ok_or_else(|| CoreError::Config(format!("local node {} missing from node table", conf.local_uuid)))?;

        Ok(Registry {
            nodes: nodes.into_boxed_slice(),
            local_idx,
            uuid_idx,
            ipv4_idx,
            subnet_a_idx,
            subnet_b_idx,
            subnet_c_idx,
        })
    }

    fn materialize(node_conf: &NodeConf, local_uuid: u64, identity: &Identity) -> Result<Node, CoreError> {
        let mut public_key = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
        sett::encoding::base64::decode_exact(&node_conf.public_key, &mut public_key)
            .map_err(|detail| CoreError::Config(format!("node {} public key: {}", node_conf.uuid, detail)))?;

        let tun_addr4: Ipv4Addr = node_conf
            .tun_addr4
            .parse()
            .map_err(|_| CoreError::Config(format!("node {} bad tun_addr4 '{}'", node_conf.uuid, node_conf.tun_addr4)))?;

        let tun_addr6: Ipv6Addr = node_conf
            .tun_addr6
            .parse()
            .map_err(|_| CoreError::Config(format!("node {} bad tun_addr6 '{}'", node_conf.uuid, node_conf.tun_addr6)))?;

        // The local record never exchanges with itself; peers get the X25519
        // shared secret precomputed so rekeying is a pure hash walk.
        let shared_secret = match node_conf.uuid == local_uuid {
            true => [0u8; crypto::EXCHANGE_KEY_SIZE],
            false => {
                let exchange_public = crypto::public_to_exchange(&public_key).ok_or_else(|| {
                    CoreError::Config(format!("node {} public key has no exchange form", node_conf.uuid))
                })?;

                crypto::shared_secret(identity.exchange_secret(), &exchange_public).ok_or_else(|| {
                    CoreError::Config(format!("node {} public key is a weak exchange point", node_conf.uuid))
                })?
            }
        };

        Ok(Node::new(
            node_conf.uuid,
            public_key,
            tun_addr4,
            tun_addr6,
            node_conf.relays.clone(),
            shared_secret,
        ))
    }

    #[inline]
    pub fn local(&self) -> &Node {
        &self.nodes[self.local_idx]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn by_uuid(&self, uuid: u64) -> Option<&Node> {
        self.uuid_idx.get(&uuid).map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn by_tun_ipv4(&self, addr: Ipv4Addr) -> Option<&Node> {
        self.ipv4_idx.get(&u32::from(addr)).map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn by_subnet_a(&self, addr: Ipv4Addr) -> Option<&Node> {
        self.subnet_a_idx
            .get(&(u32::from(addr) & SUBNET_A_MASK))
            .map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn by_subnet_b(&self, addr: Ipv4Addr) -> Option<&Node> {
        self.subnet_b_idx
            .get(&(u32::from(addr) & SUBNET_B_MASK))
            .map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn by_subnet_c(&self, addr: Ipv4Addr) -> Option<&Node> {
        self.subnet_c_idx
            .get(&(u32::from(addr) & SUBNET_C_MASK))
            .map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Applies an endpoint observation. The node worker is the only caller in
    /// steady state.
    pub fn record_observation(&self, uuid: u64, addr: SocketAddr, now_sec: u64) {
        if let Some(node) = self.by_uuid(uuid) {
            node.record_endpoint(addr, now_sec);
        }
    }
}

fn parse_subnet(subnet: &str) -> Option<(u32, u8)> {
    let mut parts = subnet.splitn(2, '/');
    let addr: Ipv4Addr = parts.next()?.parse().ok()?;
    let prefix: u8 = parts.next()?.parse().ok()?;

    let mask = match prefix {
        8 => SUBNET_A_MASK,
        16 => SUBNET_B_MASK,
        24 => SUBNET_C_MASK,
        _ => return None,
    };

    Some((u32::from(addr) & mask, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::NodeConf;
    use sett::encoding::base64;

    fn node_conf(uuid: u64, addr4: &str) -> NodeConf {
        let identity = Identity::generate().unwrap();
        NodeConf {
            uuid,
            tun_addr4: addr4.to_string(),
            public_key: base64::encode(identity.public()),
            ..NodeConf::default()
        }
    }

    fn conf_with(nodes: Vec<NodeConf>, local: u64) -> Conf {
        let mut conf = Conf::default();
        conf.local_uuid = local;
        conf.nodes = nodes;
        conf
    }

    #[test]
    fn test_build_and_lookups() {
        let mut peer = node_conf(200, "10.1.0.2");
        peer.endpoints.push("192.0.2.7:9001".to_string());
        peer.subnets.push("10.9.0.0/24".to_string());

        let conf = conf_with(vec![node_conf(100, "10.1.0.1"), peer], 100);
        let identity = Identity::generate().unwrap();
        let registry = Registry::build(&conf, &identity).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.local().uuid, 100);
        assert_eq!(registry.by_uuid(200).unwrap().uuid, 200);
        assert_eq!(registry.by_tun_ipv4("10.1.0.2".parse().unwrap()).unwrap().uuid, 200);
        assert_eq!(registry.by_subnet_c("10.9.0.77".parse().unwrap()).unwrap().uuid, 200);
        assert!(registry.by_subnet_c("10.8.0.77".parse().unwrap()).is_none());
        assert!(registry.by_uuid(300).is_none());

        // Configured endpoints are usable immediately.
        assert!(registry.by_uuid(200).unwrap().pick_endpoint(0, 30).is_some());
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let conf = conf_with(vec![node_conf(100, "10.1.0.1"), node_conf(100, "10.1.0.2")], 100);
        let identity = Identity::generate().unwrap();

        assert!(Registry::build(&conf, &identity).is_err());
    }

    #[test]
    fn test_missing_local_rejected() {
        let conf = conf_with(vec![node_conf(200, "10.1.0.2")], 100);
        let identity = Identity::generate().unwrap();

        assert!(Registry::build(&conf, &identity).is_err());
    }

    #[test]
    fn test_bad_subnet_rejected() {
        let mut peer = node_conf(200, "10.1.0.2");
        peer.subnets.push("10.9.0.0/23".to_string());

        let conf = conf_with(vec![node_conf(100, "10.1.0.1"), peer], 100);
        let identity = Identity::generate().unwrap();

        assert!(Registry::build(&conf, &identity).is_err());
    }

    #[test]
    fn test_shared_secret_symmetry() {
        let identity_a = Identity::generate().unwrap();
        let identity_b = Identity::generate().unwrap();

        let mut node_a = node_conf(100, "10.1.0.1");
        node_a.public_key = base64::encode(identity_a.public());
        let mut node_b = node_conf(200, "10.1.0.2");
        node_b.public_key = base64::encode(identity_b.public());

        let conf_a = conf_with(vec![node_a.clone(), node_b.clone()], 100);
        let conf_b = conf_with(vec![node_a, node_b], 200);

        let registry_a = Registry::build(&conf_a, &identity_a).unwrap();
        let registry_b = Registry::build(&conf_b, &identity_b).unwrap();

        assert_eq!(
            registry_a.by_uuid(200).unwrap().shared_secret(),
            registry_b.by_uuid(100).unwrap().shared_secret()
        );
    }
}
