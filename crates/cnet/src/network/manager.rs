//! The network manager: the serialized façade over networks, endpoints, and
//! external interfaces, with persistence and reboot detection.
//!
//! Every public operation takes the manager-wide mutex for its whole
//! duration, mutates kernel state through the mode-appropriate client, and
//! persists the full state document before returning. An operation either
//! completes and persists, or rolls back; no partial state is ever written.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::bridge_client::LinuxBridgeClient;
use super::clients::infravnet::InfraVnetClient;
use super::clients::snat::{SnatClient, delete_snat_bridge};
use super::clients::{
    DataPlane, EndpointClient, LinuxBridgeEndpointClient, OvsEndpointClient,
    TransparentEndpointClient, TransparentVlanEndpointClient,
};
use super::endpoint;
use super::error::{Error, Result};
use super::model::{
    Endpoint, ExternalInterface, Network, STATE_VERSION, STORE_KEY, State,
};
use super::ovs_network_client::OvsNetworkClient;
use super::store::{DEFAULT_LOCK_TIMEOUT, FileStore};
use super::types::{
    EndpointInfo, IpNet, NetworkInfo, NetworkMode, RouteInfo,
};
use crate::netlink::Connection;
use crate::platform::{self, Exec};

/// Bridge created when the caller does not name one.
const DEFAULT_BRIDGE_NAME: &str = "cnetbr0";

/// APIPA address given to the SNAT bridge when the network does not carry one.
const DEFAULT_SNAT_BRIDGE_IP: &str = "169.254.0.1/16";

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the persistent store; `None` disables persistence.
    pub store_path: Option<PathBuf>,
    /// Whether persisted state should be rehydrated (and reboot-checked).
    pub rehydration_required: bool,
    /// Bound on store lock acquisition.
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            rehydration_required: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

struct Inner {
    dp: DataPlane,
    state: State,
    store: Option<FileStore>,
    lock_timeout: Duration,
    /// Host boot time; persisted state older than this predates a reboot.
    boot_time: SystemTime,
}

/// The façade external collaborators drive.
pub struct NetworkManager {
    inner: Mutex<Inner>,
}

impl NetworkManager {
    /// Create a manager with a live data plane in the current namespace.
    pub fn new() -> Result<Self> {
        let conn = Arc::new(Connection::new()?);
        let boot_time = platform::last_reboot_time()?;
        Ok(Self::with_dataplane(DataPlane::new(conn, Exec::real()), boot_time))
    }

    /// Create a manager over an explicit data plane. Tests inject a recording
    /// executor and a fake boot time here.
    pub fn with_dataplane(dp: DataPlane, boot_time: SystemTime) -> Self {
        Self {
            inner: Mutex::new(Inner {
                dp,
                state: State::default(),
                store: None,
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
                boot_time,
            }),
        }
    }

    /// Restore persisted state, tearing down and resetting if the host
    /// rebooted since the last save.
    pub async fn initialize(&self, config: &Config) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.lock_timeout = config.lock_timeout;

        let Some(path) = &config.store_path else {
            return Ok(());
        };
        let store = FileStore::open(path)?;

        // The read happens under the store lock; the lock is released before
        // any save so the save's own acquisition cannot deadlock against it.
        let (state, rebooted) = {
            let _guard = store.lock(config.lock_timeout).await?;
            let mut state = if store.exists() {
                match store.read::<State>(STORE_KEY) {
                    Ok(state) => state,
                    Err(Error::StoreKeyNotFound(_)) => State::default(),
                    Err(e) => return Err(e),
                }
            } else {
                State::default()
            };
            state.relink();

            let rebooted = config.rehydration_required
                && store.exists()
                && store.modification_time()? < inner.boot_time;
            (state, rebooted)
        };

        inner.state = state;
        inner.store = Some(store);

        if rebooted {
            info!("store predates last boot, rebuilding from scratch");
            platform::clear_network_configuration();
            self.teardown_all(&mut inner).await;
            inner.state.external_interfaces.clear();
            Self::save(&mut inner).await?;
        }

        info!(
            interfaces = inner.state.external_interfaces.len(),
            "network manager initialized"
        );
        Ok(())
    }

    /// Drop all in-memory state. The store file is left as-is.
    pub async fn uninitialize(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = State::default();
        inner.store = None;
    }

    /// Kernel state died with the reboot; run every network's teardown path
    /// so lingering host config (bridges, rules) goes with it.
    async fn teardown_all(&self, inner: &mut Inner) {
        let ext_ifs: Vec<ExternalInterface> =
            inner.state.external_interfaces.values().cloned().collect();
        for ext_if in ext_ifs {
            for network in ext_if.networks.values() {
                if let Err(e) = Self::disconnect_network(&inner.dp, &ext_if, network).await {
                    warn!(network = %network.id, error = %e, "teardown after reboot failed");
                }
            }
        }
    }

    // ========================================================================
    // External interfaces
    // ========================================================================

    /// Register a host NIC as an external interface, or add a subnet to an
    /// existing one.
    pub async fn add_external_interface(&self, if_name: &str, subnet: Option<IpNet>) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(ext_if) = inner.state.external_interfaces.get_mut(if_name) {
            if let Some(subnet) = subnet {
                if !ext_if.subnets.contains(&subnet) {
                    ext_if.subnets.push(subnet);
                }
            }
            return Self::save(&mut inner).await;
        }

        let link = inner
            .dp
            .conn
            .get_link_by_name(if_name)
            .await
            .map_err(Error::Netlink)?;
        let mac = link.mac.unwrap_or_default();
        let addresses = inner
            .dp
            .conn
            .get_addresses(Some(if_name))
            .await
            .map(|addrs| {
                addrs
                    .into_iter()
                    .filter_map(|a| a.address.map(|ip| IpNet::new(ip, a.prefix_len)))
                    .collect()
            })
            .unwrap_or_default();

        let ext_if = ExternalInterface {
            name: if_name.to_string(),
            mac_address: super::types::MacAddr(mac),
            ip_addresses: addresses,
            subnets: subnet.into_iter().collect(),
            ..Default::default()
        };
        inner
            .state
            .external_interfaces
            .insert(if_name.to_string(), ext_if);
        info!(interface = if_name, "external interface added");
        Self::save(&mut inner).await
    }

    // ========================================================================
    // Networks
    // ========================================================================

    /// Create a network on the external interface that owns its subnets.
    pub async fn create_network(&self, info: &NetworkInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state.interface_of(&info.id).is_some() {
            return Err(Error::NetworkExists(info.id.clone()));
        }

        let ext_if_name = Self::resolve_external_interface(&inner.state, info)?;

        // Program the shared (per-network) kernel state first; on any
        // failure the partial connect is undone before the error surfaces.
        let ext_if = inner.state.external_interfaces[&ext_if_name].clone();
        let bridge_name = self.connect_external_interface(&inner.dp, &ext_if, info).await?;

        let mut network = Network::from_info(info, &ext_if_name);
        let ext_if = inner
            .state
            .external_interfaces
            .get_mut(&ext_if_name)
            .expect("resolved above under the same lock");
        if !bridge_name.is_empty() {
            ext_if.bridge_name = bridge_name;
        }
        network.ext_if_name = ext_if_name.clone();
        ext_if.networks.insert(info.id.clone(), network);

        info!(network = %info.id, mode = ?info.mode, "network created");
        Self::save(&mut inner).await
    }

    /// Delete a network once its endpoint map is empty.
    pub async fn delete_network(&self, network_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let ext_if_name = inner
            .state
            .interface_of(network_id)
            .ok_or_else(|| Error::NetworkNotFound(network_id.to_string()))?
            .to_string();

        let ext_if = inner.state.external_interfaces[&ext_if_name].clone();
        let network = ext_if.networks[network_id].clone();
        if !network.endpoints.is_empty() {
            return Err(Error::EndpointInUse(format!(
                "network {network_id} still has {} endpoint(s)",
                network.endpoints.len()
            )));
        }

        let last_bridge_user = ext_if
            .networks
            .values()
            .filter(|n| n.id != network.id)
            .all(|n| !uses_bridge(n.mode));
        if uses_bridge(network.mode) && last_bridge_user {
            Self::disconnect_network(&inner.dp, &ext_if, &network).await?;
        }

        if network.enable_snat_on_host {
            let bridge_ip = network
                .snat_bridge_ip
                .unwrap_or_else(default_snat_bridge_ip);
            if let Err(e) = delete_snat_bridge(&inner.dp, bridge_ip).await {
                warn!(error = %e, "snat bridge teardown failed");
            }
        }

        let ext_if = inner
            .state
            .external_interfaces
            .get_mut(&ext_if_name)
            .expect("present above under the same lock");
        ext_if.networks.remove(network_id);
        if uses_bridge(network.mode) && last_bridge_user {
            ext_if.bridge_name.clear();
        }

        // The external interface record outlives its networks; it is removed
        // only when its last network goes.
        if ext_if.networks.is_empty() {
            inner.state.external_interfaces.remove(&ext_if_name);
        }

        info!(network = network_id, "network deleted");
        Self::save(&mut inner).await
    }

    /// Describe a network.
    pub async fn get_network_info(&self, network_id: &str) -> Result<NetworkInfo> {
        let inner = self.inner.lock().await;
        let (ext_if, network) = Self::find_network(&inner.state, network_id)?;
        Ok(NetworkInfo {
            id: network.id.clone(),
            mode: network.mode,
            vlan_id: network.vlan_id,
            subnets: network.subnets.clone(),
            dns: network.dns.clone(),
            bridge_name: ext_if.bridge_name.clone(),
            enable_snat_on_host: network.enable_snat_on_host,
            netns: network.net_ns.clone(),
            snat_bridge_ip: network.snat_bridge_ip,
            master_if_name: ext_if.name.clone(),
            ..Default::default()
        })
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    /// Create an endpoint on a network, walking the seven-step lifecycle.
    pub async fn create_endpoint(&self, network_id: &str, info: &EndpointInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let (ext_if, network) = Self::find_network(&inner.state, network_id)?;
        if network.endpoints.contains_key(&info.id) {
            return Err(Error::EndpointExists(info.id.clone()));
        }

        let mut client = Self::make_endpoint_client(&inner.dp, ext_if, network, info);
        let vlan_id = network.vlan_id;
        let record = endpoint::create_endpoint(&mut client, info, vlan_id).await?;

        let ext_if_name = ext_if.name.clone();
        inner
            .state
            .external_interfaces
            .get_mut(&ext_if_name)
            .and_then(|e| e.networks.get_mut(network_id))
            .expect("found above under the same lock")
            .endpoints
            .insert(info.id.clone(), record);

        Self::save(&mut inner).await
    }

    /// Delete an endpoint and its data-plane state.
    pub async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let (ext_if, network) = Self::find_network(&inner.state, network_id)?;
        let record = network
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))?
            .clone();

        let info = record.to_info();
        let mut client = Self::make_endpoint_client(&inner.dp, ext_if, network, &info);
        endpoint::delete_endpoint(&mut client, &record).await?;

        let ext_if_name = ext_if.name.clone();
        inner
            .state
            .external_interfaces
            .get_mut(&ext_if_name)
            .and_then(|e| e.networks.get_mut(network_id))
            .expect("found above under the same lock")
            .endpoints
            .remove(endpoint_id);

        Self::save(&mut inner).await
    }

    /// Describe one endpoint.
    pub async fn get_endpoint_info(
        &self,
        network_id: &str,
        endpoint_id: &str,
    ) -> Result<EndpointInfo> {
        let inner = self.inner.lock().await;
        let (_, network) = Self::find_network(&inner.state, network_id)?;
        network
            .endpoints
            .get(endpoint_id)
            .map(Endpoint::to_info)
            .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))
    }

    /// Describe every endpoint of a network.
    pub async fn get_all_endpoints(
        &self,
        network_id: &str,
    ) -> Result<BTreeMap<String, EndpointInfo>> {
        let inner = self.inner.lock().await;
        let (_, network) = Self::find_network(&inner.state, network_id)?;
        Ok(network
            .endpoints
            .iter()
            .map(|(id, ep)| (id.clone(), ep.to_info()))
            .collect())
    }

    /// Find the endpoint serving a pod, by name and namespace.
    pub async fn get_endpoint_info_based_on_pod_details(
        &self,
        network_id: &str,
        pod_name: &str,
        pod_namespace: &str,
    ) -> Result<EndpointInfo> {
        let inner = self.inner.lock().await;
        let (_, network) = Self::find_network(&inner.state, network_id)?;

        let mut matches = network
            .endpoints
            .values()
            .filter(|ep| ep.pod_name == pod_name && ep.pod_namespace == pod_namespace);

        let first = matches
            .next()
            .ok_or_else(|| Error::EndpointNotFound(pod_name.to_string()))?;
        if matches.next().is_some() {
            return Err(Error::MultipleEndpointsFound {
                pod: pod_name.to_string(),
                namespace: pod_namespace.to_string(),
            });
        }
        Ok(first.to_info())
    }

    /// Bind an endpoint to a sandbox.
    pub async fn attach_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        sandbox_key: &str,
    ) -> Result<EndpointInfo> {
        let mut inner = self.inner.lock().await;
        let ep = Self::find_endpoint_mut(&mut inner.state, network_id, endpoint_id)?;
        if ep.is_attached() {
            return Err(Error::EndpointInUse(endpoint_id.to_string()));
        }
        ep.sandbox_key = sandbox_key.to_string();
        let info = ep.to_info();
        Self::save(&mut inner).await?;
        Ok(info)
    }

    /// Release an endpoint from its sandbox.
    pub async fn detach_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ep = Self::find_endpoint_mut(&mut inner.state, network_id, endpoint_id)?;
        if !ep.is_attached() {
            return Err(Error::EndpointNotInUse(endpoint_id.to_string()));
        }
        ep.sandbox_key.clear();
        Self::save(&mut inner).await
    }

    /// Replace an endpoint's container-side routes.
    pub async fn update_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        routes: Vec<RouteInfo>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let (old_routes, netns_path, if_name) = {
            let ep = Self::find_endpoint_mut(&mut inner.state, network_id, endpoint_id)?;
            (ep.routes.clone(), ep.netns_path.clone(), ep.if_name.clone())
        };

        let conn = Connection::in_namespace_path(&netns_path).map_err(Error::Netlink)?;
        for stale in old_routes.iter().filter(|r| !routes.contains(r)) {
            if let Ok(route) = Self::lower_route(&conn, &if_name, stale).await {
                if let Err(e) = conn.delete_route(&route).await {
                    if !e.is_not_found() {
                        return Err(Error::Netlink(e));
                    }
                }
            }
        }
        let fresh: Vec<RouteInfo> = routes
            .iter()
            .filter(|r| !old_routes.contains(r))
            .cloned()
            .collect();
        super::clients::install_container_routes(&conn, &if_name, &fresh).await?;

        let ep = Self::find_endpoint_mut(&mut inner.state, network_id, endpoint_id)?;
        ep.routes = routes;
        ep.gateways = ep.routes.iter().filter_map(|r| r.gateway).collect();
        Self::save(&mut inner).await
    }

    /// Total endpoints across every network.
    pub async fn number_of_endpoints(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .state
            .external_interfaces
            .values()
            .flat_map(|e| e.networks.values())
            .map(|n| n.endpoints.len())
            .sum()
    }

    /// Convergence pass: re-issue each persisted network's L2 programming so
    /// kernel state matches the persisted model.
    pub async fn setup_network_using_state(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        for ext_if in inner.state.external_interfaces.values() {
            for network in ext_if.networks.values() {
                if !uses_bridge(network.mode) {
                    continue;
                }
                if network.vlan_id != 0 {
                    let client = OvsNetworkClient::new(
                        inner.dp.clone(),
                        &ext_if.bridge_name,
                        &ext_if.name,
                    );
                    client.add_l2_rules(ext_if).await?;
                } else {
                    let client = LinuxBridgeClient::new(
                        inner.dp.clone(),
                        &ext_if.bridge_name,
                        &ext_if.name,
                        network.mode,
                        false,
                        None,
                        false,
                    );
                    client.add_l2_rules(ext_if).await?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Pick the external interface for a new network: by explicit master
    /// name, else by subnet ownership.
    fn resolve_external_interface(state: &State, info: &NetworkInfo) -> Result<String> {
        if !info.master_if_name.is_empty() {
            return state
                .external_interfaces
                .contains_key(&info.master_if_name)
                .then(|| info.master_if_name.clone())
                .ok_or_else(|| Error::ExternalInterfaceNotFound(info.master_if_name.clone()));
        }

        for subnet in &info.subnets {
            for ext_if in state.external_interfaces.values() {
                if ext_if.subnets.contains(&subnet.prefix) {
                    return Ok(ext_if.name.clone());
                }
            }
        }
        Err(Error::SubnetNotFound(
            info.subnets
                .first()
                .map(|s| s.prefix.to_string())
                .unwrap_or_default(),
        ))
    }

    /// Program the per-network kernel state; returns the bridge name when
    /// the mode carries one. Cleans up after itself on failure.
    async fn connect_external_interface(
        &self,
        dp: &DataPlane,
        ext_if: &ExternalInterface,
        info: &NetworkInfo,
    ) -> Result<String> {
        match info.mode {
            NetworkMode::Transparent | NetworkMode::TransparentVlan => {
                // No bridge; routed modes only need forwarding.
                dp.sysctl.enable_ipv4_forwarding().await?;
                Ok(String::new())
            }
            NetworkMode::Bridge | NetworkMode::Tunnel if info.vlan_id != 0 => {
                let bridge_name = pick_bridge_name(ext_if, info);
                if !ext_if.bridge_name.is_empty() {
                    return Ok(ext_if.bridge_name.clone());
                }
                let client = OvsNetworkClient::new(dp.clone(), &bridge_name, &ext_if.name);
                client.create_bridge().await?;
                if let Err(e) = client.add_l2_rules(ext_if).await {
                    client.delete_l2_rules(ext_if).await;
                    client.delete_bridge().await;
                    return Err(e);
                }
                Ok(bridge_name)
            }
            NetworkMode::Bridge | NetworkMode::Tunnel => {
                let bridge_name = pick_bridge_name(ext_if, info);
                if !ext_if.bridge_name.is_empty() {
                    return Ok(ext_if.bridge_name.clone());
                }
                let client = LinuxBridgeClient::new(
                    dp.clone(),
                    &bridge_name,
                    &ext_if.name,
                    info.mode,
                    info.ipv6_mode.enabled(),
                    info.pod_subnet.as_ref().map(|s| s.prefix),
                    info.disable_hairpin_on_host_interface,
                );
                client.create_bridge().await?;
                let connected = async {
                    dp.conn.set_link_master(&ext_if.name, &bridge_name).await?;
                    client.add_l2_rules(ext_if).await
                }
                .await;
                if let Err(e) = connected {
                    client.delete_l2_rules(ext_if).await;
                    client.delete_bridge().await;
                    return Err(e);
                }
                Ok(bridge_name)
            }
        }
    }

    /// Undo a network's shared kernel state.
    async fn disconnect_network(
        dp: &DataPlane,
        ext_if: &ExternalInterface,
        network: &Network,
    ) -> Result<()> {
        if !uses_bridge(network.mode) {
            return Ok(());
        }
        if network.vlan_id != 0 {
            let client = OvsNetworkClient::new(dp.clone(), &ext_if.bridge_name, &ext_if.name);
            client.delete_l2_rules(ext_if).await;
            client.delete_bridge().await;
        } else {
            let client = LinuxBridgeClient::new(
                dp.clone(),
                &ext_if.bridge_name,
                &ext_if.name,
                network.mode,
                false,
                None,
                false,
            );
            client.delete_l2_rules(ext_if).await;
            client.delete_bridge().await;
        }
        Ok(())
    }

    /// Build the endpoint-client variant for a network/endpoint pair.
    fn make_endpoint_client(
        dp: &DataPlane,
        ext_if: &ExternalInterface,
        network: &Network,
        info: &EndpointInfo,
    ) -> EndpointClient {
        let host_mac = ext_if.mac_address.octets();

        let snat = info.wants_snat().then(|| {
            SnatClient::new(
                dp.clone(),
                network.snat_bridge_ip.unwrap_or_else(default_snat_bridge_ip),
                host_mac,
                info.vnet_cidrs.clone(),
                info,
            )
        });

        match network.mode {
            NetworkMode::Transparent => EndpointClient::Transparent(
                TransparentEndpointClient::new(dp.clone(), &ext_if.name, info.ipv6_mode),
            ),
            NetworkMode::TransparentVlan => EndpointClient::TransparentVlan(
                TransparentVlanEndpointClient::new(dp.clone(), &ext_if.name, network.vlan_id),
            ),
            NetworkMode::Bridge | NetworkMode::Tunnel if network.vlan_id != 0 => {
                let infra = info.enable_infra_vnet.then(|| {
                    InfraVnetClient::new(dp.clone(), &ext_if.bridge_name, &ext_if.name, host_mac)
                });
                EndpointClient::Ovs(OvsEndpointClient::new(
                    dp.clone(),
                    &ext_if.bridge_name,
                    &ext_if.name,
                    host_mac,
                    network.vlan_id,
                    snat,
                    infra,
                ))
            }
            NetworkMode::Bridge | NetworkMode::Tunnel => {
                EndpointClient::Bridge(LinuxBridgeEndpointClient::new(
                    dp.clone(),
                    &ext_if.bridge_name,
                    &ext_if.name,
                    network.mode,
                    snat,
                ))
            }
        }
    }

    fn find_network<'a>(
        state: &'a State,
        network_id: &str,
    ) -> Result<(&'a ExternalInterface, &'a Network)> {
        state
            .external_interfaces
            .values()
            .find_map(|e| e.networks.get(network_id).map(|n| (e, n)))
            .ok_or_else(|| Error::NetworkNotFound(network_id.to_string()))
    }

    fn find_endpoint_mut<'a>(
        state: &'a mut State,
        network_id: &str,
        endpoint_id: &str,
    ) -> Result<&'a mut Endpoint> {
        let network = state
            .external_interfaces
            .values_mut()
            .find_map(|e| e.networks.get_mut(network_id))
            .ok_or_else(|| Error::NetworkNotFound(network_id.to_string()))?;
        network
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))
    }

    async fn lower_route(
        conn: &Connection,
        default_if: &str,
        info: &RouteInfo,
    ) -> Result<crate::netlink::Route> {
        use crate::netlink::Route;
        let mut route = match info.dst {
            Some(dst) => Route::unicast(dst.addr, dst.prefix_len),
            None => {
                let gw = info
                    .gateway
                    .ok_or_else(|| Error::MalformedIp("default route without gateway".into()))?;
                Route::default_via(gw)
            }
        };
        if let Some(gw) = info.gateway {
            route = route.gateway(gw);
        }
        route.scope = info.scope;
        route.priority = info.priority;
        route.table = info.table;
        let dev = if info.dev_name.is_empty() {
            default_if
        } else {
            &info.dev_name
        };
        route.link_index = conn.ifindex(dev).await.map_err(Error::Netlink)?;
        Ok(route)
    }

    /// Stamp and persist the whole state document.
    async fn save(inner: &mut Inner) -> Result<()> {
        inner.state.version = STATE_VERSION.to_string();
        inner.state.time_stamp = SystemTime::now();
        if let Some(store) = &inner.store {
            let _guard = store.lock(inner.lock_timeout).await?;
            store.write(STORE_KEY, &inner.state)?;
        }
        Ok(())
    }
}

fn uses_bridge(mode: NetworkMode) -> bool {
    matches!(mode, NetworkMode::Bridge | NetworkMode::Tunnel)
}

fn pick_bridge_name(ext_if: &ExternalInterface, info: &NetworkInfo) -> String {
    if !info.bridge_name.is_empty() {
        info.bridge_name.clone()
    } else if !ext_if.bridge_name.is_empty() {
        ext_if.bridge_name.clone()
    } else {
        DEFAULT_BRIDGE_NAME.to_string()
    }
}

fn default_snat_bridge_ip() -> IpNet {
    DEFAULT_SNAT_BRIDGE_IP
        .parse()
        .expect("well-formed literal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::model::Endpoint;
    use crate::network::types::{MacAddr, SubnetInfo};

    fn test_dataplane() -> (DataPlane, Exec) {
        let exec = Exec::mock();
        let conn = Arc::new(Connection::new().expect("netlink socket"));
        (DataPlane::new(conn, exec.clone()), exec)
    }

    fn transparent_network(id: &str) -> NetworkInfo {
        NetworkInfo {
            id: id.to_string(),
            mode: NetworkMode::Transparent,
            master_if_name: "lo".to_string(),
            subnets: vec![SubnetInfo {
                prefix: "10.0.0.0/24".parse().unwrap(),
                gateway: Some("10.0.0.1".parse().unwrap()),
                primary_ip: None,
            }],
            ..Default::default()
        }
    }

    async fn seeded_manager(dp: DataPlane) -> NetworkManager {
        let manager = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        manager.add_external_interface("lo", Some("10.0.0.0/24".parse().unwrap())).await.unwrap();
        manager.create_network(&transparent_network("nw1")).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_duplicate_network_id_is_rejected() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;

        let err = manager.create_network(&transparent_network("nw1")).await.unwrap_err();
        assert!(matches!(err, Error::NetworkExists(id) if id == "nw1"));
    }

    #[tokio::test]
    async fn test_network_without_matching_subnet_or_master() {
        let (dp, _) = test_dataplane();
        let manager = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        manager.add_external_interface("lo", Some("10.0.0.0/24".parse().unwrap())).await.unwrap();

        let mut info = transparent_network("nw1");
        info.master_if_name = "eth7".to_string();
        let err = manager.create_network(&info).await.unwrap_err();
        assert!(matches!(err, Error::ExternalInterfaceNotFound(_)));

        let mut info = transparent_network("nw1");
        info.master_if_name.clear();
        info.subnets[0].prefix = "192.0.2.0/24".parse().unwrap();
        let err = manager.create_network(&info).await.unwrap_err();
        assert!(matches!(err, Error::SubnetNotFound(_)));
    }

    #[tokio::test]
    async fn test_transparent_network_enables_forwarding() {
        let (dp, exec) = test_dataplane();
        let _manager = seeded_manager(dp).await;
        assert!(exec.saw("sysctl -w net.ipv4.ip_forward=1"));
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;

        assert!(matches!(
            manager.get_network_info("missing").await.unwrap_err(),
            Error::NetworkNotFound(_)
        ));
        assert!(matches!(
            manager.get_endpoint_info("nw1", "missing").await.unwrap_err(),
            Error::EndpointNotFound(_)
        ));
        assert!(matches!(
            manager.delete_network("missing").await.unwrap_err(),
            Error::NetworkNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_network_removes_interface_when_last() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;

        manager.delete_network("nw1").await.unwrap();
        let err = manager.get_network_info("nw1").await.unwrap_err();
        assert!(matches!(err, Error::NetworkNotFound(_)));

        // The external interface went with its last network.
        let inner = manager.inner.lock().await;
        assert!(inner.state.external_interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            store_path: Some(dir.path().join("state.json")),
            rehydration_required: true,
            lock_timeout: Duration::from_secs(1),
        };

        let (dp, _) = test_dataplane();
        let manager = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        manager.initialize(&config).await.unwrap();
        manager.add_external_interface("lo", Some("10.0.0.0/24".parse().unwrap())).await.unwrap();
        manager.create_network(&transparent_network("nw1")).await.unwrap();
        drop(manager);

        // Same store, fresh process; boot predates the save so no rebuild.
        let (dp, _) = test_dataplane();
        let restarted = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        restarted.initialize(&config).await.unwrap();

        let info = restarted.get_network_info("nw1").await.unwrap();
        assert_eq!(info.mode, NetworkMode::Transparent);
        assert_eq!(info.master_if_name, "lo");

        // Back-references were recomputed on load.
        let inner = restarted.inner.lock().await;
        assert_eq!(
            inner.state.external_interfaces["lo"].networks["nw1"].ext_if_name,
            "lo"
        );
    }

    #[tokio::test]
    async fn test_reboot_detection_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            store_path: Some(dir.path().join("state.json")),
            rehydration_required: true,
            lock_timeout: Duration::from_secs(1),
        };

        let (dp, _) = test_dataplane();
        let manager = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        manager.initialize(&config).await.unwrap();
        manager.add_external_interface("lo", Some("10.0.0.0/24".parse().unwrap())).await.unwrap();
        manager.create_network(&transparent_network("nw1")).await.unwrap();
        drop(manager);

        // Boot "happened" after the last save: everything must be torn down.
        let (dp, _) = test_dataplane();
        let future_boot = SystemTime::now() + Duration::from_secs(3600);
        let rebooted = NetworkManager::with_dataplane(dp, future_boot);
        rebooted.initialize(&config).await.unwrap();

        let inner = rebooted.inner.lock().await;
        assert!(inner.state.external_interfaces.is_empty());
        drop(inner);

        // The reset was persisted: a third start sees the empty document.
        let (dp, _) = test_dataplane();
        let third = NetworkManager::with_dataplane(dp, SystemTime::UNIX_EPOCH);
        third.initialize(&config).await.unwrap();
        let inner = third.inner.lock().await;
        assert!(inner.state.external_interfaces.is_empty());
    }

    /// Insert an endpoint record directly, as a restore would.
    async fn seed_endpoint(manager: &NetworkManager, network_id: &str, ep: Endpoint) {
        let mut inner = manager.inner.lock().await;
        inner
            .state
            .external_interfaces
            .get_mut("lo")
            .and_then(|e| e.networks.get_mut(network_id))
            .unwrap()
            .endpoints
            .insert(ep.id.clone(), ep);
    }

    fn sample_endpoint(id: &str, pod: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            host_if_name: super::super::types::host_veth_name(id),
            if_name: "eth0".to_string(),
            mac_address: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            ip_addresses: vec!["10.0.0.4/24".parse().unwrap()],
            pod_name: pod.to_string(),
            pod_namespace: "default".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_attach_detach_lifecycle() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;
        seed_endpoint(&manager, "nw1", sample_endpoint("epabcdefg", "pod-a")).await;

        let info = manager.attach_endpoint("nw1", "epabcdefg", "sandbox1").await.unwrap();
        assert_eq!(info.id, "epabcdefg");

        let err = manager.attach_endpoint("nw1", "epabcdefg", "sandbox2").await.unwrap_err();
        assert!(matches!(err, Error::EndpointInUse(_)));

        manager.detach_endpoint("nw1", "epabcdefg").await.unwrap();
        let err = manager.detach_endpoint("nw1", "epabcdefg").await.unwrap_err();
        assert!(matches!(err, Error::EndpointNotInUse(_)));
    }

    #[tokio::test]
    async fn test_pod_lookup() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;
        seed_endpoint(&manager, "nw1", sample_endpoint("epabcdefg", "pod-a")).await;
        seed_endpoint(&manager, "nw1", sample_endpoint("ephijklmn", "pod-b")).await;

        let info = manager
            .get_endpoint_info_based_on_pod_details("nw1", "pod-a", "default")
            .await
            .unwrap();
        assert_eq!(info.id, "epabcdefg");

        assert!(matches!(
            manager
                .get_endpoint_info_based_on_pod_details("nw1", "pod-c", "default")
                .await
                .unwrap_err(),
            Error::EndpointNotFound(_)
        ));

        seed_endpoint(&manager, "nw1", {
            let mut dup = sample_endpoint("epqrstuvw", "pod-a");
            dup.pod_namespace = "default".to_string();
            dup
        })
        .await;
        assert!(matches!(
            manager
                .get_endpoint_info_based_on_pod_details("nw1", "pod-a", "default")
                .await
                .unwrap_err(),
            Error::MultipleEndpointsFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_endpoint_counts() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;
        assert_eq!(manager.number_of_endpoints().await, 0);

        seed_endpoint(&manager, "nw1", sample_endpoint("epabcdefg", "pod-a")).await;
        seed_endpoint(&manager, "nw1", sample_endpoint("ephijklmn", "pod-b")).await;
        assert_eq!(manager.number_of_endpoints().await, 2);

        let all = manager.get_all_endpoints("nw1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("epabcdefg"));

        // A populated network refuses deletion.
        let err = manager.delete_network("nw1").await.unwrap_err();
        assert!(matches!(err, Error::EndpointInUse(_)));
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_id_is_rejected() {
        let (dp, _) = test_dataplane();
        let manager = seeded_manager(dp).await;
        seed_endpoint(&manager, "nw1", sample_endpoint("epabcdefg", "pod-a")).await;

        let info = EndpointInfo {
            id: "epabcdefg".to_string(),
            ..Default::default()
        };
        let err = manager.create_endpoint("nw1", &info).await.unwrap_err();
        assert!(matches!(err, Error::EndpointExists(_)));
    }
}
