//! Endpoint-client lifecycles across real namespaces.
//!
//! The "host" side is itself a throwaway namespace, so veths, routes, and
//! bridges never leak onto the machine; CLI rules go to the recording mock.

use std::sync::Arc;

use cnet::network::clients::{
    DataPlane, EndpointClient, LinuxBridgeEndpointClient, TransparentEndpointClient,
};
use cnet::network::{Endpoint, EndpointInfo, IpV6Mode, MacAddr, NetworkMode};
use cnet::netlink::{BridgeLink, DummyLink, Result, RouteFilter};
use cnet::platform::Exec;

use crate::common::TestNamespace;

/// A "host" namespace with a primary NIC, plus its data plane.
async fn host_fixture(prefix: &str) -> Result<(TestNamespace, DataPlane, Exec)> {
    let host = TestNamespace::new(prefix)?;
    let conn = Arc::new(host.connection()?);
    conn.add_link(DummyLink::new("eth0")).await?;
    conn.set_link_state("eth0", true).await?;
    let exec = Exec::mock();
    let dp = DataPlane::new(conn, exec.clone());
    Ok((host, dp, exec))
}

fn endpoint_info(container: &TestNamespace) -> EndpointInfo {
    EndpointInfo {
        id: "epabcdefg".to_string(),
        if_name: "eth0".to_string(),
        netns_path: container.path(),
        ip_addresses: vec!["10.0.0.4/24".parse().unwrap()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_transparent_endpoint_lifecycle() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let (host, dp, exec) = host_fixture("tphost").await?;
    let container = TestNamespace::new("tpcont")?;
    let info = endpoint_info(&container);

    let mut client = EndpointClient::Transparent(TransparentEndpointClient::new(
        dp.clone(),
        "eth0",
        IpV6Mode::Disabled,
    ));

    client.add_endpoints(&info).await?;
    client.add_endpoint_rules(&info).await?;
    client.move_endpoints_to_container_ns(&info).await?;
    client.setup_container_interfaces(&info).await?;
    client.configure_container_interfaces_and_routes(&info).await?;

    // Host side: the veth is up and the /32 points at it.
    let links = dp.conn.get_links().await?;
    let veth = links
        .iter()
        .find(|l| l.name.as_deref() == Some("vethepabcde"))
        .expect("host veth exists");
    assert!(veth.is_up());

    let routes = dp
        .conn
        .get_routes(&RouteFilter::v4().destination("10.0.0.4".parse().unwrap(), 32))
        .await?;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].link_index, veth.ifindex());

    // Proxy-ARP was requested for the veth.
    assert!(exec.saw("sysctl -w net.ipv4.conf.vethepabcde.proxy_arp=1"));

    // Container side: renamed, addressed, default via the virtual gateway,
    // and a permanent neighbor entry for it.
    let cont = container.connection()?;
    let eth0 = cont.get_link_by_name("eth0").await?;
    assert!(eth0.is_up());

    let addrs = cont.get_addresses(Some("eth0")).await?;
    assert!(addrs.iter().any(|a| a.address == Some("10.0.0.4".parse().unwrap())));

    let defaults = cont.get_routes(&RouteFilter::v4().default_route()).await?;
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].gateway, Some("169.254.1.1".parse().unwrap()));

    let neigh = container.exec("ip", &["neigh", "show", "169.254.1.1"])?;
    assert!(neigh.contains("PERMANENT"), "virtual gateway arp: {neigh}");

    // Teardown removes the veth pair and the host route.
    let mut record = Endpoint::from_info(&info, 0);
    record.mac_address = MacAddr(client.container_mac());
    client.delete_endpoint_rules(&record).await?;
    client.delete_endpoints(&record).await?;

    assert!(dp.conn.ifindex("vethepabcde").await.is_err());
    let routes = dp
        .conn
        .get_routes(&RouteFilter::v4().destination("10.0.0.4".parse().unwrap(), 32))
        .await?;
    assert!(routes.is_empty());
    assert!(cont.get_link_by_name("eth0").await.is_err());

    drop(host);
    Ok(())
}

#[tokio::test]
async fn test_bridge_endpoint_rules_and_hairpin() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let (host, dp, exec) = host_fixture("brhost").await?;
    let container = TestNamespace::new("brcont")?;

    dp.conn.add_link(BridgeLink::new("br0")).await?;
    dp.conn.set_link_state("br0", true).await?;

    let mut info = endpoint_info(&container);
    info.id = "ep0000001".to_string();
    info.ip_addresses = vec!["10.1.0.5/24".parse().unwrap()];

    let mut client = EndpointClient::Bridge(LinuxBridgeEndpointClient::new(
        dp.clone(),
        "br0",
        "eth0",
        NetworkMode::Bridge,
        None,
    ));

    client.add_endpoints(&info).await?;
    client.add_endpoint_rules(&info).await?;

    // The veth joined the bridge.
    let br_index = dp.conn.ifindex("br0").await?;
    let veth = dp.conn.get_link_by_name("veth0000001").await?;
    assert_eq!(veth.master, Some(br_index));

    // MAC-DNAT rewrites traffic for the container IP on the host NIC.
    let mac = cnet::netif::format_mac(&client.container_mac());
    assert!(exec.saw(&format!(
        "-p IPv4 -i eth0 --ip-dst 10.1.0.5 -j dnat --to-dst {mac}"
    )));
    // And ARP for the container IP is answered locally.
    assert!(exec.saw("--arp-ip-dst 10.1.0.5 -j arpreply"));

    client.move_endpoints_to_container_ns(&info).await?;
    client.setup_container_interfaces(&info).await?;
    client.configure_container_interfaces_and_routes(&info).await?;

    let cont = container.connection()?;
    assert!(cont.get_link_by_name("eth0").await?.is_up());

    let mut record = Endpoint::from_info(&info, 0);
    record.mac_address = MacAddr(client.container_mac());
    client.delete_endpoint_rules(&record).await?;
    client.delete_endpoints(&record).await?;
    assert!(dp.conn.ifindex("veth0000001").await.is_err());

    drop(host);
    Ok(())
}

#[tokio::test]
async fn test_failed_setup_rolls_back_veth() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let (host, dp, _exec) = host_fixture("rbhost").await?;

    // A bogus container namespace path makes the move step fail.
    let info = EndpointInfo {
        id: "eprollbck".to_string(),
        if_name: "eth0".to_string(),
        netns_path: "/var/run/netns/cnet-does-not-exist".to_string(),
        ip_addresses: vec!["10.0.0.9/24".parse().unwrap()],
        ..Default::default()
    };

    let mut client = EndpointClient::Transparent(TransparentEndpointClient::new(
        dp.clone(),
        "eth0",
        IpV6Mode::Disabled,
    ));

    client.add_endpoints(&info).await?;
    client.add_endpoint_rules(&info).await?;
    let err = client.move_endpoints_to_container_ns(&info).await;
    assert!(err.is_err(), "move into a missing namespace must fail");

    // The caller's rollback path: rules then endpoints.
    let record = Endpoint::from_info(&info, 0);
    client.delete_endpoint_rules(&record).await?;
    client.delete_endpoints(&record).await?;

    assert!(dp.conn.ifindex("vetheprollb").await.is_err());
    let routes = dp
        .conn
        .get_routes(&RouteFilter::v4().destination("10.0.0.9".parse().unwrap(), 32))
        .await?;
    assert!(routes.is_empty());

    drop(host);
    Ok(())
}
