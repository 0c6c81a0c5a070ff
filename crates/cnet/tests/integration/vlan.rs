//! Transparent-VLAN endpoint lifecycle: vnet namespace creation, reuse, and
//! teardown when the last endpoint leaves.

use std::sync::Arc;

use cnet::network::clients::{DataPlane, EndpointClient, TransparentVlanEndpointClient};
use cnet::network::types::{vlan_if_name, vnet_ns_name};
use cnet::network::{Endpoint, EndpointInfo, MacAddr};
use cnet::netlink::{Connection, DummyLink, namespace};
use cnet::platform::Exec;

use crate::common::TestNamespace;

/// High vlan id so the global namespace name cannot collide with real use.
const TEST_VLAN: u16 = 3999;

fn vlan_endpoint(container: &TestNamespace, id: &str, ip: &str) -> EndpointInfo {
    EndpointInfo {
        id: id.to_string(),
        if_name: "eth0".to_string(),
        netns_path: container.path(),
        ip_addresses: vec![format!("{ip}/24").parse().unwrap()],
        ..Default::default()
    }
}

fn vlan_client(dp: &DataPlane) -> EndpointClient {
    EndpointClient::TransparentVlan(TransparentVlanEndpointClient::new(
        dp.clone(),
        "eth0",
        TEST_VLAN,
    ))
}

async fn run_lifecycle(
    client: &mut EndpointClient,
    info: &EndpointInfo,
) -> cnet::network::Result<Endpoint> {
    client.add_endpoints(info).await?;
    client.add_endpoint_rules(info).await?;
    client.move_endpoints_to_container_ns(info).await?;
    client.setup_container_interfaces(info).await?;
    client.configure_container_interfaces_and_routes(info).await?;
    let mut record = Endpoint::from_info(info, TEST_VLAN);
    record.mac_address = MacAddr(client.container_mac());
    Ok(record)
}

#[tokio::test]
async fn test_vnet_namespace_reuse_and_teardown() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let ns_name = vnet_ns_name(TEST_VLAN);
    if namespace::exists(&ns_name) {
        eprintln!("Skipping test: {ns_name} already exists");
        return Ok(());
    }

    let host = TestNamespace::new("vlanhost")?;
    let conn = Arc::new(host.connection()?);
    conn.add_link(DummyLink::new("eth0")).await?;
    conn.set_link_state("eth0", true).await?;
    let dp = DataPlane::new(conn, Exec::mock());

    let cont1 = TestNamespace::new("vlancont1")?;
    let cont2 = TestNamespace::new("vlancont2")?;

    // First endpoint creates the vnet namespace and the VLAN sub-interface.
    let mut client1 = vlan_client(&dp);
    let record1 = run_lifecycle(&mut client1, &vlan_endpoint(&cont1, "epvlana01", "10.3.0.4")).await?;
    assert!(namespace::exists(&ns_name));

    let vnet = Connection::in_namespace_path(namespace::named_path(&ns_name))?;
    let vlan_if = vlan_if_name("eth0", TEST_VLAN);
    assert!(vnet.get_link_by_name(&vlan_if).await?.is_up());
    let first_vlan_index = vnet.ifindex(&vlan_if).await?;

    // Second endpoint reuses both; the VLAN interface is not recreated.
    let mut client2 = vlan_client(&dp);
    let record2 = run_lifecycle(&mut client2, &vlan_endpoint(&cont2, "epvlanb02", "10.3.0.5")).await?;
    assert_eq!(vnet.ifindex(&vlan_if).await?, first_vlan_index);

    // Deleting the first endpoint leaves the namespace for the second.
    client1.delete_endpoint_rules(&record1).await?;
    client1.delete_endpoints(&record1).await?;
    assert!(namespace::exists(&ns_name));

    // Deleting the last endpoint removes the namespace (and its VLAN
    // interface with it).
    client2.delete_endpoint_rules(&record2).await?;
    client2.delete_endpoints(&record2).await?;
    assert!(!namespace::exists(&ns_name));

    drop(host);
    Ok(())
}
