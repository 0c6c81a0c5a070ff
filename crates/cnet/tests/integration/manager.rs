//! Manager-level end-to-end scenarios.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cnet::network::clients::DataPlane;
use cnet::network::{
    Config, EndpointInfo, NetworkInfo, NetworkManager, NetworkMode, SubnetInfo,
};
use cnet::netlink::{DummyLink, RouteFilter};
use cnet::platform::Exec;

use crate::common::TestNamespace;

async fn manager_fixture(
    prefix: &str,
) -> std::result::Result<(TestNamespace, NetworkManager, DataPlane), Box<dyn std::error::Error>> {
    let host = TestNamespace::new(prefix)?;
    let conn = Arc::new(host.connection()?);
    conn.add_link(DummyLink::new("eth0")).await?;
    conn.set_link_state("eth0", true).await?;

    let dp = DataPlane::new(conn, Exec::mock());
    let manager = NetworkManager::with_dataplane(dp.clone(), SystemTime::UNIX_EPOCH);
    Ok((host, manager, dp))
}

fn transparent_network() -> NetworkInfo {
    NetworkInfo {
        id: "nw1".to_string(),
        mode: NetworkMode::Transparent,
        master_if_name: "eth0".to_string(),
        subnets: vec![SubnetInfo {
            prefix: "10.0.0.0/24".parse().unwrap(),
            gateway: Some("10.0.0.1".parse().unwrap()),
            primary_ip: None,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_and_delete_transparent_endpoint() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let (host, manager, dp) = manager_fixture("mgrhost").await?;
    let container = TestNamespace::new("mgrcont")?;

    manager
        .add_external_interface("eth0", Some("10.0.0.0/24".parse().unwrap()))
        .await?;
    manager.create_network(&transparent_network()).await?;

    let info = EndpointInfo {
        id: "epabcdefg".to_string(),
        if_name: "eth0".to_string(),
        netns_path: container.path(),
        ip_addresses: vec!["10.0.0.4/24".parse().unwrap()],
        ..Default::default()
    };
    manager.create_endpoint("nw1", &info).await?;
    assert_eq!(manager.number_of_endpoints().await, 1);

    let stored = manager.get_endpoint_info("nw1", "epabcdefg").await?;
    assert_eq!(stored.ip_addresses, info.ip_addresses);
    assert!(stored.mac_address.is_some());

    // The data plane agrees: host veth up, /32 route present, container
    // interface configured.
    assert!(dp.conn.get_link_by_name("vethepabcde").await?.is_up());
    let routes = dp
        .conn
        .get_routes(&RouteFilter::v4().destination("10.0.0.4".parse().unwrap(), 32))
        .await?;
    assert_eq!(routes.len(), 1);

    let cont = container.connection()?;
    assert!(cont.get_link_by_name("eth0").await?.is_up());

    manager.delete_endpoint("nw1", "epabcdefg").await?;
    assert_eq!(manager.number_of_endpoints().await, 0);
    assert!(dp.conn.ifindex("vethepabcde").await.is_err());

    manager.delete_network("nw1").await?;
    drop(host);
    Ok(())
}

#[tokio::test]
async fn test_manager_state_survives_restart_with_endpoints() -> std::result::Result<(), Box<dyn std::error::Error>> {
    require_root!();

    let dir = tempfile::tempdir()?;
    let config = Config {
        store_path: Some(dir.path().join("state.json")),
        rehydration_required: true,
        lock_timeout: Duration::from_secs(2),
    };

    let (host, manager, dp) = manager_fixture("perhost").await?;
    let container = TestNamespace::new("percont")?;
    manager.initialize(&config).await?;
    manager
        .add_external_interface("eth0", Some("10.0.0.0/24".parse().unwrap()))
        .await?;
    manager.create_network(&transparent_network()).await?;
    manager
        .create_endpoint(
            "nw1",
            &EndpointInfo {
                id: "epabcdefg".to_string(),
                if_name: "eth0".to_string(),
                netns_path: container.path(),
                ip_addresses: vec!["10.0.0.4/24".parse().unwrap()],
                pod_name: "pod-a".to_string(),
                pod_namespace: "default".to_string(),
                ..Default::default()
            },
        )
        .await?;
    drop(manager);

    // Restart: same store, boot time before the save.
    let restarted = NetworkManager::with_dataplane(dp.clone(), SystemTime::UNIX_EPOCH);
    restarted.initialize(&config).await?;

    assert_eq!(restarted.number_of_endpoints().await, 1);
    let ep = restarted
        .get_endpoint_info_based_on_pod_details("nw1", "pod-a", "default")
        .await?;
    assert_eq!(ep.id, "epabcdefg");

    // The restored record still drives teardown correctly.
    restarted.delete_endpoint("nw1", "epabcdefg").await?;
    assert!(dp.conn.ifindex("vethepabcde").await.is_err());

    drop(host);
    Ok(())
}
