//! Link lifecycle against a real kernel.

use cnet::netlink::{BridgeLink, DummyLink, Result, VethLink};

use crate::common::TestNamespace;

#[tokio::test]
async fn test_veth_pair_lifecycle() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("veth")?;
    let conn = ns.connection()?;

    conn.add_link(VethLink::new("veth0", "veth1").mtu(1400)).await?;

    let links = conn.get_links().await?;
    let veth0 = links.iter().find(|l| l.name.as_deref() == Some("veth0"));
    let veth1 = links.iter().find(|l| l.name.as_deref() == Some("veth1"));
    assert!(veth0.is_some() && veth1.is_some(), "both ends should exist");
    assert_eq!(veth0.unwrap().mtu, Some(1400));
    assert_eq!(veth0.unwrap().kind.as_deref(), Some("veth"));

    // Deleting one end deletes the pair.
    conn.delete_link("veth0").await?;
    let links = conn.get_links().await?;
    assert!(!links.iter().any(|l| l.name.as_deref() == Some("veth1")));

    // A second delete reports not-found, which callers tolerate.
    let err = conn.delete_link("veth0").await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_interface_lookup_follows_link_lifetime() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("lookup")?;
    let conn = ns.connection()?;

    assert!(conn.ifindex("dummy0").await.is_err());
    conn.add_link(DummyLink::new("dummy0")).await?;
    assert!(conn.ifindex("dummy0").await.unwrap() > 0);
    conn.delete_link("dummy0").await?;
    assert!(conn.ifindex("dummy0").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_bridge_master_and_state() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("bridge")?;
    let conn = ns.connection()?;

    conn.add_link(BridgeLink::new("br0")).await?;
    conn.add_link(VethLink::new("veth0", "veth1")).await?;
    conn.set_link_master("veth0", "br0").await?;
    conn.set_link_state("br0", true).await?;
    conn.set_link_state("veth0", true).await?;

    let br_index = conn.ifindex("br0").await?;
    let links = conn.get_links().await?;
    let veth0 = links
        .iter()
        .find(|l| l.name.as_deref() == Some("veth0"))
        .unwrap();
    assert_eq!(veth0.master, Some(br_index));

    conn.set_link_master("veth0", "").await?;
    let links = conn.get_links().await?;
    let veth0 = links
        .iter()
        .find(|l| l.name.as_deref() == Some("veth0"))
        .unwrap();
    assert_eq!(veth0.master, None);

    conn.set_link_hairpin("veth0", true).await.ok();
    Ok(())
}

#[tokio::test]
async fn test_rename_and_mtu() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rename")?;
    let conn = ns.connection()?;

    conn.add_link(DummyLink::new("dummy0")).await?;
    conn.set_link_mtu("dummy0", 9000).await?;
    conn.rename_link("dummy0", "renamed0").await?;

    let link = conn.get_link_by_name("renamed0").await?;
    assert_eq!(link.mtu, Some(9000));
    Ok(())
}

#[tokio::test]
async fn test_address_add_is_idempotent() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addr")?;
    let conn = ns.connection()?;
    conn.add_link(DummyLink::new("dummy0")).await?;
    conn.set_link_state("dummy0", true).await?;

    let addr = "10.0.0.1".parse().unwrap();
    conn.add_ip_address("dummy0", addr, 24).await?;

    // Second add reports EEXIST; the idempotency wrapper maps it to success.
    let second = conn.add_ip_address("dummy0", addr, 24).await;
    assert!(second.as_ref().is_err_and(|e| e.is_already_exists()));
    cnet::netlink::ok_if_exists(second)?;

    let addrs = conn.get_addresses(Some("dummy0")).await?;
    assert_eq!(
        addrs
            .iter()
            .filter(|a| a.address == Some("10.0.0.1".parse().unwrap()))
            .count(),
        1
    );

    conn.delete_ip_address("dummy0", addr, 24).await?;
    let addrs = conn.get_addresses(Some("dummy0")).await?;
    assert!(!addrs.iter().any(|a| a.address == Some(addr)));
    Ok(())
}

#[tokio::test]
async fn test_echo_round_trip() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("echo")?;
    let conn = ns.connection()?;
    conn.echo().await?;
    Ok(())
}
