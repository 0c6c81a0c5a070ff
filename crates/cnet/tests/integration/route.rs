//! Route and neighbor operations against a real kernel.

use cnet::netlink::types::{rt_proto, rt_scope};
use cnet::netlink::{DummyLink, Result, Route, RouteFilter};

use crate::common::TestNamespace;

async fn dummy_with_addr(ns: &TestNamespace) -> Result<(cnet::netlink::Connection, u32)> {
    let conn = ns.connection()?;
    conn.add_link(DummyLink::new("dummy0")).await?;
    conn.set_link_state("dummy0", true).await?;
    conn.add_ip_address("dummy0", "10.0.0.1".parse().unwrap(), 24)
        .await?;
    let index = conn.ifindex("dummy0").await?;
    Ok((conn, index))
}

#[tokio::test]
async fn test_route_add_list_delete() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("route")?;
    let (conn, index) = dummy_with_addr(&ns).await?;

    let route = Route::unicast("10.7.0.0".parse().unwrap(), 24)
        .gateway("10.0.0.254".parse().unwrap())
        .link_index(index)
        .protocol(rt_proto::STATIC);
    conn.add_route(&route).await?;

    let routes = conn
        .get_routes(&RouteFilter::v4().destination("10.7.0.0".parse().unwrap(), 24))
        .await?;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].gateway, Some("10.0.0.254".parse().unwrap()));
    assert_eq!(routes[0].link_index, index);

    // Re-adding reports EEXIST.
    assert!(conn.add_route(&route).await.is_err_and(|e| e.is_already_exists()));

    conn.delete_route(&route).await?;
    let routes = conn
        .get_routes(&RouteFilter::v4().destination("10.7.0.0".parse().unwrap(), 24))
        .await?;
    assert!(routes.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_route_table_filter() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rtable")?;
    let (conn, index) = dummy_with_addr(&ns).await?;

    let in_table_7 = Route::unicast("10.9.0.0".parse().unwrap(), 24)
        .link_index(index)
        .scope(rt_scope::LINK)
        .table(7);
    conn.add_route(&in_table_7).await?;

    // Table 0 selects main only: the table-7 route must not appear.
    let main_routes = conn.get_routes(&RouteFilter::v4()).await?;
    assert!(!main_routes
        .iter()
        .any(|r| r.dst == Some(("10.9.0.0".parse().unwrap(), 24))));

    let table_routes = conn.get_routes(&RouteFilter::v4().table(7)).await?;
    assert_eq!(table_routes.len(), 1);
    assert_eq!(table_routes[0].dst, Some(("10.9.0.0".parse().unwrap(), 24)));
    Ok(())
}

#[tokio::test]
async fn test_default_route_and_filter() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("defroute")?;
    let (conn, index) = dummy_with_addr(&ns).await?;

    let default = Route::default_via("10.0.0.254".parse().unwrap()).link_index(index);
    conn.add_route(&default).await?;

    let defaults = conn.get_routes(&RouteFilter::v4().default_route()).await?;
    assert_eq!(defaults.len(), 1);
    assert!(defaults[0].dst.is_none());

    // A width-zero filter matches only nil destinations, so the on-link
    // subnet route the kernel added for dummy0 must not appear.
    assert!(defaults.iter().all(|r| r.dst.is_none()));
    Ok(())
}

#[tokio::test]
async fn test_static_arp_entries() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("neigh")?;
    let (conn, _) = dummy_with_addr(&ns).await?;

    let ip = "10.0.0.99".parse().unwrap();
    let mac = [0x02, 0x42, 0x0a, 0x00, 0x00, 0x63];
    conn.add_static_arp("dummy0", ip, mac, false).await?;

    let shown = ns.exec("ip", &["neigh", "show", "10.0.0.99"])?;
    assert!(shown.contains("PERMANENT"), "entry should be permanent: {shown}");

    conn.delete_static_arp("dummy0", ip, false).await?;
    let shown = ns.exec("ip", &["neigh", "show", "10.0.0.99"])?;
    assert!(!shown.contains("PERMANENT"));
    Ok(())
}

#[tokio::test]
async fn test_fwmark_rule() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("fwmark")?;
    let conn = ns.connection()?;

    conn.add_fwmark_rule(333, 2).await?;
    let rules = ns.exec("ip", &["rule", "show"])?;
    assert!(rules.contains("fwmark"), "rule should exist: {rules}");

    conn.delete_fwmark_rule(333, 2).await?;
    let rules = ns.exec("ip", &["rule", "show"])?;
    assert!(!rules.contains("fwmark"));
    Ok(())
}
