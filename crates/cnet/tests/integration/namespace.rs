//! Namespace entry/exit and named-namespace lifecycle.

use cnet::netlink::{Connection, DummyLink, NetNs, Result, namespace};

use crate::common::TestNamespace;

#[tokio::test]
async fn test_enter_exit_is_balanced() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("enter")?;
    let path = ns.path();

    // The bracket runs on a dedicated thread; afterwards the calling
    // thread's namespace is untouched.
    let before = std::fs::read_link("/proc/self/ns/net")?;
    namespace::run_in_namespace(&path, || Ok(())).await?;
    let after = std::fs::read_link("/proc/self/ns/net")?;
    assert_eq!(before, after);

    // Nested enter/exit inside the bracket also balances.
    let inner_path = path.clone();
    namespace::run_in_namespace(&path, move || {
        let here = std::fs::read_link(namespace::current_thread_ns_path())?;
        let ns = NetNs::open(&inner_path)?;
        let guard = ns.enter()?;
        guard.exit()?;
        let back = std::fs::read_link(namespace::current_thread_ns_path())?;
        assert_eq!(here, back);
        Ok(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_connection_operates_in_its_namespace() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("conn")?;
    let conn = Connection::in_namespace_path(ns.path())?;

    conn.add_link(DummyLink::new("nsdummy0")).await?;

    // Visible inside the namespace, invisible outside.
    assert!(ns.exec("ip", &["link", "show", "nsdummy0"]).is_ok());
    let host = Connection::new()?;
    assert!(host.ifindex("nsdummy0").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_named_namespace_lifecycle() -> Result<()> {
    require_root!();

    let name = format!("cnet-named-{}", std::process::id());
    assert!(!namespace::exists(&name));

    namespace::create_named(&name).await?;
    assert!(namespace::exists(&name));

    // Creation is idempotent.
    namespace::create_named(&name).await?;

    // The namespace is usable.
    let conn = Connection::in_namespace_path(namespace::named_path(&name))?;
    conn.add_link(DummyLink::new("dummy0")).await?;

    namespace::delete_named(&name).await?;
    assert!(!namespace::exists(&name));

    // Deletion is idempotent too.
    namespace::delete_named(&name).await?;
    Ok(())
}

#[tokio::test]
async fn test_move_link_between_namespaces() -> Result<()> {
    require_root!();

    let host = TestNamespace::new("movehost")?;
    let container = TestNamespace::new("movecont")?;

    let conn = host.connection()?;
    conn.add_link(DummyLink::new("wander0")).await?;

    let target = NetNs::open(container.path())?;
    conn.set_link_netns("wander0", target.fd()).await?;

    assert!(conn.ifindex("wander0").await.is_err());
    let cont_conn = container.connection()?;
    assert!(cont_conn.ifindex("wander0").await.is_ok());
    Ok(())
}
