//! Endpoint lifecycle orchestration.
//!
//! Creation walks the five setup steps in order; any failure rolls back by
//! running the teardown steps against whatever was built, so no veth, rule,
//! or namespace outlives a failed create.

use tracing::{info, warn};

use super::clients::EndpointClient;
use super::error::Result;
use super::model::Endpoint;
use super::types::{EndpointInfo, MacAddr};

/// Drive the seven-step lifecycle forward for a new endpoint.
pub(crate) async fn create_endpoint(
    client: &mut EndpointClient,
    info: &EndpointInfo,
    vlan_id: u16,
) -> Result<Endpoint> {
    client.add_endpoints(info).await?;

    let result = async {
        client.add_endpoint_rules(info).await?;
        client.move_endpoints_to_container_ns(info).await?;
        client.setup_container_interfaces(info).await?;
        client.configure_container_interfaces_and_routes(info).await?;
        Ok(())
    }
    .await;

    let mut record = Endpoint::from_info(info, vlan_id);
    record.mac_address = MacAddr(client.container_mac());

    match result {
        Ok(()) => {
            info!(endpoint = %info.id, "endpoint created");
            Ok(record)
        }
        Err(e) => {
            warn!(endpoint = %info.id, error = %e, "endpoint setup failed, rolling back");
            rollback(client, &record).await;
            Err(e)
        }
    }
}

/// Tear down a failed create. The host-side veth delete cascades to the
/// container side wherever the pair ended up.
async fn rollback(client: &mut EndpointClient, record: &Endpoint) {
    if let Err(e) = client.delete_endpoint_rules(record).await {
        warn!(endpoint = %record.id, error = %e, "rollback: rule cleanup failed");
    }
    if let Err(e) = client.delete_endpoints(record).await {
        warn!(endpoint = %record.id, error = %e, "rollback: veth cleanup failed");
    }
}

/// Drive the teardown steps for an existing endpoint.
pub(crate) async fn delete_endpoint(client: &mut EndpointClient, record: &Endpoint) -> Result<()> {
    client.delete_endpoint_rules(record).await?;
    client.delete_endpoints(record).await?;
    info!(endpoint = %record.id, "endpoint deleted");
    Ok(())
}
