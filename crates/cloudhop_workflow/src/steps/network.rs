use std::net::IpAddr;

use cloudhop_contract::{NetworkAttachment, NicBinding};
use cloudhop_services::{NetworkFilter, NetworkService, PortCreate, ServiceError, Subnet};
use ipnetwork::IpNetwork;
use tracing::{info, warn};

use super::ignore_missing;
use crate::context::MigrationContext;
use crate::error::WorkflowError;
use crate::step::Step;

/// Creates one destination port per source network attachment.
pub fn prepare_nics() -> Step {
    Step::atomic("prepare_nics", |ctx| Box::pin(create_ports(ctx)))
}

/// Binds each requested floating address to the instance's fixed address on
/// the named network.
pub fn assigning_floating() -> Step {
    Step::atomic("assigning_floating", |ctx| Box::pin(bind_floating_ips(ctx)))
}

/// Subnet of the administrative tenant whose range covers `ip`.
fn subnet_containing<'a>(subnets: &'a [Subnet], tenant_id: &str, ip: IpAddr) -> Option<&'a Subnet> {
    subnets.iter().find(|subnet| {
        subnet.tenant_id == tenant_id
            && subnet
                .cidr
                .parse::<IpNetwork>()
                .map(|range| range.contains(ip))
                .unwrap_or(false)
    })
}

async fn first_network(
    network: &dyn NetworkService,
    filter: NetworkFilter,
) -> Result<Option<String>, ServiceError> {
    Ok(network
        .list_networks(&filter)
        .await?
        .into_iter()
        .next()
        .map(|net| net.id))
}

async fn resolve_network(
    ctx: &MigrationContext,
    attachment: &NetworkAttachment,
    admin_tenant_id: Option<&str>,
) -> Result<String, WorkflowError> {
    let network = ctx.services.destination.network.as_ref();

    if let Some(tenant_id) = admin_tenant_id {
        let ip = attachment
            .ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .ok_or_else(|| {
                WorkflowError::NetworkNotFound(format!("port {} has no usable fixed ip", attachment.mac))
            })?;
        let subnets = network.list_subnets().await?;
        return subnet_containing(&subnets, tenant_id, ip)
            .map(|subnet| subnet.network_id.clone())
            .ok_or_else(|| WorkflowError::NetworkNotFound(format!("subnet containing {ip}")));
    }

    if let Some(id) = &attachment.id {
        if let Some(found) = first_network(network, NetworkFilter::Id(id.clone())).await? {
            return Ok(found);
        }
    }
    if let Some(name) = &attachment.name {
        if let Some(found) = first_network(network, NetworkFilter::Name(name.clone())).await? {
            return Ok(found);
        }
    }
    Err(WorkflowError::NetworkNotFound(
        attachment
            .name
            .clone()
            .or_else(|| attachment.id.clone())
            .unwrap_or_else(|| attachment.mac.clone()),
    ))
}

async fn security_group_ids(ctx: &MigrationContext) -> Result<Vec<String>, WorkflowError> {
    let wanted = &ctx.state.derived_parameters.security_groups;
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let known = ctx.services.destination.compute.list_security_groups().await?;
    wanted
        .iter()
        .map(|name| {
            known
                .iter()
                .find(|group| group.name == *name)
                .map(|group| group.id.clone())
                .ok_or_else(|| WorkflowError::from(ServiceError::not_found("security group", name.clone())))
        })
        .collect()
}

async fn create_ports(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let request = ctx.request()?.clone();
    let keep_ip = ctx.config.destination.keep_ip;
    let identity = ctx.services.destination.identity.clone();
    let network = ctx.services.destination.network.clone();

    let tenant_name = ctx
        .state
        .derived_parameters
        .tenant_name
        .clone()
        .unwrap_or_else(|| request.tenant_name.clone());
    let tenant_id = identity.tenant_id_by_name(&tenant_name).await?;
    let security_groups = security_group_ids(ctx).await?;
    let admin_tenant_id = if keep_ip {
        Some(identity.tenant_id_by_name(&ctx.config.destination.tenant).await?)
    } else {
        None
    };

    let mut nics = Vec::with_capacity(request.networks.len());
    for (index, requested) in request.networks.iter().enumerate() {
        let attachment = match ctx.config.import_rules.network_override(index)? {
            Some(selector) if !keep_ip => NetworkAttachment {
                id: selector.id,
                name: selector.name,
                ..requested.clone()
            },
            _ => requested.clone(),
        };
        let net_id = resolve_network(ctx, &attachment, admin_tenant_id.as_deref()).await?;

        let _guard = ctx.executor.locks().lock(&format!("network:{net_id}")).await;
        let stale: Vec<_> = network
            .list_ports()
            .await?
            .into_iter()
            .filter(|port| port.network_id == net_id && port.mac_address == attachment.mac)
            .collect();
        for port in stale {
            warn!(port_id = %port.id, mac = %port.mac_address, "removing leftover port");
            ignore_missing(network.delete_port(&port.id).await)?;
        }

        let port = network
            .create_port(&PortCreate {
                network_id: net_id.clone(),
                mac_address: attachment.mac.clone(),
                security_groups: security_groups.clone(),
                tenant_id: tenant_id.clone(),
                fixed_ip: if keep_ip { attachment.ip.clone() } else { None },
            })
            .await?;
        info!(net_id = %net_id, port_id = %port.id, "port prepared");
        nics.push(NicBinding {
            net_id,
            port_id: port.id,
        });
    }
    ctx.state.derived_parameters.nics = nics;
    Ok(())
}

async fn bind_floating_ips(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let floatings = ctx.request()?.floatings.clone();
    let instance_id = ctx.instance()?.id.clone();
    let compute = ctx.services.destination.compute.clone();
    let instance = compute.get_server(&instance_id).await?;

    for floating in &floatings {
        let Some(fixed) = instance
            .networks
            .get(&floating.name)
            .and_then(|addresses| addresses.first())
        else {
            warn!(network = %floating.name, ip = %floating.ip, "instance has no address on network, skipping floating ip");
            continue;
        };
        compute
            .add_floating_ip(&instance.id, &floating.ip, fixed)
            .await?;
        info!(ip = %floating.ip, fixed = %fixed, "floating ip assigned");
    }
    ctx.state.created_instance_handle = Some(instance);
    Ok(())
}

#[cfg(test)]
mod tests {
    use cloudhop_services::Subnet;

    use super::subnet_containing;

    fn subnet(id: &str, tenant: &str, cidr: &str) -> Subnet {
        Subnet {
            id: id.to_string(),
            network_id: format!("net-{id}"),
            tenant_id: tenant.to_string(),
            cidr: cidr.to_string(),
        }
    }

    #[test]
    fn picks_admin_subnet_covering_address() {
        let subnets = vec![
            subnet("a", "tenant-x", "10.0.0.0/24"),
            subnet("b", "admin", "10.0.0.0/24"),
            subnet("c", "admin", "192.168.0.0/16"),
        ];

        let found = subnet_containing(&subnets, "admin", "10.0.0.42".parse().expect("ip"))
            .expect("subnet");
        assert_eq!(found.network_id, "net-b");
        assert!(subnet_containing(&subnets, "admin", "172.16.0.1".parse().expect("ip")).is_none());
    }
}
