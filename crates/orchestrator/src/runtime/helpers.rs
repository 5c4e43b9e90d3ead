use std::collections::HashMap;

use bollard::models::{
    ContainerNetworkStats, ContainerState, ContainerStateStatusEnum, ContainerStatsResponse,
    PortBinding, PortMap,
};

use crate::runtime::{ContainerStatus, PortBindingSpec};

pub(crate) type ExposedPorts = HashMap<String, HashMap<(), ()>>;

pub(crate) fn format_env(env: &[(String, String)]) -> Option<Vec<String>> {
    if env.is_empty() {
        None
    } else {
        Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect())
    }
}

pub(crate) fn build_port_binding(port: PortBindingSpec) -> (PortMap, ExposedPorts) {
    let key = format!("{}/tcp", port.container_port);

    let mut exposed_ports: ExposedPorts = HashMap::new();
    exposed_ports.insert(key.clone(), HashMap::new());

    let mut port_bindings: PortMap = HashMap::new();
    port_bindings.insert(
        key,
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some(port.host_port.to_string()),
        }]),
    );

    (port_bindings, exposed_ports)
}

pub(crate) fn map_status(state: Option<&ContainerState>) -> ContainerStatus {
    if let Some(state) = state {
        match state.status.as_ref() {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited {
                exit_code: state.exit_code,
            },
            Some(other) => ContainerStatus::Unknown(other.to_string()),
            None => ContainerStatus::Unknown("unknown".into()),
        }
    } else {
        ContainerStatus::Unknown("unknown".into())
    }
}

pub(crate) fn calculate_cpu_percent(stats: &ContainerStatsResponse) -> Option<f64> {
    let cpu = stats.cpu_stats.as_ref()?;
    let pre = stats.precpu_stats.as_ref()?;

    let cpu_total = cpu.cpu_usage.as_ref()?.total_usage?;
    let pre_total = pre.cpu_usage.as_ref()?.total_usage?;
    let cpu_delta = cpu_total.saturating_sub(pre_total);

    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or_default()
        .saturating_sub(pre.system_cpu_usage.unwrap_or_default());

    if cpu_delta == 0 || system_delta == 0 {
        return None;
    }

    let cpu_count = cpu
        .online_cpus
        .or_else(|| {
            cpu.cpu_usage
                .as_ref()?
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u32)
        })
        .unwrap_or(1);

    Some((cpu_delta as f64 / system_delta as f64) * cpu_count as f64 * 100.0)
}

pub(crate) fn network_bytes(
    stats: &ContainerStatsResponse,
    selector: impl Fn(&ContainerNetworkStats) -> Option<u64>,
) -> u64 {
    stats
        .networks
        .as_ref()
        .map(|map| map.values().filter_map(selector).sum())
        .unwrap_or_default()
}
