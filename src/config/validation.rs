//! Configuration validation.

use crate::config::{
    ClusterConfig, Config, HealthCheckDefaults, HealthCheckType, PersistenceMode, Protocol,
};
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one cluster, each with at least one node
/// - Unique cluster names and unique node addresses per cluster
/// - Node weight and connection cap ranges
/// - Health check paths, thresholds, intervals and timeouts
/// - Frontend cluster references, names and listen addresses
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or every problem found joined with `"; "`.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.clusters.is_empty() {
        errors.push("at least one cluster must be defined".to_string());
    }

    let cluster_names: HashSet<&str> = config.clusters.iter().map(|c| c.name.as_str()).collect();
    if cluster_names.len() != config.clusters.len() {
        errors.push("duplicate cluster names detected".to_string());
    }

    validate_health_defaults(&config.health_check_defaults, &mut errors);

    for cluster in &config.clusters {
        validate_cluster(cluster, &mut errors);
    }

    let mut frontend_names = HashSet::new();
    let mut listen_addresses = HashSet::new();

    for frontend in &config.frontends {
        if frontend.name.is_empty() {
            errors.push("frontend name cannot be empty".to_string());
        }

        if !frontend_names.insert(&frontend.name) {
            errors.push(format!("duplicate frontend name: {}", frontend.name));
        }

        // TCP and UDP may share a port
        if !listen_addresses.insert((frontend.protocol, frontend.listen)) {
            errors.push(format!(
                "duplicate listen address: {} (frontend: {})",
                frontend.listen, frontend.name
            ));
        }

        if !cluster_names.contains(frontend.cluster.as_str()) {
            errors.push(format!(
                "frontend '{}' references non-existent cluster '{}'",
                frontend.name, frontend.cluster
            ));
        }

        if frontend.protocol == Protocol::Udp {
            if let Some(ref udp) = frontend.udp {
                if udp.backlog_limit == 0 {
                    errors.push(format!(
                        "frontend '{}' has backlog_limit 0 (must be >= 1)",
                        frontend.name
                    ));
                }
                if udp.reap_interval.is_zero() || udp.idle_timeout.is_zero() {
                    errors.push(format!(
                        "frontend '{}' has a zero idle_timeout or reap_interval",
                        frontend.name
                    ));
                }
            }
        }
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_health_defaults(defaults: &HealthCheckDefaults, errors: &mut Vec<String>) {
    check_duration("health_check_defaults.interval", defaults.interval, errors);
    check_duration("health_check_defaults.timeout", defaults.timeout, errors);
    check_threshold(
        "health_check_defaults.unhealthy_threshold",
        defaults.unhealthy_threshold,
        errors,
    );
    check_threshold(
        "health_check_defaults.healthy_threshold",
        defaults.healthy_threshold,
        errors,
    );
}

fn validate_cluster(cluster: &ClusterConfig, errors: &mut Vec<String>) {
    if cluster.name.is_empty() {
        errors.push("cluster name cannot be empty".to_string());
    }

    if cluster.nodes.is_empty() {
        errors.push(format!(
            "cluster '{}' must have at least one node",
            cluster.name
        ));
    }

    let mut addresses = HashSet::new();
    for node in &cluster.nodes {
        if !addresses.insert(node.address) {
            errors.push(format!(
                "duplicate node {} in cluster '{}'",
                node.address, cluster.name
            ));
        }
        if node.weight == 0 {
            errors.push(format!(
                "node {} in cluster '{}' has weight 0 (must be >= 1)",
                node.address, cluster.name
            ));
        }
        if node.max_connections < -1 || node.max_connections > i64::from(u32::MAX) {
            errors.push(format!(
                "node {} in cluster '{}' has max_connections {} (must be between -1 and {})",
                node.address,
                cluster.name,
                node.max_connections,
                u32::MAX
            ));
        }
    }

    let hc = &cluster.health_check;
    if hc.check_type == HealthCheckType::Http && hc.path.is_none() {
        errors.push(format!(
            "cluster '{}' has HTTP health check but no path specified",
            cluster.name
        ));
    }
    if let Some(interval) = hc.interval {
        check_duration(&format!("cluster '{}' health interval", cluster.name), interval, errors);
    }
    if let Some(timeout) = hc.timeout {
        check_duration(&format!("cluster '{}' health timeout", cluster.name), timeout, errors);
    }
    if let Some(threshold) = hc.unhealthy_threshold {
        check_threshold(
            &format!("cluster '{}' unhealthy_threshold", cluster.name),
            threshold,
            errors,
        );
    }
    if let Some(threshold) = hc.healthy_threshold {
        check_threshold(
            &format!("cluster '{}' healthy_threshold", cluster.name),
            threshold,
            errors,
        );
    }

    let persistence = &cluster.persistence;
    if persistence.mode != PersistenceMode::None {
        if persistence.capacity == 0 {
            errors.push(format!(
                "cluster '{}' has persistence capacity 0 (must be >= 1)",
                cluster.name
            ));
        }
        check_duration(
            &format!("cluster '{}' persistence ttl", cluster.name),
            persistence.ttl,
            errors,
        );
    }
}

fn check_duration(what: &str, value: Duration, errors: &mut Vec<String>) {
    if value.is_zero() {
        errors.push(format!("{what} must be greater than zero"));
    }
}

fn check_threshold(what: &str, value: u32, errors: &mut Vec<String>) {
    if value == 0 {
        errors.push(format!("{what} must be >= 1"));
    }
}
