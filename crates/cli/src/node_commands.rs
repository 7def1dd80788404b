use std::{path::Path, sync::Arc};

use {
    anyhow::Result,
    cadence_config::{CadenceConfig, OwnershipConfig, validate::validate_config},
    cadence_metrics::{MetricsHandle, MetricsRecorderConfig, init_metrics},
    cadence_scheduler::{LoggingRunner, ScheduledJobsStats, ownership_from_config},
    chrono::Utc,
    tracing::{debug, info, warn},
};

use crate::node::Node;

fn metrics_recorder(config: &CadenceConfig, node: &Node) -> Result<MetricsHandle> {
    let mut global_labels: Vec<(String, String)> = config
        .metrics
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    global_labels.push(("node".into(), node.node_id.to_string()));
    Ok(init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels,
    })?)
}

/// Run a node until Ctrl-C. SIGHUP reloads the configuration file.
pub async fn run(config: CadenceConfig, config_path: Option<&Path>) -> Result<()> {
    for diagnostic in validate_config(&config) {
        warn!(
            severity = ?diagnostic.severity,
            path = %diagnostic.path,
            "{}",
            diagnostic.message
        );
    }
    let node = Node::build(&config, Arc::new(LoggingRunner)).await?;
    let metrics = metrics_recorder(&config, &node)?;
    node.start().await;
    info!(node_id = %node.node_id, "node running, press Ctrl-C to stop");

    let mut ownership = config.ownership;

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            },
            _ = reload => reload_config(&node, config_path, &mut ownership),
        }
    }

    info!("shutting down");
    node.stop().await;
    let rendered = metrics.render();
    if !rendered.is_empty() {
        debug!(metrics = %rendered, "final metrics");
    }
    Ok(())
}

fn reload_config(node: &Node, path: Option<&Path>, ownership: &mut OwnershipConfig) {
    let config = match crate::load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping current settings");
            return;
        },
    };
    let settings_changed = node.settings.update(config.scheduled_jobs);
    let ownership_changed = *ownership != config.ownership;
    if ownership_changed {
        let generation = node
            .ownership
            .replace(ownership_from_config(&node.node_id, &config.ownership));
        *ownership = config.ownership;
        info!(generation, "ownership reloaded");
    }
    info!(settings_changed, ownership_changed, "configuration reloaded");
}

/// Run one sweep against the configured store and print the node's stats.
pub async fn stats(config: CadenceConfig, prometheus: bool) -> Result<()> {
    let node = Node::build(&config, Arc::new(LoggingRunner)).await?;
    let metrics = metrics_recorder(&config, &node)?;

    let report = match node.sweeper.sweep().await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(error = %e, "sweep failed");
            None
        },
    };
    let stats =
        ScheduledJobsStats::collect(node.node_id.clone(), &node.scheduler, &node.sweeper, Utc::now())
            .await;

    let output = serde_json::json!({
        "sweep": report,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    if prometheus {
        print!("{}", metrics.render());
    }
    Ok(())
}
