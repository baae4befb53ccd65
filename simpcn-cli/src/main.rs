use self::parsing::{create_runtime, load_inputs, Cli, NodeInputs};
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use simpcn_lib::clock::Clock;
use simpcn_lib::driver::TransactionDriver;
use simpcn_lib::node::start_tcp_node;
use simpcn_lib::SimulationCfg;
use std::time::Duration;
use tokio::select;
use triggered::Listener;

pub mod parsing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level("simpcn_lib", cli.log_level)
        .with_module_level("simpcn_cli", cli.log_level)
        .init()?;

    let cfg = SimulationCfg::try_from(&cli)?;
    let NodeInputs {
        info,
        neighbors,
        topology,
        transactions,
        routing_table,
    } = load_inputs(&cli)?;

    let runtime = create_runtime(&cli)?;
    let trigger = runtime.shutdown_trigger.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutting down node.");
        trigger.trigger();
    })?;

    let mut node = start_tcp_node(info, &neighbors, runtime.clone()).await?;
    let local = node.info().id;

    log::info!(
        "Node {local} waiting {}s for the network to start.",
        cli.startup_delay_secs
    );
    wait_or_shutdown(
        runtime.clock.as_ref(),
        Duration::from_secs(cli.startup_delay_secs),
        &runtime.shutdown_listener,
    )
    .await;

    let network = node.network(cfg.reply_timeout)?;
    let mut driver = TransactionDriver::new(
        local,
        &cfg,
        network,
        topology,
        routing_table,
        runtime.clock.clone(),
        runtime.shutdown_listener.clone(),
    )?;

    let summary = match driver.run(&transactions).await {
        Ok(summary) => summary,
        Err(e) => {
            log::error!("Node {local} stopped routing: {e}.");
            drop(driver);
            node.shutdown().await;
            return Err(e.into());
        },
    };
    drop(driver);
    log::info!("{summary}");

    // Neighbors may still be forwarding through our channels, so counts are only read once they have settled.
    wait_or_shutdown(
        runtime.clock.as_ref(),
        Duration::from_secs(cli.settle_delay_secs),
        &runtime.shutdown_listener,
    )
    .await;

    for report in node.channel_reports().await {
        log::info!("{report}");
    }
    println!("{}", summary.finished_line(&node.message_counts().await));

    node.shutdown().await;
    Ok(())
}

/// Sleeps on the clock provided unless shutdown is triggered first.
async fn wait_or_shutdown(clock: &dyn Clock, wait: Duration, shutdown: &Listener) {
    select! {
        biased;
        _ = shutdown.clone() => log::info!("Shutdown requested while waiting."),
        _ = clock.sleep(wait) => {},
    }
}
