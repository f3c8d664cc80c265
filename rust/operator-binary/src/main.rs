mod cluster_state;
mod compartments;
mod config;
mod configmaps;
mod controller;
mod crd;
mod dal;
mod drain;
mod event_handler;
mod events;
mod graph;
mod metrics;
mod picker;
mod pods;
mod state_machine;
mod wrapper;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::{
    runtime::{
        events::{Recorder, Reporter},
        watcher, Controller,
    },
    Api, Client, CustomResourceExt,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::OperatorConfig,
    controller::Ctx,
    crd::{deployment_policy::DeploymentPolicy, Skyhook},
    dal::Dal,
    events::EventPublisher,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const OPERATOR_NAME: &str = "skyhook-operator";

#[derive(Parser)]
#[clap(about, author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the CRD schemas to stdout.
    Crd,
    /// Run the operator.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&Skyhook::crd())?);
            println!("---");
            print!("{}", serde_yaml::to_string(&DeploymentPolicy::crd())?);
        }
        Command::Run => run().await?,
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = built_info::PKG_VERSION,
        git = built_info::GIT_VERSION.unwrap_or("unknown"),
        target = built_info::TARGET,
        "starting skyhook operator"
    );

    let config = OperatorConfig::from_env()?;
    info!(
        namespace = %config.namespace,
        interval = ?config.max_interval,
        webhook_secret = %config.webhook_secret_name,
        webhook_service = %config.webhook_service_name,
        "operator configuration loaded"
    );
    let client = Client::try_default().await?;
    let dal = Dal::new(client.clone(), &config.namespace);
    let events = EventPublisher::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: None,
        },
    ));

    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    let skyhook_controller = Controller::new(skyhooks.clone(), watcher::Config::default());

    let node_store = skyhook_controller.store();
    let policy_store = skyhook_controller.store();
    let fanout_store = skyhook_controller.store();

    skyhook_controller
        .owns(
            Api::<ConfigMap>::namespaced(client.clone(), &config.namespace),
            watcher::Config::default(),
        )
        .watches(
            Api::<Pod>::namespaced(client.clone(), &config.namespace),
            watcher::Config::default(),
            |pod| event_handler::pod_to_skyhook(&pod),
        )
        .watches(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            move |node| event_handler::node_to_skyhooks(&node_store, &node),
        )
        .watches(
            Api::<DeploymentPolicy>::all(client.clone()),
            watcher::Config::default(),
            move |policy| event_handler::policy_to_skyhooks(&policy_store, &policy),
        )
        .watches(skyhooks, watcher::Config::default(), move |_| {
            event_handler::skyhook_fanout(&fanout_store)
        })
        .shutdown_on_signal()
        .run(
            controller::reconcile,
            controller::error_policy,
            Arc::new(Ctx {
                dal,
                config,
                events,
            }),
        )
        .for_each_concurrent(4, |result| async move {
            match result {
                Ok((object, _action)) => debug!(object = %object, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}
