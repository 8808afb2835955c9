#![warn(clippy::dbg_macro, clippy::todo)]

mod certificates;
mod config;
mod metadata;
mod metrics;
mod mutate;
mod owner;
mod pipeline;
mod secrets;
mod store;
mod tls;
mod validate;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use kube::{client::Client, core::admission::SerializePatchError};
use log::{error, info, warn};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    certificates::CertificateCreator,
    config::{Config, ConfigError},
    metadata::Extractor,
    metrics::Metrics,
    mutate::{InitImages, Mutator},
    secrets::{SecretCreator, SecretDeleter},
    store::{ClusterStore, KubeStore},
    tls::ReloadingCert,
    validate::{ProvisioningQueues, Validator},
    webhook::Webhooks,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error("Invalid input: {0}")]
    UserInputError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("CA secret is missing key '{0}'")]
    SecretKeyMissing(String),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Failed to watch certificate files: {0}")]
    WatchError(#[from] notify::Error),
    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
    #[error("HTTP server error: {0}")]
    HttpError(#[from] warp::Error),
    #[error("Worker task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("admission operation ({0}): unsupported operation")]
    UnsupportedOperation(String),
    #[error("shutting down")]
    Cancelled,
    #[error("provisioning queue closed")]
    QueueClosed,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();
    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();
    info!("starting cain {}", env!("CARGO_PKG_VERSION"));

    let result = run(config).await;
    if let Err(e) = &result {
        error!("cain failed: {e}");
    }
    result
}

async fn run(config: Config) -> Result<(), Error> {
    let resources = config.container_resources()?;
    let metrics = Metrics::new(&config.metrics_subsystem)?;

    let client = Client::try_default().await?;
    let kube_store = KubeStore::new(client.clone());
    let ca_secret = kube_store
        .get_secret(client.default_namespace(), config.ca_secret.name())
        .await?;
    let ca_data = secrets::ca_secret_data(&ca_secret, config.ca_secret.keys())?;
    info!(
        "loaded CA secret {}/{}",
        client.default_namespace(),
        config.ca_secret.name()
    );

    let cert = Arc::new(ReloadingCert::new(
        &config.tls_cert_file,
        &config.tls_key_file,
    )?);

    let token = CancellationToken::new();
    let store: Arc<dyn ClusterStore> = Arc::new(kube_store);
    let (secret_creator, secret_creation) = SecretCreator::new(store.clone(), metrics.clone());
    let (secret_deleter, secret_deletion) = SecretDeleter::new(store.clone(), metrics.clone());
    let (certificate_creator, certificate_creation) = CertificateCreator::new(
        store.clone(),
        &config.ca_issuer,
        secret_creation.clone(),
        metrics.clone(),
    );

    let extractor = Extractor::new(&config.metadata_domain, &config.truststore_password);
    let validator = Validator::new(
        extractor.clone(),
        store.clone(),
        config.ca_secret.clone(),
        ca_data,
        ProvisioningQueues {
            secret_creation,
            secret_deletion,
            certificate_creation,
        },
        token.clone(),
    );
    let mutator = Mutator::new(
        extractor,
        store,
        config.ca_secret.clone(),
        InitImages {
            debian: config.debian_image(),
            redhat: config.redhat_image(),
        },
        &config.jvm_env_var,
        resources.to_k8s(),
        token.clone(),
    );
    let hooks = Arc::new(Webhooks {
        validator,
        mutator,
        metrics: metrics.clone(),
    });

    let mut workers = JoinSet::new();
    workers.spawn(secret_creator.run(token.clone()));
    workers.spawn(secret_deleter.run(token.clone()));
    workers.spawn(certificate_creator.run(token.clone()));
    workers.spawn(cert.clone().run(token.clone()));
    workers.spawn(webhook::serve_webhook(
        SocketAddr::from(([0, 0, 0, 0], config.port)),
        hooks,
        cert,
        token.clone(),
    ));
    workers.spawn(webhook::serve_metrics(
        SocketAddr::from(([0, 0, 0, 0], config.metrics_port)),
        metrics,
        token.clone(),
    ));
    tokio::spawn(cancel_on_signal(token.clone()));

    // the first failure stops every other worker
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined.map_err(Error::from).and_then(|x| x) {
            Ok(()) if !token.is_cancelled() => {
                warn!("worker stopped before shutdown, stopping the rest");
                token.cancel();
            }
            Ok(()) => (),
            Err(e) => {
                error!("worker failed: {e}");
                token.cancel();
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
