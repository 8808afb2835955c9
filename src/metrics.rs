use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "cainjector";
const RESOURCE_LABELS: &[&str] = &["namespace", "groupVersionKind"];

/// Counters for provisioned resources, labelled by namespace and group/version/kind.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    resource_already_exists: IntCounterVec,
    resource_create_error: IntCounterVec,
    resource_created: IntCounterVec,
    resource_deleted: IntCounterVec,
    resource_not_found: IntCounterVec,
    resource_delete_error: IntCounterVec,
    admission_reviews: IntCounterVec,
}

fn counter(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem),
        labels,
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new(subsystem: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Metrics {
            resource_already_exists: counter(
                &registry,
                subsystem,
                "resource_already_exists_total",
                "Number of times a resource in a namespace already exists",
                RESOURCE_LABELS,
            )?,
            resource_create_error: counter(
                &registry,
                subsystem,
                "resource_create_errors_total",
                "Number of errors when creating a resource in a namespace",
                RESOURCE_LABELS,
            )?,
            resource_created: counter(
                &registry,
                subsystem,
                "resource_created_total",
                "Number of resources created in a namespace",
                RESOURCE_LABELS,
            )?,
            resource_deleted: counter(
                &registry,
                subsystem,
                "resource_deleted_total",
                "Number of resources deleted in a namespace",
                RESOURCE_LABELS,
            )?,
            resource_not_found: counter(
                &registry,
                subsystem,
                "resource_not_found_total",
                "Number of resources not found in a namespace",
                RESOURCE_LABELS,
            )?,
            resource_delete_error: counter(
                &registry,
                subsystem,
                "resource_delete_errors_total",
                "Number of errors deleting a resource in a namespace",
                RESOURCE_LABELS,
            )?,
            admission_reviews: counter(
                &registry,
                subsystem,
                "admission_reviews_total",
                "Number of admission reviews answered by each webhook",
                &["webhook", "operation", "allowed"],
            )?,
            registry,
        })
    }

    pub fn resource_already_exists(&self, ns: &str, gvk: &str) {
        self.resource_already_exists.with_label_values(&[ns, gvk]).inc();
    }

    pub fn resource_create_error(&self, ns: &str, gvk: &str) {
        self.resource_create_error.with_label_values(&[ns, gvk]).inc();
    }

    pub fn resource_created(&self, ns: &str, gvk: &str) {
        self.resource_created.with_label_values(&[ns, gvk]).inc();
    }

    pub fn resource_deleted(&self, ns: &str, gvk: &str) {
        self.resource_deleted.with_label_values(&[ns, gvk]).inc();
    }

    pub fn resource_not_found(&self, ns: &str, gvk: &str) {
        self.resource_not_found.with_label_values(&[ns, gvk]).inc();
    }

    pub fn resource_delete_error(&self, ns: &str, gvk: &str) {
        self.resource_delete_error.with_label_values(&[ns, gvk]).inc();
    }

    pub fn admission_review(&self, webhook: &str, operation: &str, allowed: bool) {
        self.admission_reviews
            .with_label_values(&[webhook, operation, if allowed { "true" } else { "false" }])
            .inc();
    }

    /// Prometheus text exposition of every registered counter.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    #[cfg(test)]
    pub fn count(&self, name: &str, ns: &str, gvk: &str) -> u64 {
        let counter = match name {
            "already_exists" => &self.resource_already_exists,
            "create_error" => &self.resource_create_error,
            "created" => &self.resource_created,
            "deleted" => &self.resource_deleted,
            "not_found" => &self.resource_not_found,
            "delete_error" => &self.resource_delete_error,
            _ => panic!("unknown counter {name}"),
        };
        counter.with_label_values(&[ns, gvk]).get()
    }
}
