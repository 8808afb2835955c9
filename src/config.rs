use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use clap::Parser;
use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformatted secret name '{0}', expected <secret name>/<key>[,<key>...]")]
    MisformattedSecretName(String),
    #[error("invalid resource quantity for {field}: '{value}'")]
    InvalidQuantity { field: &'static str, value: String },
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Injects trusted CA certificates into Pods")]
pub struct Config {
    /// The webhook HTTPS port
    #[arg(long, env = "PORT", default_value_t = 8443)]
    pub port: u16,
    /// The metrics HTTP port
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,
    /// The level to log at, any env_logger filter is accepted
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    /// Path to the file containing the TLS certificate
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/run/secrets/tls/tls.crt")]
    pub tls_cert_file: PathBuf,
    /// Path to the file containing the TLS key
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/run/secrets/tls/tls.key")]
    pub tls_key_file: PathBuf,
    /// The domain of the labels and annotations, allows running several injectors side by side
    #[arg(long, env = "METADATA_DOMAIN", default_value = "weisshorn.cyd")]
    pub metadata_domain: String,
    /// The ClusterIssuer to use when creating Certificate resources
    #[arg(long, env = "CA_ISSUER")]
    pub ca_issuer: String,
    /// The default CA secret, <secret name>/<CA key>[,<CA key>...]
    #[arg(long, env = "CA_SECRET")]
    pub ca_secret: CaSecretRef,
    /// The password to use for the JVM truststore
    #[arg(long, env = "TRUSTSTORE_PASSWORD")]
    pub truststore_password: String,
    /// The environment variable used to configure JVM containers
    #[arg(long, env = "JVM_ENV_VAR")]
    pub jvm_env_var: String,
    #[arg(long, env = "REDHAT_INIT_IMAGE", default_value = "ghcr.io/weisshorn-cyd/cain-redhat-init")]
    pub redhat_init_image: String,
    /// Defaults to the injector version
    #[arg(long, env = "REDHAT_INIT_TAG")]
    pub redhat_init_tag: Option<String>,
    #[arg(long, env = "DEBIAN_INIT_IMAGE", default_value = "ghcr.io/weisshorn-cyd/cain-debian-init")]
    pub debian_init_image: String,
    /// Defaults to the injector version
    #[arg(long, env = "DEBIAN_INIT_TAG")]
    pub debian_init_tag: Option<String>,
    #[arg(long, env = "METRICS_SUBSYSTEM", default_value = "")]
    pub metrics_subsystem: String,
    #[arg(long, env = "CPU_LIMIT", default_value = "500m")]
    pub cpu_limit: String,
    #[arg(long, env = "MEM_LIMIT", default_value = "50Mi")]
    pub mem_limit: String,
    /// Defaults to CPU_LIMIT
    #[arg(long, env = "CPU_REQUEST")]
    pub cpu_request: Option<String>,
    /// Defaults to MEM_LIMIT
    #[arg(long, env = "MEM_REQUEST")]
    pub mem_request: Option<String>,
}

impl Config {
    pub fn debian_image(&self) -> String {
        init_image(&self.debian_init_image, self.debian_init_tag.as_deref())
    }

    pub fn redhat_image(&self) -> String {
        init_image(&self.redhat_init_image, self.redhat_init_tag.as_deref())
    }

    pub fn container_resources(&self) -> Result<ContainerResources, ConfigError> {
        ContainerResources::new(
            &self.cpu_limit,
            &self.mem_limit,
            self.cpu_request.as_deref().filter(|x| !x.is_empty()),
            self.mem_request.as_deref().filter(|x| !x.is_empty()),
        )
    }
}

fn init_image(image: &str, tag: Option<&str>) -> String {
    match tag.filter(|x| !x.is_empty()) {
        Some(tag) => format!("{image}:{tag}"),
        None => format!("{image}:{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Reference to the CA secret holding the default CA certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaSecretRef {
    name: String,
    keys: Vec<String>,
}

impl CaSecretRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Name of the per-workload copy of the CA secret.
    pub fn secret_name(&self, root_name: &str) -> String {
        format!("{}-{root_name}", self.name)
    }
}

impl FromStr for CaSecretRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((name, keys)) = s.split_once('/') else {
            return Err(ConfigError::MisformattedSecretName(s.to_string()));
        };
        if keys.contains('/') || name.is_empty() || keys.is_empty() {
            return Err(ConfigError::MisformattedSecretName(s.to_string()));
        }
        Ok(CaSecretRef {
            name: name.to_string(),
            keys: keys.split(',').map(str::to_string).collect(),
        })
    }
}

/// Requests and limits given to the CA init container.
#[derive(Debug, Clone)]
pub struct ContainerResources {
    cpu_limit: Quantity,
    cpu_request: Quantity,
    memory_limit: Quantity,
    memory_request: Quantity,
}

impl ContainerResources {
    /// Requests default to the limits when absent.
    pub fn new(
        cpu_limit: &str,
        mem_limit: &str,
        cpu_request: Option<&str>,
        mem_request: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(ContainerResources {
            cpu_limit: parse_quantity("CPU limit", cpu_limit)?,
            cpu_request: parse_quantity("CPU request", cpu_request.unwrap_or(cpu_limit))?,
            memory_limit: parse_quantity("memory limit", mem_limit)?,
            memory_request: parse_quantity("memory request", mem_request.unwrap_or(mem_limit))?,
        })
    }

    pub fn to_k8s(&self) -> ResourceRequirements {
        let limits: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), self.cpu_limit.clone()),
            ("memory".to_string(), self.memory_limit.clone()),
        ]
        .into_iter()
        .collect();
        let requests: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), self.cpu_request.clone()),
            ("memory".to_string(), self.memory_request.clone()),
        ]
        .into_iter()
        .collect();
        ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        }
    }
}

/// Validates a Kubernetes quantity: `<signed number><suffix>` where the suffix is a
/// binary SI (`Ki`..`Ei`), decimal SI (`n`, `u`, `m`, `k`, `M`..`E`) or decimal exponent.
fn parse_quantity(field: &'static str, value: &str) -> Result<Quantity, ConfigError> {
    let invalid = || ConfigError::InvalidQuantity {
        field,
        value: value.to_string(),
    };

    let unsigned = value
        .strip_prefix('+')
        .or_else(|| value.strip_prefix('-'))
        .unwrap_or(value);
    let number_len = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    if number.is_empty() || number.matches('.').count() > 1 {
        return Err(invalid());
    }
    if whole.is_empty() && fraction.map(str::is_empty).unwrap_or(true) {
        return Err(invalid());
    }

    let valid_suffix = match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        exponent => exponent
            .strip_prefix(['e', 'E'])
            .map(|x| x.strip_prefix(['+', '-']).unwrap_or(x))
            .map(|x| !x.is_empty() && x.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or_default(),
    };
    if !valid_suffix {
        return Err(invalid());
    }

    Ok(Quantity(value.to_string()))
}
