use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use log::warn;

const TRUSTSTORE_MOUNT_PATH: &str = "/jvm-truststore/";
const TRUSTSTORE_FILE: &str = "truststore.jks";

const CA_SECRET_VOLUME_NAME: &str = "ca";
const CA_COMPLETE_VOLUME_NAME: &str = "ca-certs";

/// X.509 common names are limited to 64 characters, certificate issuers reject 64.
const MAX_CN_LENGTH: usize = 63;

pub const ENABLED_VALUE: &str = "true";

/// OS family of a workload's base image, decides how the trust bundle is regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Debian,
    Redhat,
}

/// Family specific trust store locations.
pub struct FamilyLayout {
    /// Where the init container finds the CAs to add.
    pub incoming_ca_path: &'static str,
    /// Directory holding the regenerated bundle, shared with the workload containers.
    pub bundle_dir: &'static str,
    pub bundle_file: &'static str,
}

impl Family {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            Some("redhat") => Family::Redhat,
            _ => Family::Debian,
        }
    }

    pub fn layout(self) -> &'static FamilyLayout {
        match self {
            Family::Debian => &DEBIAN_LAYOUT,
            Family::Redhat => &REDHAT_LAYOUT,
        }
    }
}

static DEBIAN_LAYOUT: FamilyLayout = FamilyLayout {
    incoming_ca_path: "/usr/local/share/ca-certificates/injected",
    bundle_dir: "/etc/ssl/certs/",
    bundle_file: "ca-certificates.crt",
};

static REDHAT_LAYOUT: FamilyLayout = FamilyLayout {
    incoming_ca_path: "/usr/share/pki/ca-trust-source/anchors",
    bundle_dir: "/etc/pki/ca-trust/extracted",
    bundle_file: "ca-bundle.trust.crt",
};

impl FamilyLayout {
    pub fn bundle_path(&self) -> String {
        join_path(self.bundle_dir, self.bundle_file)
    }
}

/// A CA certificate stored in a secret under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraCaSource {
    pub secret_name: String,
    pub key: String,
}

/// Injection settings of one object, resolved from its labels and annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPolicy {
    pub enabled: bool,
    pub family: Family,
    pub jvm_enabled: bool,
    pub python_enabled: bool,
    pub extra_ca_sources: Vec<ExtraCaSource>,
    pub ca_volume_name: String,
    pub secret_volume_name: String,
    pub truststore_password: String,
    pub jvm_mount_dir: String,
    pub jvm_mount_file: String,
}

impl WorkloadPolicy {
    pub fn truststore_path(&self) -> String {
        join_path(&self.jvm_mount_dir, &self.jvm_mount_file)
    }
}

/// Maps object metadata to injection settings. Every key is `cain.<domain>/<name>`.
#[derive(Debug, Clone)]
pub struct Extractor {
    domain: String,
    truststore_password: String,
    enabled_label: String,
    extra_secrets_annotation: String,
    family_annotation: String,
    jvm_annotation: String,
    python_annotation: String,
    ca_volume_name_annotation: String,
    secret_volume_name_annotation: String,
    jvm_common_name_annotation: String,
    truststore_password_annotation: String,
    jvm_path_annotation: String,
}

impl Extractor {
    pub fn new(domain: &str, truststore_password: &str) -> Self {
        let key = |name: &str| format!("cain.{domain}/{name}");
        Extractor {
            domain: domain.to_string(),
            truststore_password: truststore_password.to_string(),
            enabled_label: key("enabled"),
            extra_secrets_annotation: key("extra-ca-secrets"),
            family_annotation: key("family"),
            jvm_annotation: key("jvm"),
            python_annotation: key("python"),
            ca_volume_name_annotation: key("ca-volume-name"),
            secret_volume_name_annotation: key("secret-volume-name"),
            jvm_common_name_annotation: key("jvm-common-name"),
            truststore_password_annotation: key("truststore-password"),
            jvm_path_annotation: key("jvm-path"),
        }
    }

    pub fn policy(&self, meta: &ObjectMeta) -> WorkloadPolicy {
        let (jvm_mount_dir, jvm_mount_file) = self.jvm_path(meta);
        WorkloadPolicy {
            enabled: self.is_injection_enabled(meta),
            family: self.family(meta),
            jvm_enabled: self.is_jvm_enabled(meta),
            python_enabled: self.is_python_enabled(meta),
            extra_ca_sources: self.extra_ca_sources(meta),
            ca_volume_name: self.ca_volume_name(meta),
            secret_volume_name: self.secret_volume_name(meta),
            truststore_password: self.truststore_password(meta),
            jvm_mount_dir,
            jvm_mount_file,
        }
    }

    pub fn is_injection_enabled(&self, meta: &ObjectMeta) -> bool {
        label(meta, &self.enabled_label) == Some(ENABLED_VALUE)
    }

    pub fn family(&self, meta: &ObjectMeta) -> Family {
        Family::from_annotation(annotation(meta, &self.family_annotation))
    }

    pub fn is_jvm_enabled(&self, meta: &ObjectMeta) -> bool {
        annotation(meta, &self.jvm_annotation) == Some(ENABLED_VALUE)
    }

    pub fn is_python_enabled(&self, meta: &ObjectMeta) -> bool {
        annotation(meta, &self.python_annotation) == Some(ENABLED_VALUE)
    }

    /// Parses the comma separated `<secret name>/<key>` list, malformed entries are skipped.
    pub fn extra_ca_sources(&self, meta: &ObjectMeta) -> Vec<ExtraCaSource> {
        let Some(value) = annotation(meta, &self.extra_secrets_annotation) else {
            return vec![];
        };
        value
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .filter_map(|entry| match entry.split_once('/') {
                Some((secret_name, key))
                    if !secret_name.is_empty() && !key.is_empty() && !key.contains('/') =>
                {
                    Some(ExtraCaSource {
                        secret_name: secret_name.to_string(),
                        key: key.to_string(),
                    })
                }
                _ => {
                    warn!("ignoring malformed extra CA secret '{entry}'");
                    None
                }
            })
            .collect()
    }

    pub fn ca_volume_name(&self, meta: &ObjectMeta) -> String {
        annotation(meta, &self.ca_volume_name_annotation)
            .unwrap_or(CA_COMPLETE_VOLUME_NAME)
            .to_string()
    }

    pub fn secret_volume_name(&self, meta: &ObjectMeta) -> String {
        annotation(meta, &self.secret_volume_name_annotation)
            .unwrap_or(CA_SECRET_VOLUME_NAME)
            .to_string()
    }

    /// `<name>.<namespace>.<domain>` unless overridden, keeping the last 63 characters.
    pub fn jvm_common_name(&self, meta: &ObjectMeta) -> String {
        let common_name = match annotation(meta, &self.jvm_common_name_annotation) {
            Some(value) => value.to_string(),
            None => format!(
                "{}.{}.{}",
                meta.name.as_deref().unwrap_or_default(),
                meta.namespace.as_deref().unwrap_or_default(),
                self.domain
            ),
        };
        keep_last_chars(&common_name, MAX_CN_LENGTH)
    }

    pub fn truststore_password(&self, meta: &ObjectMeta) -> String {
        annotation(meta, &self.truststore_password_annotation)
            .unwrap_or(&self.truststore_password)
            .to_string()
    }

    /// Mount directory and file name of the JVM truststore.
    ///
    /// The annotation is split lexically: `/opt/certs/` names the directory
    /// `/opt/certs` and the file `certs`, an empty value gives `.` for both.
    pub fn jvm_path(&self, meta: &ObjectMeta) -> (String, String) {
        match annotation(meta, &self.jvm_path_annotation) {
            Some(value) => (dir_name(value), base_name(value)),
            None => (TRUSTSTORE_MOUNT_PATH.to_string(), TRUSTSTORE_FILE.to_string()),
        }
    }
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    lookup(meta.labels.as_ref(), key)
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    lookup(meta.annotations.as_ref(), key)
}

fn lookup<'a>(map: Option<&'a BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    map.and_then(|x| x.get(key)).map(|x| &**x)
}

fn keep_last_chars(value: &str, max: usize) -> String {
    let count = value.chars().count();
    if count <= max {
        return value.to_string();
    }
    value.chars().skip(count - max).collect()
}

pub fn join_path(dir: &str, file: &str) -> String {
    match (dir.is_empty(), file.is_empty()) {
        (true, true) => String::new(),
        (true, false) => clean_path(file),
        (false, true) => clean_path(dir),
        (false, false) => clean_path(&format!("{dir}/{file}")),
    }
}

/// Everything up to the last `/`, cleaned.
fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => clean_path(&path[..=i]),
        None => ".".to_string(),
    }
}

/// Last element after trailing slashes are dropped.
fn base_name(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Lexical path normalisation: repeated slashes, `.` and resolvable `..` are removed.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => (),
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => (),
                _ => parts.push(".."),
            },
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ObjectMeta {
        let map = |x: &[(&str, &str)]| {
            Some(
                x.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        };
        ObjectMeta {
            name: Some("test".to_string()),
            namespace: Some("default".to_string()),
            labels: map(labels),
            annotations: map(annotations),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        let policy = extractor.policy(&ObjectMeta::default());
        assert!(!policy.enabled);
        assert_eq!(policy.family, Family::Debian);
        assert!(!policy.jvm_enabled);
        assert!(!policy.python_enabled);
        assert!(policy.extra_ca_sources.is_empty());
        assert_eq!(policy.ca_volume_name, "ca-certs");
        assert_eq!(policy.secret_volume_name, "ca");
        assert_eq!(policy.truststore_password, "changeit");
        assert_eq!(policy.jvm_mount_dir, "/jvm-truststore/");
        assert_eq!(policy.jvm_mount_file, "truststore.jks");
        assert_eq!(policy.truststore_path(), "/jvm-truststore/truststore.jks");
        assert_eq!(extractor.jvm_common_name(&ObjectMeta::default()), "..weisshorn.cyd");
    }

    #[test]
    fn test_annotations() {
        let extractor = Extractor::new("example.com", "changeit");
        let meta = meta(
            &[("cain.example.com/enabled", "true")],
            &[
                ("cain.example.com/family", "redhat"),
                ("cain.example.com/jvm", "true"),
                ("cain.example.com/python", "true"),
                ("cain.example.com/extra-ca-secrets", "s1/ca.crt, s2/other.pem,broken"),
                ("cain.example.com/ca-volume-name", "bundle"),
                ("cain.example.com/secret-volume-name", "incoming"),
                ("cain.example.com/truststore-password", "hunter2"),
                ("cain.example.com/jvm-path", "/opt/app/certs/store.jks"),
            ],
        );
        let policy = extractor.policy(&meta);
        assert!(policy.enabled);
        assert_eq!(policy.family, Family::Redhat);
        assert!(policy.jvm_enabled);
        assert!(policy.python_enabled);
        assert_eq!(
            policy.extra_ca_sources,
            vec![
                ExtraCaSource {
                    secret_name: "s1".to_string(),
                    key: "ca.crt".to_string()
                },
                ExtraCaSource {
                    secret_name: "s2".to_string(),
                    key: "other.pem".to_string()
                },
            ]
        );
        assert_eq!(policy.ca_volume_name, "bundle");
        assert_eq!(policy.secret_volume_name, "incoming");
        assert_eq!(policy.truststore_password, "hunter2");
        assert_eq!(policy.jvm_mount_dir, "/opt/app/certs");
        assert_eq!(policy.jvm_mount_file, "store.jks");
        assert_eq!(policy.truststore_path(), "/opt/app/certs/store.jks");
        assert_eq!(extractor.jvm_common_name(&meta), "test.default.example.com");
    }

    #[test]
    fn test_enabled_requires_true() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        assert!(!extractor.is_injection_enabled(&meta(&[("cain.weisshorn.cyd/enabled", "yes")], &[])));
        assert!(!extractor.is_injection_enabled(&meta(&[("enabled", "true")], &[])));
        assert!(extractor.is_injection_enabled(&meta(&[("cain.weisshorn.cyd/enabled", "true")], &[])));
    }

    #[test]
    fn test_unknown_family_is_debian() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        let meta = meta(&[], &[("cain.weisshorn.cyd/family", "alpine")]);
        assert_eq!(extractor.family(&meta), Family::Debian);
    }

    #[test]
    fn test_common_name_truncation() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        let mut long = meta(&[], &[]);
        long.name = Some("a-very-long-deployment-name-that-keeps-going-and-going".to_string());
        long.namespace = Some("some-namespace".to_string());
        let cn = extractor.jvm_common_name(&long);
        assert_eq!(cn.len(), 63);
        assert!(cn.ends_with("-going.some-namespace.weisshorn.cyd"));

        let override_value = format!("x{}", "b".repeat(70));
        let overridden = meta(
            &[],
            &[("cain.weisshorn.cyd/jvm-common-name", override_value.as_str())],
        );
        let cn = extractor.jvm_common_name(&overridden);
        assert_eq!(cn, "b".repeat(63));

        let short = meta(&[], &[("cain.weisshorn.cyd/jvm-common-name", "svc.local")]);
        assert_eq!(extractor.jvm_common_name(&short), "svc.local");
    }

    #[test]
    fn test_jvm_path_relative() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        let meta = meta(&[], &[("cain.weisshorn.cyd/jvm-path", "store.jks")]);
        assert_eq!(
            extractor.jvm_path(&meta),
            (".".to_string(), "store.jks".to_string())
        );
        assert_eq!(join_path(".", "store.jks"), "store.jks");
    }

    #[test]
    fn test_jvm_path_edge_cases() {
        let extractor = Extractor::new("weisshorn.cyd", "changeit");
        let split = |value: &str| {
            extractor.jvm_path(&meta(&[], &[("cain.weisshorn.cyd/jvm-path", value)]))
        };
        let pair = |dir: &str, file: &str| (dir.to_string(), file.to_string());

        assert_eq!(split("/opt/app/certs/"), pair("/opt/app/certs", "certs"));
        assert_eq!(split(""), pair(".", "."));
        assert_eq!(split("/store.jks"), pair("/", "store.jks"));
        assert_eq!(split("/"), pair("/", "/"));
        assert_eq!(split("a//b/../store.jks"), pair("a", "store.jks"));

        assert_eq!(join_path("/opt/app/certs", "certs"), "/opt/app/certs/certs");
        assert_eq!(join_path(".", "."), ".");
        assert_eq!(join_path("/", "store.jks"), "/store.jks");
        assert_eq!(
            join_path("/jvm-truststore/", "truststore.jks"),
            "/jvm-truststore/truststore.jks"
        );
    }

    #[test]
    fn test_family_layout() {
        assert_eq!(
            Family::Debian.layout().bundle_path(),
            "/etc/ssl/certs/ca-certificates.crt"
        );
        assert_eq!(
            Family::Redhat.layout().bundle_path(),
            "/etc/pki/ca-trust/extracted/ca-bundle.trust.crt"
        );
    }
}
