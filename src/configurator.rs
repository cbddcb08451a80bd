//! Keeps webhook and CRD conversion registration in line with the installed
//! custom resource definitions.
//!
//! Each pass reads the operator certificate, points every served CRD's
//! conversion at this operator, then rebuilds the validating and mutating
//! webhook configurations from scratch. Rebuilding instead of patching
//! drops any rule a previous pass or a human left behind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiext;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{error, info};

use crate::crd::{all_crds, PgOperatorConfig};
use crate::error::{Error, Result};
use crate::webhook::{webhook_path, CONVERSION, MUTATION, VALIDATION};

/// Storage of the registration objects the configurator owns.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;
    async fn replace_crd(&self, crd: CustomResourceDefinition) -> Result<()>;
    async fn validating(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>>;
    /// Create the configuration, or replace it when it carries a resource version.
    async fn save_validating(&self, config: ValidatingWebhookConfiguration) -> Result<()>;
    async fn mutating(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>>;
    async fn save_mutating(&self, config: MutatingWebhookConfiguration) -> Result<()>;
}

/// Registration store backed by the API server.
pub struct KubeRegistrationStore {
    crds: Api<CustomResourceDefinition>,
    validating: Api<ValidatingWebhookConfiguration>,
    mutating: Api<MutatingWebhookConfiguration>,
}

impl KubeRegistrationStore {
    pub fn new(client: Client) -> Self {
        Self {
            crds: Api::all(client.clone()),
            validating: Api::all(client.clone()),
            mutating: Api::all(client),
        }
    }
}

async fn save<K>(api: &Api<K>, object: K) -> Result<()>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let pp = PostParams::default();
    if object.meta().resource_version.is_some() {
        api.replace(&object.name_any(), &pp, &object).await?;
    } else {
        api.create(&pp, &object).await?;
    }
    Ok(())
}

#[async_trait]
impl RegistrationStore for KubeRegistrationStore {
    async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(self.crds.get_opt(name).await?)
    }

    async fn replace_crd(&self, crd: CustomResourceDefinition) -> Result<()> {
        save(&self.crds, crd).await
    }

    async fn validating(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>> {
        Ok(self.validating.get_opt(name).await?)
    }

    async fn save_validating(&self, config: ValidatingWebhookConfiguration) -> Result<()> {
        save(&self.validating, config).await
    }

    async fn mutating(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>> {
        Ok(self.mutating.get_opt(name).await?)
    }

    async fn save_mutating(&self, config: MutatingWebhookConfiguration) -> Result<()> {
        save(&self.mutating, config).await
    }
}

/// Registration store kept in memory. Saving bumps the resource version.
#[derive(Default)]
pub struct InMemoryRegistrationStore {
    crds: Mutex<BTreeMap<String, CustomResourceDefinition>>,
    validating: Mutex<BTreeMap<String, ValidatingWebhookConfiguration>>,
    mutating: Mutex<BTreeMap<String, MutatingWebhookConfiguration>>,
}

fn bump(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `crds` as if applied by an administrator.
    pub fn with_crds(self, crds: impl IntoIterator<Item = CustomResourceDefinition>) -> Self {
        {
            let mut stored = locked(&self.crds);
            for mut crd in crds {
                bump(&mut crd.metadata);
                stored.insert(crd.name_any(), crd);
            }
        }
        self
    }

    pub fn with_validating(self, mut config: ValidatingWebhookConfiguration) -> Self {
        bump(&mut config.metadata);
        locked(&self.validating).insert(config.name_any(), config);
        self
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(locked(&self.crds).get(name).cloned())
    }

    async fn replace_crd(&self, mut crd: CustomResourceDefinition) -> Result<()> {
        let name = crd.name_any();
        let mut crds = locked(&self.crds);
        if !crds.contains_key(&name) {
            return Err(Error::ResourceMissing(format!("CustomResourceDefinition {name}")));
        }
        bump(&mut crd.metadata);
        crds.insert(name, crd);
        Ok(())
    }

    async fn validating(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>> {
        Ok(locked(&self.validating).get(name).cloned())
    }

    async fn save_validating(&self, mut config: ValidatingWebhookConfiguration) -> Result<()> {
        bump(&mut config.metadata);
        locked(&self.validating).insert(config.name_any(), config);
        Ok(())
    }

    async fn mutating(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>> {
        Ok(locked(&self.mutating).get(name).cloned())
    }

    async fn save_mutating(&self, mut config: MutatingWebhookConfiguration) -> Result<()> {
        bump(&mut config.metadata);
        locked(&self.mutating).insert(config.name_any(), config);
        Ok(())
    }
}

/// The CRDs that get admission and conversion webhooks: every CRD the
/// operator installs except its own configuration kind.
pub fn webhook_crds() -> Vec<CustomResourceDefinition> {
    let excluded = PgOperatorConfig::kind(&());
    all_crds()
        .into_iter()
        .filter(|crd| crd.spec.names.kind != excluded)
        .collect()
}

/// Where the API server reaches the operator.
#[derive(Clone, Debug)]
pub struct ConfiguratorSettings {
    pub operator_name: String,
    pub operator_namespace: String,
    /// PEM certificate presented by the webhook server, published as CA bundle.
    pub certificate_path: PathBuf,
}

pub struct Configurator<S> {
    store: S,
    settings: ConfiguratorSettings,
    crds: Vec<CustomResourceDefinition>,
}

impl<S: RegistrationStore> Configurator<S> {
    pub fn new(store: S, settings: ConfiguratorSettings) -> Self {
        Self {
            store,
            settings,
            crds: webhook_crds(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one sync pass. Every failure is a `WebhookRegistration` error.
    pub async fn sync(&self) -> Result<()> {
        self.sync_registrations().await.map_err(|e| match e {
            Error::WebhookRegistration(_) => e,
            other => Error::registration(other.to_string()),
        })
    }

    /// Sync every `interval` until the process stops. Failures after the
    /// first pass are logged and retried on the next tick.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync().await {
                error!(error = %e, "webhook registration sync failed");
            }
        }
    }

    async fn sync_registrations(&self) -> Result<()> {
        let ca_bundle = self.read_certificate().await?;

        let mut installed = Vec::with_capacity(self.crds.len());
        for expected in &self.crds {
            let name = expected.name_any();
            let crd = self.store.crd(&name).await?.ok_or_else(|| {
                Error::registration(format!("custom resource definition {name} is not installed"))
            })?;
            installed.push(crd);
        }

        for crd in &installed {
            let mut crd = crd.clone();
            crd.spec.preserve_unknown_fields = Some(false);
            crd.spec.conversion = Some(self.conversion(&crd, &ca_bundle));
            self.store.replace_crd(crd).await?;
        }

        let name = &self.settings.operator_name;
        let mut validating = self.store.validating(name).await?.unwrap_or_else(|| {
            ValidatingWebhookConfiguration {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                webhooks: None,
            }
        });
        validating.webhooks = Some(
            installed
                .iter()
                .map(|crd| self.validating_webhook(crd, &ca_bundle))
                .collect(),
        );
        self.store.save_validating(validating).await?;

        let mut mutating = self.store.mutating(name).await?.unwrap_or_else(|| {
            MutatingWebhookConfiguration {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                webhooks: None,
            }
        });
        mutating.webhooks = Some(
            installed
                .iter()
                .map(|crd| self.mutating_webhook(crd, &ca_bundle))
                .collect(),
        );
        self.store.save_mutating(mutating).await?;

        info!(crds = installed.len(), "webhook registration synced");
        Ok(())
    }

    async fn read_certificate(&self) -> Result<ByteString> {
        let path = &self.settings.certificate_path;
        let pem = tokio::fs::read(path).await.map_err(|e| {
            Error::registration(format!(
                "operator certificate {} is not readable: {e}",
                path.display()
            ))
        })?;
        if pem.is_empty() {
            return Err(Error::registration(format!(
                "operator certificate {} is empty",
                path.display()
            )));
        }
        Ok(ByteString(pem))
    }

    fn conversion(
        &self,
        crd: &CustomResourceDefinition,
        ca_bundle: &ByteString,
    ) -> apiext::CustomResourceConversion {
        apiext::CustomResourceConversion {
            strategy: "Webhook".to_string(),
            webhook: Some(apiext::WebhookConversion {
                client_config: Some(apiext::WebhookClientConfig {
                    ca_bundle: Some(ca_bundle.clone()),
                    service: Some(apiext::ServiceReference {
                        name: self.settings.operator_name.clone(),
                        namespace: self.settings.operator_namespace.clone(),
                        path: Some(webhook_path(CONVERSION, &singular(crd))),
                        port: None,
                    }),
                    url: None,
                }),
                conversion_review_versions: vec!["v1".to_string()],
            }),
        }
    }

    fn client_config(&self, phase: &str, crd: &CustomResourceDefinition, ca_bundle: &ByteString) -> WebhookClientConfig {
        WebhookClientConfig {
            ca_bundle: Some(ca_bundle.clone()),
            service: Some(ServiceReference {
                name: self.settings.operator_name.clone(),
                namespace: self.settings.operator_namespace.clone(),
                path: Some(webhook_path(phase, &singular(crd))),
                port: None,
            }),
            url: None,
        }
    }

    fn validating_webhook(&self, crd: &CustomResourceDefinition, ca_bundle: &ByteString) -> ValidatingWebhook {
        ValidatingWebhook {
            name: format!("{}.validating-webhook.{}", singular(crd), crd.spec.group),
            admission_review_versions: vec!["v1".to_string()],
            client_config: self.client_config(VALIDATION, crd, ca_bundle),
            failure_policy: Some("Fail".to_string()),
            side_effects: "None".to_string(),
            rules: Some(vec![rule(crd, &["CREATE", "UPDATE", "DELETE"])]),
            ..Default::default()
        }
    }

    fn mutating_webhook(&self, crd: &CustomResourceDefinition, ca_bundle: &ByteString) -> MutatingWebhook {
        MutatingWebhook {
            name: format!("{}.mutating-webhook.{}", singular(crd), crd.spec.group),
            admission_review_versions: vec!["v1".to_string()],
            client_config: self.client_config(MUTATION, crd, ca_bundle),
            failure_policy: Some("Fail".to_string()),
            side_effects: "None".to_string(),
            rules: Some(vec![rule(crd, &["CREATE", "UPDATE"])]),
            ..Default::default()
        }
    }
}

fn singular(crd: &CustomResourceDefinition) -> String {
    crd.spec
        .names
        .singular
        .clone()
        .unwrap_or_else(|| crd.spec.names.kind.to_ascii_lowercase())
}

fn rule(crd: &CustomResourceDefinition, operations: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![crd.spec.group.clone()]),
        api_versions: Some(vec!["*".to_string()]),
        operations: Some(operations.iter().map(|op| op.to_string()).collect()),
        resources: Some(vec![crd.spec.names.plural.clone()]),
        scope: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PgCluster;
    use kube::CustomResourceExt;

    fn certificate(test: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pgstack-configurator-{test}-{}.crt",
            std::process::id()
        ));
        std::fs::write(&path, "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n")
            .unwrap();
        path
    }

    fn settings(certificate_path: PathBuf) -> ConfiguratorSettings {
        ConfiguratorSettings {
            operator_name: "pgstack-operator".to_string(),
            operator_namespace: "pgstack".to_string(),
            certificate_path,
        }
    }

    #[test]
    fn test_operator_config_is_excluded() {
        let kinds: Vec<String> = webhook_crds().into_iter().map(|c| c.spec.names.kind).collect();
        assert!(kinds.contains(&"PgCluster".to_string()));
        assert!(!kinds.contains(&"PgOperatorConfig".to_string()));
    }

    #[tokio::test]
    async fn test_sync_registers_every_served_crd() {
        let store = InMemoryRegistrationStore::new().with_crds(all_crds());
        let configurator = Configurator::new(store, settings(certificate("register")));
        configurator.sync().await.unwrap();

        let validating = configurator.store.validating("pgstack-operator").await.unwrap().unwrap();
        let webhooks = validating.webhooks.unwrap();
        assert_eq!(webhooks.len(), webhook_crds().len());
        let cluster = &webhooks[0];
        assert_eq!(cluster.name, "pgcluster.validating-webhook.pgstack.io");
        assert_eq!(cluster.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(cluster.side_effects, "None");
        let service = cluster.client_config.service.as_ref().unwrap();
        assert_eq!(service.namespace, "pgstack");
        assert_eq!(service.path.as_deref(), Some("/pgstack/validation/pgcluster"));
        let rules = cluster.rules.as_ref().unwrap();
        assert_eq!(
            rules[0].operations.as_deref(),
            Some(&["CREATE".to_string(), "UPDATE".to_string(), "DELETE".to_string()][..])
        );

        let mutating = configurator.store.mutating("pgstack-operator").await.unwrap().unwrap();
        let rules = mutating.webhooks.unwrap()[0].rules.clone().unwrap();
        assert_eq!(rules[0].operations.as_ref().unwrap().len(), 2);

        let crd = configurator
            .store
            .crd(&PgCluster::crd_name().to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(crd.spec.preserve_unknown_fields, Some(false));
        let conversion = crd.spec.conversion.unwrap();
        assert_eq!(conversion.strategy, "Webhook");
        let path = conversion.webhook.unwrap().client_config.unwrap().service.unwrap().path;
        assert_eq!(path.as_deref(), Some("/pgstack/conversion/pgcluster"));
    }

    #[tokio::test]
    async fn test_stale_rules_are_dropped() {
        let stale = ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some("pgstack-operator".to_string()),
                ..Default::default()
            },
            webhooks: Some(vec![ValidatingWebhook {
                name: "retired.validating-webhook.pgstack.io".to_string(),
                ..Default::default()
            }]),
        };
        let store = InMemoryRegistrationStore::new()
            .with_crds(all_crds())
            .with_validating(stale);
        let configurator = Configurator::new(store, settings(certificate("stale")));
        configurator.sync().await.unwrap();

        let validating = configurator.store.validating("pgstack-operator").await.unwrap().unwrap();
        assert!(validating
            .webhooks
            .unwrap()
            .iter()
            .all(|w| !w.name.starts_with("retired")));
    }

    #[tokio::test]
    async fn test_missing_certificate_is_fatal() {
        let store = InMemoryRegistrationStore::new().with_crds(all_crds());
        let configurator = Configurator::new(
            store,
            settings(PathBuf::from("/nonexistent/pgstack/tls.crt")),
        );
        let err = configurator.sync().await.unwrap_err();
        assert!(matches!(err, Error::WebhookRegistration(_)));
        assert!(configurator.store.validating("pgstack-operator").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_crd_is_fatal() {
        let store = InMemoryRegistrationStore::new().with_crds(vec![PgCluster::crd()]);
        let configurator = Configurator::new(store, settings(certificate("missing")));
        let err = configurator.sync().await.unwrap_err();
        assert!(err.to_string().contains("is not installed"));
    }
}
