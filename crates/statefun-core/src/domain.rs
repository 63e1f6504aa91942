// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domains: named cluster partitions and their routing fabric.
//!
//! A domain owns a key-value bucket (`<domain>_<cache_id>_cache_bucket`), the
//! context store on top of it, and, when it routes, three streams:
//!
//! | Stream | Lives in | Captures |
//! |--------|----------|----------|
//! | `hub_events` | hub only | `signal.>` |
//! | `domain_ingress` | every domain | sourced from `hub_events`, filtered to `signal.<domain>.>` |
//! | `domain_egress` | every domain | `$SE.<domain>.>` |
//! | `domain_dlq` | every domain | `dlq.<domain>` (unroutable messages) |
//!
//! # Object IDs
//!
//! IDs may carry their domain: `<domain>/<id>`. A *shadow* ID
//! `<domain>/<home>#<id>` stands in for object `<home>/<id>` inside `<domain>`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, KeyValueBucket, KeyValueConfig, StreamConfig, StreamSource};
use crate::context_store::{ContextStore, KvContextStore};
use crate::error::{Result, StatefunError};
use crate::kv_mutex::KvMutex;
use crate::lock_unpoisoned as lock;
use crate::router::{Router, RouterKind};

/// Hub domain name when neither the account nor the config names one.
pub const DEFAULT_HUB_DOMAIN: &str = "hub";
/// Separates the domain from the rest of an object ID.
pub const OBJECT_ID_DOMAIN_SEPARATOR: char = '/';
/// Separates the home domain from the base ID inside a shadow ID.
pub const SHADOW_ID_SEPARATOR: char = '#';

pub(crate) const HUB_EVENTS_STREAM: &str = "hub_events";
pub(crate) const DOMAIN_INGRESS_STREAM: &str = "domain_ingress";
pub(crate) const DOMAIN_EGRESS_STREAM: &str = "domain_egress";
pub(crate) const DOMAIN_DLQ_STREAM: &str = "domain_dlq";

/// One partition of the cluster.
pub struct Domain {
    name: String,
    hub_domain: String,
    broker: Arc<dyn Broker>,
    cache_id: String,
    replicas: usize,
    kv_mutex_poll_interval: Duration,
    weak_cluster_domains: Mutex<BTreeSet<String>>,
    services: OnceLock<DomainServices>,
}

struct DomainServices {
    bucket: Arc<dyn KeyValueBucket>,
    kv_mutex: KvMutex,
    context_store: Arc<dyn ContextStore>,
}

impl Domain {
    /// Resolve the domain of `broker`'s account.
    ///
    /// The account domain wins; without one this runtime is the hub. An empty
    /// `hub_domain` falls back to the account domain, then to `hub`.
    pub fn new(
        broker: Arc<dyn Broker>,
        hub_domain: &str,
        cache_id: impl Into<String>,
        replicas: usize,
        kv_mutex_poll_interval: Duration,
    ) -> Self {
        let account = broker.account_domain().filter(|d| !d.is_empty());
        let (name, hub_domain) = match (account, hub_domain.is_empty()) {
            (None, true) => (DEFAULT_HUB_DOMAIN.to_string(), DEFAULT_HUB_DOMAIN.to_string()),
            (None, false) => (hub_domain.to_string(), hub_domain.to_string()),
            (Some(account), true) => (account.clone(), account),
            (Some(account), false) => (account, hub_domain.to_string()),
        };

        Self {
            weak_cluster_domains: Mutex::new(BTreeSet::from([name.clone()])),
            name,
            hub_domain,
            broker,
            cache_id: cache_id.into(),
            replicas,
            kv_mutex_poll_interval,
            services: OnceLock::new(),
        }
    }

    /// This domain's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hub domain's name.
    pub fn hub_domain(&self) -> &str {
        &self.hub_domain
    }

    /// Whether this domain is the hub.
    pub fn is_hub(&self) -> bool {
        self.name == self.hub_domain
    }

    /// Broker connection.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Name of the domain bucket.
    pub fn bucket_name(&self) -> String {
        format!("{}_{}_cache_bucket", self.name, self.cache_id)
    }

    fn services(&self) -> Result<&DomainServices> {
        self.services
            .get()
            .ok_or_else(|| StatefunError::DomainNotStarted(self.name.clone()))
    }

    /// The domain bucket.
    pub fn kv(&self) -> Result<Arc<dyn KeyValueBucket>> {
        Ok(self.services()?.bucket.clone())
    }

    /// Distributed mutex over the domain bucket.
    pub fn kv_mutex(&self) -> Result<&KvMutex> {
        Ok(&self.services()?.kv_mutex)
    }

    /// Context store of this domain.
    pub fn context_store(&self) -> Result<Arc<dyn ContextStore>> {
        Ok(self.services()?.context_store.clone())
    }

    /// Provision the bucket and, when `handles_routers`, the routing streams
    /// and router tasks. Idempotent across processes: everything is created
    /// only if missing.
    pub(crate) async fn start(
        &self,
        handles_routers: bool,
        context_store: Option<Arc<dyn ContextStore>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let bucket_name = self.bucket_name();
        let bucket = match self.broker.key_value(&bucket_name).await {
            Ok(bucket) => bucket,
            Err(BrokerError::BucketNotFound(_)) => {
                debug!(bucket = %bucket_name, "Creating domain bucket");
                self.broker
                    .create_key_value(KeyValueConfig {
                        bucket: bucket_name.clone(),
                        replicas: self.replicas,
                    })
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let context_store =
            context_store.unwrap_or_else(|| Arc::new(KvContextStore::new(bucket.clone())));
        let services = DomainServices {
            kv_mutex: KvMutex::new(bucket.clone(), self.kv_mutex_poll_interval),
            bucket,
            context_store,
        };
        if self.services.set(services).is_err() {
            warn!(domain = %self.name, "Domain already started");
        }

        let mut routers = Vec::new();
        if handles_routers {
            self.create_routing_streams().await?;
            for kind in [RouterKind::Ingress, RouterKind::Egress] {
                let router = Router::new(kind, self.broker.clone(), &self.name);
                router.provision().await?;
                routers.push(router.spawn(cancel.child_token()).await?);
            }
        }

        info!(
            domain = %self.name,
            hub = %self.hub_domain,
            bucket = %bucket_name,
            routers = handles_routers,
            "Domain started"
        );
        Ok(routers)
    }

    async fn create_routing_streams(&self) -> Result<()> {
        if self.is_hub() {
            self.ensure_stream(StreamConfig {
                name: HUB_EVENTS_STREAM.to_string(),
                subjects: vec!["signal.>".to_string()],
                sources: Vec::new(),
                replicas: self.replicas,
            })
            .await?;
        }

        self.ensure_stream(StreamConfig {
            name: DOMAIN_INGRESS_STREAM.to_string(),
            subjects: Vec::new(),
            sources: vec![StreamSource {
                name: HUB_EVENTS_STREAM.to_string(),
                filter_subject: Some(format!("signal.{}.>", self.name)),
                external_domain: (!self.is_hub()).then(|| self.hub_domain.clone()),
            }],
            replicas: self.replicas,
        })
        .await?;

        self.ensure_stream(StreamConfig {
            name: DOMAIN_EGRESS_STREAM.to_string(),
            subjects: vec![format!("$SE.{}.>", self.name)],
            sources: Vec::new(),
            replicas: self.replicas,
        })
        .await?;

        self.ensure_stream(StreamConfig {
            name: DOMAIN_DLQ_STREAM.to_string(),
            subjects: vec![dlq_subject(&self.name)],
            sources: Vec::new(),
            replicas: self.replicas,
        })
        .await
    }

    /// Create a stream unless one with the same name exists.
    pub(crate) async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        let existing = self.broker.stream_names().await?;
        if existing.contains(&config.name) {
            return Ok(());
        }
        debug!(domain = %self.name, stream = %config.name, "Creating stream");
        self.broker.add_stream(config).await?;
        Ok(())
    }

    /// Domain an object ID belongs to; IDs without one belong to this domain.
    pub fn get_domain_from_object_id(&self, object_id: &str) -> String {
        let mut tokens = object_id.split(OBJECT_ID_DOMAIN_SEPARATOR);
        match (tokens.next(), tokens.next()) {
            (Some(domain), Some(_)) => {
                if tokens.next().is_some() {
                    warn!(object_id = %object_id, "Object ID with multiple domains");
                }
                domain.to_string()
            }
            _ => self.name.clone(),
        }
    }

    /// `<domain>/<id>` → `<id>`.
    pub fn id_without_domain(object_id: &str) -> &str {
        object_id
            .rsplit_once(OBJECT_ID_DOMAIN_SEPARATOR)
            .map_or(object_id, |(_, id)| id)
    }

    /// Put `object_id` into `domain`. An existing domain is kept unless
    /// `replace` is set.
    pub fn create_object_id_with_domain(domain: &str, object_id: &str, replace: bool) -> String {
        let base = Self::id_without_domain(object_id);
        if replace || base == object_id {
            format!("{domain}{OBJECT_ID_DOMAIN_SEPARATOR}{base}")
        } else {
            object_id.to_string()
        }
    }

    /// [`create_object_id_with_domain`](Self::create_object_id_with_domain) with this domain.
    pub fn create_object_id_with_this_domain(&self, object_id: &str, replace: bool) -> String {
        Self::create_object_id_with_domain(&self.name, object_id, replace)
    }

    /// [`create_object_id_with_domain`](Self::create_object_id_with_domain) with the hub domain.
    pub fn create_object_id_with_hub_domain(&self, object_id: &str, replace: bool) -> String {
        Self::create_object_id_with_domain(&self.hub_domain, object_id, replace)
    }

    /// `<store_domain>/<target_domain>#<id>`
    pub fn create_custom_shadow_id(store_domain: &str, target_domain: &str, id: &str) -> String {
        format!("{store_domain}{OBJECT_ID_DOMAIN_SEPARATOR}{target_domain}{SHADOW_ID_SEPARATOR}{id}")
    }

    /// Shadow ID, inside this domain, of an object living elsewhere.
    ///
    /// `other/obj` → `this/other#obj`; `this/obj` is returned unchanged.
    pub fn shadow_object_shadow_id(&self, object_id: &str) -> String {
        let object_domain = self.get_domain_from_object_id(object_id);
        if object_domain == self.name {
            return object_id.to_string();
        }
        Self::create_custom_shadow_id(&self.name, &object_domain, Self::id_without_domain(object_id))
    }

    /// `<any>/<home>#<id>` → `(home, id)`.
    pub fn shadow_object_domain_and_id(shadow_id: &str) -> Result<(String, String)> {
        match Self::id_without_domain(shadow_id).split_once(SHADOW_ID_SEPARATOR) {
            Some((home, id)) if !home.is_empty() && !id.is_empty() => {
                Ok((home.to_string(), id.to_string()))
            }
            _ => Err(StatefunError::InvalidObjectId(shadow_id.to_string())),
        }
    }

    /// Whether `object_id` is a shadow ID.
    pub fn is_shadow_object(object_id: &str) -> bool {
        Self::shadow_object_domain_and_id(object_id).is_ok()
    }

    /// Normalize a shadow ID as seen from this domain.
    ///
    /// A shadow of one of our own objects collapses to `this/<id>`; a foreign
    /// object stored in its own home domain becomes a shadow here. Everything
    /// else is returned unchanged.
    pub fn valid_object_id(&self, object_id: &str) -> String {
        let Ok((home, id)) = Self::shadow_object_domain_and_id(object_id) else {
            return object_id.to_string();
        };
        if home == self.name {
            return format!("{}{OBJECT_ID_DOMAIN_SEPARATOR}{id}", self.name);
        }
        if self.get_domain_from_object_id(object_id) == home {
            return Self::create_custom_shadow_id(&self.name, &home, &id);
        }
        object_id.to_string()
    }

    /// Domains in this domain's weak cluster, this one included.
    pub fn weak_cluster_domains(&self) -> Vec<String> {
        lock(&self.weak_cluster_domains).iter().cloned().collect()
    }

    /// Replace the weak cluster. This domain is always a member.
    pub fn set_weak_cluster_domains<I, S>(&self, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: BTreeSet<String> = domains.into_iter().map(Into::into).collect();
        members.insert(self.name.clone());
        *lock(&self.weak_cluster_domains) = members;
    }

    /// Whether `domain` belongs to this domain's weak cluster.
    pub fn is_weak_cluster_domain(&self, domain: &str) -> bool {
        lock(&self.weak_cluster_domains).contains(domain)
    }
}

/// Subject carrying dead letters of `domain`.
pub(crate) fn dlq_subject(domain: &str) -> String {
    format!("dlq.{domain}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryCluster;

    fn domain(name: &str, hub: &str) -> Domain {
        let cluster = MemoryCluster::new();
        Domain::new(cluster.connect(name), hub, "kv", 1, Duration::from_millis(10))
    }

    #[test]
    fn test_name_resolution() {
        let leaf = domain("leaf", "hub");
        assert_eq!(leaf.name(), "leaf");
        assert_eq!(leaf.hub_domain(), "hub");
        assert!(!leaf.is_hub());
        assert_eq!(leaf.bucket_name(), "leaf_kv_cache_bucket");

        let hub = domain("hub", "");
        assert_eq!(hub.hub_domain(), "hub");
        assert!(hub.is_hub());

        let empty_account = domain("", "root");
        assert_eq!(empty_account.name(), "root");
        assert!(empty_account.is_hub());

        let defaults = domain("", "");
        assert_eq!(defaults.name(), DEFAULT_HUB_DOMAIN);
    }

    #[test]
    fn test_object_id_helpers() {
        let d = domain("a", "hub");
        assert_eq!(d.get_domain_from_object_id("b/obj"), "b");
        assert_eq!(d.get_domain_from_object_id("obj"), "a");
        assert_eq!(Domain::id_without_domain("b/obj"), "obj");
        assert_eq!(Domain::id_without_domain("obj"), "obj");

        assert_eq!(Domain::create_object_id_with_domain("c", "obj", false), "c/obj");
        assert_eq!(Domain::create_object_id_with_domain("c", "b/obj", false), "b/obj");
        assert_eq!(Domain::create_object_id_with_domain("c", "b/obj", true), "c/obj");
        assert_eq!(d.create_object_id_with_this_domain("obj", false), "a/obj");
        assert_eq!(d.create_object_id_with_hub_domain("a/obj", true), "hub/obj");
    }

    #[test]
    fn test_shadow_ids() {
        let d = domain("a", "hub");
        assert_eq!(d.shadow_object_shadow_id("b/obj"), "a/b#obj");
        assert_eq!(d.shadow_object_shadow_id("a/obj"), "a/obj");

        assert_eq!(
            Domain::shadow_object_domain_and_id("a/b#obj").unwrap(),
            ("b".to_string(), "obj".to_string())
        );
        assert!(Domain::shadow_object_domain_and_id("a/obj").is_err());
        assert!(Domain::shadow_object_domain_and_id("a/#obj").is_err());
        assert!(Domain::is_shadow_object("x/b#obj"));
        assert!(!Domain::is_shadow_object("x/obj"));

        assert_eq!(d.valid_object_id("b/a#obj"), "a/obj");
        assert_eq!(d.valid_object_id("b/b#obj"), "a/b#obj");
        assert_eq!(d.valid_object_id("a/b#obj"), "a/b#obj");
        assert_eq!(d.valid_object_id("c/obj"), "c/obj");
    }

    #[test]
    fn test_weak_cluster_always_contains_self() {
        let d = domain("a", "hub");
        assert_eq!(d.weak_cluster_domains(), vec!["a".to_string()]);

        d.set_weak_cluster_domains(["c", "b"]);
        assert_eq!(d.weak_cluster_domains(), vec!["a", "b", "c"]);
        assert!(d.is_weak_cluster_domain("b"));
        assert!(!d.is_weak_cluster_domain("z"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let cluster = MemoryCluster::new();
        let cancel = CancellationToken::new();

        let first = Domain::new(cluster.connect("hub"), "hub", "kv", 1, Duration::from_millis(10));
        assert!(matches!(first.kv(), Err(StatefunError::DomainNotStarted(_))));
        let routers = first.start(true, None, &cancel).await.unwrap();
        assert_eq!(routers.len(), 2);

        let second = Domain::new(cluster.connect("hub"), "hub", "kv", 1, Duration::from_millis(10));
        second.start(true, None, &cancel).await.unwrap();

        let mut streams = second.broker().stream_names().await.unwrap();
        streams.sort();
        assert_eq!(
            streams,
            vec!["domain_dlq", "domain_egress", "domain_ingress", "hub_events"]
        );

        first.kv().unwrap().put("k", b"v".to_vec()).await.unwrap();
        assert!(second.kv().unwrap().get("k").await.unwrap().is_some());
        cancel.cancel();
    }
}
