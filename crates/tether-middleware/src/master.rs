//! Topic registry surface.
//!
//! Publishers and subscribers talk to the registry only through
//! [`MasterProxy`]. [`LocalMaster`] is the in-process implementation used by
//! tests, the CLI demo and single-process deployments.
//!
//! # Subscriptions
//!
//! A subscriber hands the master an unbounded sender. Every change to the
//! topic's sources is pushed into it: a publish delivers the new
//! [`TopicInfo`], an unpublish delivers the same info with
//! [`TopicStatus::Unregistered`]. Subscribing to a topic that is already
//! published delivers its info immediately.
//!
//! Service clients are tracked the same way: registering a service server
//! pushes its [`ServiceInfo`] to every client of that service, and
//! unregistering pushes it again with [`ServiceStatus::Unregistered`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_types::{NodeInfo, Result, ServiceInfo, ServiceStatus, TetherError, TopicInfo, TopicStatus};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Sink for topic source changes.
pub type TopicInfoSink = mpsc::UnboundedSender<TopicInfo>;

/// Sink for service server changes.
pub type ServiceInfoSink = mpsc::UnboundedSender<ServiceInfo>;

#[async_trait]
pub trait MasterProxy: Send + Sync {
    async fn publish_topic(&self, node: &NodeInfo, topic_info: TopicInfo) -> Result<()>;

    async fn unpublish_topic(&self, node: &NodeInfo, topic: &str) -> Result<()>;

    async fn subscribe_topic(&self, node: &NodeInfo, topic: &str, sink: TopicInfoSink) -> Result<()>;

    async fn unsubscribe_topic(&self, node: &NodeInfo, topic: &str) -> Result<()>;

    async fn register_service_server(&self, node: &NodeInfo, service_info: ServiceInfo) -> Result<()>;

    async fn unregister_service_server(&self, node: &NodeInfo, service: &str) -> Result<()>;

    async fn register_service_client(&self, node: &NodeInfo, service: &str, sink: ServiceInfoSink) -> Result<()>;

    async fn unregister_service_client(&self, node: &NodeInfo, service: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// A record plus the node that owns it.
struct Owned<T> {
    owner: Uuid,
    info: T,
}

type Watchers<T> = HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<T>>>;

#[derive(Default)]
struct Registry {
    publications: HashMap<String, Owned<TopicInfo>>,
    subscriptions: Watchers<TopicInfo>,
    services: HashMap<String, Owned<ServiceInfo>>,
    service_clients: Watchers<ServiceInfo>,
}

/// Push `info` to every watcher of `name`, forgetting sinks whose receiver
/// is gone.
fn notify<T: Clone>(watchers: &mut Watchers<T>, name: &str, info: &T) {
    if let Some(sinks) = watchers.get_mut(name) {
        sinks.retain(|_, sink| sink.send(info.clone()).is_ok());
    }
}

/// In-memory [`MasterProxy`].
#[derive(Default)]
pub struct LocalMaster {
    registry: Mutex<Registry>,
}

impl LocalMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published info for `topic`.
    pub fn topic_info(&self, topic: &str) -> Option<TopicInfo> {
        self.registry
            .lock()
            .publications
            .get(topic)
            .map(|p| p.info.clone())
    }

    pub fn service_info(&self, service: &str) -> Option<ServiceInfo> {
        self.registry
            .lock()
            .services
            .get(service)
            .map(|s| s.info.clone())
    }

    pub fn service_client_count(&self, service: &str) -> usize {
        self.registry
            .lock()
            .service_clients
            .get(service)
            .map_or(0, HashMap::len)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .lock()
            .subscriptions
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl MasterProxy for LocalMaster {
    async fn publish_topic(&self, node: &NodeInfo, mut topic_info: TopicInfo) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.publications.get(&topic_info.topic) {
            if existing.owner != node.id {
                return Err(TetherError::Aborted(format!(
                    "topic {} is already published by another node",
                    topic_info.topic
                )));
            }
        }
        topic_info.status = TopicStatus::Registered;
        info!(node = %node.name, topic = %topic_info.topic, sources = topic_info.topic_source.len(), "topic published");
        notify(&mut registry.subscriptions, &topic_info.topic, &topic_info);
        registry.publications.insert(
            topic_info.topic.clone(),
            Owned {
                owner: node.id,
                info: topic_info,
            },
        );
        Ok(())
    }

    async fn unpublish_topic(&self, node: &NodeInfo, topic: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        match registry.publications.get(topic) {
            Some(p) if p.owner == node.id => {}
            Some(_) => {
                return Err(TetherError::Aborted(format!("topic {topic} is published by another node")));
            }
            None => return Err(TetherError::NotFound(format!("topic {topic} is not published"))),
        }
        if let Some(publication) = registry.publications.remove(topic) {
            let mut info = publication.info;
            info.status = TopicStatus::Unregistered;
            notify(&mut registry.subscriptions, topic, &info);
        }
        info!(node = %node.name, topic, "topic unpublished");
        Ok(())
    }

    async fn subscribe_topic(&self, node: &NodeInfo, topic: &str, sink: TopicInfoSink) -> Result<()> {
        let mut registry = self.registry.lock();
        let already_subscribed = registry
            .subscriptions
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(&node.id));
        if already_subscribed {
            return Err(TetherError::Aborted(format!("{} already subscribes to {topic}", node.name)));
        }
        if let Some(publication) = registry.publications.get(topic) {
            let _ = sink.send(publication.info.clone());
        }
        registry
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(node.id, sink);
        debug!(node = %node.name, topic, "topic subscribed");
        Ok(())
    }

    async fn unsubscribe_topic(&self, node: &NodeInfo, topic: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let removed = registry
            .subscriptions
            .get_mut(topic)
            .and_then(|subscribers| subscribers.remove(&node.id));
        if removed.is_none() {
            return Err(TetherError::NotFound(format!("{} does not subscribe to {topic}", node.name)));
        }
        debug!(node = %node.name, topic, "topic unsubscribed");
        Ok(())
    }

    async fn register_service_server(&self, node: &NodeInfo, mut service_info: ServiceInfo) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.services.contains_key(&service_info.service) {
            return Err(TetherError::Aborted(format!(
                "service {} already has a server",
                service_info.service
            )));
        }
        service_info.status = ServiceStatus::Registered;
        info!(node = %node.name, service = %service_info.service, source = %service_info.service_source, "service registered");
        notify(&mut registry.service_clients, &service_info.service, &service_info);
        registry.services.insert(
            service_info.service.clone(),
            Owned {
                owner: node.id,
                info: service_info,
            },
        );
        Ok(())
    }

    async fn unregister_service_server(&self, node: &NodeInfo, service: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        match registry.services.get(service) {
            Some(s) if s.owner == node.id => {}
            Some(_) => {
                return Err(TetherError::Aborted(format!("service {service} is served by another node")));
            }
            None => return Err(TetherError::NotFound(format!("service {service} is not registered"))),
        }
        if let Some(server) = registry.services.remove(service) {
            let mut info = server.info;
            info.status = ServiceStatus::Unregistered;
            notify(&mut registry.service_clients, service, &info);
        }
        info!(node = %node.name, service, "service unregistered");
        Ok(())
    }

    async fn register_service_client(&self, node: &NodeInfo, service: &str, sink: ServiceInfoSink) -> Result<()> {
        let mut registry = self.registry.lock();
        let already_registered = registry
            .service_clients
            .get(service)
            .is_some_and(|clients| clients.contains_key(&node.id));
        if already_registered {
            return Err(TetherError::Aborted(format!("{} already is a client of {service}", node.name)));
        }
        if let Some(server) = registry.services.get(service) {
            let _ = sink.send(server.info.clone());
        }
        registry
            .service_clients
            .entry(service.to_string())
            .or_default()
            .insert(node.id, sink);
        debug!(node = %node.name, service, "service client registered");
        Ok(())
    }

    async fn unregister_service_client(&self, node: &NodeInfo, service: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let removed = registry
            .service_clients
            .get_mut(service)
            .and_then(|clients| clients.remove(&node.id));
        if removed.is_none() {
            return Err(TetherError::NotFound(format!("{} is not a client of {service}", node.name)));
        }
        debug!(node = %node.name, service, "service client unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tether_types::{ChannelAddress, ChannelDef, ChannelType, ImplKind};

    use super::*;

    fn topic_info(topic: &str) -> TopicInfo {
        TopicInfo {
            topic: topic.to_string(),
            type_name: "tether.test.SimpleMessage".to_string(),
            impl_kind: ImplKind::Json,
            status: TopicStatus::Registered,
            topic_source: vec![ChannelDef::new(
                ChannelType::Tcp,
                ChannelAddress::Ip("127.0.0.1:5000".parse().unwrap()),
            )],
        }
    }

    #[tokio::test]
    async fn duplicate_publish_from_other_node_is_aborted() {
        let master = LocalMaster::new();
        let a = NodeInfo::new("a");
        let b = NodeInfo::new("b");
        master.publish_topic(&a, topic_info("/chatter")).await.unwrap();
        let err = master.publish_topic(&b, topic_info("/chatter")).await.unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));
        // Re-publishing from the owner updates the record.
        master.publish_topic(&a, topic_info("/chatter")).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_aborted() {
        let master = LocalMaster::new();
        let node = NodeInfo::new("listener");
        let (tx, _rx) = mpsc::unbounded_channel();
        master.subscribe_topic(&node, "/chatter", tx.clone()).await.unwrap();
        let err = master.subscribe_topic(&node, "/chatter", tx).await.unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));
        assert_eq!(master.subscriber_count("/chatter"), 1);
    }

    #[tokio::test]
    async fn unknown_topics_are_not_found() {
        let master = LocalMaster::new();
        let node = NodeInfo::new("n");
        assert!(matches!(
            master.unpublish_topic(&node, "/missing").await,
            Err(TetherError::NotFound(_))
        ));
        assert!(matches!(
            master.unsubscribe_topic(&node, "/missing").await,
            Err(TetherError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_every_source_change() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = LocalMaster::new();
        let talker = NodeInfo::new("talker");
        let early = NodeInfo::new("early");
        let late = NodeInfo::new("late");

        let (early_tx, mut early_rx) = mpsc::unbounded_channel();
        master.subscribe_topic(&early, "/chatter", early_tx).await?;
        assert!(early_rx.try_recv().is_err());

        master.publish_topic(&talker, topic_info("/chatter")).await?;
        assert_eq!(early_rx.recv().await.map(|i| i.status), Some(TopicStatus::Registered));

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        master.subscribe_topic(&late, "/chatter", late_tx).await?;
        assert_eq!(late_rx.recv().await.map(|i| i.topic), Some("/chatter".to_string()));

        master.unpublish_topic(&talker, "/chatter").await?;
        assert_eq!(early_rx.recv().await.map(|i| i.status), Some(TopicStatus::Unregistered));
        assert_eq!(late_rx.recv().await.map(|i| i.status), Some(TopicStatus::Unregistered));
        assert!(master.topic_info("/chatter").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn service_clients_follow_their_server() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = LocalMaster::new();
        let server = NodeInfo::new("server");
        let client = NodeInfo::new("client");
        let info = ServiceInfo {
            service: "/add".to_string(),
            request_type: "tether.test.AddRequest".to_string(),
            response_type: "tether.test.AddResponse".to_string(),
            status: ServiceStatus::Registered,
            service_source: ChannelDef::new(ChannelType::Tcp, ChannelAddress::Ip("127.0.0.1:5001".parse()?)),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        master.register_service_client(&client, "/add", tx.clone()).await?;
        assert!(matches!(
            master.register_service_client(&client, "/add", tx).await,
            Err(TetherError::Aborted(_))
        ));

        master.register_service_server(&server, info.clone()).await?;
        assert_eq!(rx.recv().await, Some(info.clone()));
        assert!(matches!(
            master.register_service_server(&client, info.clone()).await,
            Err(TetherError::Aborted(_))
        ));
        assert!(matches!(
            master.unregister_service_server(&client, "/add").await,
            Err(TetherError::Aborted(_))
        ));

        master.unregister_service_server(&server, "/add").await?;
        assert_eq!(rx.recv().await.map(|i| i.status), Some(ServiceStatus::Unregistered));
        assert!(master.service_info("/add").is_none());

        master.unregister_service_client(&client, "/add").await?;
        assert_eq!(master.service_client_count("/add"), 0);
        Ok(())
    }
}
