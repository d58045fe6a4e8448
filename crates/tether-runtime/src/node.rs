//! A named node owning the publishers, subscribers and services it created.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_middleware::{Context, Message, MessageType, Publisher, ServiceClient, ServiceServer, Settings, Subscriber};
use tether_types::{ChannelTypes, NodeInfo, Result, ServiceStatus, TetherError};
use tracing::{info, warn};

#[async_trait]
trait Registration: Send + Sync {
    /// Topic or service name.
    fn name(&self) -> &str;

    async fn shutdown(&self, node: &NodeInfo) -> Result<()>;
}

struct Published<M: Message> {
    topic: String,
    publisher: Arc<Publisher<M>>,
}

#[async_trait]
impl<M: Message> Registration for Published<M> {
    fn name(&self) -> &str {
        &self.topic
    }

    async fn shutdown(&self, node: &NodeInfo) -> Result<()> {
        self.publisher.request_unpublish(node, &self.topic).await
    }
}

struct Subscribed<M: Message> {
    topic: String,
    subscriber: Arc<Subscriber<M>>,
}

#[async_trait]
impl<M: Message> Registration for Subscribed<M> {
    fn name(&self) -> &str {
        &self.topic
    }

    async fn shutdown(&self, node: &NodeInfo) -> Result<()> {
        self.subscriber.request_unsubscribe(node, &self.topic).await
    }
}

struct Served<Req: Message, Resp: Message> {
    service: String,
    server: Arc<ServiceServer<Req, Resp>>,
}

#[async_trait]
impl<Req: Message, Resp: Message> Registration for Served<Req, Resp> {
    fn name(&self) -> &str {
        &self.service
    }

    async fn shutdown(&self, node: &NodeInfo) -> Result<()> {
        self.server.request_unregister(node, &self.service).await
    }
}

struct Calling<Req: Message, Resp: Message> {
    service: String,
    client: Arc<ServiceClient<Req, Resp>>,
}

#[async_trait]
impl<Req: Message, Resp: Message> Registration for Calling<Req, Resp> {
    fn name(&self) -> &str {
        &self.service
    }

    async fn shutdown(&self, node: &NodeInfo) -> Result<()> {
        self.client.request_unregister(node, &self.service).await
    }
}

/// Node identity plus the [`Context`] its actors run in.
pub struct NodeRuntime {
    node: NodeInfo,
    context: Context,
    registrations: Mutex<Vec<Box<dyn Registration>>>,
}

impl NodeRuntime {
    /// Node with an in-process master on the current Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_context(name, Context::local())
    }

    pub fn with_context(name: impl Into<String>, context: Context) -> Self {
        Self {
            node: NodeInfo::new(name),
            context,
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Register a publisher for `topic` on every channel in `channel_types`.
    pub async fn publish<M: Message>(
        &self,
        topic: &str,
        channel_types: ChannelTypes,
        settings: Settings,
    ) -> Result<Arc<Publisher<M>>> {
        let publisher = Arc::new(Publisher::new(&self.context)?);
        self.register_publisher(topic, channel_types, settings, publisher).await
    }

    /// Like [`publish`](Self::publish) for messages typed at runtime.
    pub async fn publish_as<M: Message>(
        &self,
        topic: &str,
        message_type: MessageType,
        channel_types: ChannelTypes,
        settings: Settings,
    ) -> Result<Arc<Publisher<M>>> {
        let publisher = Arc::new(Publisher::with_message_type(&self.context, message_type));
        self.register_publisher(topic, channel_types, settings, publisher).await
    }

    async fn register_publisher<M: Message>(
        &self,
        topic: &str,
        channel_types: ChannelTypes,
        settings: Settings,
        publisher: Arc<Publisher<M>>,
    ) -> Result<Arc<Publisher<M>>> {
        publisher
            .request_publish(&self.node, topic, channel_types, settings)
            .await?;
        self.registrations.lock().push(Box::new(Published {
            topic: topic.to_string(),
            publisher: publisher.clone(),
        }));
        Ok(publisher)
    }

    /// Subscribe to `topic`, connecting over the first channel type shared
    /// with its publisher.
    pub async fn subscribe<M, F, E>(
        &self,
        topic: &str,
        channel_types: ChannelTypes,
        settings: Settings,
        on_message: F,
        on_error: E,
    ) -> Result<Arc<Subscriber<M>>>
    where
        M: Message,
        F: FnMut(M) + Send + 'static,
        E: Fn(&TetherError) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber::new(&self.context)?);
        subscriber
            .request_subscribe(&self.node, topic, channel_types, settings, on_message, on_error)
            .await?;
        self.registrations.lock().push(Box::new(Subscribed {
            topic: topic.to_string(),
            subscriber: subscriber.clone(),
        }));
        Ok(subscriber)
    }

    /// Answer requests on `service` with `handler`.
    pub async fn serve<Req, Resp, F, Fut>(
        &self,
        service: &str,
        settings: Settings,
        handler: F,
    ) -> Result<Arc<ServiceServer<Req, Resp>>>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let server = Arc::new(ServiceServer::new(&self.context)?);
        server
            .request_register(&self.node, service, &settings, handler)
            .await?;
        self.registrations.lock().push(Box::new(Served {
            service: service.to_string(),
            server: server.clone(),
        }));
        Ok(server)
    }

    /// Client for `service`; `on_connect` hears when its server comes and goes.
    pub async fn service_client<Req, Resp, F>(
        &self,
        service: &str,
        settings: Settings,
        on_connect: F,
    ) -> Result<Arc<ServiceClient<Req, Resp>>>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServiceStatus) + Send + Sync + 'static,
    {
        let client = Arc::new(ServiceClient::new(&self.context)?);
        client
            .request_register(&self.node, service, &settings, on_connect)
            .await?;
        self.registrations.lock().push(Box::new(Calling {
            service: service.to_string(),
            client: client.clone(),
        }));
        Ok(client)
    }

    /// Topics and services this node currently holds.
    pub fn topics(&self) -> Vec<String> {
        self.registrations
            .lock()
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Release every topic and service, newest first. Every
    /// registration is attempted; the last failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        let mut outcome = Ok(());
        for registration in registrations.iter().rev() {
            match registration.shutdown(&self.node).await {
                Ok(()) => info!(node = %self.node.name, name = registration.name(), "released"),
                Err(e) => {
                    warn!(node = %self.node.name, name = registration.name(), error = %e, "failed to release");
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}
