//! Per-topic publisher.
//!
//! A [`Publisher`] is a handle to an actor task that owns the registration
//! state machine and the server channels. Application threads only touch the
//! message pool (behind a mutex) and the actor's command queue.
//!
//! ```text
//! Unregistered ─request_publish─▶ Registering ─ok─▶ Registered
//!      ▲                              │ err              │
//!      └──────────────────────────────┘                  │ request_unpublish
//!      ▲                                                 ▼
//!      └────────────────ok────────────────────────── Unregistering ─err─▶ Registered
//! ```
//!
//! Once registered, a send pass runs every `period` and whenever a message
//! is published. A pass pops at most one message and sends it to every
//! channel that is idle and has receivers.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_types::{ChannelDef, ChannelTypes, NodeInfo, Result, TetherError, TopicInfo, TopicStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::SendBuffer;
use crate::channel::{SendCallback, ServerChannel, open_server_channel, report};
use crate::context::Context;
use crate::message::{Message, MessageType};
use crate::pool::Pool;
use crate::settings::Settings;
use crate::state::RegisterState;

struct Pending<M> {
    message: M,
    callback: Option<SendCallback>,
}

type SharedPool<M> = Arc<Mutex<Option<Pool<Pending<M>>>>>;
type Reply = oneshot::Sender<Result<()>>;

struct Registration {
    channels: Vec<Box<dyn ServerChannel>>,
    topic_info: TopicInfo,
    node: NodeInfo,
    settings: Settings,
}

enum Command {
    Publish {
        node: NodeInfo,
        topic: String,
        channel_types: ChannelTypes,
        settings: Settings,
        reply: Reply,
    },
    PublishDone {
        result: Result<Registration>,
        reply: Reply,
    },
    Unpublish {
        node: NodeInfo,
        topic: String,
        reply: Reply,
    },
    UnpublishDone {
        result: Result<()>,
        reply: Reply,
    },
    Flush,
}

pub struct Publisher<M: Message> {
    commands: mpsc::UnboundedSender<Command>,
    pool: SharedPool<M>,
    topic_info: Arc<Mutex<Option<TopicInfo>>>,
    _message: PhantomData<fn(M)>,
}

impl<M: Message> Publisher<M> {
    /// Publisher for a statically typed message.
    pub fn new(context: &Context) -> Result<Self> {
        let message_type = M::message_type().ok_or_else(|| {
            TetherError::InvalidArgument("message type is only known at runtime, use with_message_type".into())
        })?;
        Ok(Self::with_message_type(context, message_type))
    }

    /// Publisher whose topic type is named explicitly, e.g. for
    /// [`RawMessage`](crate::message::RawMessage).
    pub fn with_message_type(context: &Context, message_type: MessageType) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let pool: SharedPool<M> = Arc::new(Mutex::new(None));
        let topic_info = Arc::new(Mutex::new(None));
        let actor = PublisherActor {
            context: context.clone(),
            message_type,
            state: RegisterState::Unregistered,
            registration: None,
            send_buffer: SendBuffer::new(),
            pool: pool.clone(),
            shared_topic_info: topic_info.clone(),
            commands: commands.downgrade(),
            ticker: None,
        };
        context.handle().spawn(actor.run(command_rx));
        Self {
            commands,
            pool,
            topic_info,
            _message: PhantomData,
        }
    }

    /// Open a channel per requested type and register the topic.
    pub async fn request_publish(
        &self,
        node_info: &NodeInfo,
        topic: &str,
        channel_types: ChannelTypes,
        settings: Settings,
    ) -> Result<()> {
        self.request(|reply| Command::Publish {
            node: node_info.clone(),
            topic: topic.to_string(),
            channel_types,
            settings,
            reply,
        })
        .await
    }

    pub async fn request_unpublish(&self, node_info: &NodeInfo, topic: &str) -> Result<()> {
        self.request(|reply| Command::Unpublish {
            node: node_info.clone(),
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| TetherError::Aborted("publisher task is gone".into()))?;
        done.await
            .map_err(|_| TetherError::Aborted("publisher task dropped the request".into()))?
    }

    /// Queue `message`. Before registration the message is dropped.
    pub fn publish(&self, message: M) {
        self.enqueue(Pending {
            message,
            callback: None,
        });
    }

    /// Queue `message` and report every channel's send result to `callback`.
    pub fn publish_with<F>(&self, message: M, callback: F)
    where
        F: Fn(&ChannelDef, Result<()>) + Send + Sync + 'static,
    {
        self.enqueue(Pending {
            message,
            callback: Some(Arc::new(callback)),
        });
    }

    fn enqueue(&self, pending: Pending<M>) {
        {
            let mut pool = self.pool.lock();
            let Some(pool) = pool.as_mut() else {
                return;
            };
            pool.push(pending);
        }
        let _ = self.commands.send(Command::Flush);
    }

    /// Info registered with the master, `None` unless registered.
    pub fn topic_info(&self) -> Option<TopicInfo> {
        self.topic_info.lock().clone()
    }

    /// Messages waiting to be sent.
    pub fn queued(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, Pool::len)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct PublisherActor<M> {
    context: Context,
    message_type: MessageType,
    state: RegisterState,
    registration: Option<Registration>,
    send_buffer: SendBuffer,
    pool: SharedPool<M>,
    shared_topic_info: Arc<Mutex<Option<TopicInfo>>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    ticker: Option<Interval>,
}

impl<M: Message> PublisherActor<M> {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = next_tick(&mut self.ticker) => self.send_pass(),
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Publish {
                node,
                topic,
                channel_types,
                settings,
                reply,
            } => self.on_request_publish(node, topic, channel_types, settings, reply),
            Command::PublishDone { result, reply } => self.on_publish_done(result, reply),
            Command::Unpublish { node, topic, reply } => self.on_request_unpublish(node, topic, reply),
            Command::UnpublishDone { result, reply } => self.on_unpublish_done(result, reply),
            Command::Flush => self.send_pass(),
        }
    }

    fn on_request_publish(
        &mut self,
        node: NodeInfo,
        topic: String,
        channel_types: ChannelTypes,
        settings: Settings,
        reply: Reply,
    ) {
        if channel_types.is_empty() {
            let _ = reply.send(Err(TetherError::InvalidArgument("no channel types requested".into())));
            return;
        }
        if let Err(e) = self.state.transition(RegisterState::Unregistered, RegisterState::Registering) {
            let _ = reply.send(Err(e));
            return;
        }
        debug!(topic = %topic, types = channel_types.bits(), "registering topic");

        let master = self.context.master().clone();
        let message_type = self.message_type.clone();
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            let result = register(master.clone(), node, topic, channel_types, settings, message_type).await;
            let undelivered = match commands.upgrade() {
                Some(commands) => match commands.send(Command::PublishDone { result, reply }) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(Command::PublishDone { result, .. })) => Some(result),
                    Err(_) => None,
                },
                None => Some(result),
            };
            if let Some(Ok(registration)) = undelivered {
                abandon(master, registration).await;
            }
        });
    }

    fn on_publish_done(&mut self, result: Result<Registration>, reply: Reply) {
        match result {
            Ok(registration) => {
                let settings = &registration.settings;
                self.send_buffer = SendBuffer::new();
                self.send_buffer.set_capacity(settings.buffer_size);
                if settings.is_dynamic_buffer {
                    self.send_buffer.enable_dynamic_buffer();
                    self.send_buffer.set_max_dynamic_capacity(settings.max_dynamic_buffer_size);
                }
                *self.pool.lock() = Some(Pool::with_capacity(settings.queue_size));
                let mut ticker = tokio::time::interval(settings.period());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
                *self.shared_topic_info.lock() = Some(registration.topic_info.clone());
                info!(
                    topic = %registration.topic_info.topic,
                    channels = registration.channels.len(),
                    "topic registered"
                );
                self.registration = Some(registration);
                self.state = RegisterState::Registered;
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "topic registration failed");
                self.state = RegisterState::Unregistered;
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_request_unpublish(&mut self, node: NodeInfo, topic: String, reply: Reply) {
        if let Err(e) = self.state.transition(RegisterState::Registered, RegisterState::Unregistering) {
            let _ = reply.send(Err(e));
            return;
        }
        let master = self.context.master().clone();
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            let result = master.unpublish_topic(&node, &topic).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::UnpublishDone { result, reply });
            }
        });
    }

    fn on_unpublish_done(&mut self, result: Result<()>, reply: Reply) {
        if let Err(e) = result {
            warn!(error = %e, "topic unregistration failed");
            self.state = RegisterState::Registered;
            let _ = reply.send(Err(e));
            return;
        }
        self.release();
        self.state = RegisterState::Unregistered;
        let _ = reply.send(Ok(()));
    }

    /// Drop the pool and topic info and close every channel in the background.
    fn release(&mut self) {
        self.ticker = None;
        *self.pool.lock() = None;
        *self.shared_topic_info.lock() = None;
        self.send_buffer.detach();
        if let Some(registration) = self.registration.take() {
            debug!(topic = %registration.topic_info.topic, "releasing channels");
            self.context.handle().spawn(close_channels(registration.channels));
        }
    }

    fn send_pass(&mut self) {
        if !self.state.is_registered() {
            return;
        }
        let Some(registration) = self.registration.as_ref() else {
            return;
        };
        let ready: Vec<&dyn ServerChannel> = registration
            .channels
            .iter()
            .map(|c| &**c)
            .filter(|c| !c.is_sending() && c.has_receivers())
            .collect();
        if ready.is_empty() {
            return;
        }
        let Some(pending) = self.pool.lock().as_mut().and_then(Pool::pop) else {
            return;
        };

        let content = match pending.message.serialize() {
            Ok(content) => content,
            Err(e) => {
                let e = TetherError::from(e);
                for channel in &ready {
                    report(channel.channel_def(), Err(e.clone()), pending.callback.as_ref());
                }
                return;
            }
        };

        for (i, channel) in ready.iter().enumerate() {
            let reuse = i > 0;
            if let Err(e) = channel.send_message(&mut self.send_buffer, &content, reuse, pending.callback.clone()) {
                report(channel.channel_def(), Err(e), pending.callback.as_ref());
            }
        }
    }

    async fn shutdown(mut self) {
        if self.state.is_registered() {
            if let Some(registration) = self.registration.as_ref() {
                let topic = registration.topic_info.topic.clone();
                let node = registration.node.clone();
                if let Err(e) = self.context.master().unpublish_topic(&node, &topic).await {
                    debug!(topic = %topic, error = %e, "unpublish on drop failed");
                }
            }
        }
        self.ticker = None;
        *self.pool.lock() = None;
        if let Some(registration) = self.registration.take() {
            close_channels(registration.channels).await;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn close_channels(channels: Vec<Box<dyn ServerChannel>>) {
    for mut channel in channels {
        channel.close().await;
    }
}

/// Undo a registration that completed after its publisher was dropped.
async fn abandon(master: Arc<dyn crate::master::MasterProxy>, registration: Registration) {
    let topic = &registration.topic_info.topic;
    debug!(topic = %topic, "publisher dropped while registering, releasing topic");
    if let Err(e) = master.unpublish_topic(&registration.node, topic).await {
        warn!(topic = %topic, error = %e, "failed to release abandoned topic");
    }
    close_channels(registration.channels).await;
}

/// Open every requested channel, then register with the master. Any failure
/// closes what was opened so far.
async fn register(
    master: Arc<dyn crate::master::MasterProxy>,
    node: NodeInfo,
    topic: String,
    channel_types: ChannelTypes,
    settings: Settings,
    message_type: MessageType,
) -> Result<Registration> {
    let mut channels: Vec<Box<dyn ServerChannel>> = Vec::new();
    for channel_type in channel_types.iter() {
        match open_server_channel(channel_type, &settings).await {
            Ok(channel) => {
                debug!(topic = %topic, channel = %channel.channel_def(), "channel ready");
                channels.push(channel);
            }
            Err(e) => {
                error!(topic = %topic, channel_type = %channel_type, error = %e, "channel setup failed");
                close_channels(channels).await;
                return Err(e);
            }
        }
    }

    let topic_info = TopicInfo {
        topic: topic.clone(),
        type_name: message_type.type_name,
        impl_kind: message_type.impl_kind,
        status: TopicStatus::Registered,
        topic_source: channels.iter().map(|c| c.channel_def().clone()).collect(),
    };
    if let Err(e) = master.publish_topic(&node, topic_info.clone()).await {
        close_channels(channels).await;
        return Err(e);
    }
    Ok(Registration {
        channels,
        topic_info,
        node,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tether_types::{ChannelType, ServiceInfo};

    use super::*;
    use crate::master::{LocalMaster, MasterProxy, ServiceInfoSink, TopicInfoSink};
    use crate::message::RawMessage;
    use crate::message::testing::SimpleMessage;

    fn settings() -> Settings {
        Settings::default()
            .with_period(Duration::from_millis(30))
            .with_buffer_size(512)
    }

    #[tokio::test]
    async fn publish_registers_every_requested_channel() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let node = NodeInfo::new("talker");
        let types = ChannelTypes::from(ChannelType::Tcp) | ChannelType::Udp;

        publisher.request_publish(&node, "/chatter", types, settings()).await?;
        let info = publisher.topic_info().expect("registered");
        assert_eq!(info.type_name, "tether.test.SimpleMessage");
        assert_eq!(info.channel_types(), types);
        assert_eq!(master.topic_info("/chatter"), Some(info));

        let err = publisher
            .request_publish(&node, "/chatter", types, settings())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));

        publisher.request_unpublish(&node, "/chatter").await?;
        assert!(publisher.topic_info().is_none());
        assert!(master.topic_info("/chatter").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn master_rejection_returns_to_unregistered() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let first: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let second: Publisher<SimpleMessage> = Publisher::new(&context)?;
        first
            .request_publish(&NodeInfo::new("a"), "/chatter", ChannelType::Tcp.into(), settings())
            .await?;

        let other = NodeInfo::new("b");
        let err = second
            .request_publish(&other, "/chatter", ChannelType::Tcp.into(), settings())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));
        assert!(second.topic_info().is_none());

        // Back in Unregistered, so a fresh topic works.
        second
            .request_publish(&other, "/other", ChannelType::Tcp.into(), settings())
            .await?;
        Ok(())
    }

    /// Local master whose topic registration takes a while.
    struct SlowMaster {
        inner: LocalMaster,
        delay: Duration,
        published: AtomicUsize,
        unpublished: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MasterProxy for SlowMaster {
        async fn publish_topic(&self, node: &NodeInfo, topic_info: TopicInfo) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.published.fetch_add(1, Ordering::SeqCst);
            self.inner.publish_topic(node, topic_info).await
        }

        async fn unpublish_topic(&self, node: &NodeInfo, topic: &str) -> Result<()> {
            self.unpublished.fetch_add(1, Ordering::SeqCst);
            self.inner.unpublish_topic(node, topic).await
        }

        async fn subscribe_topic(&self, node: &NodeInfo, topic: &str, sink: TopicInfoSink) -> Result<()> {
            self.inner.subscribe_topic(node, topic, sink).await
        }

        async fn unsubscribe_topic(&self, node: &NodeInfo, topic: &str) -> Result<()> {
            self.inner.unsubscribe_topic(node, topic).await
        }

        async fn register_service_server(&self, node: &NodeInfo, service_info: ServiceInfo) -> Result<()> {
            self.inner.register_service_server(node, service_info).await
        }

        async fn unregister_service_server(&self, node: &NodeInfo, service: &str) -> Result<()> {
            self.inner.unregister_service_server(node, service).await
        }

        async fn register_service_client(&self, node: &NodeInfo, service: &str, sink: ServiceInfoSink) -> Result<()> {
            self.inner.register_service_client(node, service, sink).await
        }

        async fn unregister_service_client(&self, node: &NodeInfo, service: &str) -> Result<()> {
            self.inner.unregister_service_client(node, service).await
        }
    }

    #[tokio::test]
    async fn dropping_while_registering_releases_the_topic() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = Arc::new(SlowMaster {
            inner: LocalMaster::new(),
            delay: Duration::from_millis(100),
            published: AtomicUsize::new(0),
            unpublished: AtomicUsize::new(0),
        });
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let node = NodeInfo::new("talker");
        let request = publisher.request_publish(&node, "/chatter", ChannelType::Tcp.into(), settings());
        assert!(tokio::time::timeout(Duration::from_millis(20), request).await.is_err());
        drop(publisher);

        tokio::time::timeout(Duration::from_secs(2), async {
            while master.unpublished.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(master.published.load(Ordering::SeqCst), 1);
        assert_eq!(master.unpublished.load(Ordering::SeqCst), 1);
        assert!(master.inner.topic_info("/chatter").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unpublish_requires_registration() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let context = Context::local();
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let err = publisher
            .request_unpublish(&NodeInfo::new("n"), "/chatter")
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(ref m) if m.contains("invalid state")));
        Ok(())
    }

    #[tokio::test]
    async fn publish_before_registration_is_dropped() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let context = Context::local();
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        publisher.publish(SimpleMessage { data: 1, timestamp: 0 });
        assert_eq!(publisher.queued(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn raw_messages_need_an_explicit_type() {
        let context = Context::local();
        assert!(Publisher::<RawMessage>::new(&context).is_err());
        let publisher =
            Publisher::<RawMessage>::with_message_type(&context, MessageType::new("raw.Bytes", tether_types::ImplKind::Raw));
        publisher
            .request_publish(&NodeInfo::new("n"), "/raw", ChannelType::Tcp.into(), settings())
            .await
            .unwrap();
        assert_eq!(publisher.topic_info().unwrap().impl_kind, tether_types::ImplKind::Raw);
    }

    #[tokio::test]
    async fn oversized_message_reports_resource_exhausted() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let context = Context::local();
        let publisher: Publisher<RawMessage> =
            Publisher::with_message_type(&context, MessageType::new("raw.Bytes", tether_types::ImplKind::Raw));
        let node = NodeInfo::new("n");
        publisher
            .request_publish(&node, "/big", ChannelType::Shm.into(), settings().with_buffer_size(64))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        publisher.publish_with(RawMessage(vec![0u8; 1024]), move |_, result| {
            let _ = tx.send(result);
        });
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert!(matches!(result, Some(Err(TetherError::ResourceExhausted(_)))));
        Ok(())
    }
}
