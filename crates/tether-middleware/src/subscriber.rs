//! Per-topic subscriber.
//!
//! Like the publisher, a [`Subscriber`] is a handle to an actor task. The
//! actor owns two state machines:
//!
//! - [`RegisterState`] tracks the subscription with the master.
//! - [`SubscriberState`] tracks the session with one publisher: a receive
//!   task that reads from the connected [`ClientChannel`] and a notify timer
//!   that hands one message per period to the application.
//!
//! Every session gets a fresh id; events from a previous session are
//! dropped on arrival.
//!
//! Topic source changes arrive from the master at any time. A change while
//! a session is running is deferred until the session is released, except
//! on transports that cannot notice a vanished publisher, where it also
//! stops the running session.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tether_types::{ChannelType, ChannelTypes, NodeInfo, Result, TetherError, TopicInfo, TopicStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{ClientChannel, connect_client_channel};
use crate::context::Context;
use crate::master::MasterProxy;
use crate::message::{Message, MessageType};
use crate::pool::Pool;
use crate::settings::Settings;
use crate::state::{RegisterState, SubscriberState};

/// Consecutive receive failures after which the session is restarted.
pub const MAX_RECEIVE_FAILURES: u32 = 5;

/// Delay before re-examining a topic source that arrived mid-transition.
const REPOST_DELAY: Duration = Duration::from_millis(10);

/// Extra wait after the pool drained before a stopping session is released.
const RELEASE_GRACE: Duration = Duration::from_millis(100);

pub type ErrorCallback = Arc<dyn Fn(&TetherError) + Send + Sync>;

type MessageCallback<M> = Box<dyn FnMut(M) + Send>;
type Reply = oneshot::Sender<Result<()>>;

struct Subscription<M> {
    node: NodeInfo,
    topic: String,
    channel_types: ChannelTypes,
    settings: Settings,
    on_message: MessageCallback<M>,
    on_error: ErrorCallback,
}

enum Command<M> {
    Subscribe {
        subscription: Subscription<M>,
        reply: Reply,
    },
    SubscribeDone {
        result: Result<()>,
        subscription: Subscription<M>,
        sources: mpsc::UnboundedReceiver<TopicInfo>,
        reply: Reply,
    },
    Unsubscribe {
        node: NodeInfo,
        topic: String,
        reply: Reply,
    },
    UnsubscribeDone {
        result: Result<()>,
        reply: Reply,
    },
    FindPublisher(TopicInfo),
    Connected {
        session: u64,
        channel: Option<Box<dyn ClientChannel>>,
    },
    StartMessageLoop {
        session: u64,
        channel: Box<dyn ClientChannel>,
    },
    Received {
        session: u64,
        result: Result<M>,
        disconnected: bool,
        next: oneshot::Sender<bool>,
    },
}

pub struct Subscriber<M: Message> {
    commands: mpsc::UnboundedSender<Command<M>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> Subscriber<M> {
    pub fn new(context: &Context) -> Result<Self> {
        let message_type = M::message_type().ok_or_else(|| {
            TetherError::InvalidArgument("message type is only known at runtime, use with_message_type".into())
        })?;
        Ok(Self::with_message_type(context, message_type))
    }

    /// Subscriber that only accepts sources advertising `message_type`.
    pub fn with_message_type(context: &Context, message_type: MessageType) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = SubscriberActor {
            context: context.clone(),
            message_type,
            state: RegisterState::Unregistered,
            session_state: SubscriberState::Stopped,
            session: 0,
            subscription: None,
            sources: None,
            pool: Pool::default(),
            active: None,
            last_info: None,
            deferred: None,
            connecting: false,
            failures: 0,
            receiver: None,
            notify: None,
            release_at: None,
            commands: commands.downgrade(),
        };
        context.handle().spawn(actor.run(command_rx));
        Self {
            commands,
            _message: PhantomData,
        }
    }

    /// Register interest in `topic`. Messages are delivered to `on_message`
    /// on the subscriber's task, at most one per period; transport and
    /// decoding failures go to `on_error`.
    pub async fn request_subscribe<F, E>(
        &self,
        node_info: &NodeInfo,
        topic: &str,
        channel_types: ChannelTypes,
        settings: Settings,
        on_message: F,
        on_error: E,
    ) -> Result<()>
    where
        F: FnMut(M) + Send + 'static,
        E: Fn(&TetherError) + Send + Sync + 'static,
    {
        let subscription = Subscription {
            node: node_info.clone(),
            topic: topic.to_string(),
            channel_types,
            settings,
            on_message: Box::new(on_message),
            on_error: Arc::new(on_error),
        };
        self.request(|reply| Command::Subscribe { subscription, reply }).await
    }

    pub async fn request_unsubscribe(&self, node_info: &NodeInfo, topic: &str) -> Result<()> {
        self.request(|reply| Command::Unsubscribe {
            node: node_info.clone(),
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command<M>) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| TetherError::Aborted("subscriber task is gone".into()))?;
        done.await
            .map_err(|_| TetherError::Aborted("subscriber task dropped the request".into()))?
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SubscriberActor<M> {
    context: Context,
    message_type: MessageType,
    state: RegisterState,
    session_state: SubscriberState,
    session: u64,
    subscription: Option<Subscription<M>>,
    sources: Option<mpsc::UnboundedReceiver<TopicInfo>>,
    pool: Pool<M>,
    /// Transport of the running session.
    active: Option<ChannelType>,
    last_info: Option<TopicInfo>,
    deferred: Option<TopicInfo>,
    connecting: bool,
    failures: u32,
    receiver: Option<JoinHandle<()>>,
    notify: Option<Interval>,
    release_at: Option<Instant>,
    commands: mpsc::WeakUnboundedSender<Command<M>>,
}

impl<M: Message> SubscriberActor<M> {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command<M>>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                source = next_source(&mut self.sources) => match source {
                    Some(info) => self.on_find_publisher(info),
                    None => self.sources = None,
                },
                _ = next_tick(&mut self.notify) => self.on_notify(),
                _ = sleep_until(self.release_at) => self.release(),
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, command: Command<M>) {
        match command {
            Command::Subscribe { subscription, reply } => self.on_request_subscribe(subscription, reply),
            Command::SubscribeDone {
                result,
                subscription,
                sources,
                reply,
            } => self.on_subscribe_done(result, subscription, sources, reply),
            Command::Unsubscribe { node, topic, reply } => self.on_request_unsubscribe(node, topic, reply),
            Command::UnsubscribeDone { result, reply } => self.on_unsubscribe_done(result, reply),
            Command::FindPublisher(info) => self.on_find_publisher(info),
            Command::Connected { session, channel } => self.on_connected(session, channel),
            Command::StartMessageLoop { session, channel } => self.start_message_loop(session, channel),
            Command::Received {
                session,
                result,
                disconnected,
                next,
            } => self.on_received(session, result, disconnected, next),
        }
    }

    fn post_after(&self, delay: Duration, command: Command<M>) {
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command);
            }
        });
    }

    fn report_error(&self, error: &TetherError) {
        match &self.subscription {
            Some(subscription) => (subscription.on_error)(error),
            None => warn!(error = %error, "subscriber error"),
        }
    }

    // ── registration ────────────────────────────────────────────────────

    fn on_request_subscribe(&mut self, subscription: Subscription<M>, reply: Reply) {
        if let Err(e) = self.state.transition(RegisterState::Unregistered, RegisterState::Registering) {
            let _ = reply.send(Err(e));
            return;
        }
        debug!(topic = %subscription.topic, types = subscription.channel_types.bits(), "subscribing");
        let master = self.context.master().clone();
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            let (sink, sources) = mpsc::unbounded_channel();
            let result = master
                .subscribe_topic(&subscription.node, &subscription.topic, sink)
                .await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::SubscribeDone {
                    result,
                    subscription,
                    sources,
                    reply,
                });
            }
        });
    }

    fn on_subscribe_done(
        &mut self,
        result: Result<()>,
        subscription: Subscription<M>,
        sources: mpsc::UnboundedReceiver<TopicInfo>,
        reply: Reply,
    ) {
        if let Err(e) = result {
            warn!(topic = %subscription.topic, error = %e, "subscription failed");
            self.state = RegisterState::Unregistered;
            let _ = reply.send(Err(e));
            return;
        }
        info!(topic = %subscription.topic, "topic subscribed");
        self.pool = Pool::with_capacity(subscription.settings.queue_size);
        self.subscription = Some(subscription);
        self.sources = Some(sources);
        self.state = RegisterState::Registered;
        let _ = reply.send(Ok(()));
    }

    fn on_request_unsubscribe(&mut self, node: NodeInfo, topic: String, reply: Reply) {
        if let Err(e) = self.state.transition(RegisterState::Registered, RegisterState::Unregistering) {
            let _ = reply.send(Err(e));
            return;
        }
        let master = self.context.master().clone();
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            let result = master.unsubscribe_topic(&node, &topic).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::UnsubscribeDone { result, reply });
            }
        });
    }

    fn on_unsubscribe_done(&mut self, result: Result<()>, reply: Reply) {
        if let Err(e) = result {
            warn!(error = %e, "unsubscribe failed");
            self.state = RegisterState::Registered;
            let _ = reply.send(Err(e));
            return;
        }
        self.state = RegisterState::Unregistered;
        self.sources = None;
        self.deferred = None;
        match self.session_state {
            SubscriberState::Started => self.stop(),
            SubscriberState::Stopping => {}
            SubscriberState::Stopped => self.clear(),
        }
        let _ = reply.send(Ok(()));
    }

    // ── topic sources ───────────────────────────────────────────────────

    fn on_find_publisher(&mut self, info: TopicInfo) {
        match self.state {
            RegisterState::Registering | RegisterState::Unregistering => {
                self.post_after(REPOST_DELAY, Command::FindPublisher(info));
                return;
            }
            RegisterState::Unregistered => return,
            RegisterState::Registered => {}
        }

        if info.status == TopicStatus::Unregistered {
            debug!(topic = %info.topic, "publisher went away");
            self.deferred = None;
            if self.session_state == SubscriberState::Started {
                self.stop();
            }
            return;
        }
        if info.type_name != self.message_type.type_name {
            self.report_error(&TetherError::InvalidArgument(format!(
                "topic {} carries {}, expected {}",
                info.topic, info.type_name, self.message_type.type_name
            )));
            return;
        }
        if self.connecting {
            self.deferred = Some(info);
            return;
        }

        match self.session_state {
            SubscriberState::Started => {
                let detects = self.active.is_some_and(ChannelType::can_detect_peer_disconnect);
                self.deferred = Some(info);
                if !detects {
                    debug!("restarting session on a transport without disconnect detection");
                    self.stop();
                }
            }
            SubscriberState::Stopping => self.deferred = Some(info),
            SubscriberState::Stopped => self.connect(info),
        }
    }

    /// Try each common transport in ascending order until one connects.
    fn connect(&mut self, info: TopicInfo) {
        let Some(subscription) = self.subscription.as_ref() else {
            return;
        };
        let candidates: Vec<_> = subscription
            .channel_types
            .intersection(info.channel_types())
            .iter()
            .filter_map(|t| info.channel_def(t).cloned())
            .collect();
        if candidates.is_empty() {
            self.report_error(&TetherError::Unavailable(format!(
                "no common channel type for {}",
                info.topic
            )));
            return;
        }

        self.session += 1;
        let session = self.session;
        self.connecting = true;
        self.last_info = Some(info);
        let settings = subscription.settings.clone();
        let on_error = subscription.on_error.clone();
        let commands = self.commands.clone();
        self.context.handle().spawn(async move {
            let mut connected = None;
            for def in &candidates {
                match connect_client_channel(def, &settings).await {
                    Ok(channel) => {
                        debug!(channel = %def, "connected to publisher");
                        connected = Some(channel);
                        break;
                    }
                    Err(e) => {
                        warn!(channel = %def, error = %e, "connect failed");
                        on_error(&e);
                    }
                }
            }
            if connected.is_none() {
                on_error(&TetherError::Unavailable("no advertised channel could be connected".into()));
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Connected {
                    session,
                    channel: connected,
                });
            }
        });
    }

    fn on_connected(&mut self, session: u64, channel: Option<Box<dyn ClientChannel>>) {
        if session != self.session {
            return;
        }
        self.connecting = false;
        match channel {
            Some(channel) if self.state.is_registered() => self.start_message_loop(session, channel),
            _ => {
                if self.session_state == SubscriberState::Stopped {
                    self.apply_deferred();
                }
            }
        }
    }

    // ── session ─────────────────────────────────────────────────────────

    fn start_message_loop(&mut self, session: u64, channel: Box<dyn ClientChannel>) {
        if session != self.session || !self.state.is_registered() {
            return;
        }
        let Some(subscription) = self.subscription.as_ref() else {
            return;
        };
        let period = subscription.settings.period();
        if self.session_state == SubscriberState::Stopping {
            self.post_after(period, Command::StartMessageLoop { session, channel });
            return;
        }

        self.pool = Pool::with_capacity(subscription.settings.queue_size);
        self.failures = 0;
        self.active = Some(channel.channel_type());
        let mut notify = tokio::time::interval(period);
        notify.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.notify = Some(notify);
        self.release_at = None;
        self.session_state = SubscriberState::Started;
        self.receiver = Some(
            self.context
                .handle()
                .spawn(receive_loop(channel, session, self.commands.clone())),
        );
        debug!(session, channel_type = ?self.active, "session started");
    }

    fn on_received(&mut self, session: u64, result: Result<M>, disconnected: bool, next: oneshot::Sender<bool>) {
        if session != self.session || self.session_state != SubscriberState::Started {
            let _ = next.send(false);
            return;
        }
        match result {
            Ok(message) => {
                self.failures = 0;
                self.pool.push(message);
                let _ = next.send(true);
            }
            Err(e) => {
                self.report_error(&e);
                self.failures += 1;
                let detects = self.active.is_some_and(ChannelType::can_detect_peer_disconnect);
                if disconnected && detects {
                    debug!(session, "publisher disconnected");
                    let _ = next.send(false);
                    self.stop();
                } else if self.failures >= MAX_RECEIVE_FAILURES {
                    warn!(session, failures = self.failures, "too many receive failures, reconnecting");
                    let _ = next.send(false);
                    self.stop();
                    if let Some(info) = self.last_info.clone() {
                        self.connect(info);
                    }
                } else {
                    let _ = next.send(true);
                }
            }
        }
    }

    fn on_notify(&mut self) {
        match self.session_state {
            SubscriberState::Started | SubscriberState::Stopping => {}
            SubscriberState::Stopped => return,
        }
        if let Some(message) = self.pool.pop() {
            if let Some(subscription) = self.subscription.as_mut() {
                (subscription.on_message)(message);
            }
            return;
        }
        if self.session_state == SubscriberState::Stopping && self.release_at.is_none() {
            let period = self
                .subscription
                .as_ref()
                .map_or(Duration::ZERO, |s| s.settings.period());
            self.release_at = Some(Instant::now() + period + RELEASE_GRACE);
        }
    }

    /// Stop receiving; queued messages are still delivered before release.
    fn stop(&mut self) {
        if self.session_state != SubscriberState::Started {
            return;
        }
        debug!(session = self.session, "stopping session");
        self.session_state = SubscriberState::Stopping;
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }

    fn release(&mut self) {
        self.release_at = None;
        self.notify = None;
        self.active = None;
        if self.state == RegisterState::Unregistered {
            self.clear();
        }
        self.session_state = SubscriberState::Stopped;
        debug!(session = self.session, "session released");
        self.apply_deferred();
    }

    fn apply_deferred(&mut self) {
        if let Some(info) = self.deferred.take() {
            self.on_find_publisher(info);
        }
    }

    fn clear(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        self.pool.clear();
        self.subscription = None;
        self.last_info = None;
    }

    async fn shutdown(mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        if !self.state.is_registered() {
            return;
        }
        let Some((node, topic)) = self
            .subscription
            .as_ref()
            .map(|s| (s.node.clone(), s.topic.clone()))
        else {
            return;
        };
        let master: Arc<dyn MasterProxy> = self.context.master().clone();
        if let Err(e) = master.unsubscribe_topic(&node, &topic).await {
            debug!(topic = %topic, error = %e, "unsubscribe on drop failed");
        }
    }
}

/// Read messages until the actor declines the next one.
async fn receive_loop<M: Message>(
    mut channel: Box<dyn ClientChannel>,
    session: u64,
    commands: mpsc::WeakUnboundedSender<Command<M>>,
) {
    loop {
        let result = match channel.receive_message().await {
            Ok(content) => M::deserialize(content).map_err(TetherError::from),
            Err(e) => Err(e),
        };
        let disconnected = !channel.is_connected();
        let (next, proceed) = oneshot::channel();
        let Some(sender) = commands.upgrade() else {
            return;
        };
        if sender
            .send(Command::Received {
                session,
                result,
                disconnected,
                next,
            })
            .is_err()
        {
            return;
        }
        drop(sender);
        if !matches!(proceed.await, Ok(true)) {
            return;
        }
    }
}

async fn next_source(sources: &mut Option<mpsc::UnboundedReceiver<TopicInfo>>) -> Option<TopicInfo> {
    match sources {
        Some(sources) => sources.recv().await,
        None => std::future::pending().await,
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

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tether_types::{ChannelAddress, ChannelDef, ImplKind};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::channel::write_framed;
    use crate::master::LocalMaster;
    use crate::message::RawMessage;
    use crate::message::testing::SimpleMessage;
    use crate::publisher::Publisher;

    fn settings(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default()
            .with_period(Duration::from_millis(30))
            .with_buffer_size(512);
        settings.channel_settings.uds.dir = dir.path().to_path_buf();
        settings.channel_settings.shm.dir = dir.path().to_path_buf();
        settings
    }

    fn sample() -> SimpleMessage {
        SimpleMessage {
            data: 42,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Publish `expected` every 100ms until the subscriber delivers it.
    async fn deliver_over(channel_type: ChannelType) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let context = Context::local();
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let talker = NodeInfo::new("talker");
        let listener = NodeInfo::new("listener");

        publisher
            .request_publish(&talker, "/chatter", channel_type.into(), settings(&dir))
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &listener,
                "/chatter",
                channel_type.into(),
                settings(&dir),
                move |message| {
                    let _ = tx.send(message);
                },
                |e| warn!(error = %e, "subscriber error"),
            )
            .await?;

        let expected = sample();
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                publisher.publish(expected.clone());
                tokio::select! {
                    message = rx.recv() => break message,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        })
        .await?;
        assert_eq!(received, Some(expected));

        subscriber.request_unsubscribe(&listener, "/chatter").await?;
        publisher.request_unpublish(&talker, "/chatter").await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_over_tcp() -> std::result::Result<(), Box<dyn std::error::Error>> {
        deliver_over(ChannelType::Tcp).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_over_udp() -> std::result::Result<(), Box<dyn std::error::Error>> {
        deliver_over(ChannelType::Udp).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_over_shm() -> std::result::Result<(), Box<dyn std::error::Error>> {
        deliver_over(ChannelType::Shm).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_over_uds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        deliver_over(ChannelType::Uds).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_over_websocket() -> std::result::Result<(), Box<dyn std::error::Error>> {
        deliver_over(ChannelType::Ws).await
    }

    #[tokio::test]
    async fn unsubscribe_requires_registration() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let context = Context::local();
        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let err = subscriber
            .request_unsubscribe(&NodeInfo::new("n"), "/chatter")
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(ref m) if m.contains("invalid state")));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_subscription_returns_to_unregistered() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let node = NodeInfo::new("listener");
        let first: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let second: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let settings = Settings::default();

        first
            .request_subscribe(&node, "/chatter", ChannelType::Tcp.into(), settings.clone(), |_| {}, |_| {})
            .await?;
        let err = second
            .request_subscribe(&node, "/chatter", ChannelType::Tcp.into(), settings.clone(), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));
        assert_eq!(master.subscriber_count("/chatter"), 1);

        // Unregistered again, so a request for another topic proceeds.
        second
            .request_subscribe(&node, "/other", ChannelType::Tcp.into(), settings, |_| {}, |_| {})
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn no_common_channel_reports_unavailable() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let context = Context::local();
        let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        publisher
            .request_publish(&NodeInfo::new("talker"), "/chatter", ChannelType::Tcp.into(), settings(&dir))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &NodeInfo::new("listener"),
                "/chatter",
                ChannelType::Shm.into(),
                settings(&dir),
                |_| {},
                move |e| {
                    let _ = tx.send(e.clone());
                },
            )
            .await?;
        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert!(matches!(err, Some(TetherError::Unavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_type_is_reported() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let context = Context::local();
        let publisher = Publisher::<RawMessage>::with_message_type(&context, MessageType::new("raw.Bytes", ImplKind::Raw));
        publisher
            .request_publish(&NodeInfo::new("talker"), "/chatter", ChannelType::Tcp.into(), settings(&dir))
            .await?;

        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &NodeInfo::new("listener"),
                "/chatter",
                ChannelType::Tcp.into(),
                settings(&dir),
                |_| {},
                move |e| {
                    let _ = tx.send(e.clone());
                },
            )
            .await?;
        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert!(matches!(err, Some(TetherError::InvalidArgument(ref m)) if m.contains("raw.Bytes")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_to_a_new_publisher() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let context = Context::local();
        let talker = NodeInfo::new("talker");
        let listener = NodeInfo::new("listener");
        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &listener,
                "/chatter",
                ChannelType::Tcp.into(),
                settings(&dir),
                move |message: SimpleMessage| {
                    let _ = tx.send(message.data);
                },
                |_| {},
            )
            .await?;

        for data in [1, 2] {
            let publisher: Publisher<SimpleMessage> = Publisher::new(&context)?;
            publisher
                .request_publish(&talker, "/chatter", ChannelType::Tcp.into(), settings(&dir))
                .await?;
            let received = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    publisher.publish(SimpleMessage { data, timestamp: 0 });
                    tokio::select! {
                        message = rx.recv() => if message != Some(data - 1) { break message },
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            })
            .await?;
            assert_eq!(received, Some(data));
            publisher.request_unpublish(&talker, "/chatter").await?;
        }
        Ok(())
    }

    /// Advertise a plain TCP listener as the source of `/chatter`.
    async fn advertise(master: &LocalMaster, listener: &TcpListener) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let source = ChannelDef::new(ChannelType::Tcp, ChannelAddress::Ip(listener.local_addr()?));
        master
            .publish_topic(
                &NodeInfo::new("talker"),
                TopicInfo {
                    topic: "/chatter".into(),
                    type_name: "tether.test.SimpleMessage".into(),
                    impl_kind: ImplKind::Json,
                    status: TopicStatus::Registered,
                    topic_source: vec![source],
                },
            )
            .await?;
        Ok(())
    }

    async fn send_data(stream: &mut TcpStream, data: i32) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_vec(&SimpleMessage { data, timestamp: 0 })?;
        write_framed(stream, &content).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_receive_failures_reconnect() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        advertise(&master, &listener).await?;

        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &NodeInfo::new("listener"),
                "/chatter",
                ChannelType::Tcp.into(),
                settings(&dir),
                move |message: SimpleMessage| {
                    let _ = tx.send(message.data);
                },
                move |e| {
                    let _ = err_tx.send(e.clone());
                },
            )
            .await?;

        let (mut first, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await??;
        for _ in 0..MAX_RECEIVE_FAILURES {
            write_framed(&mut first, b"not json").await?;
        }
        // The connection stays open, so only the failure count triggers this.
        let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;
        let mut failures = 0;
        while let Ok(e) = err_rx.try_recv() {
            assert!(matches!(e, TetherError::Aborted(ref m) if m.contains("deserialize")));
            failures += 1;
        }
        assert_eq!(failures, MAX_RECEIVE_FAILURES);

        send_data(&mut second, 7).await?;
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(received, Some(7));
        drop(first);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_session_moves_to_a_replaced_source() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let talker = NodeInfo::new("talker");
        let first: Publisher<SimpleMessage> = Publisher::new(&context)?;
        first
            .request_publish(&talker, "/chatter", ChannelType::Udp.into(), settings(&dir))
            .await?;

        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &NodeInfo::new("listener"),
                "/chatter",
                ChannelType::Udp.into(),
                settings(&dir),
                move |message: SimpleMessage| {
                    let _ = tx.send(message.data);
                },
                |_| {},
            )
            .await?;
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                first.publish(SimpleMessage { data: 1, timestamp: 0 });
                tokio::select! {
                    message = rx.recv() => break message,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        })
        .await?;
        assert_eq!(received, Some(1));

        // Re-advertise the topic from another channel while the session runs.
        // UDP cannot tell the old publisher is gone, so the session restarts.
        let second: Publisher<SimpleMessage> = Publisher::new(&context)?;
        second
            .request_publish(&talker, "/staging", ChannelType::Udp.into(), settings(&dir))
            .await?;
        let mut replacement = second.topic_info().ok_or("second publisher is not registered")?;
        replacement.topic = "/chatter".into();
        master.publish_topic(&talker, replacement).await?;

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                second.publish(SimpleMessage { data: 2, timestamp: 0 });
                tokio::select! {
                    message = rx.recv() => if message != Some(1) { break message },
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        })
        .await?;
        assert_eq!(received, Some(2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopping_session_drains_before_release() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let period = Duration::from_millis(200);
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        let first_source = TcpListener::bind("127.0.0.1:0").await?;
        advertise(&master, &first_source).await?;

        let subscriber: Subscriber<SimpleMessage> = Subscriber::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .request_subscribe(
                &NodeInfo::new("listener"),
                "/chatter",
                ChannelType::Tcp.into(),
                settings(&dir).with_period(period),
                move |message: SimpleMessage| {
                    let _ = tx.send((message.data, Instant::now()));
                },
                |_| {},
            )
            .await?;

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(2), first_source.accept()).await??;
        for data in 1..=3 {
            send_data(&mut stream, data).await?;
        }
        // The publisher vanishes with three messages still queued, and a new
        // source shows up at once.
        drop(stream);
        drop(first_source);
        let second_source = TcpListener::bind("127.0.0.1:0").await?;
        advertise(&master, &second_source).await?;

        let mut delivered = Vec::new();
        let mut last_delivery = Instant::now();
        while delivered.len() < 3 {
            let Some((data, at)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await? else {
                break;
            };
            delivered.push(data);
            last_delivery = at;
        }
        assert_eq!(delivered, vec![1, 2, 3]);

        tokio::time::timeout(Duration::from_secs(5), second_source.accept()).await??;
        assert!(last_delivery.elapsed() >= period + RELEASE_GRACE);
        Ok(())
    }
}
