//! Request/response services.
//!
//! A [`ServiceServer`] answers on one TCP listener. A [`ServiceClient`]
//! learns the server's endpoint from the master and sends one request at a
//! time over a connection it opens on first use and reopens after a
//! transport failure.
//!
//! Requests and responses are framed like stream messages, `Header || body`.
//! A response body starts with a status byte: [`RESPONSE_OK`] followed by the
//! serialized response, or [`RESPONSE_ERROR`] followed by the JSON form of
//! the [`TetherError`] the handler returned.

use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tether_types::{
    ChannelAddress, ChannelDef, ChannelType, NetError, NodeInfo, Result, ServiceInfo, ServiceStatus, TetherError,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::buffer::ChannelBuffer;
use crate::channel::{is_disconnect, read_framed, receive_buffer, write_framed};
use crate::context::Context;
use crate::message::{Message, MessageType};
use crate::settings::Settings;
use crate::socket::TcpServerSocket;
use crate::state::RegisterState;

pub const RESPONSE_OK: u8 = 0;
pub const RESPONSE_ERROR: u8 = 1;

/// Bound on one call, connect included.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Handler<Req, Resp> = Arc<dyn Fn(Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync>;
type SharedConnection = Arc<tokio::sync::Mutex<Option<Connection>>>;

fn static_type<M: Message>(role: &str) -> Result<MessageType> {
    M::message_type().ok_or_else(|| {
        TetherError::InvalidArgument(format!("{role} type is only known at runtime, use with_message_types"))
    })
}

/// Run `task` to completion on the context's runtime even if the caller
/// stops waiting for it.
async fn run_detached<T: Send + 'static>(context: &Context, task: impl Future<Output = T> + Send + 'static) -> Result<T> {
    context
        .handle()
        .spawn(task)
        .await
        .map_err(|e| TetherError::Aborted(format!("service task failed: {e}")))
}

fn encode_response<Resp: Message>(response: Result<Resp>) -> Vec<u8> {
    let (status, body) = match response.and_then(|r| r.serialize().map_err(TetherError::from)) {
        Ok(body) => (RESPONSE_OK, body),
        Err(e) => (RESPONSE_ERROR, serde_json::to_vec(&e).unwrap_or_default()),
    };
    let mut encoded = Vec::with_capacity(body.len() + 1);
    encoded.push(status);
    encoded.extend_from_slice(&body);
    encoded
}

fn decode_response<Resp: Message>(bytes: &[u8]) -> Result<Resp> {
    match bytes.split_first() {
        Some((&RESPONSE_OK, body)) => Ok(Resp::deserialize(body)?),
        Some((&RESPONSE_ERROR, body)) => Err(serde_json::from_slice(body)
            .unwrap_or_else(|e| TetherError::Protocol(format!("undecodable service error: {e}")))),
        _ => Err(TetherError::Protocol("malformed service response".into())),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Serving {
    node: NodeInfo,
    service: String,
    def: ChannelDef,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Drop for Serving {
    fn drop(&mut self) {
        self.accept_task.abort();
        for connection in self.connections.lock().drain(..) {
            connection.abort();
        }
    }
}

#[derive(Default)]
struct ServerShared {
    state: RegisterState,
    serving: Option<Serving>,
    dropped: bool,
}

pub struct ServiceServer<Req, Resp> {
    context: Context,
    request_type: MessageType,
    response_type: MessageType,
    shared: Arc<Mutex<ServerShared>>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> ServiceServer<Req, Resp> {
    pub fn new(context: &Context) -> Result<Self> {
        Ok(Self::with_message_types(
            context,
            static_type::<Req>("request")?,
            static_type::<Resp>("response")?,
        ))
    }

    pub fn with_message_types(context: &Context, request_type: MessageType, response_type: MessageType) -> Self {
        Self {
            context: context.clone(),
            request_type,
            response_type,
            shared: Arc::new(Mutex::new(ServerShared::default())),
            _types: PhantomData,
        }
    }

    pub fn state(&self) -> RegisterState {
        self.shared.lock().state
    }

    /// Endpoint clients connect to, `None` unless registered.
    pub fn channel_def(&self) -> Option<ChannelDef> {
        self.shared.lock().serving.as_ref().map(|s| s.def.clone())
    }

    /// Start listening and register `service` with the master. Every
    /// request is answered with what `handler` returns for it.
    pub async fn request_register<F, Fut>(
        &self,
        node_info: &NodeInfo,
        service: &str,
        settings: &Settings,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.shared
            .lock()
            .state
            .transition(RegisterState::Unregistered, RegisterState::Registering)?;
        let handler: Handler<Req, Resp> = Arc::new(move |request| handler(request).boxed());
        let context = self.context.clone();
        let shared = self.shared.clone();
        let node = node_info.clone();
        let service = service.to_string();
        let settings = settings.clone();
        let types = (self.request_type.type_name.clone(), self.response_type.type_name.clone());

        run_detached(&self.context, async move {
            let result = serve(&context, node, service, &settings, types, handler).await;
            let abandoned = {
                let mut shared = shared.lock();
                match result {
                    Err(e) => {
                        warn!(error = %e, "service registration failed");
                        shared.state = RegisterState::Unregistered;
                        return Err(e);
                    }
                    Ok(serving) if shared.dropped => Some(serving),
                    Ok(serving) => {
                        info!(service = %serving.service, source = %serving.def, "service serving");
                        shared.serving = Some(serving);
                        shared.state = RegisterState::Registered;
                        None
                    }
                }
            };
            if let Some(serving) = abandoned {
                let _ = context
                    .master()
                    .unregister_service_server(&serving.node, &serving.service)
                    .await;
                return Err(TetherError::Aborted("service server was dropped".into()));
            }
            Ok(())
        })
        .await?
    }

    pub async fn request_unregister(&self, node_info: &NodeInfo, service: &str) -> Result<()> {
        self.shared
            .lock()
            .state
            .transition(RegisterState::Registered, RegisterState::Unregistering)?;
        let master = self.context.master().clone();
        let shared = self.shared.clone();
        let node = node_info.clone();
        let service = service.to_string();

        run_detached(&self.context, async move {
            let result = master.unregister_service_server(&node, &service).await;
            let mut shared = shared.lock();
            match result {
                Ok(()) => {
                    shared.serving = None;
                    shared.state = RegisterState::Unregistered;
                    info!(service = %service, "service stopped");
                    Ok(())
                }
                Err(e) => {
                    shared.state = RegisterState::Registered;
                    Err(e)
                }
            }
        })
        .await?
    }
}

impl<Req, Resp> Drop for ServiceServer<Req, Resp> {
    fn drop(&mut self) {
        let serving = {
            let mut shared = self.shared.lock();
            shared.dropped = true;
            shared.serving.take()
        };
        let Some(serving) = serving else {
            return;
        };
        let master = self.context.master().clone();
        self.context.handle().spawn(async move {
            if let Err(e) = master
                .unregister_service_server(&serving.node, &serving.service)
                .await
            {
                debug!(service = %serving.service, error = %e, "unregister on drop failed");
            }
        });
    }
}

async fn serve<Req: Message, Resp: Message>(
    context: &Context,
    node: NodeInfo,
    service: String,
    settings: &Settings,
    (request_type, response_type): (String, String),
    handler: Handler<Req, Resp>,
) -> Result<Serving> {
    let socket = TcpServerSocket::listen(SocketAddr::new(settings.channel_settings.host, 0)).await?;
    let def = ChannelDef::new(ChannelType::Tcp, ChannelAddress::Ip(socket.local_addr()));
    let connections = Arc::new(Mutex::new(Vec::<AbortHandle>::new()));
    let accept_task = socket.accept_loop({
        let connections = connections.clone();
        let settings = settings.clone();
        move |stream, peer| {
            let task = tokio::spawn(answer(stream, peer, receive_buffer(&settings), handler.clone()));
            let mut connections = connections.lock();
            connections.retain(|c| !c.is_finished());
            connections.push(task.abort_handle());
            std::future::ready(())
        }
    });
    let serving = Serving {
        node,
        service,
        def: def.clone(),
        accept_task,
        connections,
    };

    let info = ServiceInfo {
        service: serving.service.clone(),
        request_type,
        response_type,
        status: ServiceStatus::Registered,
        service_source: def,
    };
    context.master().register_service_server(&serving.node, info).await?;
    Ok(serving)
}

/// Answer requests on one connection until the client leaves.
async fn answer<Req: Message, Resp: Message>(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut buffer: ChannelBuffer,
    handler: Handler<Req, Resp>,
) {
    loop {
        let response = match read_framed(&mut stream, &mut buffer).await {
            Ok(content) => match Req::deserialize(content) {
                Ok(request) => handler(request).await,
                Err(e) => Err(TetherError::from(e)),
            },
            // The oversized request was drained, so the stream is still aligned.
            Err(e @ TetherError::ResourceExhausted(_)) => Err(e),
            Err(e) => {
                if is_disconnect(&e) {
                    debug!(peer = %peer, "service client left");
                } else {
                    warn!(peer = %peer, error = %e, "dropping service connection");
                }
                return;
            }
        };
        if let Err(e) = write_framed(&mut stream, &encode_response(response)).await {
            debug!(peer = %peer, error = %e, "failed to answer service request");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Connection {
    def: ChannelDef,
    stream: TcpStream,
    buffer: ChannelBuffer,
}

impl Connection {
    async fn open(def: &ChannelDef, settings: &Settings) -> Result<Self> {
        let addr = def
            .socket_addr()
            .ok_or_else(|| TetherError::InvalidArgument(format!("{def} has no socket address")))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TetherError::from(e).context(&format!("connect to {addr}")))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            def: def.clone(),
            stream,
            buffer: receive_buffer(settings),
        })
    }

    async fn round_trip(&mut self, request: &[u8]) -> Result<&[u8]> {
        write_framed(&mut self.stream, request).await?;
        read_framed(&mut self.stream, &mut self.buffer).await
    }
}

#[derive(Default)]
struct ClientShared {
    state: RegisterState,
    registration: Option<(NodeInfo, String)>,
    settings: Settings,
    server: Option<ServiceInfo>,
    watcher: Option<JoinHandle<()>>,
    dropped: bool,
}

pub struct ServiceClient<Req, Resp> {
    context: Context,
    request_type: MessageType,
    response_type: MessageType,
    shared: Arc<Mutex<ClientShared>>,
    connection: SharedConnection,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> ServiceClient<Req, Resp> {
    pub fn new(context: &Context) -> Result<Self> {
        Ok(Self::with_message_types(
            context,
            static_type::<Req>("request")?,
            static_type::<Resp>("response")?,
        ))
    }

    pub fn with_message_types(context: &Context, request_type: MessageType, response_type: MessageType) -> Self {
        Self {
            context: context.clone(),
            request_type,
            response_type,
            shared: Arc::new(Mutex::new(ClientShared::default())),
            connection: Arc::new(tokio::sync::Mutex::new(None)),
            _types: PhantomData,
        }
    }

    pub fn state(&self) -> RegisterState {
        self.shared.lock().state
    }

    /// Server currently registered for the service, if any.
    pub fn server_info(&self) -> Option<ServiceInfo> {
        self.shared.lock().server.clone()
    }

    /// Register interest in `service`. `on_connect` is told every time a
    /// server appears or goes away.
    pub async fn request_register<F>(
        &self,
        node_info: &NodeInfo,
        service: &str,
        settings: &Settings,
        on_connect: F,
    ) -> Result<()>
    where
        F: Fn(ServiceStatus) + Send + Sync + 'static,
    {
        self.shared
            .lock()
            .state
            .transition(RegisterState::Unregistered, RegisterState::Registering)?;
        let context = self.context.clone();
        let shared = self.shared.clone();
        let connection = self.connection.clone();
        let node = node_info.clone();
        let service = service.to_string();
        let settings = settings.clone();

        run_detached(&self.context, async move {
            let (sink, updates) = mpsc::unbounded_channel();
            let result = context.master().register_service_client(&node, &service, sink).await;
            let abandoned = {
                let mut guard = shared.lock();
                match result {
                    Err(e) => {
                        warn!(service = %service, error = %e, "service client registration failed");
                        guard.state = RegisterState::Unregistered;
                        return Err(e);
                    }
                    Ok(()) if guard.dropped => true,
                    Ok(()) => {
                        let watcher = watch_server(updates, Arc::downgrade(&shared), connection, on_connect);
                        guard.watcher = Some(context.handle().spawn(watcher));
                        guard.registration = Some((node.clone(), service.clone()));
                        guard.settings = settings;
                        guard.state = RegisterState::Registered;
                        false
                    }
                }
            };
            if abandoned {
                let _ = context.master().unregister_service_client(&node, &service).await;
                return Err(TetherError::Aborted("service client was dropped".into()));
            }
            debug!(service = %service, "service client registered");
            Ok(())
        })
        .await?
    }

    pub async fn request_unregister(&self, node_info: &NodeInfo, service: &str) -> Result<()> {
        self.shared
            .lock()
            .state
            .transition(RegisterState::Registered, RegisterState::Unregistering)?;
        let master = self.context.master().clone();
        let shared = self.shared.clone();
        let connection = self.connection.clone();
        let node = node_info.clone();
        let service = service.to_string();

        run_detached(&self.context, async move {
            let result = master.unregister_service_client(&node, &service).await;
            {
                let mut guard = shared.lock();
                if let Err(e) = result {
                    guard.state = RegisterState::Registered;
                    return Err(e);
                }
                if let Some(watcher) = guard.watcher.take() {
                    watcher.abort();
                }
                guard.server = None;
                guard.registration = None;
                guard.state = RegisterState::Unregistered;
            }
            connection.lock().await.take();
            Ok(())
        })
        .await?
    }

    pub async fn call(&self, request: Req) -> Result<Resp> {
        self.call_with_timeout(request, DEFAULT_CALL_TIMEOUT).await
    }

    /// Send `request` and wait at most `timeout` for the response. Calls on
    /// one client are answered one at a time.
    pub async fn call_with_timeout(&self, request: Req, timeout: Duration) -> Result<Resp> {
        let (server, settings) = {
            let shared = self.shared.lock();
            if !shared.state.is_registered() {
                return Err(TetherError::Aborted(format!(
                    "invalid state: {}, expected {}",
                    shared.state,
                    RegisterState::Registered
                )));
            }
            let server = shared
                .server
                .clone()
                .ok_or_else(|| TetherError::Unavailable("no server registered for the service".into()))?;
            (server, shared.settings.clone())
        };
        if server.request_type != self.request_type.type_name || server.response_type != self.response_type.type_name
        {
            return Err(TetherError::InvalidArgument(format!(
                "service {} maps {} to {}, expected {} to {}",
                server.service,
                server.request_type,
                server.response_type,
                self.request_type.type_name,
                self.response_type.type_name
            )));
        }
        let content = request.serialize()?;

        let mut connection = self.connection.lock().await;
        let exchange = async {
            if (*connection).as_ref().is_none_or(|c| c.def != server.service_source) {
                *connection = Some(Connection::open(&server.service_source, &settings).await?);
            }
            let Some(open) = (*connection).as_mut() else {
                return Err(TetherError::Unavailable("no service connection".into()));
            };
            let reply = open.round_trip(&content).await?;
            Ok::<_, TetherError>(decode_response::<Resp>(reply))
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                *connection = None;
                Err(e)
            }
            Err(_) => {
                *connection = None;
                Err(TetherError::network(
                    NetError::TimedOut,
                    format!("{} did not answer within {timeout:?}", server.service),
                ))
            }
        }
    }
}

impl<Req, Resp> Drop for ServiceClient<Req, Resp> {
    fn drop(&mut self) {
        let registration = {
            let mut shared = self.shared.lock();
            shared.dropped = true;
            if let Some(watcher) = shared.watcher.take() {
                watcher.abort();
            }
            shared.registration.take()
        };
        let Some((node, service)) = registration else {
            return;
        };
        let master = self.context.master().clone();
        self.context.handle().spawn(async move {
            if let Err(e) = master.unregister_service_client(&node, &service).await {
                debug!(service = %service, error = %e, "unregister on drop failed");
            }
        });
    }
}

/// Track the service's server as the master reports it.
async fn watch_server<F>(
    mut updates: mpsc::UnboundedReceiver<ServiceInfo>,
    shared: Weak<Mutex<ClientShared>>,
    connection: SharedConnection,
    on_connect: F,
) where
    F: Fn(ServiceStatus) + Send + Sync + 'static,
{
    while let Some(info) = updates.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let status = info.status;
        match status {
            ServiceStatus::Registered => {
                debug!(service = %info.service, source = %info.service_source, "service server found");
                shared.lock().server = Some(info);
            }
            ServiceStatus::Unregistered => {
                debug!(service = %info.service, "service server went away");
                shared.lock().server = None;
                connection.lock().await.take();
            }
        }
        on_connect(status);
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::master::LocalMaster;
    use crate::message::JsonMessage;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    impl JsonMessage for AddRequest {
        const TYPE_NAME: &'static str = "tether.test.AddRequest";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddResponse {
        sum: i64,
    }

    impl JsonMessage for AddResponse {
        const TYPE_NAME: &'static str = "tether.test.AddResponse";
    }

    async fn add(request: AddRequest) -> Result<AddResponse> {
        if request.a < 0 || request.b < 0 {
            return Err(TetherError::InvalidArgument("negative operand".into()));
        }
        Ok(AddResponse {
            sum: request.a + request.b,
        })
    }

    fn local() -> (Arc<LocalMaster>, Context) {
        let master = Arc::new(LocalMaster::new());
        let context = Context::new(master.clone(), tokio::runtime::Handle::current());
        (master, context)
    }

    #[tokio::test]
    async fn answers_requests_and_handler_errors() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_master, context) = local();
        let settings = Settings::default();
        let server: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        server
            .request_register(&NodeInfo::new("adder"), "/add", &settings, add)
            .await?;

        let client: ServiceClient<AddRequest, AddResponse> = ServiceClient::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .request_register(&NodeInfo::new("caller"), "/add", &settings, move |status| {
                let _ = tx.send(status);
            })
            .await?;
        let status = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(status, Some(ServiceStatus::Registered));
        assert_eq!(client.server_info().map(|i| i.service_source), server.channel_def());

        assert_eq!(client.call(AddRequest { a: 2, b: 3 }).await?, AddResponse { sum: 5 });
        let err = client.call(AddRequest { a: 10, b: -1 }).await.unwrap_err();
        assert_eq!(err, TetherError::InvalidArgument("negative operand".into()));
        // A handler error leaves the connection usable.
        assert_eq!(client.call(AddRequest { a: 1, b: 1 }).await?.sum, 2);
        Ok(())
    }

    #[tokio::test]
    async fn calls_follow_the_server_lifecycle() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (master, context) = local();
        let settings = Settings::default();
        let adder = NodeInfo::new("adder");
        let client: ServiceClient<AddRequest, AddResponse> = ServiceClient::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .request_register(&NodeInfo::new("caller"), "/add", &settings, move |status| {
                let _ = tx.send(status);
            })
            .await?;
        let err = client.call(AddRequest { a: 1, b: 2 }).await.unwrap_err();
        assert!(matches!(err, TetherError::Unavailable(_)));

        let server: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        server.request_register(&adder, "/add", &settings, add).await?;
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?,
            Some(ServiceStatus::Registered)
        );
        assert_eq!(client.call(AddRequest { a: 1, b: 2 }).await?.sum, 3);

        server.request_unregister(&adder, "/add").await?;
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?,
            Some(ServiceStatus::Unregistered)
        );
        assert!(master.service_info("/add").is_none());
        assert!(server.channel_def().is_none());
        let err = client.call(AddRequest { a: 1, b: 2 }).await.unwrap_err();
        assert!(matches!(err, TetherError::Unavailable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn server_registration_state_machine() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_master, context) = local();
        let settings = Settings::default();
        let node = NodeInfo::new("adder");
        let first: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        let err = first.request_unregister(&node, "/add").await.unwrap_err();
        assert!(matches!(err, TetherError::Aborted(ref m) if m.contains("invalid state")));

        first.request_register(&node, "/add", &settings, add).await?;
        let err = first.request_register(&node, "/add", &settings, add).await.unwrap_err();
        assert!(matches!(err, TetherError::Aborted(ref m) if m.contains("invalid state")));

        let second: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        let err = second
            .request_register(&NodeInfo::new("other"), "/add", &settings, add)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(_)));
        assert_eq!(second.state(), RegisterState::Unregistered);
        assert!(second.channel_def().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_server_releases_the_service() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (master, context) = local();
        let server: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        server
            .request_register(&NodeInfo::new("adder"), "/add", &Settings::default(), add)
            .await?;
        assert!(master.service_info("/add").is_some());

        drop(server);
        tokio::time::timeout(Duration::from_secs(1), async {
            while master.service_info("/add").is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_types_are_rejected() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (_master, context) = local();
        let settings = Settings::default();
        let server: ServiceServer<AddRequest, AddResponse> = ServiceServer::new(&context)?;
        server
            .request_register(&NodeInfo::new("adder"), "/add", &settings, add)
            .await?;

        let client: ServiceClient<AddRequest, AddRequest> = ServiceClient::new(&context)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .request_register(&NodeInfo::new("caller"), "/add", &settings, move |status| {
                let _ = tx.send(status);
            })
            .await?;
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        let err = client.call(AddRequest { a: 1, b: 2 }).await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidArgument(ref m) if m.contains("tether.test.AddResponse")));
        Ok(())
    }

    #[test]
    fn malformed_responses_are_protocol_errors() {
        assert!(matches!(decode_response::<AddResponse>(&[]), Err(TetherError::Protocol(_))));
        assert!(matches!(decode_response::<AddResponse>(&[9, 1]), Err(TetherError::Protocol(_))));
        let encoded = encode_response::<AddResponse>(Err(TetherError::NotFound("x".into())));
        assert_eq!(encoded[0], RESPONSE_ERROR);
        assert_eq!(decode_response::<AddResponse>(&encoded), Err(TetherError::NotFound("x".into())));
    }
}
