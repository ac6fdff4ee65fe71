//! Extension of the base router that owns the ID allocator, route
//! monitor, and module-forwarding responder; exposes `connect(method, …)`
//! and `proxy_connect(via, method, …)`.

use crate::{
    bootstrap,
    config::RuntimeConfig,
    context::Context,
    error::Error,
    id_allocator::{encode_allocation, IdAllocator, ALLOCATION_CHUNK},
    message::{Envelope, MessageKind},
    module_forwarder::{GetModule, Module, ModuleForwarder},
    route_monitor::RouteMonitor,
    stream::ParentStream,
    transports::{self, ConnectOptions},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::oneshot;

/// Structured error record a remote `proxy_connect` failure is reported
/// as, re-raised locally as a stream-setup error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConnectError {
    pub msg: String,
}

/// Request payload an intermediary receives to perform a `connect()` on
/// the master's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConnectRequest {
    pub method: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub container: Option<String>,
}

/// Reply to a `ProxyConnectRequest`: either the new context's id and name,
/// or a failure reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyConnectReply {
    Connected { id: u32, name: String },
    Failed(RemoteConnectError),
}

struct PendingAllocation {
    reply: oneshot::Sender<Range<u32>>,
}

type PendingAllocationSlot = Arc<Mutex<Option<PendingAllocation>>>;

/// Owns every directly spawned child's stream, the routing tables, and the
/// parent-only services (ID allocator, route monitor, module forwarder).
pub struct Router {
    self_id: AtomicU32,
    contexts: Mutex<HashMap<u32, Context>>,
    routes: Mutex<HashMap<u32, Arc<ParentStream>>>,
    parent_stream: Option<Arc<ParentStream>>,
    id_allocator: IdAllocator,
    pub module_forwarder: ModuleForwarder,
    route_monitor: Mutex<Option<Arc<RouteMonitor>>>,
    pending_allocation: PendingAllocationSlot,
    pending_proxy_connect: Mutex<HashMap<u32, oneshot::Sender<ProxyConnectReply>>>,
    /// Downstream (stream, requester_id) pairs waiting on a module a
    /// cache miss has already asked the parent stream for, keyed by
    /// module name, so a second concurrent miss for the same module
    /// doesn't issue a second upstream request.
    pending_module_requests: Mutex<HashMap<String, Vec<(Arc<ParentStream>, u32)>>>,
    pub config: RuntimeConfig,
    preamble_source: String,
}

impl Router {
    /// The master: owns the ID counter directly and has no parent stream.
    pub fn new_master(config: RuntimeConfig, preamble_source: String) -> Arc<Self> {
        let router = Arc::new(Self {
            self_id: AtomicU32::new(0),
            contexts: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            parent_stream: None,
            id_allocator: IdAllocator::local(1),
            module_forwarder: ModuleForwarder::new(),
            route_monitor: Mutex::new(None),
            pending_allocation: Arc::new(Mutex::new(None)),
            pending_proxy_connect: Mutex::new(HashMap::new()),
            pending_module_requests: Mutex::new(HashMap::new()),
            config,
            preamble_source,
        });
        router.upgrade();
        router
    }

    /// A non-master node: its ID allocator proxies `ALLOCATE_ID` to
    /// `parent_stream`, and a background task demultiplexes the replies.
    pub fn new_child(
        config: RuntimeConfig,
        preamble_source: String,
        self_id: u32,
        parent_stream: Arc<ParentStream>,
    ) -> Arc<Self> {
        let pending_allocation: PendingAllocationSlot = Arc::new(Mutex::new(None));
        let refill = make_refill(parent_stream.clone(), pending_allocation.clone());

        let router = Arc::new(Self {
            self_id: AtomicU32::new(self_id),
            contexts: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            parent_stream: Some(parent_stream.clone()),
            id_allocator: IdAllocator::remote(refill),
            module_forwarder: ModuleForwarder::new(),
            route_monitor: Mutex::new(None),
            pending_allocation,
            pending_proxy_connect: Mutex::new(HashMap::new()),
            pending_module_requests: Mutex::new(HashMap::new()),
            config,
            preamble_source,
        });
        router.upgrade();
        router.spawn_dispatch_loop(parent_stream);
        router
    }

    /// Wires the route monitor; called once the router is behind an `Arc`
    /// since `RouteMonitor` holds a back-reference to it.
    fn upgrade(self: &Arc<Self>) {
        *self.route_monitor.lock() = Some(Arc::new(RouteMonitor::new(self.clone())));
    }

    pub fn self_id(&self) -> u32 {
        self.self_id.load(Ordering::SeqCst)
    }

    pub fn is_master(&self) -> bool {
        self.parent_stream.is_none()
    }

    fn route_monitor(&self) -> Arc<RouteMonitor> {
        self.route_monitor
            .lock()
            .clone()
            .expect("router upgraded before use")
    }

    pub fn parent_stream(&self) -> Option<Arc<ParentStream>> {
        self.parent_stream.clone()
    }

    pub fn route(&self, id: u32) -> Option<Arc<ParentStream>> {
        self.routes.lock().get(&id).cloned()
    }

    pub fn is_default_upstream(&self, stream: &Arc<ParentStream>) -> bool {
        self.parent_stream
            .as_ref()
            .is_some_and(|parent| Arc::ptr_eq(parent, stream))
    }

    /// Returns the explicit route if any, else the default upstream route,
    /// so packets addressed to unknown IDs move toward the root.
    pub fn stream_by_id(&self, id: u32) -> Option<Arc<ParentStream>> {
        self.route(id).or_else(|| self.parent_stream.clone())
    }

    pub fn install_route(&self, id: u32, stream: Arc<ParentStream>) {
        self.routes.lock().insert(id, stream);
    }

    pub fn remove_route(&self, id: u32) {
        self.routes.lock().remove(&id);
    }

    pub fn context(&self, id: u32) -> Option<Context> {
        self.contexts.lock().get(&id).cloned()
    }

    pub fn context_or_create(&self, id: u32) -> Context {
        self.contexts
            .lock()
            .entry(id)
            .or_insert_with(|| Context::new(self as *const _ as usize, id, None))
            .clone()
    }

    pub fn register_stream(&self, stream: Arc<ParentStream>) {
        self.routes.lock().insert(stream.remote_id, stream);
    }

    /// Fails any `proxy_connect` calls still waiting on a reply through one
    /// of `ids`, called once those routes are retracted on disconnect.
    pub(crate) fn fail_pending_proxy_connects(&self, ids: &[u32]) {
        let mut pending = self.pending_proxy_connect.lock();
        for id in ids {
            if let Some(tx) = pending.remove(id) {
                let _ = tx.send(ProxyConnectReply::Failed(RemoteConnectError {
                    msg: "stream disconnected before reply".to_string(),
                }));
            }
        }
    }

    /// Connects to a fresh direct child using the named transport method.
    /// `"local"` is an alias for the base parent transport.
    pub async fn connect(
        self: &Arc<Self>,
        method: &str,
        name: Option<&str>,
        options: ConnectOptions,
    ) -> Result<Context, Error> {
        let transport = transports::build_by_method_name(method, &options)?;
        let id = self.id_allocator.allocate().await?;
        let remote_name = name
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| method.to_string());

        let bootstrap = bootstrap::assemble(&self.config, &remote_name, &self.preamble_source);
        let argv = transport.wrap_argv(&bootstrap.argv);

        let stream = ParentStream::connect(
            &self.config,
            id,
            &remote_name,
            transport.spawn_mode(),
            &argv,
            &bootstrap.compressed_preamble,
        )
        .await?;
        let stream = Arc::new(stream);

        self.route_monitor().notice_stream(stream.clone()).await;
        self.spawn_dispatch_loop(stream.clone());

        let context = self.context_or_create(id);
        context.set_name(stream.name.clone());
        Ok(context)
    }

    /// Asks the `via` context to perform the equivalent `connect()` on the
    /// master's behalf, returning a synthesised context whose `via` is the
    /// intermediary. The reply is delivered through the normal dispatch
    /// loop for `via`'s stream rather than read here directly, so this can
    /// run concurrently with other traffic on the same stream.
    pub async fn proxy_connect(
        self: &Arc<Self>,
        via: &Context,
        method: &str,
        name: Option<&str>,
        options: ConnectOptions,
    ) -> Result<Context, Error> {
        let stream = self
            .route(via.id())
            .ok_or_else(|| Error::RemoteConnect(via.id(), "no route to via context".into()))?;

        let request = ProxyConnectRequest {
            method: method.to_string(),
            name: name.map(ToOwned::to_owned),
            hostname: options.hostname,
            username: options.username,
            container: options.container,
        };
        let payload = bincode::serialize(&request)
            .map_err(|err| Error::ProtocolViolation(err.to_string().into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending_proxy_connect.lock().insert(via.id(), tx);

        let self_id = self.self_id.load(Ordering::SeqCst);
        if let Err(err) = stream
            .handler
            .send(&Envelope::new(MessageKind::Connect, self_id, via.id(), payload))
            .await
        {
            self.pending_proxy_connect.lock().remove(&via.id());
            return Err(err);
        }

        let reply = rx
            .await
            .map_err(|_| Error::RemoteConnect(via.id(), "stream disconnected before reply".into()))?;

        match reply {
            ProxyConnectReply::Connected { id, name } => {
                let via_name = via.name().unwrap_or_default();
                let context = Context::new(self.as_ref() as *const _ as usize, id, Some(via.clone()));
                context.set_name(format!("{}.{}", via_name, name));
                self.install_route(id, stream);
                self.contexts.lock().insert(id, context.clone());
                Ok(context)
            }
            ProxyConnectReply::Failed(err) => Err(Error::RemoteConnect(via.id(), err.msg.into())),
        }
    }

    /// Background task demultiplexing one stream's inbound envelopes to
    /// the route monitor, module forwarder, or pending-allocation waiter.
    fn spawn_dispatch_loop(self: &Arc<Self>, stream: Arc<ParentStream>) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                match stream.handler.recv().await {
                    Ok(Some(envelope)) => router.dispatch(&stream, envelope).await,
                    Ok(None) => {
                        router.route_monitor().on_stream_disconnect(&stream).await;
                        break;
                    }
                    Err(_) => {
                        router.route_monitor().on_stream_disconnect(&stream).await;
                        break;
                    }
                }
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, stream: &Arc<ParentStream>, envelope: Envelope) {
        match envelope.kind {
            MessageKind::AddRoute => {
                if !self.from_immediate_child(stream, &envelope) {
                    return;
                }
                self.route_monitor().on_add_route(stream, &envelope.payload).await;
            }
            MessageKind::DelRoute => {
                if !self.from_immediate_child(stream, &envelope) {
                    return;
                }
                self.route_monitor().on_del_route(stream, &envelope.payload).await;
            }
            MessageKind::AllocateId => self.handle_allocate_id(stream, &envelope).await,
            MessageKind::Data => self.handle_data(stream, envelope).await,
            MessageKind::Connect => self.handle_connect_envelope(stream, envelope).await,
            MessageKind::LoadModule => self.handle_load_module(envelope).await,
            MessageKind::Shutdown => {}
        }
    }

    /// Immediate-child policy: `ADD_ROUTE`/`DEL_ROUTE` are only honoured
    /// from the stream that owns the announced ID directly, not forwarded
    /// on behalf of some other context.
    fn from_immediate_child(&self, stream: &Arc<ParentStream>, envelope: &Envelope) -> bool {
        if envelope.source_id != stream.remote_id {
            crate::log_warn!(
                "dropping {:?} from {} claiming source {}",
                envelope.kind,
                stream.remote_id,
                envelope.source_id
            );
            return false;
        }
        true
    }

    /// Either the reply to one of our own outstanding `proxy_connect`
    /// calls, or an incoming request for us to perform a `connect()` on
    /// the sender's behalf.
    async fn handle_connect_envelope(self: &Arc<Self>, stream: &Arc<ParentStream>, envelope: Envelope) {
        if let Some(reply_tx) = self.pending_proxy_connect.lock().remove(&envelope.source_id) {
            if let Ok(reply) = envelope.decode::<ProxyConnectReply>() {
                let _ = reply_tx.send(reply);
            }
            return;
        }

        if envelope.dest_id != self.self_id() {
            return;
        }

        let Ok(request) = envelope.decode::<ProxyConnectRequest>() else {
            return;
        };
        let requester_id = envelope.source_id;

        let options = ConnectOptions {
            hostname: request.hostname,
            username: request.username,
            container: request.container,
            extra: HashMap::new(),
        };
        let reply = match self.connect(&request.method, request.name.as_deref(), options).await {
            Ok(context) => ProxyConnectReply::Connected {
                id: context.id(),
                name: context.name().unwrap_or_default(),
            },
            Err(err) => ProxyConnectReply::Failed(RemoteConnectError { msg: err.to_string() }),
        };

        let Ok(payload) = bincode::serialize(&reply) else {
            return;
        };
        let _ = stream
            .handler
            .send(&Envelope::new(MessageKind::Connect, self.self_id(), requester_id, payload))
            .await;
    }

    async fn handle_allocate_id(self: &Arc<Self>, stream: &Arc<ParentStream>, envelope: &Envelope) {
        if self.is_master() {
            if let Ok(allocated) = self.allocate_range_local().await {
                let reply = encode_allocation(&allocated);
                let _ = stream.handler.send(&reply).await;
            }
            return;
        }

        // A reply to our own outstanding request.
        if let Some(pending) = self.pending_allocation.lock().take() {
            if let Ok((start, end)) = bincode::deserialize::<(u32, u32)>(&envelope.payload) {
                let _ = pending.reply.send(start..end);
            }
        }
    }

    async fn allocate_range_local(&self) -> Result<Range<u32>, Error> {
        // The master's own allocator already serialises concurrent
        // refills; borrow its range machinery to mint a fresh chunk.
        let mut start = 0u32;
        for i in 0..ALLOCATION_CHUNK {
            let id = self.id_allocator.allocate().await?;
            if i == 0 {
                start = id;
            }
        }
        Ok(start..start + ALLOCATION_CHUNK)
    }

    async fn handle_data(self: &Arc<Self>, stream: &Arc<ParentStream>, envelope: Envelope) {
        let Ok(request) = bincode::deserialize::<GetModule>(&envelope.payload) else {
            return;
        };

        if self.module_forwarder.get(&request.name).is_some() || self.is_master() {
            let _ = self
                .module_forwarder
                .serve(&stream.handler, envelope.source_id, &request)
                .await;
            return;
        }

        self.forward_module_miss(stream.clone(), envelope.source_id, request).await;
    }

    /// A non-master router's cache missed: ask its own parent for the
    /// module (§4.8's "registers a callback on the importer, which will
    /// itself recursively ask upstream"), and remember who to push it to
    /// once it arrives. A module already in flight just gets another
    /// waiter appended, rather than a second upstream request.
    async fn forward_module_miss(self: &Arc<Self>, stream: Arc<ParentStream>, requester_id: u32, request: GetModule) {
        let Some(parent) = self.parent_stream() else {
            return;
        };

        let already_in_flight = {
            let mut pending = self.pending_module_requests.lock();
            let in_flight = pending.contains_key(&request.name);
            pending.entry(request.name.clone()).or_default().push((stream, requester_id));
            in_flight
        };
        if already_in_flight {
            return;
        }

        let _ = parent
            .handler
            .send_data(MessageKind::Data, self.self_id(), 0, &request)
            .await;
    }

    /// A module pushed back by our own parent stream: cache it, then
    /// replay `serve` for every downstream requester that was waiting on
    /// it (delivering its transitive dependencies too, where cached).
    async fn handle_load_module(self: &Arc<Self>, envelope: Envelope) {
        let Ok(module) = envelope.decode::<Module>() else {
            return;
        };

        let waiters = {
            let mut pending = self.pending_module_requests.lock();
            pending.remove(&module.name).unwrap_or_default()
        };

        self.module_forwarder.insert(module.clone());

        let request = GetModule { name: module.name };
        for (stream, requester_id) in waiters {
            let _ = self.module_forwarder.serve(&stream.handler, requester_id, &request).await;
        }
    }
}

/// Issues the `ALLOCATE_ID` RPC to `parent_stream` and awaits the reply
/// via `pending`, for use as a non-master router's `IdAllocator` refill
/// closure. Built before the owning `Router` exists (it only needs the
/// stream and the shared pending-reply slot, not the router itself).
fn make_refill(
    parent_stream: Arc<ParentStream>,
    pending: PendingAllocationSlot,
) -> crate::id_allocator::RefillFn {
    Box::new(move || {
        let parent_stream = parent_stream.clone();
        let pending = pending.clone();
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            *pending.lock() = Some(PendingAllocation { reply: tx });
            parent_stream
                .handler
                .send_kind(MessageKind::AllocateId, 0, 0)
                .await?;
            rx.await.map_err(|_| Error::Timeout("id allocation reply"))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_monitor::encode_add_route;

    #[tokio::test]
    async fn master_allocator_yields_range_starting_at_one() {
        let router = Router::new_master(RuntimeConfig::default(), String::new());
        let range = router.allocate_range_local().await.unwrap();
        assert_eq!(range.start, 1);
        assert_eq!(range.end - range.start, ALLOCATION_CHUNK);
    }

    #[test]
    fn default_route_falls_back_to_parent() {
        let router = Router::new_master(RuntimeConfig::default(), String::new());
        assert!(router.stream_by_id(999).is_none());
        assert!(router.is_master());
    }

    #[tokio::test]
    async fn connect_reply_resolves_the_matching_pending_call() {
        let router = Router::new_master(RuntimeConfig::default(), String::new());
        let (tx, rx) = oneshot::channel();
        router.pending_proxy_connect.lock().insert(7, tx);

        let (a, b) = crate::message::Handler::pair().unwrap();
        let reply = ProxyConnectReply::Connected { id: 42, name: "worker".to_string() };
        let payload = bincode::serialize(&reply).unwrap();
        let envelope = Envelope::new(MessageKind::Connect, 7, 0, payload);

        let stream = Arc::new(ParentStream::test_only(7, "worker", a));
        router.handle_connect_envelope(&stream, envelope).await;
        drop(b);

        match rx.await.unwrap() {
            ProxyConnectReply::Connected { id, name } => {
                assert_eq!(id, 42);
                assert_eq!(name, "worker");
            }
            ProxyConnectReply::Failed(_) => panic!("expected a Connected reply"),
        }
    }

    #[tokio::test]
    async fn add_route_from_a_non_immediate_child_is_dropped() {
        let router = Router::new_master(RuntimeConfig::default(), String::new());
        let (a, _b) = crate::message::Handler::pair().unwrap();
        let stream = Arc::new(ParentStream::test_only(7, "worker", a));

        // Claims to announce a route on behalf of context 99, but the
        // arrival stream only owns context 7.
        let envelope = Envelope::new(MessageKind::AddRoute, 99, 0, encode_add_route(5, None));
        router.dispatch(&stream, envelope).await;

        assert!(router.route(5).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn module_miss_is_forwarded_upstream_and_replayed_downstream() {
        let (parent_up, parent_down) = crate::message::Handler::pair().unwrap();
        let parent_stream = Arc::new(ParentStream::test_only(2, "upstream", parent_up));
        let router = Router::new_child(RuntimeConfig::default(), String::new(), 2, parent_stream);

        let (down_a, down_b) = crate::message::Handler::pair().unwrap();
        let downstream = Arc::new(ParentStream::test_only(5, "child", down_a));

        let request = GetModule { name: "foo".to_string() };
        let envelope = Envelope::new(MessageKind::Data, 5, 0, bincode::serialize(&request).unwrap());
        router.dispatch(&downstream, envelope).await;

        let forwarded = parent_down.recv().await.unwrap().unwrap();
        assert_eq!(forwarded.kind, MessageKind::Data);
        let forwarded_request: GetModule = forwarded.decode().unwrap();
        assert_eq!(forwarded_request.name, "foo");

        let module = crate::module_forwarder::Module {
            name: "foo".to_string(),
            blob: b"blob".to_vec(),
            dependencies: vec![],
        };
        let payload = bincode::serialize(&module).unwrap();
        parent_down
            .send(&Envelope::new(MessageKind::LoadModule, 0, 2, payload))
            .await
            .unwrap();

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), down_b.recv())
            .await
            .expect("module should be replayed downstream")
            .unwrap()
            .unwrap();
        let pushed_module: crate::module_forwarder::Module = pushed.decode().unwrap();
        assert_eq!(pushed_module.name, "foo");
    }

    #[tokio::test]
    async fn disconnect_fails_pending_proxy_connect_for_its_routes() {
        let router = Router::new_master(RuntimeConfig::default(), String::new());
        let (tx, rx) = oneshot::channel();
        router.pending_proxy_connect.lock().insert(7, tx);

        router.fail_pending_proxy_connects(&[7]);

        match rx.await.unwrap() {
            ProxyConnectReply::Failed(_) => {}
            ProxyConnectReply::Connected { .. } => panic!("expected a Failed reply"),
        }
    }
}
