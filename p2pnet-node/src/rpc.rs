//! Request/response calls over pooled streams.
//!
//! Requests and responses are length-prefixed bincode frames on a stream
//! opened with the RPC protocol tag. A server serves one request at a time per
//! stream. Clients keep a stream per peer after a clean round trip and reuse it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use p2pnet_core::wire::{decode_payload, encode_payload};
use p2pnet_core::{PeerId, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{CallError, Error, Result};
use crate::framed::{read_frame, write_msg};
use crate::stream::Stream;
use crate::transport::{handler_fn, PeerTransport};

type MethodFuture = Pin<Box<dyn Future<Output = RpcResponse> + Send + 'static>>;
type Method = Arc<dyn Fn(Vec<u8>) -> MethodFuture + Send + Sync>;

/// A named set of methods, each taking one argument and returning one result.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add `name`. An `Err` from `f` reaches the caller as `CallError::Remote`.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        let method: Method = Arc::new(move |args: Vec<u8>| -> MethodFuture {
            let arg = match decode_payload::<A>(&args) {
                Ok(a) => a,
                Err(e) => {
                    let msg = format!("decoding argument: {e}");
                    return Box::pin(async move { RpcResponse::BadRequest(msg) });
                }
            };
            let fut = f(arg);
            Box::pin(async move {
                match fut.await {
                    Ok(result) => match encode_payload(&result) {
                        Ok(bytes) => RpcResponse::Ok(bytes),
                        Err(e) => RpcResponse::Err(format!("encoding result: {e}")),
                    },
                    Err(msg) => RpcResponse::Err(msg),
                }
            })
        });
        self.methods.insert(name.to_string(), method);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type ServiceTable = RwLock<HashMap<String, Arc<Service>>>;

pub struct Rpc {
    transport: Arc<dyn PeerTransport>,
    protocol: String,
    services: Arc<ServiceTable>,
    pool: Mutex<HashMap<PeerId, Vec<Stream>>>,
    inbound: Arc<AtomicUsize>,
    call_timeout: Duration,
}

impl Rpc {
    /// Start serving `protocol` on the transport. Services are added with `register`.
    pub fn new(transport: Arc<dyn PeerTransport>, protocol: String, call_timeout: Duration) -> Self {
        let services: Arc<ServiceTable> = Arc::default();
        let inbound = Arc::new(AtomicUsize::new(0));
        let table = services.clone();
        let counter = inbound.clone();
        transport.set_stream_handler(
            &protocol,
            handler_fn(move |stream| serve(table.clone(), counter.clone(), stream)),
        );
        debug!(%protocol, "rpc serving");
        Self {
            transport,
            protocol,
            services,
            pool: Mutex::new(HashMap::new()),
            inbound,
            call_timeout,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Inbound RPC streams currently being served.
    pub fn inbound_streams(&self) -> usize {
        self.inbound.load(Ordering::SeqCst)
    }

    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_string()));
        }
        debug!(service = service.name(), methods = service.methods.len(), "service registered");
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// `call_with_timeout` with the configured call timeout.
    pub async fn call<A, R>(
        &self,
        peer: PeerId,
        service: &str,
        method: &str,
        args: &A,
    ) -> std::result::Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(peer, service, method, args, self.call_timeout)
            .await
    }

    /// Dropping the returned future before it resolves resets the stream in use.
    pub async fn call_with_timeout<A, R>(
        &self,
        peer: PeerId,
        service: &str,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> std::result::Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request = RpcRequest {
            service: service.to_string(),
            method: method.to_string(),
            args: encode_payload(args).map_err(|e| CallError::Codec(e.to_string()))?,
        };
        let response = tokio::time::timeout(timeout, self.round_trip(peer, &request))
            .await
            .map_err(|_| CallError::Timeout)??;
        match response {
            RpcResponse::Ok(bytes) => {
                decode_payload::<R>(&bytes).map_err(|e| CallError::Codec(e.to_string()))
            }
            RpcResponse::Err(msg) => Err(CallError::Remote(msg)),
            RpcResponse::UnknownService => Err(CallError::UnknownService(service.to_string())),
            RpcResponse::UnknownMethod => Err(CallError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            }),
            RpcResponse::BadRequest(msg) => Err(CallError::Codec(msg)),
        }
    }

    async fn round_trip(
        &self,
        peer: PeerId,
        request: &RpcRequest,
    ) -> std::result::Result<RpcResponse, CallError> {
        if let Some(stream) = self.take_pooled(peer) {
            let mut call = InFlight::new(stream);
            match call.exchange(request).await {
                Ok(Some(response)) => {
                    self.put_back(peer, call.finish());
                    return Ok(response);
                }
                Err(Failed(e @ CallError::Codec(_))) => return Err(e),
                // The remote closed or reset the pooled stream; retry on a fresh one.
                _ => debug!(%peer, "pooled rpc stream stale"),
            }
        }

        let stream = self
            .transport
            .open_stream(peer, &self.protocol)
            .await
            .map_err(|e| CallError::Stream(e.to_string()))?;
        let mut call = InFlight::new(stream);
        match call.exchange(request).await {
            Ok(Some(response)) => {
                self.put_back(peer, call.finish());
                Ok(response)
            }
            Ok(None) => Err(CallError::Stream("stream closed before response".into())),
            Err(Stale) => Err(CallError::Stream("write failed".into())),
            Err(Failed(e)) => Err(e),
        }
    }

    fn take_pooled(&self, peer: PeerId) -> Option<Stream> {
        let mut pool = self.lock_pool();
        let streams = pool.get_mut(&peer)?;
        let stream = streams.pop();
        if streams.is_empty() {
            pool.remove(&peer);
        }
        stream
    }

    fn put_back(&self, peer: PeerId, stream: Stream) {
        self.lock_pool().entry(peer).or_default().push(stream);
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Vec<Stream>>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop serving and drop pooled streams.
    pub fn close(&self) {
        self.transport.remove_stream_handler(&self.protocol);
        self.lock_pool().clear();
    }
}

enum ExchangeError {
    Stale,
    Failed(CallError),
}
use ExchangeError::{Failed, Stale};

/// A stream with a request in flight. Reset on drop unless the exchange completed.
struct InFlight {
    stream: Option<Stream>,
}

impl InFlight {
    fn new(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// `Ok(None)` if the remote closed the stream without answering.
    async fn exchange(
        &mut self,
        request: &RpcRequest,
    ) -> std::result::Result<Option<RpcResponse>, ExchangeError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Stale);
        };
        if write_msg(stream, request).await.is_err() {
            return Err(Stale);
        }
        let payload = match read_frame(stream).await {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Err(Stale),
            Err(e) => return Err(Failed(CallError::Stream(e.to_string()))),
        };
        decode_payload::<RpcResponse>(&payload)
            .map(Some)
            .map_err(|e| Failed(CallError::Codec(e.to_string())))
    }

    fn finish(mut self) -> Stream {
        match self.stream.take() {
            Some(s) => s,
            None => unreachable!("InFlight finished twice"),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.reset();
        }
    }
}

/// Counts a stream as served for as long as it lives.
struct Serving(Arc<AtomicUsize>);

impl Serving {
    fn enter(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Serving {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve requests on one inbound stream until the caller closes or resets it.
/// A reset mid-call abandons the method future.
async fn serve(services: Arc<ServiceTable>, inbound: Arc<AtomicUsize>, mut stream: Stream) {
    let _serving = Serving::enter(inbound);
    let remote = stream.remote_peer();
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %remote, "rpc stream failed: {e}");
                break;
            }
        };
        let response = match decode_payload::<RpcRequest>(&payload) {
            Ok(req) => {
                tokio::select! {
                    response = dispatch(&services, req) => response,
                    _ = caller_gone(&mut stream) => {
                        debug!(peer = %remote, "rpc caller went away mid-call");
                        break;
                    }
                }
            }
            Err(e) => RpcResponse::BadRequest(format!("malformed request: {e}")),
        };
        if write_msg(&mut stream, &response).await.is_err() {
            break;
        }
    }
}

/// Resolves when the caller resets or closes the stream. Callers send nothing
/// while a request is outstanding, so any read completing means the call is over.
async fn caller_gone(stream: &mut Stream) {
    let mut byte = [0u8; 1];
    let _ = stream.read(&mut byte).await;
}

async fn dispatch(services: &ServiceTable, req: RpcRequest) -> RpcResponse {
    let method = {
        let services = services.read().unwrap_or_else(|e| e.into_inner());
        let Some(service) = services.get(&req.service) else {
            return RpcResponse::UnknownService;
        };
        let Some(method) = service.methods.get(&req.method) else {
            return RpcResponse::UnknownMethod;
        };
        method.clone()
    };
    method(req.args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(service: Service) -> ServiceTable {
        let table = ServiceTable::default();
        table
            .write()
            .unwrap()
            .insert(service.name().to_string(), Arc::new(service));
        table
    }

    fn request<A: Serialize>(service: &str, method: &str, args: &A) -> RpcRequest {
        RpcRequest {
            service: service.into(),
            method: method.into(),
            args: encode_payload(args).unwrap(),
        }
    }

    fn echo_service() -> Service {
        Service::new("Echo")
            .method("echo", |bytes: Vec<u8>| async move { Ok::<_, String>(bytes) })
            .method("fail", |_: ()| async move { Err::<(), _>("nope".to_string()) })
    }

    #[tokio::test]
    async fn dispatch_runs_typed_method() {
        let table = table_with(echo_service());
        match dispatch(&table, request("Echo", "echo", &vec![1u8, 2, 3])).await {
            RpcResponse::Ok(bytes) => {
                assert_eq!(decode_payload::<Vec<u8>>(&bytes).unwrap(), vec![1, 2, 3])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_reports_lookup_and_method_failures() {
        let table = table_with(echo_service());
        assert_eq!(
            dispatch(&table, request("Nope", "echo", &())).await,
            RpcResponse::UnknownService
        );
        assert_eq!(
            dispatch(&table, request("Echo", "nope", &())).await,
            RpcResponse::UnknownMethod
        );
        assert_eq!(
            dispatch(&table, request("Echo", "fail", &())).await,
            RpcResponse::Err("nope".into())
        );
        let bad = RpcRequest {
            service: "Echo".into(),
            method: "echo".into(),
            args: vec![0xff],
        };
        assert!(matches!(dispatch(&table, bad).await, RpcResponse::BadRequest(_)));
    }

    #[test]
    fn serving_guard_tracks_live_streams() {
        let count = Arc::new(AtomicUsize::new(0));
        let a = Serving::enter(count.clone());
        let b = Serving::enter(count.clone());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        drop(a);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_service_rejected() {
        let transport: Arc<dyn PeerTransport> = Arc::new(crate::testutil::MockTransport::new());
        let rpc = Rpc::new(transport, "/p2p/rpc/meetme".into(), Duration::from_secs(1));
        rpc.register(echo_service()).unwrap();
        assert!(matches!(
            rpc.register(Service::new("Echo")),
            Err(Error::DuplicateService(name)) if name == "Echo"
        ));
    }
}
