//! The invoker: entry point of every outbound RPC call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tether_proto::{RpcRequest, RpcResponse, DEFAULT_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_MS};
use tokio::time::Instant;

use crate::balancer::RoundRobin;
use crate::callback::{CallbackChain, CallbackConfig, CallbackRegistry};
use crate::channel::{Channel, ChannelConfig, ChannelContext, ChannelRegistry};
use crate::error::RpcError;

/// Header carrying the caller's RPC id, reported in the stat event.
pub const RPC_ID_HEADER: &str = "rpc_trace_context.sofaRpcId";

/// Header carrying the caller's trace id, reported in the stat event.
pub const TRACE_ID_HEADER: &str = "rpc_trace_context.sofaTraceId";

/// Either one channel config or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelConfigs {
    Many(Vec<ChannelConfig>),
    One(ChannelConfig),
}

impl ChannelConfigs {
    /// The config replicas are built from.
    pub fn primary(&self) -> Option<&ChannelConfig> {
        match self {
            Self::One(config) => Some(config),
            Self::Many(configs) => configs.first(),
        }
    }
}

/// Invoker configuration, as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokerConfig {
    #[serde(default)]
    pub before_invoke: Vec<CallbackConfig>,

    #[serde(default)]
    pub after_invoke: Vec<CallbackConfig>,

    /// Number of channel replicas; zero means one.
    #[serde(default)]
    pub total_channels: usize,

    #[serde(default)]
    pub channel: Option<ChannelConfigs>,
}

impl InvokerConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, RpcError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Registries and collaborators an invoker is built against.
#[derive(Debug, Clone)]
pub struct InvokerContext {
    pub channels: Arc<ChannelRegistry>,
    pub callbacks: Arc<CallbackRegistry>,
    pub channel: ChannelContext,
}

impl InvokerContext {
    /// Uses the default channel and callback registries.
    pub fn new(channel: ChannelContext) -> Self {
        Self {
            channels: Arc::new(ChannelRegistry::with_defaults()),
            callbacks: Arc::new(CallbackRegistry::with_defaults()),
            channel,
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: Arc<ChannelRegistry>) -> Self {
        self.channels = channels;
        self
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<CallbackRegistry>) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Runs calls through the callback chains and a set of channel replicas.
#[derive(Debug)]
pub struct Invoker {
    callbacks: CallbackChain,
    replicas: Vec<Arc<dyn Channel>>,
    balancer: RoundRobin,
}

impl Invoker {
    /// Builds an invoker from its JSON configuration.
    pub fn from_json(raw: &[u8], ctx: &InvokerContext) -> Result<Self, RpcError> {
        Self::new(&InvokerConfig::from_json(raw)?, ctx)
    }

    pub fn new(config: &InvokerConfig, ctx: &InvokerContext) -> Result<Self, RpcError> {
        let mut callbacks = CallbackChain::new();
        for conf in &config.before_invoke {
            callbacks.add_before(&ctx.callbacks, conf);
        }
        for conf in &config.after_invoke {
            callbacks.add_after(&ctx.callbacks, conf);
        }

        let channel = config
            .channel
            .as_ref()
            .and_then(ChannelConfigs::primary)
            .ok_or(RpcError::MissingChannelConfig)?;

        let total = config.total_channels.max(1);
        let replicas = (0..total)
            .map(|_| ctx.channels.get_channel(channel, &ctx.channel))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            protocol = %channel.protocol,
            listener = %channel.listener,
            replicas = total,
            "invoker initialised"
        );
        Ok(Self {
            callbacks,
            replicas,
            balancer: RoundRobin::new(),
        })
    }

    /// Number of channel replicas.
    pub fn replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Performs one call.
    ///
    /// A panic anywhere in the call is caught and returned as
    /// [`RpcError::Panic`].
    pub async fn invoke(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
        match AssertUnwindSafe(self.invoke_inner(req)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_owned()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_owned()
                };
                tracing::error!(panic = %message, "invoker panic");
                Err(RpcError::Panic(message))
            }
        }
    }

    async fn invoke_inner(&self, mut req: RpcRequest) -> Result<RpcResponse, RpcError> {
        resolve_timeout(&mut req);
        let started = Instant::now();
        tracing::debug!(
            id = %req.id,
            method = %req.method,
            timeout_ms = req.timeout_ms,
            "invoking"
        );

        let req = self.callbacks.before_invoke(req).map_err(|e| {
            tracing::error!(error = %e, "before-invoke callback failed");
            e
        })?;
        let rpc_id = req.header.get(RPC_ID_HEADER);
        let trace_id = req.header.get(TRACE_ID_HEADER);

        let channel = self
            .balancer
            .select(&self.replicas)
            .ok_or(RpcError::MissingChannelConfig)?;
        let resp = channel.call(req).await.map_err(|e| {
            tracing::error!(error = %e, error_type = e.error_type(), "rpc call failed");
            e
        })?;

        let resp = match self.callbacks.after_invoke(resp.clone()) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "after-invoke callback failed");
                resp
            }
        };

        tracing::info!(
            target: "tether::stat",
            rpc_id = %rpc_id,
            trace_id = %trace_id,
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "rpc call completed"
        );
        Ok(resp)
    }
}

/// Replaces a zero timeout with the header override or the default.
pub fn resolve_timeout(req: &mut RpcRequest) {
    if req.timeout_ms != 0 {
        return;
    }
    req.timeout_ms = req
        .header
        .get(REQUEST_TIMEOUT_MS)
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TcpOnlyHook;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Channel that answers with its replica number.
    #[derive(Debug)]
    struct Replica {
        index: usize,
    }

    #[async_trait]
    impl Channel for Replica {
        async fn call(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
            match &req.data[..] {
                b"panic" => panic!("replica {} exploded", self.index),
                b"fail" => Err(RpcError::ConnectionClosed),
                _ => Ok(RpcResponse {
                    data: self.index.to_string().into(),
                    success: true,
                    header: [("timeout", req.timeout_ms.to_string())].into_iter().collect(),
                    ..RpcResponse::default()
                }),
            }
        }
    }

    fn context() -> InvokerContext {
        let channels = ChannelRegistry::with_defaults();
        let built = Arc::new(AtomicUsize::new(0));
        channels.register("replica", move |_, _| {
            let index = built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Replica { index }))
        });
        InvokerContext::new(ChannelContext::new(Arc::new(TcpOnlyHook)))
            .with_channels(Arc::new(channels))
    }

    fn invoker(config: &str) -> Invoker {
        Invoker::from_json(config.as_bytes(), &context()).unwrap()
    }

    #[test]
    fn channel_accepts_object_or_array() {
        let single: InvokerConfig =
            serde_json::from_str(r#"{"channel":{"protocol":"http","listener":"l"}}"#).unwrap();
        let list: InvokerConfig =
            serde_json::from_str(r#"{"channel":[{"protocol":"http","listener":"l"}]}"#).unwrap();

        assert_eq!(single.channel.unwrap().primary().unwrap().protocol, "http");
        assert_eq!(list.channel.unwrap().primary().unwrap().listener, "l");
    }

    #[test]
    fn missing_channel_config() {
        for raw in [r#"{}"#, r#"{"channel":[]}"#] {
            let err = Invoker::from_json(raw.as_bytes(), &context()).unwrap_err();
            assert_eq!(err.to_string(), "missing channel config");
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = Invoker::from_json(b"{not json", &context()).unwrap_err();
        assert!(matches!(err, RpcError::Json(_)));
    }

    #[test]
    fn unknown_channel_fails_init() {
        let err = Invoker::from_json(br#"{"channel":{"protocol":"fake"}}"#, &context())
            .unwrap_err();
        assert_eq!(err.to_string(), "channel fake not found");
    }

    #[test]
    fn zero_replicas_is_one() {
        let invoker = invoker(r#"{"total_channels":0,"channel":{"protocol":"replica"}}"#);
        assert_eq!(invoker.replicas(), 1);
    }

    #[tokio::test]
    async fn round_robin_across_replicas() {
        let invoker = invoker(r#"{"total_channels":3,"channel":{"protocol":"replica"}}"#);
        let mut counts = [0usize; 3];

        for _ in 0..30 {
            let resp = invoker
                .invoke(RpcRequest::new("1", "m", "hi"))
                .await
                .unwrap();
            let index: usize = std::str::from_utf8(&resp.data).unwrap().parse().unwrap();
            counts[index] += 1;
        }
        assert_eq!(counts, [10, 10, 10]);
    }

    #[tokio::test]
    async fn timeout_defaults() {
        let invoker = invoker(r#"{"channel":{"protocol":"replica"}}"#);
        let cases = [
            (None, 0, "3000"),
            (Some("0"), 0, "3000"),
            (Some("junk"), 0, "3000"),
            (Some("100000"), 0, "100000"),
            (Some("100000"), 50, "50"),
        ];

        for (header, timeout_ms, expected) in cases {
            let mut req = RpcRequest::new("1", "m", "hi").with_timeout_ms(timeout_ms);
            if let Some(value) = header {
                req.header.set(REQUEST_TIMEOUT_MS, value);
            }
            let resp = invoker.invoke(req).await.unwrap();
            assert_eq!(resp.header.get("timeout"), expected, "header {header:?}");
        }
    }

    #[tokio::test]
    async fn panic_becomes_error() {
        let invoker = invoker(r#"{"channel":{"protocol":"replica"}}"#);

        let err = invoker
            .invoke(RpcRequest::new("1", "m", "panic"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invoker panic: replica 0 exploded");

        // the invoker stays usable
        assert!(invoker.invoke(RpcRequest::new("1", "m", "hi")).await.is_ok());
    }

    #[tokio::test]
    async fn channel_errors_propagate() {
        let invoker = invoker(r#"{"channel":{"protocol":"replica"}}"#);
        let err = invoker
            .invoke(RpcRequest::new("1", "m", "fail"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn callbacks_wrap_the_call() {
        let invoker = invoker(
            r#"{
                "before_invoke": [{"name": "header_rename", "config": {"rpc_timeout": "rpc_request_timeout"}}],
                "after_invoke": [{"name": "header_inject", "config": {"x-invoker": "tether"}}],
                "channel": {"protocol": "replica"}
            }"#,
        );

        let req = RpcRequest::new("1", "m", "hi").with_header("rpc_timeout", "250");
        let resp = invoker.invoke(req).await.unwrap();
        // the renamed header arrives too late to affect the already resolved timeout
        assert_eq!(resp.header.get("timeout"), "3000");
        assert_eq!(resp.header.get("x-invoker"), "tether");
    }

    #[tokio::test]
    async fn before_callback_error_aborts_call() {
        struct Deny;

        impl crate::callback::BeforeFactory for Deny {
            fn name(&self) -> &str {
                "deny"
            }

            fn create(
                &self,
                _config: &serde_json::Value,
            ) -> Result<crate::callback::BeforeFn, RpcError> {
                Ok(Box::new(|_| Err(RpcError::Callback("denied".into()))))
            }
        }

        let callbacks = CallbackRegistry::with_defaults();
        callbacks.register_before(Deny);
        let ctx = context().with_callbacks(Arc::new(callbacks));
        let invoker = Invoker::from_json(
            br#"{"before_invoke":[{"name":"deny"}],"channel":{"protocol":"replica"}}"#,
            &ctx,
        )
        .unwrap();

        let err = invoker
            .invoke(RpcRequest::new("1", "m", "panic"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Callback error: denied");
    }

    #[tokio::test]
    async fn after_callback_error_keeps_response() {
        struct Broken;

        impl crate::callback::AfterFactory for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            fn create(
                &self,
                _config: &serde_json::Value,
            ) -> Result<crate::callback::AfterFn, RpcError> {
                Ok(Box::new(|_| Err(RpcError::Callback("broken".into()))))
            }
        }

        let callbacks = CallbackRegistry::with_defaults();
        callbacks.register_after(Broken);
        let ctx = context().with_callbacks(Arc::new(callbacks));
        let invoker = Invoker::from_json(
            br#"{"after_invoke":[{"name":"broken"}],"channel":{"protocol":"replica"}}"#,
            &ctx,
        )
        .unwrap();

        let resp = invoker
            .invoke(RpcRequest::new("1", "m", "hi"))
            .await
            .unwrap();
        assert_eq!(&resp.data[..], b"0");
    }
}
