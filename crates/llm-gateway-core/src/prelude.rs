//! Common imports for typical gateway and adapter usage.
pub use crate::{
    CancellationToken, ErrorKind, Gateway, GatewayBuilder, GatewayError, GatewayStream, InputPart,
    ModelRef, NativeStream, Phase, ProviderError, ProviderId, RetryPolicy, StartMeta,
    StarterOutput, StreamAdapter, StreamBackend, StreamEvent, StreamOutput, StreamRequest,
    StreamingConfig, TracingSink, Translators, init_observability,
};
