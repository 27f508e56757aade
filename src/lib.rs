pub mod gateway;

#[doc(hidden)]
pub mod test_support;

pub use gateway::{
    Admission, AdmissionPipeline, Channel, ChannelDispatcher, ChannelDisableRegistry,
    InboundRequest, ModerationGate, QuotaAdmissionController, RelayConfig, RelayContext,
    RelayError, RelayFormat, RelayMode, SubscriptionLedger, UpstreamOutcome, UserStore,
};
