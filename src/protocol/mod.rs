//! Protocol Selector
//!
//! Given a message and the current network conditions, picks a transport
//! profile from a registry of capability records. Suitability combines
//! network-condition fit, message-characteristic fit, and historical
//! performance per `(profile, message-type)` bucket. Adaptation triggers can
//! swap the preferred profile for a bucket; in-flight messages keep theirs.

pub mod conditions;
pub mod profiles;
pub mod selector;

pub use conditions::{CongestionLevel, NetworkConditions, NetworkMonitor};
pub use profiles::{
    BackoffStrategy, ProfileRegistry, ProtocolCharacteristics, ProtocolProfile, RetryMechanism,
};
pub use selector::{
    AdaptationTrigger, ExpectedPerformance, ProtocolSelection, ProtocolSelector, SelectorConfig,
};
