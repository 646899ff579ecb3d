pub mod matcher;
pub mod registry;

pub use matcher::{any_match, subscription_matches};
pub use registry::{
    NotifEventFilter, SubscriberEvent, Subscription, SubscriptionId, SubscriptionKind,
    SubscriptionRegistry,
};
