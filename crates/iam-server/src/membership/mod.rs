//! Membership mutation engine.

pub mod controller;
pub mod events;

pub use controller::{MembershipController, MembershipError};
pub use events::{
    MembershipAction, MembershipChangeEvent, MembershipEventSink, QUEUE_KEY, RedisEventPublisher,
};
