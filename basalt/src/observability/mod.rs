//! Entities that allow observing and measuring the pool layer's behaviour.

pub mod metrics;
