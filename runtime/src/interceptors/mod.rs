//! Interceptors of the transition pipeline.
//!
//! Each wraps another [`TransitionExecutor`](crate::transition_executor::TransitionExecutor)
//! and delegates to it. None of them changes the actions of a transition.

mod deserialization_check;
mod dump_history;
mod hospitalising;
mod metrics;
mod printing;

pub use deserialization_check::{CheckpointChecker, DeserializationCheckInterceptor};
pub use dump_history::{DumpHistoryInterceptor, TransitionRecord};
pub use hospitalising::HospitalisingInterceptor;
pub use metrics::MetricInterceptor;
pub use printing::PrintingInterceptor;
