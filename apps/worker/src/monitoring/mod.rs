/// Probe engine: runners, scheduling, execution and incident tracking
///
/// - [`checker`]: the runner trait and check types
/// - [`dns`], [`tls`], [`http`]: the network probes
/// - [`scheduler`]: one recurring job per enabled (domain, check) pair
/// - [`executor`]: runs a job, persists the result, evaluates incidents
/// - [`incident`]: OPEN/RESOLVED transitions and the notification outbox
pub mod checker;
pub mod dns;
pub mod executor;
pub mod http;
pub mod incident;
pub mod scheduler;
pub mod tls;
pub mod types;
pub mod validation;

pub use checker::{CheckType, ProbeRunner, ProbeRunners};
pub use executor::{ProbeExecutor, ProbeJob, ProbeOutcome};
pub use incident::{IncidentEvaluator, IncidentTransition};
pub use scheduler::ProbeScheduler;
pub use types::ProbeResult;
