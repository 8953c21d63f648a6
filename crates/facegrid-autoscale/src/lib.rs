//! facegrid-autoscale — queue-depth driven instance scaling.
//!
//! Reads the approximate depth of the request queue, lists the worker
//! pool, and starts or stops pre-provisioned instances so the number of
//! active workers tracks the backlog.
//!
//! # Scaling Algorithm
//!
//! ```text
//! Q       = approximate request queue depth
//! active  = pool instances that are running or pending
//! desired = min(Q, max_instances)
//!
//! if active < desired:
//!     clear over_capacity_since
//!     Start(first desired - active stopped instances)
//!
//! if active > desired:
//!     if over_capacity_since is unset: set it to now, AwaitGrace
//!     elif now - over_capacity_since >= grace_period: Stop(active[desired..])
//!     else: AwaitGrace
//!
//! otherwise: clear over_capacity_since, NoChange
//! ```
//!
//! Scale-up is immediate; scale-down only happens once over-provisioning
//! has been sustained for a full grace period, so a brief dip in the
//! backlog never stops a worker.

pub mod scaler;

pub use scaler::{Autoscaler, Evaluation, ScaleDecision, ScalerState, ScalingPolicy, decide};
