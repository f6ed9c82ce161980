//! The Flow Hospital.
//!
//! Every flow that errors, and every inbound session initiation that cannot
//! be answered, is admitted here. A list of [`Staff`] policies examines the
//! errors and the patient's history and the combined diagnosis becomes the
//! [`Verdict`]:
//!
//! - any [`Diagnosis::Discharge`] means **retry** from the last checkpoint
//! - otherwise any [`Diagnosis::OvernightObservation`] means **observe**:
//!   the flow stays resident and errored until an operator acts
//! - otherwise the verdict is **terminate**, and the flow finishes with
//!   its errors
//!
//! Records of every admission are kept, stamped by the injected clock, so
//! operators have one place to see why flows failed or were refused.

use crate::config::HospitalConfig;
use crate::metrics::HospitalMetrics;
use chrono::{DateTime, Utc};
use flowmachine_core::context::Clock;
use flowmachine_core::error::{FlowError, FlowErrorKind};
use flowmachine_core::external::ExternalMessageEvent;
use flowmachine_core::id::FlowId;
use flowmachine_core::identity::Party;
use flowmachine_core::state::StateMachineState;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// One staff member's opinion of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diagnosis {
    /// Retry the flow.
    Discharge,
    /// Keep the flow for an operator.
    OvernightObservation,
    /// Fail the flow.
    Terminal,
    /// This staff member has no opinion.
    NotMyProblem,
}

/// What happens to the patient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Restart from the last checkpoint.
    Retry,
    /// Keep resident, do nothing automatically.
    Observe,
    /// Finish with error.
    Terminate,
}

impl Verdict {
    /// Lowercase name, used as a metrics label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Observe => "observe",
            Self::Terminate => "terminate",
        }
    }

    fn from_diagnoses(diagnoses: &[Diagnosis]) -> Self {
        if diagnoses.contains(&Diagnosis::Discharge) {
            Self::Retry
        } else if diagnoses.contains(&Diagnosis::OvernightObservation) {
            Self::Observe
        } else {
            Self::Terminate
        }
    }
}

/// Why a patient was admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionKind {
    /// A running flow errored.
    FlowError,
    /// A peer's session initiation could not be answered.
    SessionInit,
}

/// One admission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MedicalRecord {
    /// The patient.
    pub flow_id: FlowId,
    /// When it was admitted.
    pub time: DateTime<Utc>,
    /// Why.
    pub kind: AdmissionKind,
    /// The errors examined.
    pub errors: Vec<FlowError>,
    /// The outcome.
    pub verdict: Verdict,
    /// Staff members that had an opinion.
    pub by: Vec<&'static str>,
}

/// A session initiation kept unacknowledged for an operator.
#[derive(Clone, Debug)]
pub struct ObservedSessionInit {
    /// Id the responder flow would have had.
    pub flow_id: FlowId,
    /// The initiating party.
    pub sender: Party,
    /// Why it was refused.
    pub error: FlowError,
    /// The delivery, still unacknowledged.
    pub event: ExternalMessageEvent,
}

/// A policy of the Flow Hospital.
pub trait Staff: Send + Sync {
    /// Name recorded in medical records.
    fn name(&self) -> &'static str;

    /// Diagnose one error of a patient, given its earlier records.
    fn consult(
        &self,
        kind: AdmissionKind,
        error: &FlowError,
        history: &[MedicalRecord],
    ) -> Diagnosis;
}

/// Retries flows that timed out.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeoutDoctor;

impl Staff for TimeoutDoctor {
    fn name(&self) -> &'static str {
        "TimeoutDoctor"
    }

    fn consult(&self, kind: AdmissionKind, error: &FlowError, _: &[MedicalRecord]) -> Diagnosis {
        if kind == AdmissionKind::FlowError && error.kind() == FlowErrorKind::Timeout {
            Diagnosis::Discharge
        } else {
            Diagnosis::NotMyProblem
        }
    }
}

/// Retries transient and infrastructure failures a bounded number of times,
/// then keeps the flow for observation.
#[derive(Clone, Copy, Debug)]
pub struct TransientErrorDoctor {
    max_retries: u32,
}

impl TransientErrorDoctor {
    /// Create a doctor allowing `max_retries` retries per flow.
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Staff for TransientErrorDoctor {
    fn name(&self) -> &'static str {
        "TransientErrorDoctor"
    }

    fn consult(&self, kind: AdmissionKind, error: &FlowError, history: &[MedicalRecord]) -> Diagnosis {
        let transient = matches!(
            error.kind(),
            FlowErrorKind::Transient | FlowErrorKind::Infrastructure
        );
        if kind != AdmissionKind::FlowError || !transient {
            return Diagnosis::NotMyProblem;
        }
        let retries = history
            .iter()
            .filter(|record| record.verdict == Verdict::Retry && record.by.contains(&self.name()))
            .count();
        if retries < self.max_retries as usize {
            Diagnosis::Discharge
        } else {
            Diagnosis::OvernightObservation
        }
    }
}

/// Refuses session initiations that name an unusable responder.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionInitNurse;

impl Staff for SessionInitNurse {
    fn name(&self) -> &'static str {
        "SessionInitNurse"
    }

    fn consult(&self, kind: AdmissionKind, _: &FlowError, _: &[MedicalRecord]) -> Diagnosis {
        if kind == AdmissionKind::SessionInit {
            Diagnosis::Terminal
        } else {
            Diagnosis::NotMyProblem
        }
    }
}

#[derive(Debug, Default)]
struct Ward {
    records: HashMap<FlowId, Vec<MedicalRecord>>,
    under_observation: HashSet<FlowId>,
    session_inits: HashMap<FlowId, ObservedSessionInit>,
}

/// Policy engine for failing flows.
pub struct FlowHospital {
    staff: Vec<Arc<dyn Staff>>,
    clock: Arc<dyn Clock>,
    ward: Mutex<Ward>,
}

impl FlowHospital {
    /// A hospital with the default staff.
    #[must_use]
    pub fn new(config: &HospitalConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            staff: vec![
                Arc::new(TimeoutDoctor),
                Arc::new(TransientErrorDoctor::new(config.max_transient_retries)),
                Arc::new(SessionInitNurse),
            ],
            clock,
            ward: Mutex::new(Ward::default()),
        }
    }

    /// Add a staff member, consulted after the existing ones.
    #[must_use]
    pub fn with_staff(mut self, staff: Arc<dyn Staff>) -> Self {
        self.staff.push(staff);
        self
    }

    /// Admit a flow whose state just became errored.
    pub fn flow_errored(&self, state: &StateMachineState) -> Verdict {
        let errors = state.checkpoint.error_state.errors().to_vec();
        let verdict = self.admit(state.flow_id, AdmissionKind::FlowError, errors);
        let mut ward = self.ward();
        if verdict == Verdict::Observe {
            ward.under_observation.insert(state.flow_id);
        } else {
            ward.under_observation.remove(&state.flow_id);
        }
        verdict
    }

    /// Admit an inbound session initiation that could not be answered.
    ///
    /// `flow_id` is the id the responder would have had. On
    /// [`Verdict::Observe`] the delivery is kept here, unacknowledged.
    pub fn session_init_errored(
        &self,
        flow_id: FlowId,
        sender: Party,
        error: FlowError,
        event: ExternalMessageEvent,
    ) -> Verdict {
        let verdict = self.admit(flow_id, AdmissionKind::SessionInit, vec![error.clone()]);
        let mut ward = self.ward();
        if verdict == Verdict::Observe {
            ward.session_inits.insert(
                flow_id,
                ObservedSessionInit {
                    flow_id,
                    sender,
                    error,
                    event,
                },
            );
        } else {
            // No flow exists under this id, so nothing else would clear it.
            ward.records.remove(&flow_id);
        }
        verdict
    }

    /// Forget a flow that left the manager.
    pub fn flow_removed(&self, flow_id: FlowId) {
        let mut ward = self.ward();
        ward.under_observation.remove(&flow_id);
        ward.records.remove(&flow_id);
    }

    /// Admissions of a flow, oldest first.
    #[must_use]
    pub fn records(&self, flow_id: FlowId) -> Vec<MedicalRecord> {
        self.ward().records.get(&flow_id).cloned().unwrap_or_default()
    }

    /// Flows kept for an operator.
    #[must_use]
    pub fn under_observation(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.ward().under_observation.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Session initiations kept for an operator.
    #[must_use]
    pub fn observed_session_inits(&self) -> Vec<ObservedSessionInit> {
        self.ward().session_inits.values().cloned().collect()
    }

    /// Hand an observed session initiation back, for redelivery or disposal.
    pub fn release_session_init(&self, flow_id: FlowId) -> Option<ObservedSessionInit> {
        let mut ward = self.ward();
        ward.records.remove(&flow_id);
        ward.session_inits.remove(&flow_id)
    }

    fn admit(&self, flow_id: FlowId, kind: AdmissionKind, errors: Vec<FlowError>) -> Verdict {
        let mut ward = self.ward();
        let history = ward.records.get(&flow_id).map_or(&[][..], Vec::as_slice);

        let mut diagnoses = Vec::new();
        let mut by = Vec::new();
        for staff in &self.staff {
            for error in &errors {
                let diagnosis = staff.consult(kind, error, history);
                if diagnosis != Diagnosis::NotMyProblem {
                    diagnoses.push(diagnosis);
                    if !by.contains(&staff.name()) {
                        by.push(staff.name());
                    }
                }
            }
        }
        let verdict = Verdict::from_diagnoses(&diagnoses);

        tracing::info!(
            flow_id = %flow_id,
            ?kind,
            verdict = verdict.as_str(),
            errors = ?errors,
            "Flow admitted to hospital"
        );
        HospitalMetrics::record_admission(verdict.as_str());

        ward.records.entry(flow_id).or_default().push(MedicalRecord {
            flow_id,
            time: self.clock.now(),
            kind,
            errors,
            verdict,
            by,
        });
        verdict
    }

    fn ward(&self) -> std::sync::MutexGuard<'_, Ward> {
        self.ward.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FlowHospital {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let staff: Vec<&'static str> = self.staff.iter().map(|s| s.name()).collect();
        f.debug_struct("FlowHospital")
            .field("staff", &staff)
            .finish_non_exhaustive()
    }
}
