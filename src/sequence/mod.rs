mod definition;
mod enrollment;
mod machine;
mod window;

pub use definition::{
    Condition, SequenceDefinition, SequenceStep, StepDelay, Targeting, TriggerType,
};
pub use enrollment::{
    AttemptStatus, DeliveryAttempt, DeliveryOutcome, Engagement, Enrollment, EnrollmentStatus,
    idempotency_key,
};
pub use machine::{
    REASON_COMPLETED, REASON_LEAD_INVALID, REASON_LEAD_MISSING, REASON_LEAD_REPLIED,
    SequenceMachine, StepContext, Transition,
};
pub use window::DeliveryWindow;
