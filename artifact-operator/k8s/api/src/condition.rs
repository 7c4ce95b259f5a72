use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;

/// Upserts a condition by type. The transition timestamp is carried over when
/// the status value is unchanged, so repeated reconciles do not churn it.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let mut next = Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    };

    for existing in conditions.iter_mut() {
        if existing.type_ == type_ {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = next;
            return;
        }
    }

    conditions.push(next);
}
