use chrono::Duration;

use lab_orchestrator::models::lab_session::{LabSession, LabSessionStatus};
use lab_orchestrator::models::template::LabTemplate;

fn template() -> LabTemplate {
    serde_json::from_value(serde_json::json!({
        "template_id": "web-101",
        "name": "Web Exploitation 101",
        "ami_id": "ami-0abc",
        "services": [{"port": 80, "name": "http"}],
    }))
    .expect("template parses")
}

fn lab_in(status: LabSessionStatus) -> LabSession {
    let mut lab = LabSession::launching(
        "user-1".into(),
        &template(),
        None,
        "lynkbox".into(),
        Duration::hours(4),
    );
    lab.status = status;
    lab
}

#[test]
fn template_defaults_and_image_alias() {
    let template = template();
    assert_eq!(template.image_id.as_deref(), Some("ami-0abc"));
    assert_eq!(template.lab_type, "vm");
    assert_eq!(template.difficulty, "beginner");
    assert_eq!(template.category, "general");
    assert!(template.active);
    assert_eq!(template.services[0].protocol, "tcp");
}

#[test]
fn launching_copies_template_fields() {
    let lab = lab_in(LabSessionStatus::Launching);
    assert!(lab.session_id.starts_with("lab-"));
    assert_eq!(lab.session_id.len(), "lab-".len() + 12);
    assert_eq!(lab.template_name, "Web Exploitation 101");
    assert_eq!(lab.services.len(), 1);
    assert!(lab.status.is_active());
}

#[test]
fn lab_transitions_follow_launch_order() {
    assert!(lab_in(LabSessionStatus::Pending).can_transition_to(LabSessionStatus::Launching));
    assert!(lab_in(LabSessionStatus::Launching).can_transition_to(LabSessionStatus::Running));
    assert!(lab_in(LabSessionStatus::Running).can_transition_to(LabSessionStatus::Terminating));
    assert!(lab_in(LabSessionStatus::Terminating).can_transition_to(LabSessionStatus::Terminated));
    assert!(!lab_in(LabSessionStatus::Running).can_transition_to(LabSessionStatus::Launching));
    assert!(!lab_in(LabSessionStatus::Pending).can_transition_to(LabSessionStatus::Running));
}

#[test]
fn error_reachable_from_launching_and_running() {
    assert!(lab_in(LabSessionStatus::Launching).can_transition_to(LabSessionStatus::Error));
    assert!(lab_in(LabSessionStatus::Running).can_transition_to(LabSessionStatus::Error));
}

#[test]
fn error_can_still_be_torn_down() {
    let mut lab = lab_in(LabSessionStatus::Error);
    assert!(lab.advance_to(LabSessionStatus::Terminated));
    assert!(!lab.advance_to(LabSessionStatus::Running));
}

#[test]
fn terminated_is_final() {
    let mut lab = lab_in(LabSessionStatus::Terminated);
    for next in [
        LabSessionStatus::Pending,
        LabSessionStatus::Launching,
        LabSessionStatus::Running,
        LabSessionStatus::Error,
    ] {
        assert!(!lab.advance_to(next));
    }
    assert_eq!(lab.status, LabSessionStatus::Terminated);
}
