use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::vm_type::VmType;

/// The hosted-CI's two-valued view of a runner registration, as it appears on
/// the wire. `busy` is orthogonal and carried separately (see [`Runner::ingest_observation`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Online,
    Offline,
}

/// Full lifecycle state of a runner. Persisted by lowercase symbolic name
/// (never by ordinal) so the on-disk format survives enum reordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Respawning,
    Online,
    Running,
    Offline,
    Deleting,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Respawning => "respawning",
            Status::Online => "online",
            Status::Running => "running",
            Status::Offline => "offline",
            Status::Deleting => "deleting",
        };
        write!(f, "{s}")
    }
}

/// A single self-hosted runner: one physical worker, tracked from VM
/// allocation through its one job to teardown.
///
/// Mutated only through [`Runner::update_status`] / [`Runner::ingest_observation`]
/// (for state transitions) or directly by the `Factory` (for the fields a
/// create/respawn/delete cycle resets) -- never by ad hoc external writers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Runner {
    pub name: String,
    pub vm_id: Option<String>,
    pub action_id: Option<i64>,
    pub vm_type: VmType,
    pub status: Status,
    pub status_history: Vec<Status>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Runner {
    /// A freshly allocated runner, prior to any VM having been provisioned.
    pub fn new(name: String, vm_type: VmType) -> Self {
        Self {
            name,
            vm_id: None,
            action_id: None,
            vm_type,
            status: Status::Creating,
            status_history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
        }
    }

    pub fn is_offline(&self) -> bool {
        !matches!(self.status, Status::Online | Status::Running)
    }

    /// `status == online` exactly. An earlier revision of this logic defined
    /// this via a self-referential `running.online` lookup, which could never
    /// be true; that was a bug and is not reproduced here.
    pub fn is_online(&self) -> bool {
        self.status == Status::Online
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub fn is_creating(&self) -> bool {
        matches!(self.status, Status::Creating | Status::Respawning)
    }

    pub fn has_run(&self) -> bool {
        self.status == Status::Offline
            && self.status_history.iter().any(|s| {
                matches!(
                    s,
                    Status::Online | Status::Running | Status::Creating | Status::Respawning
                )
            })
    }

    pub fn time_since_created(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// `None` if the runner has never been online.
    pub fn time_online(&self) -> Option<Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }

    /// Applies a status transition, enforcing the two special rules: a
    /// same-state update is a no-op, and an `offline` observation arriving
    /// while `creating`/`respawning` is suppressed (it just reflects the
    /// hosted service not having seen the new VM register yet).
    pub fn update_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        if self.is_creating() && status == Status::Offline {
            return;
        }

        if self.is_offline() && matches!(status, Status::Online | Status::Running) {
            self.started_at = Some(Utc::now());
        }

        if status == Status::Deleting {
            metrics::counter!(
                "runner_pool_removals_total",
                "tags" => self.vm_type.tags().join(","),
            )
            .increment(1);
        }

        tracing::info!(
            runner = %self.name,
            from = %self.status,
            to = %status,
            "runner status transition"
        );

        self.status_history.push(self.status);
        self.status = status;
    }

    /// Ingests a single hosted-CI observation: records the hosted-CI id and
    /// derives the effective status (`running` iff reported online and busy).
    pub fn ingest_observation(&mut self, status: ObservedStatus, busy: bool, id: i64) {
        self.action_id = Some(id);
        let effective = match (status, busy) {
            (ObservedStatus::Online, true) => Status::Running,
            (ObservedStatus::Online, false) => Status::Online,
            (ObservedStatus::Offline, _) => Status::Offline,
        };
        self.update_status(effective);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_type::{CloudConfig, Quantity};

    fn vm_type() -> VmType {
        VmType::new(
            vec!["small".into()],
            CloudConfig {
                image: "img".into(),
                flavor: "flv".into(),
                network: "net".into(),
                key_name: "key".into(),
                runner_user: "runner".into(),
                runner_group: "runner".into(),
            },
            Quantity { min: 1, max: 2 },
        )
    }

    fn runner() -> Runner {
        Runner::new("runner-os-org-abc-0".into(), vm_type())
    }

    #[test]
    fn fresh_runner_has_not_run() {
        let r = runner();
        assert!(!r.has_run());
        assert!(r.is_creating());
        assert!(r.is_offline());
    }

    #[test]
    fn offline_observation_suppressed_while_creating() {
        let mut r = runner();
        r.ingest_observation(ObservedStatus::Offline, false, 1);
        assert_eq!(r.status, Status::Creating);
        assert!(r.status_history.is_empty());
    }

    #[test]
    fn s2_warm_runner_takes_a_job() {
        let mut r = runner();
        r.status = Status::Online;
        r.status_history = vec![Status::Offline];
        r.started_at = Some(Utc::now() - Duration::minutes(5));
        let started_at = r.started_at;

        r.ingest_observation(ObservedStatus::Online, true, 7);

        assert_eq!(r.status, Status::Running);
        assert_eq!(r.status_history, vec![Status::Offline, Status::Online]);
        assert_eq!(r.action_id, Some(7));
        assert_eq!(r.started_at, started_at);
    }

    #[test]
    fn s3_consumed_runner_is_offline_and_has_run() {
        let mut r = runner();
        r.status = Status::Running;
        r.status_history = vec![Status::Offline, Status::Online];

        r.ingest_observation(ObservedStatus::Offline, false, 7);

        assert_eq!(r.status, Status::Offline);
        assert!(r.has_run());
    }

    #[test]
    fn started_at_only_set_on_first_offline_to_online_transition() {
        let mut r = runner();
        r.update_status(Status::Online);
        let first = r.started_at.unwrap();

        r.update_status(Status::Running);
        assert_eq!(r.started_at, Some(first));
    }

    #[test]
    fn status_history_never_repeats_current_status_as_last_entry() {
        let mut r = runner();
        r.update_status(Status::Online);
        r.update_status(Status::Online); // no-op, duplicate
        assert_ne!(r.status_history.last().copied(), Some(r.status));
    }

    #[test]
    fn is_online_is_strict_status_equality() {
        let mut r = runner();
        r.update_status(Status::Running);
        assert!(!r.is_online());

        let mut r2 = runner();
        r2.update_status(Status::Online);
        assert!(r2.is_online());
    }
}
