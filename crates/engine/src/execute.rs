// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The migration executor.
//!
//! Candidates run one at a time through an explicit state machine:
//! Check (preflight, full VMs only) → Submit → Poll → Resume. The batch
//! tolerates a bounded number of failures and stops after the first fully
//! successful move; the control loop re-measures and re-plans before any
//! further migration.

use crate::error::Error;
use crate::gateway::{GuestKind, Hypervisor};
use crate::notify::Notifier;
use crate::plan::MigrationCandidate;
use pvelb_config::Parameters;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const RESUME_DELAY: Duration = Duration::from_secs(10);

/// How many failures a batch absorbs before aborting. A batch aborts once
/// `error_counter` exceeds this.
const MAX_ERRORS: i32 = 2;

/// What happened to a migration batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// The guest that was successfully migrated, if any. At most one per
    /// batch: after a success the loop re-measures before moving again.
    pub migrated: Option<u32>,
    /// Guests skipped because of pinned local disks or resources.
    pub skipped: Vec<u32>,
    /// Guests whose preflight or submission failed.
    pub failed: Vec<u32>,
}

/// Outcome of driving a single candidate through the state machine.
/// Mirrors the split between conditions that count against the batch's
/// error budget and conditions that merely skip the candidate.
enum MoveOutcome {
    /// The guest is running on the recipient.
    Done,
    /// Local disks or resources pin the guest; not an error.
    Skipped,
    /// Preflight or submission failed; counts against the error budget.
    Failed,
}

/// Phases of one candidate migration, in the order they are entered.
enum Phase {
    Check,
    Submit,
    Poll,
    Resume,
}

/// Drives a batch of candidates, best first.
///
/// In test mode the candidates are only logged. Otherwise candidates are
/// attempted in order until one succeeds; the batch aborts with
/// [`Error::TooManyMigrationFailures`] when the error budget is exhausted.
/// Bad post-migration states and unverifiable polls abort the batch
/// immediately after notifying the operator.
pub async fn execute_batch(
    hypervisor: &dyn Hypervisor,
    notifier: &dyn Notifier,
    parameters: &Parameters,
    candidates: &[MigrationCandidate],
) -> Result<BatchReport, Error> {
    let mut report = BatchReport::default();

    if candidates.is_empty() {
        info!("no migration variants to process");
        return Ok(report);
    }

    if parameters.test_mode.is_on() {
        info!("test mode, the following migrations would be attempted:");
        for candidate in candidates {
            info!(
                vmid = candidate.vmid,
                donor = %candidate.donor,
                recipient = %candidate.recipient,
                "test mode migration candidate"
            );
        }
        info!("test mode, no real migrations performed");
        return Ok(report);
    }

    info!("starting guest migrations");
    let mut error_counter: i32 = 0;

    for candidate in candidates {
        if error_counter > MAX_ERRORS {
            break;
        }

        info!(
            vmid = candidate.vmid,
            donor = %candidate.donor,
            recipient = %candidate.recipient,
            "attempting migration"
        );

        match migrate_one(hypervisor, parameters, candidate).await {
            Ok(MoveOutcome::Done) => {
                error_counter -= 1;
                report.migrated = Some(candidate.vmid);
                break;
            }
            Ok(MoveOutcome::Skipped) => {
                report.skipped.push(candidate.vmid);
            }
            Ok(MoveOutcome::Failed) => {
                error_counter += 1;
                report.failed.push(candidate.vmid);
            }
            Err(error) => {
                notifier
                    .notify(&format!(
                        "check guest {} after migration: {error}",
                        candidate.vmid
                    ))
                    .await;
                return Err(error);
            }
        }
    }

    if error_counter > MAX_ERRORS {
        warn!("too many migration errors");
        notifier
            .notify(&format!("migration errors: {:?}", report.failed))
            .await;
        return Err(Error::TooManyMigrationFailures {
            guests: report.failed,
        });
    }

    Ok(report)
}

/// Runs one candidate through Check → Submit → Poll → Resume.
async fn migrate_one(
    hypervisor: &dyn Hypervisor,
    parameters: &Parameters,
    candidate: &MigrationCandidate,
) -> Result<MoveOutcome, Error> {
    let vmid = candidate.vmid;
    let mut phase = Phase::Check;
    let mut elapsed_secs: u64 = 0;

    loop {
        match phase {
            Phase::Check => {
                // Containers have no preflight endpoint.
                if candidate.kind == GuestKind::Container {
                    phase = Phase::Submit;
                    continue;
                }
                match hypervisor.migration_preflight(&candidate.donor, vmid).await {
                    Ok(preflight) if preflight.blocked() => {
                        info!(vmid, "guest has local resources that cannot be migrated");
                        return Ok(MoveOutcome::Skipped);
                    }
                    Ok(_) => phase = Phase::Submit,
                    Err(error) => {
                        warn!(vmid, %error, "could not check guest migration info");
                        return Ok(MoveOutcome::Failed);
                    }
                }
            }
            Phase::Submit => {
                match hypervisor
                    .migrate(&candidate.donor, candidate.kind, vmid, &candidate.recipient)
                    .await
                {
                    Ok(task_id) => {
                        info!(vmid, %task_id, "migration submitted");
                        phase = Phase::Poll;
                    }
                    Err(error) => {
                        warn!(vmid, %error, "migration request failed");
                        return Ok(MoveOutcome::Failed);
                    }
                }
            }
            Phase::Poll => {
                sleep(POLL_INTERVAL).await;
                elapsed_secs += POLL_INTERVAL.as_secs();

                let guests = hypervisor
                    .guests_on(&candidate.recipient, candidate.kind)
                    .await
                    .map_err(|source| Error::PostMigrationCheckFailed { vmid, source })?;

                match guests.iter().find(|g| g.vmid == vmid) {
                    Some(status) if status.running => {
                        info!(vmid, elapsed_secs, "migration complete");
                        phase = Phase::Resume;
                    }
                    Some(_) => {
                        warn!(vmid, "guest found on recipient but not running");
                        return Err(Error::MigrationBadState {
                            vmid,
                            recipient: candidate.recipient.clone(),
                        });
                    }
                    None => {
                        info!(vmid, elapsed_secs, "migration in progress");
                        let ceiling = parameters.migration_timeout;
                        if ceiling > 0 && elapsed_secs >= ceiling {
                            return Err(Error::MigrationPollTimeout { vmid, elapsed_secs });
                        }
                    }
                }
            }
            Phase::Resume => {
                sleep(RESUME_DELAY).await;
                if candidate.kind == GuestKind::FullVm {
                    if let Err(error) = hypervisor.resume(&candidate.recipient, vmid).await {
                        warn!(vmid, %error, "resume request failed");
                    }
                }
                return Ok(MoveOutcome::Done);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MigrationCandidate;
    use crate::testing::{FakeHypervisor, RecordingNotifier, parameters, test_mode_parameters};
    use pretty_assertions::assert_eq;

    fn candidate(vmid: u32, kind: GuestKind) -> MigrationCandidate {
        MigrationCandidate {
            donor: "a".to_string(),
            recipient: "b".to_string(),
            vmid,
            kind,
            projected_total: 0.0,
        }
    }

    fn two_node_cluster() -> FakeHypervisor {
        FakeHypervisor::new()
            .with_node("a", 8, 0.1, 100, 80)
            .with_node("b", 8, 0.1, 100, 20)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_vm_move_is_resumed() {
        let hv = two_node_cluster().with_vm(100, "a", 30);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.migrated, Some(100));
        assert_eq!(hv.submitted(), vec![("a".to_string(), "b".to_string(), 100)]);
        assert_eq!(hv.resumed(), vec![100]);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn container_move_is_not_resumed() {
        let hv = two_node_cluster().with_container(200, "a", 30);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[candidate(200, GuestKind::Container)],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.migrated, Some(200));
        assert!(hv.resumed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_move_per_batch() {
        let hv = two_node_cluster().with_vm(100, "a", 30).with_vm(101, "a", 10);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[
                candidate(100, GuestKind::FullVm),
                candidate(101, GuestKind::FullVm),
            ],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.migrated, Some(100));
        assert_eq!(hv.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_resources_skip_without_counting_as_errors() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 30)
            .with_preflight(100, true, false);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.migrated, None);
        assert_eq!(report.skipped, vec![100]);
        assert!(report.failed.is_empty());
        assert!(hv.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_absorbs_an_earlier_failure() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 30)
            .with_vm(101, "a", 10)
            .with_failing_submits(1);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[
                candidate(100, GuestKind::FullVm),
                candidate(101, GuestKind::FullVm),
            ],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.failed, vec![100]);
        assert_eq!(report.migrated, Some(101));
    }

    #[tokio::test(start_paused = true)]
    async fn three_submit_failures_abort_the_batch() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 10)
            .with_vm(101, "a", 10)
            .with_vm(102, "a", 10)
            .with_failing_submits(3);
        let notifier = RecordingNotifier::new();

        let err = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[
                candidate(100, GuestKind::FullVm),
                candidate(101, GuestKind::FullVm),
                candidate(102, GuestKind::FullVm),
            ],
        )
        .await
        .expect_err("batch must abort");

        assert!(matches!(
            err,
            Error::TooManyMigrationFailures { ref guests } if *guests == vec![100, 101, 102]
        ));
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("migration errors"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_post_migration_state_is_fatal_and_notified() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 30)
            .with_bad_state_after_migration(100);
        let notifier = RecordingNotifier::new();

        let err = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect_err("bad state must abort");

        assert!(matches!(err, Error::MigrationBadState { vmid: 100, .. }));
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ceiling_aborts_a_hung_migration() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 30)
            .with_polls_before_visible(1_000);
        let notifier = RecordingNotifier::new();
        let mut parameters = parameters();
        parameters.migration_timeout = 30;

        let err = execute_batch(
            &hv,
            &notifier,
            &parameters,
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect_err("hung migration must abort");

        assert!(matches!(
            err,
            Error::MigrationPollTimeout {
                vmid: 100,
                elapsed_secs: 30
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_visibility_is_polled_through() {
        let hv = two_node_cluster()
            .with_vm(100, "a", 30)
            .with_polls_before_visible(3);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &parameters(),
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect("batch must succeed");

        assert_eq!(report.migrated, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_contacts_nothing() {
        let hv = two_node_cluster().with_vm(100, "a", 30);
        let notifier = RecordingNotifier::new();

        let report = execute_batch(
            &hv,
            &notifier,
            &test_mode_parameters(),
            &[candidate(100, GuestKind::FullVm)],
        )
        .await
        .expect("test mode must succeed");

        assert_eq!(report, BatchReport::default());
        assert!(hv.submitted().is_empty());
        assert!(hv.resumed().is_empty());
    }
}
