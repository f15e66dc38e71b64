//! Progress reconciliation.
//!
//! Turns a checker run into per-task and per-check status and restores the
//! "one current task" pointer. The functions here are pure over a
//! `TaskProgress` slice in position order; `CapstoneDb::reconcile` loads
//! that slice, applies them and writes the result back inside one
//! transaction.
//!
//! Pointer rule, applied after every batch of updates:
//!
//! 1. every `In Progress` task is demoted to `Failing` if one of its checks
//!    failed or errored, otherwise to `Pending`;
//! 2. the first `Pending` or `Failing` task whose next task is absent or
//!    `Pending` is promoted to `In Progress`;
//! 3. if no task qualifies, the first task that is not `Completed` is
//!    promoted.
//!
//! `Completed` is only ever assigned from a check run.

use crate::checker::TaskOutcome;
use crate::store::models::{CheckStatus, TaskProgress, TaskStatus};

/// Status implied by a task's check results: all pass → `Completed`, any
/// fail/error → `Failing`, otherwise `Pending`. A task without checks is
/// `Completed`.
pub fn compute_status<'a, I>(checks: I) -> TaskStatus
where
    I: IntoIterator<Item = &'a CheckStatus>,
{
    let mut all_pass = true;
    for status in checks {
        if status.is_failure() {
            return TaskStatus::Failing;
        }
        if *status != CheckStatus::Pass {
            all_pass = false;
        }
    }
    if all_pass {
        TaskStatus::Completed
    } else {
        TaskStatus::Pending
    }
}

/// Restore the single in-progress pointer. Returns the index of the task
/// that ends up `In Progress`, if any.
pub fn assign_in_progress(tasks: &mut [TaskProgress]) -> Option<usize> {
    for task in tasks.iter_mut() {
        if task.status == TaskStatus::InProgress {
            task.status = if task.checks.iter().any(|c| c.status.is_failure()) {
                TaskStatus::Failing
            } else {
                TaskStatus::Pending
            };
        }
    }

    let candidate = (0..tasks.len())
        .find(|&i| {
            let open = matches!(tasks[i].status, TaskStatus::Pending | TaskStatus::Failing);
            let next_open = tasks
                .get(i + 1)
                .is_none_or(|next| next.status == TaskStatus::Pending);
            open && next_open
        })
        .or_else(|| tasks.iter().position(|t| t.status != TaskStatus::Completed));

    if let Some(i) = candidate {
        tasks[i].status = TaskStatus::InProgress;
    }
    candidate
}

/// Apply one checker run. Results map onto a task's checks by position;
/// checks the run did not report are reset to `pending`. Tasks absent from
/// the run keep their status.
pub fn apply_run(tasks: &mut [TaskProgress], outcomes: &[TaskOutcome]) -> Option<usize> {
    for outcome in outcomes {
        let Some(task) = tasks.iter_mut().find(|t| t.name == outcome.name) else {
            tracing::warn!(task = %outcome.name, "Check run reported an unknown task");
            continue;
        };
        for (i, check) in task.checks.iter_mut().enumerate() {
            match outcome.checks.get(i) {
                Some(result) => {
                    check.status = result.status;
                    check.message = result.message.clone();
                }
                None => {
                    check.status = CheckStatus::Pending;
                    check.message = None;
                }
            }
        }
        task.status = compute_status(task.checks.iter().map(|c| &c.status));
    }
    assign_in_progress(tasks)
}

/// Number of tasks currently `In Progress`.
pub fn in_progress_count(tasks: &[TaskProgress]) -> usize {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CheckOutcome;
    use crate::store::models::CheckProgress;

    fn task(name: &str, status: TaskStatus, checks: &[CheckStatus]) -> TaskProgress {
        TaskProgress {
            task_id: 0,
            name: name.to_string(),
            title: name.to_string(),
            position: 0,
            status,
            checks: checks
                .iter()
                .enumerate()
                .map(|(i, s)| CheckProgress {
                    check_id: i as i64,
                    name: format!("c{}", i),
                    title: String::new(),
                    status: *s,
                    message: None,
                })
                .collect(),
        }
    }

    fn outcome(name: &str, statuses: &[CheckStatus]) -> TaskOutcome {
        TaskOutcome {
            name: name.to_string(),
            checks: statuses
                .iter()
                .map(|s| CheckOutcome {
                    status: *s,
                    message: None,
                })
                .collect(),
        }
    }

    fn statuses(tasks: &[TaskProgress]) -> Vec<TaskStatus> {
        tasks.iter().map(|t| t.status).collect()
    }

    use CheckStatus::{Error, Fail, Pass};
    use TaskStatus::{Completed, Failing, InProgress, Pending};

    #[test]
    fn test_compute_status() {
        assert_eq!(compute_status(&[Pass, Pass]), Completed);
        assert_eq!(compute_status(&[Pass, Fail]), Failing);
        assert_eq!(compute_status(&[CheckStatus::Pending, Error]), Failing);
        assert_eq!(compute_status(&[Pass, CheckStatus::Pending]), Pending);
        assert_eq!(compute_status(std::iter::empty()), Completed);
    }

    #[test]
    fn test_fresh_project_points_at_first_task() {
        let mut tasks = vec![
            task("a", Pending, &[CheckStatus::Pending]),
            task("b", Pending, &[CheckStatus::Pending]),
            task("c", Pending, &[]),
        ];
        assert_eq!(assign_in_progress(&mut tasks), Some(0));
        assert_eq!(statuses(&tasks), vec![InProgress, Pending, Pending]);
    }

    #[test]
    fn test_run_completing_first_task_moves_pointer() {
        let mut tasks = vec![
            task("t1", InProgress, &[]),
            task("t2", Pending, &[CheckStatus::Pending]),
        ];
        apply_run(&mut tasks, &[outcome("t1", &[])]);
        assert_eq!(statuses(&tasks), vec![Completed, InProgress]);
        assert_eq!(tasks[1].checks[0].status, CheckStatus::Pending);
    }

    #[test]
    fn test_failing_last_task_stays_current() {
        let mut tasks = vec![
            task("t1", Completed, &[]),
            task("t2", InProgress, &[CheckStatus::Pending]),
        ];
        apply_run(&mut tasks, &[outcome("t1", &[]), outcome("t2", &[Fail])]);
        assert_eq!(statuses(&tasks), vec![Completed, InProgress]);
        assert_eq!(tasks[1].checks[0].status, Fail);
        assert_eq!(
            compute_status(tasks[1].checks.iter().map(|c| &c.status)),
            Failing
        );
    }

    #[test]
    fn test_failing_task_can_return_to_completed() {
        let mut tasks = vec![
            task("t1", InProgress, &[Fail]),
            task("t2", Pending, &[CheckStatus::Pending]),
        ];
        apply_run(&mut tasks, &[outcome("t1", &[Pass])]);
        assert_eq!(statuses(&tasks), vec![Completed, InProgress]);
    }

    #[test]
    fn test_out_of_order_failure_takes_pointer() {
        let mut tasks = vec![
            task("t1", Completed, &[Pass]),
            task("t2", Pending, &[CheckStatus::Pending]),
            task("t3", Failing, &[Fail]),
            task("t4", Pending, &[CheckStatus::Pending]),
        ];
        assert_eq!(assign_in_progress(&mut tasks), Some(2));
        assert_eq!(in_progress_count(&tasks), 1);
    }

    #[test]
    fn test_gap_falls_back_to_first_incomplete_task() {
        let mut tasks = vec![
            task("t1", Completed, &[Pass]),
            task("t2", Pending, &[CheckStatus::Pending]),
            task("t3", Completed, &[Pass]),
        ];
        assert_eq!(assign_in_progress(&mut tasks), Some(1));
    }

    #[test]
    fn test_all_completed_has_no_current_task() {
        let mut tasks = vec![task("t1", InProgress, &[Pass]), task("t2", Completed, &[Pass])];
        apply_run(&mut tasks, &[outcome("t1", &[Pass])]);
        assert_eq!(in_progress_count(&tasks), 0);
    }

    #[test]
    fn test_two_in_progress_collapse_to_one() {
        let mut tasks = vec![
            task("t1", InProgress, &[CheckStatus::Pending]),
            task("t2", InProgress, &[CheckStatus::Pending]),
        ];
        assign_in_progress(&mut tasks);
        assert_eq!(statuses(&tasks), vec![InProgress, Pending]);
    }

    #[test]
    fn test_missing_check_result_resets_to_pending() {
        let mut tasks = vec![task("t1", InProgress, &[Pass, Pass])];
        apply_run(&mut tasks, &[outcome("t1", &[Pass])]);
        assert_eq!(tasks[0].checks[1].status, CheckStatus::Pending);
        assert_eq!(tasks[0].status, InProgress);
    }

    #[test]
    fn test_unknown_task_in_run_is_ignored() {
        let mut tasks = vec![task("t1", InProgress, &[CheckStatus::Pending])];
        apply_run(&mut tasks, &[outcome("ghost", &[Pass])]);
        assert_eq!(statuses(&tasks), vec![InProgress]);
    }

    #[test]
    fn test_apply_run_is_idempotent() {
        let mut tasks = vec![
            task("t1", InProgress, &[CheckStatus::Pending]),
            task("t2", Pending, &[CheckStatus::Pending, CheckStatus::Pending]),
            task("t3", Pending, &[]),
        ];
        let run = [outcome("t1", &[Pass]), outcome("t2", &[Pass, Error])];
        apply_run(&mut tasks, &run);
        let first = tasks.clone();
        apply_run(&mut tasks, &run);
        assert_eq!(tasks, first);
        assert_eq!(statuses(&tasks), vec![Completed, InProgress, Pending]);
    }
}
