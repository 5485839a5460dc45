//! Parallel group execution and merge strategies.
//!
//! Every group invocation gets its own worker pool: a semaphore sized to
//! `max_workers` and a feeder task that starts members in declaration order
//! as permits free up. Members report back over a channel; results are
//! reassembled in member order regardless of completion order.
//!
//! Under a budget, each member reserves its estimate before it starts and
//! settles to its actual cost when it ends, so members that are in flight
//! together never add up to more than the group may spend.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cf_core::{
    Artifact, FailureClass, MergeStrategy, ParallelGroupSpec, StepEntry, StepFailure, StepPosition,
    StepResult, StepSpec,
};

use crate::dispatcher::{StepDispatcher, BUDGET_EPSILON};
use crate::estimate::group_cost;

/// Runs [`ParallelGroupSpec`]s on top of a [`StepDispatcher`].
#[derive(Debug, Clone)]
pub struct ParallelGroupExecutor {
    dispatcher: StepDispatcher,
}

impl ParallelGroupExecutor {
    pub fn new(dispatcher: StepDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Execute the group at chain position `index`. All members receive the
    /// same `input`; the group yields exactly one [`StepResult`] whose
    /// `members` hold the per-member results in declaration order.
    pub async fn execute(
        &self,
        index: usize,
        group: &ParallelGroupSpec,
        input: Option<&Artifact>,
        budget_remaining: Option<f64>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let position = StepPosition::top(index);
        let entry = StepEntry::Group(group.clone());
        let enabled = group.enabled_members().count();
        if !group.enabled || enabled == 0 {
            tracing::info!(step = %position, "Skipping disabled parallel group");
            return StepResult::skipped(position, entry);
        }

        if let Some(remaining) = budget_remaining {
            let cost = group_cost(self.dispatcher.registry(), group);
            if cost.estimate > remaining + BUDGET_EPSILON {
                tracing::warn!(
                    step = %position,
                    estimate = cost.estimate,
                    remaining,
                    "Group estimate exceeds remaining budget; not dispatching"
                );
                return StepResult::failed(
                    position,
                    entry,
                    StepFailure::budget_exceeded(cost.estimate, remaining),
                );
            }
        }

        tracing::info!(
            step = %position,
            members = enabled,
            max_workers = group.max_workers,
            strategy = %group.merge_strategy,
            "Starting parallel group"
        );

        let started = Instant::now();
        let token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(group.max_workers.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, StepResult)>();

        let members: Vec<(usize, StepSpec)> = group
            .enabled_members()
            .map(|(i, m)| (i, m.clone()))
            .collect();
        let feeder = tokio::spawn(feed_members(
            self.dispatcher.clone(),
            index,
            group.merge_strategy,
            members,
            input.cloned(),
            budget_remaining.map(|left| Arc::new(MemberBudget::new(left))),
            token.clone(),
            semaphore,
            tx,
        ));

        let mut slots: Vec<Option<StepResult>> = vec![None; group.members.len()];
        let mut winner: Option<usize> = None;
        while let Some((member, result)) = rx.recv().await {
            tracing::debug!(
                step = %result.position,
                status = %result.status,
                cost = result.cost,
                "Group member finished"
            );
            if group.merge_strategy == MergeStrategy::FirstSuccess
                && winner.is_none()
                && result.is_success()
            {
                winner = Some(member);
                tracing::info!(
                    step = %position,
                    winner = member,
                    "First success; cancelling remaining members"
                );
                token.cancel();
            }
            slots[member] = Some(result);
        }
        if let Err(e) = feeder.await {
            tracing::error!(step = %position, "Group feeder task failed: {e}");
        }
        let stopped_early = token.is_cancelled();

        let members: Vec<StepResult> = group
            .members
            .iter()
            .zip(slots)
            .enumerate()
            .map(|(m, (spec, slot))| {
                let member_position = StepPosition::member(index, m);
                if !spec.enabled {
                    return StepResult::skipped(member_position, StepEntry::Step(spec.clone()));
                }
                slot.unwrap_or_else(|| {
                    let failure = if stopped_early {
                        StepFailure::cancelled("not started; the group finished first")
                    } else {
                        StepFailure::new(FailureClass::Provider, "member never reported a result")
                    };
                    StepResult::failed(member_position, StepEntry::Step(spec.clone()), failure)
                })
            })
            .collect();

        let total_cost: f64 = members.iter().map(|r| r.cost).sum();
        let attempts: u32 = members.iter().map(|r| r.attempt_count).sum();
        let duration = started.elapsed().as_secs_f64();

        let merged = merge(group, &members, winner);
        let result = match merged {
            Ok(output) => {
                tracing::info!(
                    step = %position,
                    cost = total_cost,
                    duration_secs = duration,
                    "Parallel group succeeded"
                );
                StepResult::success(position, entry, output)
            }
            Err(failure) => {
                tracing::warn!(step = %position, "Parallel group failed: {failure}");
                StepResult::failed(position, entry, failure)
            }
        };
        result
            .with_members(members)
            .with_accounting(duration, total_cost, attempts)
    }
}

/// What is left of the group's budget for members that have not settled.
#[derive(Debug)]
struct Ledger {
    left: f64,
    in_flight: usize,
}

#[derive(Debug)]
struct MemberBudget {
    ledger: Mutex<Ledger>,
    settled: Notify,
}

enum Reserve {
    /// Reserved; the member may spend up to this much.
    Granted(f64),
    /// Not enough left until an in-flight member settles.
    Wait,
    /// Not enough left and nothing in flight to free any.
    Never(f64),
}

impl MemberBudget {
    fn new(left: f64) -> Self {
        Self {
            ledger: Mutex::new(Ledger { left, in_flight: 0 }),
            settled: Notify::new(),
        }
    }

    fn reserve(&self, estimate: f64) -> Reserve {
        let mut ledger = self.ledger.lock();
        if estimate <= ledger.left + BUDGET_EPSILON {
            let granted = ledger.left;
            ledger.left -= estimate;
            ledger.in_flight += 1;
            Reserve::Granted(granted)
        } else if ledger.in_flight > 0 {
            Reserve::Wait
        } else {
            Reserve::Never(ledger.left)
        }
    }

    fn settle(&self, reserved: f64, spent: f64) {
        {
            let mut ledger = self.ledger.lock();
            ledger.left += reserved - spent;
            ledger.in_flight = ledger.in_flight.saturating_sub(1);
        }
        self.settled.notify_one();
    }
}

/// A member's reservation, settled on drop so a panicking member still
/// releases it.
struct Reservation {
    budget: Arc<MemberBudget>,
    reserved: f64,
    spent: f64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.settle(self.reserved, self.spent);
    }
}

/// Start members in declaration order, one per free permit and, under a
/// budget, one per granted reservation, until done or cancelled. Then wait
/// for the started members and report any that died without a result.
#[allow(clippy::too_many_arguments)]
async fn feed_members(
    dispatcher: StepDispatcher,
    index: usize,
    strategy: MergeStrategy,
    members: Vec<(usize, StepSpec)>,
    input: Option<Artifact>,
    budget: Option<Arc<MemberBudget>>,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<(usize, StepResult)>,
) {
    let mut started: Vec<(usize, StepSpec, JoinHandle<()>)> = Vec::new();

    'members: for (member, spec) in members {
        let position = StepPosition::member(index, member);
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut reservation = None;
        let mut allowance = None;
        if let Some(budget) = &budget {
            let estimate = dispatcher.estimate(&spec);
            loop {
                match budget.reserve(estimate) {
                    Reserve::Granted(granted) => {
                        allowance = Some(granted);
                        reservation = Some(Reservation {
                            budget: Arc::clone(budget),
                            reserved: estimate,
                            spent: 0.0,
                        });
                        break;
                    }
                    Reserve::Wait => {
                        tracing::debug!(step = %position, "Waiting for budget held by running members");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break 'members,
                            _ = budget.settled.notified() => {}
                        }
                    }
                    Reserve::Never(left) => {
                        tracing::warn!(
                            step = %position,
                            estimate,
                            left,
                            "Group member exceeds what is left of the budget; not dispatching"
                        );
                        let failed = StepResult::failed(
                            position,
                            StepEntry::Step(spec.clone()),
                            StepFailure::budget_exceeded(estimate, left),
                        );
                        let _ = tx.send((member, failed));
                        continue 'members;
                    }
                }
            }
        }

        tracing::debug!(step = %position, "Starting group member");
        let handle = tokio::spawn(run_member(
            dispatcher.clone(),
            position,
            strategy,
            spec.clone(),
            input.clone(),
            allowance,
            reservation,
            token.clone(),
            permit,
            tx.clone(),
        ));
        started.push((member, spec, handle));
    }

    for (member, spec, handle) in started {
        if let Err(e) = handle.await {
            let position = StepPosition::member(index, member);
            let message = if e.is_panic() {
                "member panicked before producing a result".to_string()
            } else {
                format!("member task ended without a result: {e}")
            };
            tracing::error!(step = %position, "{message}");
            let failed = StepResult::failed(
                position,
                StepEntry::Step(spec),
                StepFailure::new(FailureClass::Provider, message),
            );
            let _ = tx.send((member, failed));
        }
    }
}

/// Run one member; on cancellation the in-flight call is abandoned and the
/// member is billed its estimate.
///
/// A first_success winner cancels the group token before releasing its
/// permit, so the feeder can never start another member after a win.
#[allow(clippy::too_many_arguments)]
async fn run_member(
    dispatcher: StepDispatcher,
    position: StepPosition,
    strategy: MergeStrategy,
    spec: StepSpec,
    input: Option<Artifact>,
    allowance: Option<f64>,
    mut reservation: Option<Reservation>,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
    tx: mpsc::UnboundedSender<(usize, StepResult)>,
) {
    let started = Instant::now();
    let result = tokio::select! {
        result = dispatcher.execute(position, &spec, input.as_ref(), allowance, &token) => result,
        _ = token.cancelled() => StepResult::failed(
            position,
            StepEntry::Step(spec.clone()),
            StepFailure::cancelled("cancelled while in flight; result discarded"),
        )
        .with_accounting(started.elapsed().as_secs_f64(), dispatcher.estimate(&spec), 1),
    };
    if strategy == MergeStrategy::FirstSuccess && result.is_success() {
        token.cancel();
    }
    if let Some(reservation) = reservation.as_mut() {
        reservation.spent = result.cost;
    }
    drop(reservation);
    drop(permit);
    let member = position.member.unwrap_or_default();
    // The receiver only goes away if the group itself was dropped.
    let _ = tx.send((member, result));
}

fn aggregate_failure(members: &[StepResult]) -> StepFailure {
    let details: Vec<String> = members
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("[{}] {e}", r.position)))
        .collect();
    StepFailure::new(
        FailureClass::Aggregate,
        format!("no group member succeeded: {}", details.join("; ")),
    )
}

/// Reduce member results to the group's single output.
fn merge(
    group: &ParallelGroupSpec,
    members: &[StepResult],
    winner: Option<usize>,
) -> Result<Artifact, StepFailure> {
    let succeeded = members.iter().filter(|r| r.is_success()).count();
    match group.merge_strategy {
        MergeStrategy::CollectAll => {
            if succeeded == 0 {
                return Err(aggregate_failure(members));
            }
            let items = members.iter().map(|r| r.output.clone()).collect();
            Ok(Artifact::collection(items)
                .with_meta("merge_strategy", "collect_all")
                .with_meta("members_succeeded", succeeded))
        }
        MergeStrategy::FirstSuccess => winner
            .and_then(|w| members.get(w).and_then(|r| r.output.clone()).map(|a| (w, a)))
            .map(|(w, artifact)| {
                artifact
                    .with_meta("merge_strategy", "first_success")
                    .with_meta("winner", w)
            })
            .ok_or_else(|| aggregate_failure(members)),
        MergeStrategy::BestQuality => {
            let score_by = group.score_by().unwrap_or("resolution");
            let (best, score) =
                pick_best(members, score_by).ok_or_else(|| aggregate_failure(members))?;
            let artifact = members[best]
                .output
                .clone()
                .ok_or_else(|| aggregate_failure(members))?;
            let mut artifact = artifact
                .with_meta("merge_strategy", "best_quality")
                .with_meta("winner", best);
            if score.is_finite() {
                artifact = artifact.with_meta("score", score);
            }
            Ok(artifact)
        }
    }
}

/// Highest `score_by` metric among successful members. Missing scores rank
/// lowest; ties go to the lowest member index.
fn pick_best(members: &[StepResult], score_by: &str) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, result) in members.iter().enumerate() {
        if !result.is_success() {
            continue;
        }
        let Some(output) = result.output.as_ref() else {
            continue;
        };
        let score = output.metric(score_by).unwrap_or(f64::NEG_INFINITY);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((i, score));
        }
    }
    best
}
