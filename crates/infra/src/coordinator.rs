//! Resource coordinator: admission control over named resources.
//!
//! ## Rules
//!
//! For a call requesting resources `R` with weight `w`:
//!
//! - an exclusive request (`write`, `exclusive`) conflicts with any grant on
//!   the resource;
//! - a shared request (`read`) conflicts with an exclusive grant, or when the
//!   summed granted weight plus `w` would exceed the resource budget;
//! - a resource is also blocked while an earlier-submitted call naming it is
//!   still queued (strict FIFO per resource);
//! - the optional global weight budget applies to every call, with the same
//!   FIFO discipline once an earlier call is waiting on it.
//!
//! Calls that can never fit (weight above a budget) are rejected up front.
//! Everything else is granted or queued. The queue is only re-evaluated on
//! release or withdrawal; nothing polls.
//!
//! The coordinator is plain data. The dispatcher owns it behind its lock, so
//! every evaluate-and-apply step is atomic.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use conductor_calls::{Operation, Reason};
use conductor_core::TaskId;

/// Concurrency budgets. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBudgets {
    /// Total weight of all running calls.
    pub global: Option<u32>,
    /// Per-resource budget for resources without an explicit entry.
    pub default_per_resource: Option<u32>,
    /// Per-resource overrides.
    pub per_resource: BTreeMap<String, u32>,
}

impl ResourceBudgets {
    pub fn with_global(mut self, budget: u32) -> Self {
        self.global = Some(budget);
        self
    }

    pub fn with_default_per_resource(mut self, budget: u32) -> Self {
        self.default_per_resource = Some(budget);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>, budget: u32) -> Self {
        self.per_resource.insert(resource_id.into(), budget);
        self
    }

    pub fn for_resource(&self, resource_id: &str) -> Option<u32> {
        self.per_resource
            .get(resource_id)
            .copied()
            .or(self.default_per_resource)
    }
}

/// Result of an admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Postponed(Vec<Reason>),
    Rejected(Vec<Reason>),
}

#[derive(Debug, Clone)]
struct Grant {
    task_id: TaskId,
    operation: Operation,
    weight: u32,
}

#[derive(Debug, Clone)]
struct Claim {
    resources: BTreeMap<String, Operation>,
    weight: u32,
}

#[derive(Debug, Clone)]
struct Queued {
    task_id: TaskId,
    claim: Claim,
    reasons: Vec<Reason>,
}

/// What earlier queued calls hold back from later ones during a pass.
#[derive(Debug, Default)]
struct QueueAhead {
    resources: HashSet<String>,
    global: bool,
}

impl QueueAhead {
    fn add(&mut self, entry: &Queued) {
        self.resources.extend(entry.claim.resources.keys().cloned());
        if entry
            .reasons
            .iter()
            .any(|r| matches!(r, Reason::GlobalBudget { .. }))
        {
            self.global = true;
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceCoordinator {
    budgets: ResourceBudgets,
    grants: HashMap<String, Vec<Grant>>,
    running: HashMap<TaskId, Claim>,
    global_in_use: u64,
    queue: VecDeque<Queued>,
}

impl ResourceCoordinator {
    pub fn new(budgets: ResourceBudgets) -> Self {
        Self {
            budgets,
            ..Default::default()
        }
    }

    pub fn budgets(&self) -> &ResourceBudgets {
        &self.budgets
    }

    /// Decide admission for a newly submitted call.
    ///
    /// Accepted calls hold their grants until [`release`](Self::release);
    /// postponed calls wait in submission order.
    pub fn request(
        &mut self,
        task_id: TaskId,
        resources: &BTreeMap<String, Operation>,
        weight: u32,
    ) -> Admission {
        if self.running.contains_key(&task_id) {
            return Admission::Accepted;
        }
        if let Some(queued) = self.queue.iter().find(|q| q.task_id == task_id) {
            return Admission::Postponed(queued.reasons.clone());
        }

        let claim = Claim {
            resources: resources.clone(),
            weight,
        };

        let impossible = self.impossible(&claim);
        if !impossible.is_empty() {
            debug!(task_id = %task_id, reasons = ?impossible, "call rejected");
            return Admission::Rejected(impossible);
        }

        let mut ahead = QueueAhead::default();
        for queued in &self.queue {
            ahead.add(queued);
        }
        let reasons = self.blockers(&claim, &ahead);

        if reasons.is_empty() {
            self.grant(task_id, claim);
            Admission::Accepted
        } else {
            debug!(task_id = %task_id, reasons = ?reasons, "call postponed");
            self.queue.push_back(Queued {
                task_id,
                claim,
                reasons: reasons.clone(),
            });
            Admission::Postponed(reasons)
        }
    }

    /// Drop a running call's grants and admit whatever now fits.
    ///
    /// Returns newly admitted calls in submission order.
    pub fn release(&mut self, task_id: TaskId) -> Vec<TaskId> {
        let Some(claim) = self.running.remove(&task_id) else {
            return Vec::new();
        };
        for resource_id in claim.resources.keys() {
            if let Some(grants) = self.grants.get_mut(resource_id) {
                grants.retain(|g| g.task_id != task_id);
                if grants.is_empty() {
                    self.grants.remove(resource_id);
                }
            }
        }
        self.global_in_use -= u64::from(claim.weight);
        trace!(task_id = %task_id, "released grants");
        self.pump()
    }

    /// Remove a queued call (e.g. canceled while waiting) and re-run admission.
    pub fn withdraw(&mut self, task_id: TaskId) -> Vec<TaskId> {
        let before = self.queue.len();
        self.queue.retain(|q| q.task_id != task_id);
        if self.queue.len() == before {
            return Vec::new();
        }
        self.pump()
    }

    /// Current blocking reasons of every queued call, in submission order.
    pub fn queued(&self) -> impl Iterator<Item = (TaskId, &[Reason])> {
        self.queue.iter().map(|q| (q.task_id, q.reasons.as_slice()))
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn is_queued(&self, task_id: TaskId) -> bool {
        self.queue.iter().any(|q| q.task_id == task_id)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Calls currently holding `resource_id`.
    pub fn holders(&self, resource_id: &str) -> Vec<(TaskId, Operation)> {
        self.grants
            .get(resource_id)
            .map(|gs| gs.iter().map(|g| (g.task_id, g.operation)).collect())
            .unwrap_or_default()
    }

    pub fn granted_weight(&self, resource_id: &str) -> u64 {
        self.grants
            .get(resource_id)
            .map(|gs| gs.iter().map(|g| u64::from(g.weight)).sum())
            .unwrap_or(0)
    }

    pub fn global_in_use(&self) -> u64 {
        self.global_in_use
    }

    fn impossible(&self, claim: &Claim) -> Vec<Reason> {
        let mut reasons: Vec<Reason> = claim
            .resources
            .iter()
            .filter(|(id, _)| {
                self.budgets
                    .for_resource(id)
                    .is_some_and(|budget| claim.weight > budget)
            })
            .map(|(id, op)| Reason::resource(id.clone(), *op))
            .collect();
        if let Some(budget) = self.budgets.global {
            if claim.weight > budget {
                reasons.push(Reason::GlobalBudget {
                    weight: claim.weight,
                    budget,
                });
            }
        }
        reasons
    }

    fn blockers(&self, claim: &Claim, ahead: &QueueAhead) -> Vec<Reason> {
        let mut reasons = Vec::new();

        for (resource_id, op) in &claim.resources {
            let blocked = ahead.resources.contains(resource_id.as_str())
                || self.conflicts(resource_id, *op, claim.weight);
            if blocked {
                reasons.push(Reason::resource(resource_id.clone(), *op));
            }
        }

        if let Some(budget) = self.budgets.global {
            if ahead.global || self.global_in_use + u64::from(claim.weight) > u64::from(budget) {
                reasons.push(Reason::GlobalBudget {
                    weight: claim.weight,
                    budget,
                });
            }
        }

        reasons
    }

    fn conflicts(&self, resource_id: &str, op: Operation, weight: u32) -> bool {
        let Some(grants) = self.grants.get(resource_id) else {
            return false;
        };
        if op.is_exclusive() {
            return !grants.is_empty();
        }
        if grants.iter().any(|g| g.operation.is_exclusive()) {
            return true;
        }
        match self.budgets.for_resource(resource_id) {
            Some(budget) => {
                let used: u64 = grants.iter().map(|g| u64::from(g.weight)).sum();
                used + u64::from(weight) > u64::from(budget)
            }
            None => false,
        }
    }

    fn grant(&mut self, task_id: TaskId, claim: Claim) {
        for (resource_id, op) in &claim.resources {
            self.grants
                .entry(resource_id.clone())
                .or_default()
                .push(Grant {
                    task_id,
                    operation: *op,
                    weight: claim.weight,
                });
        }
        self.global_in_use += u64::from(claim.weight);
        self.running.insert(task_id, claim);
        trace!(task_id = %task_id, "granted");
    }

    /// Walk the queue front to back, granting every call that fits given the
    /// calls still queued ahead of it.
    fn pump(&mut self) -> Vec<TaskId> {
        let pending = std::mem::take(&mut self.queue);
        let mut remaining: VecDeque<Queued> = VecDeque::with_capacity(pending.len());
        let mut admitted = Vec::new();
        let mut ahead = QueueAhead::default();

        for mut entry in pending {
            let reasons = self.blockers(&entry.claim, &ahead);
            if reasons.is_empty() {
                admitted.push(entry.task_id);
                self.grant(entry.task_id, entry.claim);
            } else {
                entry.reasons = reasons;
                ahead.add(&entry);
                remaining.push_back(entry);
            }
        }

        self.queue = remaining;
        if !admitted.is_empty() {
            debug!(admitted = admitted.len(), queued = self.queue.len(), "admitted queued calls");
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn res(entries: &[(&str, Operation)]) -> BTreeMap<String, Operation> {
        entries
            .iter()
            .map(|(id, op)| (id.to_string(), *op))
            .collect()
    }

    #[test]
    fn exclusive_requests_serialize() {
        let mut c = ResourceCoordinator::default();
        let a = TaskId::new();
        let b = TaskId::new();
        let repo = res(&[("repo-1", Operation::Exclusive)]);

        assert_eq!(c.request(a, &repo, 1), Admission::Accepted);
        assert_eq!(
            c.request(b, &repo, 1),
            Admission::Postponed(vec![Reason::resource("repo-1", Operation::Exclusive)])
        );

        assert_eq!(c.release(a), vec![b]);
        assert!(c.is_running(b));
        assert_eq!(c.holders("repo-1"), vec![(b, Operation::Exclusive)]);
    }

    #[test]
    fn shared_reads_coexist_until_budget() {
        let mut c = ResourceCoordinator::new(ResourceBudgets::default().with_resource("repo-1", 3));
        let read = res(&[("repo-1", Operation::Read)]);
        let (a, b, d) = (TaskId::new(), TaskId::new(), TaskId::new());

        assert_eq!(c.request(a, &read, 1), Admission::Accepted);
        assert_eq!(c.request(b, &read, 2), Admission::Accepted);
        assert!(matches!(c.request(d, &read, 1), Admission::Postponed(_)));
        assert_eq!(c.granted_weight("repo-1"), 3);

        assert_eq!(c.release(a), vec![d]);
        assert_eq!(c.granted_weight("repo-1"), 3);
    }

    #[test]
    fn read_waits_for_exclusive_holder() {
        let mut c = ResourceCoordinator::default();
        let (w, r) = (TaskId::new(), TaskId::new());
        c.request(w, &res(&[("repo-1", Operation::Write)]), 1);
        assert_eq!(
            c.request(r, &res(&[("repo-1", Operation::Read)]), 1),
            Admission::Postponed(vec![Reason::resource("repo-1", Operation::Read)])
        );
        assert_eq!(c.release(w), vec![r]);
    }

    #[test]
    fn later_call_cannot_overtake_queued_one() {
        let mut c = ResourceCoordinator::default();
        let (holder, a, b) = (TaskId::new(), TaskId::new(), TaskId::new());

        // `a` waits on repo-2 (held) and also wants repo-1.
        c.request(holder, &res(&[("repo-2", Operation::Exclusive)]), 1);
        let a_admission = c.request(
            a,
            &res(&[("repo-1", Operation::Exclusive), ("repo-2", Operation::Exclusive)]),
            1,
        );
        assert_eq!(
            a_admission,
            Admission::Postponed(vec![Reason::resource("repo-2", Operation::Exclusive)])
        );

        // repo-1 is free, but `a` is ahead of `b` on it.
        assert_eq!(
            c.request(b, &res(&[("repo-1", Operation::Exclusive)]), 1),
            Admission::Postponed(vec![Reason::resource("repo-1", Operation::Exclusive)])
        );

        assert_eq!(c.release(holder), vec![a]);
        assert!(c.is_queued(b));
        assert_eq!(c.release(a), vec![b]);
    }

    #[test]
    fn global_budget_limits_resource_free_calls() {
        let mut c = ResourceCoordinator::new(ResourceBudgets::default().with_global(5));
        let (a, b) = (TaskId::new(), TaskId::new());
        let none = BTreeMap::new();

        assert_eq!(c.request(a, &none, 5), Admission::Accepted);
        assert_eq!(
            c.request(b, &none, 5),
            Admission::Postponed(vec![Reason::GlobalBudget { weight: 5, budget: 5 }])
        );
        assert_eq!(c.release(a), vec![b]);
    }

    #[test]
    fn release_walks_long_queue_in_order() {
        let budgets = ResourceBudgets::default().with_resource("repo-0", 10);
        let mut c = ResourceCoordinator::new(budgets);
        let holder = TaskId::new();
        c.request(holder, &res(&[("repo-0", Operation::Exclusive)]), 1);

        let queued: Vec<TaskId> = (0..1000)
            .map(|i| {
                let id = TaskId::new();
                let mut claim = res(&[("repo-0", Operation::Read)]);
                claim.insert(format!("repo-{}", i + 1), Operation::Exclusive);
                assert!(matches!(c.request(id, &claim, 1), Admission::Postponed(_)));
                id
            })
            .collect();

        assert_eq!(c.release(holder), queued[..10].to_vec());
        assert_eq!(c.queued_len(), 990);
        assert_eq!(c.queued().next().map(|(id, _)| id), Some(queued[10]));
        for (_, reasons) in c.queued() {
            assert_eq!(reasons, &[Reason::resource("repo-0", Operation::Read)]);
        }

        assert_eq!(c.release(queued[0]), vec![queued[10]]);
        assert_eq!(c.holders("repo-0").len(), 10);
    }

    #[test]
    fn global_budget_is_fifo() {
        let mut c = ResourceCoordinator::new(ResourceBudgets::default().with_global(4));
        let none = BTreeMap::new();
        let (a, big, small) = (TaskId::new(), TaskId::new(), TaskId::new());

        c.request(a, &none, 3);
        assert!(matches!(c.request(big, &none, 4), Admission::Postponed(_)));
        // Would fit (3 + 1 <= 4) but `big` is waiting on the budget first.
        assert!(matches!(c.request(small, &none, 1), Admission::Postponed(_)));

        assert_eq!(c.release(a), vec![big]);
        assert_eq!(c.release(big), vec![small]);
    }

    #[test]
    fn freed_capacity_is_granted_in_submission_order() {
        let mut c = ResourceCoordinator::new(ResourceBudgets::default().with_global(3));
        let none = BTreeMap::new();
        let holder = TaskId::new();
        let waiting: Vec<TaskId> = (0..4).map(|_| TaskId::new()).collect();

        c.request(holder, &none, 3);
        for id in &waiting {
            c.request(*id, &none, 1);
        }

        assert_eq!(c.release(holder), waiting[..3].to_vec());
        assert!(c.is_queued(waiting[3]));
    }

    #[test]
    fn impossible_requests_are_rejected() {
        let budgets = ResourceBudgets::default()
            .with_global(10)
            .with_resource("repo-1", 2);
        let mut c = ResourceCoordinator::new(budgets);

        assert_eq!(
            c.request(TaskId::new(), &res(&[("repo-1", Operation::Read)]), 3),
            Admission::Rejected(vec![Reason::resource("repo-1", Operation::Read)])
        );
        assert_eq!(
            c.request(TaskId::new(), &BTreeMap::new(), 11),
            Admission::Rejected(vec![Reason::GlobalBudget { weight: 11, budget: 10 }])
        );
        assert_eq!(c.queued_len(), 0);
        assert_eq!(c.running_len(), 0);
    }

    #[test]
    fn withdrawing_a_queued_call_unblocks_followers() {
        let mut c = ResourceCoordinator::default();
        let (holder, stuck, follower) = (TaskId::new(), TaskId::new(), TaskId::new());

        c.request(holder, &res(&[("repo-2", Operation::Exclusive)]), 1);
        c.request(
            stuck,
            &res(&[("repo-1", Operation::Read), ("repo-2", Operation::Read)]),
            1,
        );
        assert!(matches!(
            c.request(follower, &res(&[("repo-1", Operation::Exclusive)]), 1),
            Admission::Postponed(_)
        ));

        assert_eq!(c.withdraw(stuck), vec![follower]);
        assert!(c.withdraw(stuck).is_empty());
    }

    #[test]
    fn queued_reasons_are_refreshed() {
        let mut c = ResourceCoordinator::default();
        let (a, b, d) = (TaskId::new(), TaskId::new(), TaskId::new());
        c.request(a, &res(&[("repo-1", Operation::Exclusive)]), 1);
        c.request(b, &res(&[("repo-2", Operation::Exclusive)]), 1);
        c.request(
            d,
            &res(&[("repo-1", Operation::Exclusive), ("repo-2", Operation::Exclusive)]),
            1,
        );

        c.release(a);
        let reasons: Vec<(TaskId, Vec<Reason>)> =
            c.queued().map(|(id, r)| (id, r.to_vec())).collect();
        assert_eq!(
            reasons,
            vec![(d, vec![Reason::resource("repo-2", Operation::Exclusive)])]
        );
    }

    #[test]
    fn releasing_unknown_call_is_noop() {
        let mut c = ResourceCoordinator::default();
        assert!(c.release(TaskId::new()).is_empty());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Submit(Vec<(usize, Operation)>, u32),
        Release(usize),
    }

    const RESOURCES: [&str; 3] = ["repo-1", "repo-2", "repo-3"];

    fn arb_step() -> impl Strategy<Value = Step> {
        let op = prop_oneof![
            Just(Operation::Read),
            Just(Operation::Write),
            Just(Operation::Exclusive),
        ];
        prop_oneof![
            3 => (prop::collection::vec((0usize..RESOURCES.len(), op), 0..3), 0u32..4)
                .prop_map(|(rs, w)| Step::Submit(rs, w)),
            2 => any::<usize>().prop_map(Step::Release),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: across any submit/release sequence, exclusive grants are
        /// sole holders, granted weight never exceeds a budget, and no running
        /// call overtook an earlier queued call on a shared resource.
        #[test]
        fn admission_invariants_hold(steps in prop::collection::vec(arb_step(), 1..40)) {
            let budgets = ResourceBudgets::default()
                .with_global(6)
                .with_default_per_resource(3);
            let mut c = ResourceCoordinator::new(budgets);
            let mut submitted: Vec<(TaskId, BTreeMap<String, Operation>)> = Vec::new();

            for step in steps {
                match step {
                    Step::Submit(rs, weight) => {
                        let resources: BTreeMap<String, Operation> = rs
                            .into_iter()
                            .map(|(i, op)| (RESOURCES[i].to_string(), op))
                            .collect();
                        let id = TaskId::new();
                        if !matches!(c.request(id, &resources, weight), Admission::Rejected(_)) {
                            submitted.push((id, resources));
                        }
                    }
                    Step::Release(pick) => {
                        let running: Vec<TaskId> = submitted
                            .iter()
                            .map(|(id, _)| *id)
                            .filter(|id| c.is_running(*id))
                            .collect();
                        if !running.is_empty() {
                            c.release(running[pick % running.len()]);
                        }
                    }
                }

                for resource in RESOURCES {
                    let holders = c.holders(resource);
                    if holders.iter().any(|(_, op)| op.is_exclusive()) {
                        prop_assert_eq!(holders.len(), 1);
                    }
                    prop_assert!(c.granted_weight(resource) <= 3);
                }
                prop_assert!(c.global_in_use() <= 6);

                for (later_idx, (later, later_res)) in submitted.iter().enumerate() {
                    if !c.is_running(*later) {
                        continue;
                    }
                    for (earlier, earlier_res) in &submitted[..later_idx] {
                        let shares = earlier_res.keys().any(|r| later_res.contains_key(r));
                        prop_assert!(!(shares && c.is_queued(*earlier)));
                    }
                }
            }
        }
    }
}
