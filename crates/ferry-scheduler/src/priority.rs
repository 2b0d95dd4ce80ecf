//! Admission bookkeeping: which builds of which flow wait for agents of a selector.
//!
//! The queue never grants an agent itself. The dispatcher asks it whether a
//! build is the oldest pending one of its flow before trying any lock.

use ferry_core::ids::{FlowId, SelectorId};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

type Pending = HashMap<SelectorId, HashMap<FlowId, BTreeSet<u64>>>;

#[derive(Default)]
pub struct PriorityAdmissionQueue {
    pending: Mutex<Pending>,
}

impl PriorityAdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending build. Adding the same triple twice is a no-op.
    pub async fn add_job(&self, selector: &SelectorId, flow_id: FlowId, build_number: u64) {
        self.pending
            .lock()
            .await
            .entry(selector.clone())
            .or_default()
            .entry(flow_id)
            .or_default()
            .insert(build_number);
    }

    pub async fn remove_job(&self, selector: &SelectorId, flow_id: FlowId, build_number: u64) {
        let mut pending = self.pending.lock().await;
        let Some(flows) = pending.get_mut(selector) else {
            return;
        };

        if let Some(builds) = flows.get_mut(&flow_id) {
            builds.remove(&build_number);
            if builds.is_empty() {
                flows.remove(&flow_id);
            }
        }
        if flows.is_empty() {
            pending.remove(selector);
        }
    }

    pub async fn min_pending_build_number(
        &self,
        selector: &SelectorId,
        flow_id: FlowId,
    ) -> Option<u64> {
        self.pending
            .lock()
            .await
            .get(selector)
            .and_then(|flows| flows.get(&flow_id))
            .and_then(|builds| builds.first().copied())
    }

    /// Whether `build_number` may compete for an agent now.
    pub async fn is_next(&self, selector: &SelectorId, flow_id: FlowId, build_number: u64) -> bool {
        self.min_pending_build_number(selector, flow_id)
            .await
            .is_none_or(|min| build_number <= min)
    }

    /// Oldest pending build of every flow waiting on `selector`.
    pub async fn all_min(&self, selector: &SelectorId) -> Vec<(FlowId, u64)> {
        let pending = self.pending.lock().await;
        let Some(flows) = pending.get(selector) else {
            return Vec::new();
        };

        let mut mins: Vec<(FlowId, u64)> = flows
            .iter()
            .filter_map(|(flow, builds)| builds.first().map(|min| (*flow, *min)))
            .collect();
        mins.sort_by_key(|(flow, min)| (*min, *flow));
        mins
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::selector::Selector;

    #[tokio::test]
    async fn test_min_pending_follows_removals() {
        let queue = PriorityAdmissionQueue::new();
        let selector = Selector::new(["linux"]).id();
        let flow = FlowId::new();

        queue.add_job(&selector, flow, 2).await;
        queue.add_job(&selector, flow, 1).await;
        queue.add_job(&selector, flow, 1).await;
        assert_eq!(queue.min_pending_build_number(&selector, flow).await, Some(1));

        queue.remove_job(&selector, flow, 1).await;
        assert_eq!(queue.min_pending_build_number(&selector, flow).await, Some(2));

        queue.remove_job(&selector, flow, 42).await;
        queue.remove_job(&Selector::new(["none"]).id(), flow, 2).await;
        assert_eq!(queue.min_pending_build_number(&selector, flow).await, Some(2));

        queue.remove_job(&selector, flow, 2).await;
        assert_eq!(queue.min_pending_build_number(&selector, flow).await, None);
        assert!(queue.is_empty().await);
    }

    #[test]
    fn test_unknown_flow_is_next() {
        let queue = PriorityAdmissionQueue::new();
        let selector = Selector::default().id();
        let flow = FlowId::new();

        tokio_test::block_on(async {
            assert!(queue.is_next(&selector, flow, 10).await);
            assert_eq!(queue.min_pending_build_number(&selector, flow).await, None);
        });
    }

    #[tokio::test]
    async fn test_is_next_per_flow() {
        let queue = PriorityAdmissionQueue::new();
        let selector = Selector::default().id();
        let flow = FlowId::new();
        let other = FlowId::new();

        queue.add_job(&selector, flow, 3).await;
        queue.add_job(&selector, flow, 4).await;
        queue.add_job(&selector, other, 1).await;

        assert!(queue.is_next(&selector, flow, 3).await);
        assert!(!queue.is_next(&selector, flow, 4).await);
        assert!(queue.is_next(&selector, other, 1).await);
    }

    #[tokio::test]
    async fn test_all_min_ordered_by_build() {
        let queue = PriorityAdmissionQueue::new();
        let selector = Selector::new(["ios"]).id();
        let a = FlowId::new();
        let b = FlowId::new();

        queue.add_job(&selector, a, 7).await;
        queue.add_job(&selector, a, 9).await;
        queue.add_job(&selector, b, 2).await;

        assert_eq!(queue.all_min(&selector).await, vec![(b, 2), (a, 7)]);
    }
}
