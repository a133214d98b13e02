//! Bounded-concurrency fan-out of one operation across many nodes.
//!
//! Every node's outcome is independent: an error or timeout on one node is
//! recorded in that node's slot and never aborts the batch. Completion order
//! across nodes is unspecified.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::agent::{AgentFailure, AgentResult};
use crate::db::entities::node;

#[derive(Debug)]
pub struct NodeOutcome<T> {
    pub node_id: i32,
    pub result: AgentResult<T>,
}

impl<T> NodeOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `op` against every node with at most `concurrency` calls in flight.
/// Each call is bounded by `timeout`; an elapsed timeout surfaces as a
/// regular [`AgentFailure`], indistinguishable from an agent error.
pub async fn fan_out<T, F, Fut>(
    nodes: Vec<node::Model>,
    concurrency: usize,
    timeout: Duration,
    op: F,
) -> Vec<NodeOutcome<T>>
where
    F: Fn(node::Model) -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    stream::iter(nodes.into_iter().map(|node| {
        let node_id = node.id;
        let fut = op(node);
        async move {
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(AgentFailure::new(format!(
                    "operation timed out after {}s",
                    timeout.as_secs_f64()
                ))),
            };
            NodeOutcome { node_id, result }
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}
