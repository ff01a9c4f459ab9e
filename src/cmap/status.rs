use bson::oid::ObjectId;
use tokio::sync::watch;

use super::worker::PoolGeneration;

/// Create a channel for publishing and receiving updates to the pool's generation.
pub(super) fn channel(initial: PoolGeneration) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(initial);
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

/// Struct used to publish updates to the pool's generation.
#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: watch::Sender<PoolGeneration>,
}

impl PoolGenerationPublisher {
    /// Publish a new generation.
    pub(super) fn publish(&self, new_generation: PoolGeneration) {
        // If nobody is listening, this will return an error, which we don't mind.
        let _: std::result::Result<_, _> = self.sender.send(new_generation);
    }
}

/// Subscriber used to get the latest generation of the pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<PoolGeneration>,
}

impl PoolGenerationSubscriber {
    /// Get a copy of the latest generation.
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().clone()
    }

    /// Get the current generation for a given load-balancer backend.
    #[allow(dead_code)]
    pub(crate) fn service_generation(&self, service_id: &ObjectId) -> Option<u32> {
        match *self.receiver.borrow() {
            PoolGeneration::LoadBalanced(ref gen_map) => gen_map.get(service_id).copied(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) async fn wait_for_generation_change(
        &mut self,
        timeout: std::time::Duration,
    ) -> Option<PoolGeneration> {
        crate::runtime::timeout(timeout, self.receiver.changed())
            .await
            .ok()
            .and_then(|changed| changed.ok())
            .map(|_| self.receiver.borrow().clone())
    }
}
