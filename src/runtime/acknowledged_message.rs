use tokio::sync::oneshot;

/// A message type that includes an acknowledgement mechanism.
/// When this is dropped or `acknowledge` is called, the sender will be notified.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    acknowledger: AcknowledgmentSender<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Create a new message and return it along with a receiver that will be notified when the
    /// message is received and processed.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: AcknowledgmentSender { sender },
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.acknowledger)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    /// Send the result of processing the message. If the receiver end hung up, this will
    /// quietly discard the result.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        let _: std::result::Result<_, _> = self.sender.send(result.into());
    }
}

/// The receiving end of an `AcknowledgedMessage`.
#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Wait for the message to be acknowledged. If the message was dropped without being
    /// acknowledged, this returns `None`.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
