use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to an async task spawned via `runtime::spawn`.
/// Awaiting the handle returns the task's output; dropping it detaches the task.
#[derive(Debug)]
pub(crate) enum AsyncJoinHandle<T> {
    Tokio(tokio::task::JoinHandle<T>),
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match *self {
            Self::Tokio(ref mut handle) => Pin::new(handle)
                .poll(cx)
                .map(|result| result.expect("task panicked")),
        }
    }
}
