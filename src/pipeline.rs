//! Hand-off between the admission path and the provisioning workers.
//!
//! Every resource type has one queue with a single consumer, so requests of one type
//! are processed in submission order. The queues hold a single request: an admission
//! call waits while its worker is still busy with the previous request.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub const QUEUE_CAPACITY: usize = 1;

pub fn queue<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// Queues a request, giving up as soon as shutdown starts.
pub async fn enqueue<T>(
    queue: &mpsc::Sender<T>,
    request: T,
    token: &CancellationToken,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        sent = queue.send(request) => sent.map_err(|_| Error::QueueClosed),
    }
}

/// Receives the next request, `None` once shutdown starts or every sender is gone.
pub async fn next<T>(queue: &mut mpsc::Receiver<T>, token: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        request = queue.recv() => request,
    }
}

/// Result of one create or delete call against the cluster.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    AlreadyExists,
    NotFound(String),
    /// The API server answered with a structured error.
    Rejected(String),
    Failed(kube::Error),
}

pub fn classify(result: Result<(), kube::Error>) -> Outcome {
    match result {
        Ok(()) => Outcome::Succeeded,
        Err(kube::Error::Api(e)) if e.reason == "AlreadyExists" => Outcome::AlreadyExists,
        Err(kube::Error::Api(e)) if e.reason == "NotFound" || e.code == 404 => {
            Outcome::NotFound(e.message)
        }
        Err(kube::Error::Api(e)) => Outcome::Rejected(e.message),
        Err(e) => Outcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::api_error;

    #[test]
    fn test_classify() {
        assert!(matches!(classify(Ok(())), Outcome::Succeeded));
        assert!(matches!(
            classify(Err(api_error(409, "AlreadyExists", "exists"))),
            Outcome::AlreadyExists
        ));
        assert!(matches!(
            classify(Err(api_error(404, "NotFound", "gone"))),
            Outcome::NotFound(m) if m == "gone"
        ));
        assert!(matches!(
            classify(Err(api_error(422, "Invalid", "bad name"))),
            Outcome::Rejected(m) if m == "bad name"
        ));
        assert!(matches!(
            classify(Err(kube::Error::SerdeError(
                serde_json::from_str::<u32>("x").unwrap_err()
            ))),
            Outcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_after_cancel() {
        let (tx, mut rx) = queue::<u32>();
        let token = CancellationToken::new();
        enqueue(&tx, 1, &token).await.unwrap();

        // the queue is full, only cancellation can release the sender
        let blocked = tokio::spawn({
            let tx = tx.clone();
            let token = token.clone();
            async move { enqueue(&tx, 2, &token).await }
        });
        token.cancel();
        assert!(matches!(blocked.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(next(&mut rx, &token).await, None);
    }

    #[tokio::test]
    async fn test_enqueue_closed() {
        let (tx, rx) = queue::<u32>();
        drop(rx);
        let token = CancellationToken::new();
        assert!(matches!(
            enqueue(&tx, 1, &token).await,
            Err(Error::QueueClosed)
        ));
    }
}
