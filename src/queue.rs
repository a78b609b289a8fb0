//! Growable FIFO channel between a producer and a consumer.
//!
//! The server floods the whole offline queue right after the handshake
//! and the application may be slow to drain it; dropping is not allowed
//! and neither is blocking the receive task. A small pump task bridges
//! two rendezvous-sized channels through a `VecDeque` that grows as
//! needed, so pushes always complete promptly no matter how far behind
//! the consumer is.

use std::collections::VecDeque;

use tokio::sync::mpsc;

/// Create an elastic channel. The sender side never observes
/// back-pressure as long as the pump task is alive.
pub fn elastic_channel<T: Send + 'static>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    let (in_tx, in_rx) = mpsc::channel(1);
    let (out_tx, out_rx) = mpsc::channel(1);
    tokio::spawn(pump(in_rx, out_tx));
    (in_tx, out_rx)
}

async fn pump<T: Send>(mut in_rx: mpsc::Receiver<T>, out_tx: mpsc::Sender<T>) {
    let mut buf: VecDeque<T> = VecDeque::new();

    loop {
        if buf.is_empty() {
            match in_rx.recv().await {
                Some(item) => buf.push_back(item),
                None => break,
            }
        } else {
            tokio::select! {
                permit = out_tx.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(item) = buf.pop_front() {
                            permit.send(item);
                        }
                    }
                    // Consumer went away, nothing left to deliver to.
                    Err(_) => return,
                },
                item = in_rx.recv() => match item {
                    Some(item) => buf.push_back(item),
                    None => break,
                },
            }
        }
    }

    // Producer is gone; drain what is buffered before closing the output.
    for item in buf {
        if out_tx.send(item).await.is_err() {
            return;
        }
    }
}
