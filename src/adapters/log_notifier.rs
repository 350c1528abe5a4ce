use crate::ports::{Notifier, PortFuture};
use tracing::warn;

/// Operator notifications written to the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> PortFuture<'a, ()> {
        Box::pin(async move {
            warn!(notification = true, subject, body, "Operator attention required");
            Ok(())
        })
    }
}
