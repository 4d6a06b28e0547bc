use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::responder::Responder;

/// Periodically nudges the bot while tasks are pending and the channel has
/// been quiet. Never interrupts a response that is already being thought up.
pub async fn run_auto_responder(responder: Arc<Responder>, token: CancellationToken) {
    loop {
        let interval = responder.voice_ux().auto_respond_interval_seconds;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(Duration::from_secs(interval.max(1))) => {}
        }

        if interval == 0 {
            continue;
        }
        let tasks = responder.prompt_contents().tasks;
        let Some(first_task) = tasks.first() else {
            continue;
        };
        if responder.last_response_end().elapsed() < Duration::from_secs(interval) {
            continue;
        }

        debug!(task = %first_task.name, "Auto-response attempt");
        responder.transcript.add_task_reminder(&first_task.name);
        responder.attempt_to_respond(false);
    }
    debug!("Auto-responder stopped");
}
