//! Human-readable explanations for why a task found no worker.

use std::collections::BTreeSet;

use crate::tasks::Task;

/// Capability descriptors shown before the list is summarized.
const SHOWN_CAPABILITIES: usize = 4;

/// `[a, b, c, d, +N more]`.
pub fn summarize_capabilities(capabilities: &[String]) -> String {
    let mut shown: Vec<String> = capabilities
        .iter()
        .take(SHOWN_CAPABILITIES)
        .cloned()
        .collect();
    if capabilities.len() > SHOWN_CAPABILITIES {
        shown.push(format!("+{} more", capabilities.len() - SHOWN_CAPABILITIES));
    }
    format!("[{}]", shown.join(", "))
}

fn list<'a>(workers: impl IntoIterator<Item = &'a String>) -> String {
    format!(
        "[{}]",
        workers.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    )
}

/// Alert text when workers are connected but none has the capabilities.
pub fn capability_mismatch(task: &Task, connected: &[String]) -> String {
    format!(
        "{} connected worker(s) {} lack capabilities required by {} task {}: {}",
        connected.len(),
        list(connected),
        task.task_type,
        task.id,
        summarize_capabilities(&task.capabilities)
    )
}

/// Alert text when nothing is connected for the account.
pub fn no_active_workers(account_id: &str) -> String {
    format!("No workers are connected for account {account_id}.")
}

/// Result message attached to a task that expired without a worker.
pub fn expiry_message(task: &Task, connected: &[String]) -> String {
    if connected.is_empty() {
        return format!("Task expired. {}", no_active_workers(&task.account_id));
    }

    let silent: BTreeSet<&String> = task
        .validating_workers
        .difference(&task.validation_complete_workers)
        .collect();
    format!(
        "Task expired. None of the connected workers could execute the task. \
         Required capabilities: {}. Consulted: {}. Did not report: {}.",
        summarize_capabilities(&task.capabilities),
        list(&task.validating_workers),
        list(silent)
    )
}
