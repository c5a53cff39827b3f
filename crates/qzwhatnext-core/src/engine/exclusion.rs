use crate::models::Task;

/// Whether a task may ever be shown to the inference adapter.
///
/// A task is AI-excluded when the explicit flag is set, when its stripped
/// title begins with '.', or (for titles that came out of smart capture)
/// when the notes begin with '.'. This check runs before any inference call;
/// excluded tasks keep user-supplied attributes and defaults only.
pub fn is_ai_excluded(task: &Task) -> bool {
    if task.ai_excluded {
        return true;
    }
    if task.title.trim_start().starts_with('.') {
        return true;
    }
    if task.title_autogenerated {
        if let Some(notes) = &task.notes {
            if notes.trim_start().starts_with('.') {
                return true;
            }
        }
    }
    false
}

/// Partition a task list into (eligible, excluded).
pub fn partition_excluded(tasks: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    tasks.into_iter().partition(|t| !is_ai_excluded(t))
}
