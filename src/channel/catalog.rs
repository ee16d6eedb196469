//! The fixed set of logical channels a producer may publish on.

/// Channel whose events also force the named user's sockets closed
pub const FORCED_LOGOUT_CHANNEL: &str = "user-logged-out";

/// Every logical channel known to the service.
///
/// No entry may equal a `-`-separated suffix of another entry; wire names
/// would become ambiguous otherwise.
pub const CHANNELS: &[&str] = &[
    // Tasks
    "task-created",
    "task-updated",
    "task-deleted",
    "task-moved",
    "task-assigned",
    "task-unassigned",
    "task-archived",
    "task-restored",
    "task-position-updated",
    "task-status-changed",
    "task-priority-changed",
    "task-due-date-changed",
    "task-label-added",
    "task-label-removed",
    // Boards and columns
    "board-created",
    "board-updated",
    "board-deleted",
    "board-archived",
    "column-created",
    "column-updated",
    "column-deleted",
    "column-reordered",
    // Comments
    "comment-created",
    "comment-updated",
    "comment-deleted",
    // Members
    "member-added",
    "member-updated",
    "member-removed",
    "member-role-changed",
    // Labels
    "label-created",
    "label-updated",
    "label-deleted",
    // Attachments and checklists
    "attachment-added",
    "attachment-deleted",
    "checklist-item-created",
    "checklist-item-updated",
    "checklist-item-deleted",
    // Time tracking
    "time-entry-created",
    "time-entry-updated",
    "time-entry-deleted",
    // Misc
    "activity-logged",
    "notification-created",
    FORCED_LOGOUT_CHANNEL,
];

/// Check whether a name belongs to the channel catalogue
pub fn is_known_channel(name: &str) -> bool {
    CHANNELS.contains(&name)
}
