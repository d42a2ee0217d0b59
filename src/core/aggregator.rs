//! Folds partial updates into a [`TaskView`].
//!
//! Every function here is pure: it takes the current view by value and hands
//! back the next one. Updates are applied in arrival order and a later update
//! for a module always replaces the earlier one.

use crate::core::model::{ModuleStatus, StatusUpdate, TaskView};

/// Modules listed here are displayed first, in this order.
pub const MODULE_PRIORITY: &[&str] = &[
    "seo",
    "ssl",
    "security",
    "headers",
    "performance",
    "accessibility",
    "dns",
    "links",
    "katana",
];

/// Case-insensitive phrases that mean the module was refused for
/// authorization, credit or login reasons.
const ACCESS_RESTRICTED_PATTERNS: &[&str] = &[
    "insufficient credits",
    "not enough credits",
    "credit limit",
    "unauthorized",
    "not authorized",
    "forbidden",
    "access denied",
    "permission denied",
    "login required",
    "please log in",
    "please login",
    "authentication required",
    "subscription required",
    "upgrade your plan",
];

pub const ACCESS_DENIED_LABEL: &str = "Access denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    AccessDenied,
    Failed,
}

/// Display form of a module error. `raw` is kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub category: ErrorCategory,
    pub raw: String,
}

impl ModuleError {
    pub fn label(&self) -> &str {
        match self.category {
            ErrorCategory::AccessDenied => ACCESS_DENIED_LABEL,
            ErrorCategory::Failed => &self.raw,
        }
    }
}

pub fn classify_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if ACCESS_RESTRICTED_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorCategory::AccessDenied
    } else {
        ErrorCategory::Failed
    }
}

pub fn module_error(module: &ModuleStatus) -> Option<ModuleError> {
    module.error.as_ref().map(|raw| ModuleError {
        category: classify_error(raw),
        raw: raw.clone(),
    })
}

/// Inserts or replaces the entry for `module_name`.
pub fn merge_module_update(mut view: TaskView, module_name: &str, mut status: ModuleStatus) -> TaskView {
    status.name = module_name.to_string();
    status.progress = status.progress.normalized();
    view.modules.insert(module_name.to_string(), status);
    view
}

pub fn apply_status_update(mut view: TaskView, update: &StatusUpdate) -> TaskView {
    view.status = update.status;
    if let Some(p) = update.progress {
        view.progress = p.normalized();
    }
    if update.error.is_some() {
        view.error = update.error.clone();
    }
    if update.updated_at.is_some() {
        view.updated_at = update.updated_at;
    }
    view
}

/// A fetched snapshot is authoritative for everything it carries. Modules the
/// snapshot omits but that arrived earlier are kept.
pub fn apply_snapshot(view: TaskView, snapshot: TaskView) -> TaskView {
    let mut next = TaskView {
        progress: snapshot.progress.normalized(),
        ..snapshot
    };
    for (name, module) in view.modules {
        next.modules.entry(name).or_insert(module);
    }
    if next.created_at.is_none() {
        next.created_at = view.created_at;
    }
    next
}

fn priority_of(name: &str) -> usize {
    MODULE_PRIORITY
        .iter()
        .position(|p| p.eq_ignore_ascii_case(name))
        .unwrap_or(MODULE_PRIORITY.len())
}

/// Known modules by priority, then unknown ones in their incoming order.
pub fn display_order<'a, I>(modules: I) -> Vec<&'a ModuleStatus>
where
    I: IntoIterator<Item = &'a ModuleStatus>,
{
    let mut out: Vec<&ModuleStatus> = modules.into_iter().collect();
    out.sort_by_key(|m| priority_of(&m.name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Progress, TaskStatus};

    fn module(name: &str, status: TaskStatus) -> ModuleStatus {
        ModuleStatus::new(name, status)
    }

    #[test]
    fn last_write_wins_per_module() {
        let updates = vec![
            ("seo", TaskStatus::Running, 1),
            ("ssl", TaskStatus::Running, 1),
            ("seo", TaskStatus::Running, 5),
            ("performance", TaskStatus::Pending, 0),
            ("ssl", TaskStatus::Completed, 3),
            ("seo", TaskStatus::Failed, 7),
        ];

        let mut view = TaskView::new("abc", TaskStatus::Running);
        for (name, status, current) in &updates {
            let mut m = module(name, *status);
            m.progress = Progress::new(*current, 10);
            view = merge_module_update(view, name, m);
        }

        assert_eq!(view.modules.len(), 3);
        for name in ["seo", "ssl", "performance"] {
            let (_, status, current) = updates.iter().rev().find(|(n, _, _)| *n == name).unwrap();
            let got = &view.modules[name];
            assert_eq!(got.status, *status, "module {name}");
            assert_eq!(got.progress.current, *current, "module {name}");
        }
    }

    #[test]
    fn merge_uses_key_as_name() {
        let view = merge_module_update(TaskView::new("abc", TaskStatus::Running), "ssl", module("other", TaskStatus::Running));
        assert_eq!(view.modules["ssl"].name, "ssl");
    }

    #[test]
    fn insufficient_credits_is_access_denied() {
        let mut m = module("seo", TaskStatus::Failed);
        m.error = Some("Insufficient credits".to_string());
        let view = merge_module_update(TaskView::new("abc", TaskStatus::Running), "seo", m);

        let err = module_error(&view.modules["seo"]).unwrap();
        assert_eq!(err.category, ErrorCategory::AccessDenied);
        assert_eq!(err.label(), ACCESS_DENIED_LABEL);
        assert_eq!(err.raw, "Insufficient credits");
    }

    #[test]
    fn other_errors_keep_their_message() {
        assert_eq!(classify_error("DNS lookup timed out"), ErrorCategory::Failed);
        assert_eq!(classify_error("LOGIN REQUIRED for this module"), ErrorCategory::AccessDenied);
        let mut m = module("dns", TaskStatus::Failed);
        m.error = Some("DNS lookup timed out".to_string());
        assert_eq!(module_error(&m).unwrap().label(), "DNS lookup timed out");
    }

    #[test]
    fn status_update_keeps_modules() {
        let view = merge_module_update(TaskView::new("abc", TaskStatus::Pending), "seo", module("seo", TaskStatus::Running));
        let view = apply_status_update(
            view,
            &StatusUpdate {
                status: TaskStatus::Running,
                progress: Some(Progress::new(4, 10)),
                error: None,
                updated_at: None,
            },
        );
        assert_eq!(view.status, TaskStatus::Running);
        assert_eq!(view.progress, Progress::new(4, 10));
        assert!(view.modules.contains_key("seo"));
    }

    #[test]
    fn snapshot_overrides_but_keeps_unreported_modules() {
        let view = merge_module_update(TaskView::new("abc", TaskStatus::Running), "katana", module("katana", TaskStatus::Running));
        let mut snap = TaskView::new("abc", TaskStatus::Completed);
        snap = merge_module_update(snap, "seo", module("seo", TaskStatus::Completed));
        let view = apply_snapshot(view, snap);
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.modules.len(), 2);
    }

    #[test]
    fn display_order_is_priority_then_arrival() {
        let ms = vec![
            module("zeta", TaskStatus::Pending),
            module("performance", TaskStatus::Pending),
            module("alpha", TaskStatus::Pending),
            module("seo", TaskStatus::Pending),
            module("SSL", TaskStatus::Pending),
        ];
        let names: Vec<&str> = display_order(&ms).iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["seo", "SSL", "performance", "zeta", "alpha"]);
    }
}
