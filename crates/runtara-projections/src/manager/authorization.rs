// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role check applied to management commands before they reach a projection.

use crate::messages::management::{ManagementCommand, SetRunAsAction};
use crate::model::{ProjectionMode, RunAs};

/// Decides whether a requester may run a command against a projection.
pub trait RunAsValidator: Send + Sync {
    /// `target_mode` is the mode of the addressed projection, or the
    /// requested mode for a post.
    fn authorize(
        &self,
        requester: &RunAs,
        command: &ManagementCommand,
        target_mode: ProjectionMode,
    ) -> bool;
}

/// Roles allowed to change non-transient projections.
pub const PRIVILEGED_ROLES: [&str; 2] = ["$admins", "$ops"];

/// Default validator.
///
/// Reads are open. Changes to non-transient projections need a privileged
/// role, and setting a run-as needs an authenticated requester.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleRunAsValidator;

impl RunAsValidator for RoleRunAsValidator {
    fn authorize(
        &self,
        requester: &RunAs,
        command: &ManagementCommand,
        target_mode: ProjectionMode,
    ) -> bool {
        match command {
            ManagementCommand::GetQuery(_)
            | ManagementCommand::GetConfig(_)
            | ManagementCommand::GetState(_)
            | ManagementCommand::GetResult(_)
            | ManagementCommand::GetStatistics { .. } => return true,
            ManagementCommand::SetRunAs {
                action: SetRunAsAction::Set,
                ..
            } if requester.is_anonymous() => return false,
            _ => {}
        }
        target_mode == ProjectionMode::Transient
            || PRIVILEGED_ROLES.iter().any(|role| requester.has_role(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::management::{Named, Post};

    fn disable(run_as: RunAs) -> ManagementCommand {
        ManagementCommand::Disable(Named::new("p", run_as))
    }

    #[test]
    fn test_reads_are_open() {
        let command = ManagementCommand::GetQuery(Named::new("p", RunAs::Anonymous));
        assert!(RoleRunAsValidator.authorize(
            &RunAs::Anonymous,
            &command,
            ProjectionMode::Continuous
        ));
    }

    #[test]
    fn test_writes_to_persistent_projections_need_a_role() {
        let validator = RoleRunAsValidator;
        let user = RunAs::user("bob", &[]);
        let ops = RunAs::user("ops", &["$ops"]);
        assert!(!validator.authorize(&user, &disable(user.clone()), ProjectionMode::Continuous));
        assert!(validator.authorize(&ops, &disable(ops.clone()), ProjectionMode::Continuous));
        assert!(validator.authorize(&RunAs::System, &disable(RunAs::System), ProjectionMode::OneTime));
        assert!(validator.authorize(&user, &disable(user.clone()), ProjectionMode::Transient));
    }

    #[test]
    fn test_transient_post_is_open() {
        let post = Post::new("q", ProjectionMode::Transient, "JS", "fromAll()");
        let command = ManagementCommand::Post(post);
        assert!(RoleRunAsValidator.authorize(&RunAs::Anonymous, &command, ProjectionMode::Transient));
        assert!(!RoleRunAsValidator.authorize(&RunAs::Anonymous, &command, ProjectionMode::Continuous));
    }

    #[test]
    fn test_anonymous_cannot_set_run_as() {
        let command = ManagementCommand::SetRunAs {
            target: Named::new("q", RunAs::Anonymous),
            action: SetRunAsAction::Set,
        };
        assert!(!RoleRunAsValidator.authorize(&RunAs::Anonymous, &command, ProjectionMode::Transient));
    }
}
