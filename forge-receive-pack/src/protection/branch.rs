use serde::Deserialize;

use super::{Verdict, VerifyInput, Violation};
use crate::classify::Action;
use crate::refs::RefType;

/// Who may bypass a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bypass {
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub repo_owners: bool,
}

impl Bypass {
    fn applies_to(&self, input: &VerifyInput<'_>) -> bool {
        self.user_ids.contains(&input.actor.id) || (self.repo_owners && input.is_repo_owner)
    }
}

/// Which ref lifecycle steps are forbidden on matching branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lifecycle {
    #[serde(default)]
    pub create_forbidden: bool,
    #[serde(default)]
    pub delete_forbidden: bool,
    #[serde(default)]
    pub update_forbidden: bool,
    #[serde(default)]
    pub update_force_forbidden: bool,
}

/// Definition of the `branch` rule kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub bypass: Bypass,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

pub const CODE_CREATE: &str = "lifecycle.create";
pub const CODE_DELETE: &str = "lifecycle.delete";
pub const CODE_UPDATE: &str = "lifecycle.update";
pub const CODE_UPDATE_FORCE: &str = "lifecycle.update.force";

impl Branch {
    /// Check `names`, already filtered by the rule's pattern, against the lifecycle settings.
    pub(crate) fn verify(&self, input: &VerifyInput<'_>, names: &[&str]) -> Verdict {
        let mut violations = Vec::new();
        if input.ref_type == RefType::Branch {
            for name in names {
                let forbidden = match input.action {
                    Action::Create => self
                        .lifecycle
                        .create_forbidden
                        .then(|| (CODE_CREATE, format!("Creation of branch \"{name}\" is not allowed."))),
                    Action::Delete => self
                        .lifecycle
                        .delete_forbidden
                        .then(|| (CODE_DELETE, format!("Deletion of branch \"{name}\" is not allowed."))),
                    Action::Update => self.lifecycle.update_forbidden.then(|| {
                        (
                            CODE_UPDATE,
                            format!("Push to branch \"{name}\" is not allowed. Please use pull requests."),
                        )
                    }),
                    // A force push is an update too, so forbidding updates forbids it as well.
                    Action::UpdateForce => {
                        if self.lifecycle.update_force_forbidden {
                            Some((CODE_UPDATE_FORCE, format!("Force push to branch \"{name}\" is not allowed.")))
                        } else {
                            self.lifecycle.update_forbidden.then(|| {
                                (
                                    CODE_UPDATE,
                                    format!("Push to branch \"{name}\" is not allowed. Please use pull requests."),
                                )
                            })
                        }
                    }
                };
                if let Some((code, message)) = forbidden {
                    violations.push(Violation { code, message });
                }
            }
        }
        Verdict {
            violations,
            can_bypass: self.bypass.applies_to(input),
        }
    }
}
