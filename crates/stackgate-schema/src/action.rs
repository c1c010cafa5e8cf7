use crate::change::ChangeStatus;
use std::fmt;
use std::str::FromStr;

/// A provisioning command. Only `plan` and `apply` get special pipeline
/// handling; anything else is passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Plan,
    Apply,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Plan => "plan",
            Command::Apply => "apply",
            Command::Other(cmd) => cmd,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "plan" => Command::Plan,
            "apply" => Command::Apply,
            other => Command::Other(other.to_owned()),
        })
    }
}

/// Static descriptor of a requested operation and the statuses it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub command: Command,
    pub success: ChangeStatus,
    pub failure: ChangeStatus,
}

impl Action {
    pub fn new(command: Command, success: ChangeStatus, failure: ChangeStatus) -> Self {
        Self {
            command,
            success,
            failure,
        }
    }

    pub fn plan() -> Self {
        Self::new(
            Command::Plan,
            ChangeStatus::Planned,
            ChangeStatus::PlanFailed,
        )
    }

    pub fn apply() -> Self {
        Self::new(
            Command::Apply,
            ChangeStatus::Applied,
            ChangeStatus::ApplyFailed,
        )
    }

    pub fn is_plan(&self) -> bool {
        self.command == Command::Plan
    }

    pub fn is_apply(&self) -> bool {
        self.command == Command::Apply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parse_roundtrip() {
        for raw in ["plan", "apply", "destroy"] {
            let cmd: Command = raw.parse().unwrap();
            assert_eq!(cmd.to_string(), raw);
        }
        assert_eq!("plan".parse::<Command>().unwrap(), Command::Plan);
        assert_eq!(
            "refresh".parse::<Command>().unwrap(),
            Command::Other("refresh".to_owned())
        );
    }

    #[test]
    fn builtin_actions_carry_matching_codes() {
        let plan = Action::plan();
        assert!(plan.is_plan());
        assert_eq!(plan.success, ChangeStatus::Planned);
        assert_eq!(plan.failure, ChangeStatus::PlanFailed);

        let apply = Action::apply();
        assert!(apply.is_apply());
        assert_eq!(apply.success, ChangeStatus::Applied);
        assert_eq!(apply.failure, ChangeStatus::ApplyFailed);
    }
}
