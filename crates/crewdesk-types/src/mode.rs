use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation mode of a bridge session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Plan,
    Act,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Plan, Mode::Act];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Plan => "plan",
            Mode::Act => "act",
        }
    }

    pub fn capabilities(self) -> ModeCapabilities {
        match self {
            Mode::Plan => ModeCapabilities {
                allow_file_operations: false,
                allow_execution: false,
                require_confirmation: true,
            },
            Mode::Act => ModeCapabilities {
                allow_file_operations: true,
                allow_execution: true,
                require_confirmation: false,
            },
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Mode::Plan => {
                "Plan mode: analyze requirements, design solutions and execution strategies. \
                 No file modifications or executions; user confirmation is required to proceed."
            }
            Mode::Act => {
                "Act mode: execute planned actions, modify files, run tests and implement \
                 solutions autonomously within constraints."
            }
        }
    }

    pub fn other(self) -> Mode {
        match self {
            Mode::Plan => Mode::Act,
            Mode::Act => Mode::Plan,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(Mode::Plan),
            "act" => Ok(Mode::Act),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// What a mode lets commands do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeCapabilities {
    pub allow_file_operations: bool,
    pub allow_execution: bool,
    pub require_confirmation: bool,
}

/// Capabilities a command needs from the current mode before it may be sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityNeeds {
    pub file_operations: bool,
    pub execution: bool,
}

impl CapabilityNeeds {
    pub const NONE: CapabilityNeeds = CapabilityNeeds {
        file_operations: false,
        execution: false,
    };

    pub fn satisfied_by(self, caps: ModeCapabilities) -> bool {
        (!self.file_operations || caps.allow_file_operations)
            && (!self.execution || caps.allow_execution)
    }

    /// Modes whose capability descriptor satisfies these needs.
    pub fn permitted_modes(self) -> ModeSet {
        let mut set = ModeSet::EMPTY;
        for mode in Mode::ALL {
            if self.satisfied_by(mode.capabilities()) {
                set = set.with(mode);
            }
        }
        set
    }
}

/// Small set of modes, used for a command's `requiresMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeSet {
    plan: bool,
    act: bool,
}

impl ModeSet {
    pub const EMPTY: ModeSet = ModeSet {
        plan: false,
        act: false,
    };
    pub const ANY: ModeSet = ModeSet {
        plan: true,
        act: true,
    };

    pub fn only(mode: Mode) -> Self {
        Self::EMPTY.with(mode)
    }

    pub fn with(mut self, mode: Mode) -> Self {
        match mode {
            Mode::Plan => self.plan = true,
            Mode::Act => self.act = true,
        }
        self
    }

    pub fn contains(self, mode: Mode) -> bool {
        match mode {
            Mode::Plan => self.plan,
            Mode::Act => self.act,
        }
    }

    pub fn modes(self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|mode| self.contains(*mode))
            .collect()
    }
}

impl fmt::Display for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .modes()
            .into_iter()
            .map(Mode::as_str)
            .collect::<Vec<_>>();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_read_only() {
        let caps = Mode::Plan.capabilities();
        assert!(!caps.allow_file_operations);
        assert!(!caps.allow_execution);
        assert!(caps.require_confirmation);
    }

    #[test]
    fn needs_map_to_permitted_modes() {
        assert_eq!(CapabilityNeeds::NONE.permitted_modes(), ModeSet::ANY);
        let writes = CapabilityNeeds {
            file_operations: true,
            execution: false,
        };
        assert_eq!(writes.permitted_modes(), ModeSet::only(Mode::Act));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("ACT".parse::<Mode>().unwrap(), Mode::Act);
        assert!("build".parse::<Mode>().is_err());
        assert_eq!(ModeSet::ANY.to_string(), "[plan, act]");
    }
}
